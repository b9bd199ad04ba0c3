pub mod admission;
pub mod client;
pub mod config;
pub mod error;
pub mod generator;
pub mod handlers;
pub mod middleware;
pub mod server;
pub mod sink;
pub mod telemetry;
pub mod types;
pub mod window;

pub use admission::{AdmissionController, Forward};
pub use config::{Cli, ServiceConfig};
pub use error::{CallError, Error, Result};
pub use generator::{CallTarget, LoadGenerator, LoadPlan};
pub use server::{controller_app, generator_app, sink_app, Server};
pub use sink::EchoSink;
pub use window::RateWindow;
