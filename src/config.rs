use clap::{Args, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use validator::{Validate, ValidationError};

use crate::error::Result;
use crate::generator::LoadPlan;

pub const DEFAULT_GENERATOR_PORT: u16 = 3000;
pub const DEFAULT_CONTROLLER_PORT: u16 = 3001;
pub const DEFAULT_SINK_PORT: u16 = 3002;

#[derive(Debug, Parser)]
#[command(name = "callchain", version, about = "Load generator, admission controller and rate-limited sink")]
pub struct Cli {
    /// Log level for this crate's targets (overridden by RUST_LOG)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Also append logs to `<dir>/<service>.log`
    #[arg(long, env = "LOG_DIR", global = true)]
    pub log_dir: Option<PathBuf>,

    /// Address the service listens on
    #[arg(long, env = "BIND_IP", default_value = "0.0.0.0", global = true)]
    pub bind_ip: IpAddr,

    #[command(subcommand)]
    pub service: ServiceConfig,
}

#[derive(Debug, Clone, Subcommand)]
pub enum ServiceConfig {
    /// Rate-limited echo sink
    Sink(SinkConfig),
    /// Admission controller forwarding to the sink
    Controller(ControllerConfig),
    /// Phased load generator calling the controller
    Generator(GeneratorConfig),
}

impl ServiceConfig {
    pub fn name(&self) -> &'static str {
        match self {
            ServiceConfig::Sink(_) => "sink",
            ServiceConfig::Controller(_) => "controller",
            ServiceConfig::Generator(_) => "generator",
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            ServiceConfig::Sink(config) => config.port,
            ServiceConfig::Controller(config) => config.port,
            ServiceConfig::Generator(config) => config.port,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            ServiceConfig::Sink(config) => config.validate()?,
            ServiceConfig::Controller(config) => config.validate()?,
            ServiceConfig::Generator(config) => config.validate()?,
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Args, Validate)]
pub struct SinkConfig {
    #[arg(long, env = "SINK_PORT", default_value_t = DEFAULT_SINK_PORT)]
    pub port: u16,

    /// Calls per window answered with an echo
    #[arg(long, env = "SINK_RATE_LIMIT", default_value_t = 512)]
    #[validate(range(min = 1))]
    pub rate_limit: u32,

    #[arg(long, env = "SINK_WINDOW_MS", default_value_t = 60_000)]
    #[validate(range(min = 1))]
    pub window_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_SINK_PORT,
            rate_limit: 512,
            window_ms: 60_000,
        }
    }
}

impl SinkConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, Args, Validate)]
pub struct ControllerConfig {
    #[arg(long, env = "CONTROLLER_PORT", default_value_t = DEFAULT_CONTROLLER_PORT)]
    pub port: u16,

    /// Calls per window forwarded to the sink
    #[arg(long, env = "THROTTLE_LIMIT", default_value_t = 4096)]
    #[validate(range(min = 1))]
    pub throttle_limit: u32,

    #[arg(long, env = "THROTTLE_WINDOW_MS", default_value_t = 60_000)]
    #[validate(range(min = 1))]
    pub window_ms: u64,

    #[arg(long, env = "SINK_URL", default_value = "http://localhost:3002")]
    #[validate(url)]
    pub sink_url: String,

    /// Delay after each forwarded call
    #[arg(long, env = "THROTTLE_PACE_MS", default_value_t = 10)]
    pub pace_ms: u64,

    #[arg(long, env = "FORWARD_TIMEOUT_SECS", default_value_t = 30)]
    #[validate(range(min = 1))]
    pub forward_timeout_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_CONTROLLER_PORT,
            throttle_limit: 4096,
            window_ms: 60_000,
            sink_url: "http://localhost:3002".to_string(),
            pace_ms: 10,
            forward_timeout_secs: 30,
        }
    }
}

impl ControllerConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn pace(&self) -> Duration {
        Duration::from_millis(self.pace_ms)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_secs(self.forward_timeout_secs)
    }
}

#[derive(Debug, Clone, Args, Validate)]
#[validate(schema(function = "validate_plan"))]
pub struct GeneratorConfig {
    #[arg(long, env = "GENERATOR_PORT", default_value_t = DEFAULT_GENERATOR_PORT)]
    pub port: u16,

    #[arg(long, env = "CONTROLLER_URL", default_value = "http://localhost:3001")]
    #[validate(url)]
    pub controller_url: String,

    #[arg(long, env = "GENERATOR_PHASES", default_value_t = 4)]
    #[validate(range(min = 1, max = 8))]
    pub phases: u32,

    /// Phase `n` issues `fan_out^n` calls
    #[arg(long, env = "GENERATOR_FAN_OUT", default_value_t = 16)]
    #[validate(range(min = 1))]
    pub fan_out: u64,

    #[arg(long, env = "GENERATOR_PHASE_PAUSE_MS", default_value_t = 60_000)]
    pub phase_pause_ms: u64,

    /// How long a single call may wait for its answer
    #[arg(long, env = "GENERATOR_CALL_TIMEOUT_SECS", default_value_t = 1800)]
    #[validate(range(min = 1))]
    pub call_timeout_secs: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_GENERATOR_PORT,
            controller_url: "http://localhost:3001".to_string(),
            phases: 4,
            fan_out: 16,
            phase_pause_ms: 60_000,
            call_timeout_secs: 1800,
        }
    }
}

impl GeneratorConfig {
    pub fn plan(&self) -> LoadPlan {
        LoadPlan {
            phases: self.phases,
            fan_out: self.fan_out,
            pause: Duration::from_millis(self.phase_pause_ms),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

fn validate_plan(config: &GeneratorConfig) -> std::result::Result<(), ValidationError> {
    config.plan().check().map(|_| ()).map_err(|err| {
        ValidationError::new("load_plan_too_large").with_message(err.to_string().into())
    })
}
