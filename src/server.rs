use crate::admission::{AdmissionController, Forward};
use crate::client::{ControllerClient, SinkClient};
use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::generator::{CallTarget, LoadGenerator};
use crate::handlers::{
    controller_health, echo, generator_health, not_found, sink_health, start, status, throttle,
    ControllerState, GeneratorState, SinkState,
};
use crate::middleware::logging_middleware;
use crate::sink::EchoSink;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub struct Server {
    app: Router,
    addr: SocketAddr,
    service: &'static str,
}

impl Server {
    pub fn new(app: Router, addr: SocketAddr, service: &'static str) -> Self {
        Self { app, addr, service }
    }

    /// Build the router for whichever service the configuration selects.
    pub fn from_config(config: &ServiceConfig, addr: SocketAddr) -> Result<Self> {
        let app = match config {
            ServiceConfig::Sink(sink) => sink_app(Arc::new(SinkState {
                sink: EchoSink::new(sink.rate_limit, sink.window()),
                port: sink.port,
            })),
            ServiceConfig::Controller(controller) => {
                let forwarder = SinkClient::new(&controller.sink_url, controller.forward_timeout())?;
                controller_app(Arc::new(ControllerState {
                    controller: AdmissionController::new(
                        forwarder,
                        controller.throttle_limit,
                        controller.window(),
                        controller.pace(),
                    ),
                    port: controller.port,
                }))
            }
            ServiceConfig::Generator(generator) => {
                let target =
                    ControllerClient::new(&generator.controller_url, generator.call_timeout())?;
                generator_app(Arc::new(GeneratorState {
                    generator: LoadGenerator::new(target, generator.plan())?,
                    port: generator.port,
                }))
            }
        };

        Ok(Self::new(app, addr, config.name()))
    }

    pub async fn run(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;

        tracing::info!(service = self.service, addr = %self.addr, "Server listening");

        axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        tracing::info!(service = self.service, "Server stopped");
        Ok(())
    }
}

pub fn sink_app(state: Arc<SinkState>) -> Router {
    let router = Router::new()
        .route("/echo", post(echo))
        .route("/health", get(sink_health))
        .with_state(state);

    with_layers(router, "sink")
}

pub fn controller_app<F: Forward>(state: Arc<ControllerState<F>>) -> Router {
    let router = Router::new()
        .route("/throttle", post(throttle::<F>))
        .route("/health", get(controller_health::<F>))
        .with_state(state);

    with_layers(router, "controller")
}

pub fn generator_app<T: CallTarget>(state: Arc<GeneratorState<T>>) -> Router {
    let router = Router::new()
        .route("/start", post(start::<T>))
        .route("/status", get(status::<T>))
        .route("/health", get(generator_health::<T>))
        .with_state(state);

    with_layers(router, "generator")
}

fn with_layers(router: Router, service: &'static str) -> Router {
    router.fallback(not_found).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(middleware::from_fn_with_state(service, logging_middleware))
            .layer(CorsLayer::permissive())
            .layer(CatchPanicLayer::custom(panic_response)),
    )
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else {
        "handler panicked".to_string()
    };

    Error::Internal(detail).into_response()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
