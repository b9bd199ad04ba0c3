use axum::{
    extract::{rejection::JsonRejection, State},
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

use crate::admission::{AdmissionController, Forward};
use crate::error::{Error, Result};
use crate::generator::{CallTarget, LoadGenerator};
use crate::sink::EchoSink;
use crate::types::{
    Call, ControllerHealth, EchoResult, GeneratorHealth, GeneratorStatus, SinkHealth,
    StartReceipt,
};

pub struct SinkState {
    pub sink: EchoSink,
    pub port: u16,
}

pub struct ControllerState<F> {
    pub controller: AdmissionController<F>,
    pub port: u16,
}

pub struct GeneratorState<T> {
    pub generator: LoadGenerator<T>,
    pub port: u16,
}

/// Echo a call, or reject it once the sink's window is spent
pub async fn echo(
    State(state): State<Arc<SinkState>>,
    payload: std::result::Result<Json<Call>, JsonRejection>,
) -> Result<Json<EchoResult>> {
    let Json(call) = payload?;
    Ok(Json(state.sink.echo(call)))
}

pub async fn sink_health(State(state): State<Arc<SinkState>>) -> Json<SinkHealth> {
    Json(SinkHealth {
        status: "Echo sink is running".to_string(),
        port: state.port,
        rate_limit: format!("{} calls per minute", state.sink.limit()),
        current_window: state.sink.window(),
    })
}

/// Queue a call and hold the request open until the drain loop answers it
pub async fn throttle<F: Forward>(
    State(state): State<Arc<ControllerState<F>>>,
    payload: std::result::Result<Json<Call>, JsonRejection>,
) -> Result<Response> {
    let Json(call) = payload?;
    tracing::debug!(
        id = call.id,
        message = %call.message,
        queue_len = state.controller.queue_len(),
        "Received call"
    );

    let result = state
        .controller
        .submit(call)
        .await
        .map_err(|_| Error::Internal("queued call was dropped without a reply".to_string()))?;

    let status = if result.is_forwarded() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok((status, Json(result)).into_response())
}

pub async fn controller_health<F: Forward>(
    State(state): State<Arc<ControllerState<F>>>,
) -> Json<ControllerHealth> {
    let controller = &state.controller;
    Json(ControllerHealth {
        status: "Admission controller is running".to_string(),
        port: state.port,
        throttle_limit: format!("{} calls per minute", controller.throttle_limit()),
        current_window: controller.window(),
        queue_length: controller.queue_len(),
        echo_service_url: controller.target().to_string(),
    })
}

/// Kick off a load sequence unless one is already in progress
pub async fn start<T: CallTarget>(
    State(state): State<Arc<GeneratorState<T>>>,
) -> Result<Json<StartReceipt>> {
    // The sequence reports through the log; nothing waits on its handle.
    let _sequence = state.generator.start()?;

    Ok(Json(StartReceipt {
        message: "Load sequence started".to_string(),
        pattern: state.generator.plan().describe(),
    }))
}

pub async fn status<T: CallTarget>(
    State(state): State<Arc<GeneratorState<T>>>,
) -> Json<GeneratorStatus> {
    Json(state.generator.status())
}

pub async fn generator_health<T: CallTarget>(
    State(state): State<Arc<GeneratorState<T>>>,
) -> Json<GeneratorHealth> {
    Json(GeneratorHealth {
        status: "Load generator is running".to_string(),
        port: state.port,
        current_phase: state.generator.current_phase(),
        throttle_service_url: state.generator.target().to_string(),
    })
}

pub async fn not_found(method: Method, uri: Uri) -> Error {
    Error::NotFound {
        method: method.to_string(),
        path: uri.path().to_string(),
    }
}
