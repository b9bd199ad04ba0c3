//! Message and report bodies exchanged between the three services.
//!
//! Field names follow the JSON wire format (camelCase), so the same
//! structs are used on both the serving and the calling side.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Response text the sink sends back instead of the echo once its budget is spent.
pub const LIMIT_EXCEEDED_RESPONSE: &str = "Exceeding Limit";

/// Response text the controller synthesizes when a forward fails.
pub const SERVICE_ERROR_RESPONSE: &str = "Service Error";

/// RFC 3339 UTC timestamp with millisecond precision.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_timestamp() -> String {
    timestamp(Utc::now())
}

/// A single unit of load travelling down the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    pub id: u64,
    pub message: String,
}

impl Call {
    pub fn new(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            message: message.into(),
        }
    }
}

/// What the sink answers for every call it receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EchoResult {
    pub id: u64,
    pub original_message: String,
    pub response: String,
    pub rate_limit_exceeded: bool,
    pub current_calls: u32,
    pub limit: u32,
}

impl EchoResult {
    pub fn echoed(call: Call, current_calls: u32, limit: u32) -> Self {
        Self {
            id: call.id,
            response: call.message.clone(),
            original_message: call.message,
            rate_limit_exceeded: false,
            current_calls,
            limit,
        }
    }

    pub fn rejected(call: Call, current_calls: u32, limit: u32) -> Self {
        Self {
            id: call.id,
            original_message: call.message,
            response: LIMIT_EXCEEDED_RESPONSE.to_string(),
            rate_limit_exceeded: true,
            current_calls,
            limit,
        }
    }
}

/// Forwarding metadata the controller attaches to every answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleInfo {
    pub forwarded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time: Option<String>,
    pub calls_this_minute: u32,
    pub throttle_limit: u32,
}

/// The controller's terminal answer for one queued call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub echo: EchoResult,
    pub throttle_info: ThrottleInfo,
}

impl ForwardResult {
    pub fn forwarded(
        echo: EchoResult,
        forward_time: String,
        calls_this_minute: u32,
        throttle_limit: u32,
    ) -> Self {
        Self {
            error: None,
            echo,
            throttle_info: ThrottleInfo {
                forwarded: true,
                forward_time: Some(forward_time),
                response_time: Some(now_timestamp()),
                calls_this_minute,
                throttle_limit,
            },
        }
    }

    /// Synthesized answer for a call whose forward attempt failed.
    pub fn failed(call: Call, calls_this_minute: u32, throttle_limit: u32) -> Self {
        Self {
            error: Some("Failed to forward request to the sink".to_string()),
            echo: EchoResult {
                id: call.id,
                original_message: call.message,
                response: SERVICE_ERROR_RESPONSE.to_string(),
                rate_limit_exceeded: false,
                current_calls: 0,
                limit: 0,
            },
            throttle_info: ThrottleInfo {
                forwarded: false,
                forward_time: None,
                response_time: None,
                calls_this_minute,
                throttle_limit,
            },
        }
    }

    pub fn is_forwarded(&self) -> bool {
        self.throttle_info.forwarded
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowSnapshot {
    pub calls: u32,
    pub window_start: String,
}

impl WindowSnapshot {
    pub fn new(calls: u32, started_at: DateTime<Utc>) -> Self {
        Self {
            calls,
            window_start: timestamp(started_at),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkHealth {
    pub status: String,
    pub port: u16,
    pub rate_limit: String,
    pub current_window: WindowSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerHealth {
    pub status: String,
    pub port: u16,
    pub throttle_limit: String,
    pub current_window: WindowSnapshot,
    pub queue_length: usize,
    pub echo_service_url: String,
}

/// Progress of the running load sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseSnapshot {
    pub minute: u32,
    pub calls_this_minute: u64,
    pub total_calls: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorHealth {
    pub status: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<PhaseSnapshot>,
    pub throttle_service_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorStatus {
    pub is_running: bool,
    pub current_minute: u32,
    pub current_id: u64,
    pub total_calls: u64,
    pub next_calls_count: Option<u64>,
    pub throttle_service_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartReceipt {
    pub message: String,
    pub pattern: String,
}
