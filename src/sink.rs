//! Rate-limited echo sink.
//!
//! Every request is counted against the sink's own window. Requests under
//! budget are echoed back, requests over budget get the rejection marker.
//! Both outcomes are ordinary successful answers.

use std::time::Duration;

use crate::types::{Call, EchoResult, WindowSnapshot};
use crate::window::RateWindow;

pub struct EchoSink {
    window: RateWindow,
}

impl EchoSink {
    pub fn new(rate_limit: u32, window_size: Duration) -> Self {
        Self {
            window: RateWindow::new("sink", rate_limit, window_size),
        }
    }

    pub fn echo(&self, call: Call) -> EchoResult {
        tracing::debug!(id = call.id, message = %call.message, "Received call");

        let recorded = self.window.record();
        let limit = self.window.limit();

        if recorded.exceeded {
            tracing::info!(
                id = call.id,
                count = recorded.count,
                limit,
                "Rate limit exceeded, rejecting call"
            );
            EchoResult::rejected(call, recorded.count, limit)
        } else {
            tracing::debug!(id = call.id, count = recorded.count, limit, "Echoing call");
            EchoResult::echoed(call, recorded.count, limit)
        }
    }

    pub fn limit(&self) -> u32 {
        self.window.limit()
    }

    pub fn window(&self) -> WindowSnapshot {
        self.window.snapshot()
    }
}
