//! Admission controller: a FIFO queue drained against a per-window budget.
//!
//! Intake never blocks and never rejects. Each call is appended to the
//! queue together with a one-shot reply handle, and the first arrival that
//! finds the controller idle spawns the drain loop. At most one drain loop
//! runs at a time; the `processing` flag lives under the same lock as the
//! queue, so the decision to start a loop and the decision to stop one can
//! never interleave badly.
//!
//! The queue lock is never held across an await point. Saturation waits
//! and downstream calls happen with the lock released, so arrivals keep
//! queueing while the loop is suspended.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::CallError;
use crate::types::{now_timestamp, Call, EchoResult, ForwardResult, WindowSnapshot};
use crate::window::{Admission, RateWindow};

/// Downstream hop the controller forwards admitted calls to.
pub trait Forward: Send + Sync + 'static {
    fn forward(&self, call: &Call) -> impl Future<Output = Result<EchoResult, CallError>> + Send;

    /// Address of the downstream service, for status reporting.
    fn target(&self) -> &str;
}

struct QueuedCall {
    call: Call,
    reply: oneshot::Sender<ForwardResult>,
}

#[derive(Default)]
struct Queue {
    pending: VecDeque<QueuedCall>,
    processing: bool,
}

/// Armed while a drain loop runs. If the loop unwinds, the controller is
/// marked idle and every queued caller is failed, so the next arrival
/// starts a fresh loop instead of queueing behind a dead one.
struct DrainGuard<'a> {
    queue: &'a Mutex<Queue>,
    armed: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut queue = self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        queue.processing = false;
        let abandoned = queue.pending.len();
        queue.pending.clear();
        tracing::error!(abandoned, "Drain loop stopped unexpectedly, queued calls failed");
    }
}

pub struct AdmissionController<F> {
    inner: Arc<Inner<F>>,
}

impl<F> Clone for AdmissionController<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<F> {
    forwarder: F,
    window: RateWindow,
    queue: Mutex<Queue>,
    pace: Duration,
    drains_started: AtomicUsize,
}

impl<F: Forward> AdmissionController<F> {
    pub fn new(forwarder: F, throttle_limit: u32, window_size: Duration, pace: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                forwarder,
                window: RateWindow::new("controller", throttle_limit, window_size),
                queue: Mutex::new(Queue::default()),
                pace,
                drains_started: AtomicUsize::new(0),
            }),
        }
    }

    /// Queue a call and return the handle its terminal result arrives on.
    pub fn submit(&self, call: Call) -> oneshot::Receiver<ForwardResult> {
        let (reply, receiver) = oneshot::channel();
        let id = call.id;

        let start_drain = {
            let mut queue = self.inner.lock_queue();
            queue.pending.push_back(QueuedCall { call, reply });
            tracing::debug!(id, queue_len = queue.pending.len(), "Call queued");

            !std::mem::replace(&mut queue.processing, true)
        };

        if start_drain {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(inner.drain());
        }

        receiver
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock_queue().pending.len()
    }

    pub fn window(&self) -> WindowSnapshot {
        self.inner.window.snapshot()
    }

    pub fn throttle_limit(&self) -> u32 {
        self.inner.window.limit()
    }

    pub fn target(&self) -> &str {
        self.inner.forwarder.target()
    }
}

impl<F: Forward> Inner<F> {
    fn lock_queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn drain(self: Arc<Self>) {
        let run = self.drains_started.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(run, "Drain loop started");

        let mut guard = DrainGuard {
            queue: &self.queue,
            armed: true,
        };
        let mut processed = 0u64;
        loop {
            if self.finish_if_empty() {
                break;
            }

            let calls_this_window = self.wait_for_budget().await;

            // Only this loop pops, so the head seen above is still there.
            let Some(queued) = self.lock_queue().pending.pop_front() else {
                continue;
            };

            self.dispatch(queued, calls_this_window).await;
            processed += 1;

            tokio::time::sleep(self.pace).await;
        }
        guard.armed = false;

        tracing::info!(run, processed, "Drain loop finished, queue empty");
    }

    /// Clears `processing` when nothing is left, under the queue lock.
    fn finish_if_empty(&self) -> bool {
        let mut queue = self.lock_queue();
        if queue.pending.is_empty() {
            queue.processing = false;
            true
        } else {
            false
        }
    }

    async fn wait_for_budget(&self) -> u32 {
        loop {
            match self.window.try_acquire() {
                Admission::Granted { count } => return count,
                Admission::Saturated { retry_in } => {
                    tracing::info!(
                        limit = self.window.limit(),
                        wait_ms = retry_in.as_millis() as u64,
                        queue_len = self.lock_queue().pending.len(),
                        "Throttle limit reached, waiting for next window"
                    );
                    tokio::time::sleep(retry_in).await;
                }
            }
        }
    }

    async fn dispatch(&self, queued: QueuedCall, calls_this_window: u32) {
        let QueuedCall { call, reply } = queued;
        let limit = self.window.limit();
        let forward_time = now_timestamp();

        tracing::info!(
            id = call.id,
            calls = calls_this_window,
            limit,
            "Forwarding call to sink"
        );

        let result = match self.forwarder.forward(&call).await {
            Ok(echo) => {
                tracing::debug!(
                    id = call.id,
                    rate_limit_exceeded = echo.rate_limit_exceeded,
                    "Received sink response"
                );
                ForwardResult::forwarded(echo, forward_time, calls_this_window, limit)
            }
            Err(err) => {
                tracing::warn!(id = call.id, error = %err, "Forward to sink failed");
                ForwardResult::failed(call, calls_this_window, limit)
            }
        };

        let id = result.echo.id;
        if reply.send(result).is_err() {
            tracing::debug!(id, "Caller went away before its response was ready");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SERVICE_ERROR_RESPONSE;
    use std::collections::HashSet;
    use tokio::time::Instant;

    const MINUTE: Duration = Duration::from_secs(60);
    const PACE: Duration = Duration::from_millis(10);

    /// In-process sink that records when each call arrived.
    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<(u64, Instant)>>,
        failing: HashSet<u64>,
        panic_on: Option<u64>,
    }

    impl RecordingSink {
        fn failing(ids: &[u64]) -> Self {
            Self {
                failing: ids.iter().copied().collect(),
                ..Self::default()
            }
        }
    }

    impl Forward for Arc<RecordingSink> {
        fn forward(
            &self,
            call: &Call,
        ) -> impl Future<Output = Result<EchoResult, CallError>> + Send {
            self.seen.lock().unwrap().push((call.id, Instant::now()));
            if self.panic_on == Some(call.id) {
                panic!("sink blew up on call {}", call.id);
            }
            let outcome = if self.failing.contains(&call.id) {
                Err(CallError::Status {
                    url: "test-sink".to_string(),
                    status: 503,
                })
            } else {
                Ok(EchoResult::echoed(call.clone(), 1, 512))
            };
            async move { outcome }
        }

        fn target(&self) -> &str {
            "test-sink"
        }
    }

    fn controller(sink: &Arc<RecordingSink>, limit: u32) -> AdmissionController<Arc<RecordingSink>> {
        AdmissionController::new(Arc::clone(sink), limit, MINUTE, PACE)
    }

    async fn submit_all(
        controller: &AdmissionController<Arc<RecordingSink>>,
        ids: std::ops::RangeInclusive<u64>,
    ) -> Vec<ForwardResult> {
        let receivers: Vec<_> = ids
            .map(|id| controller.submit(Call::new(id, id.to_string())))
            .collect();

        let mut results = Vec::new();
        for receiver in receivers {
            results.push(receiver.await.unwrap());
        }
        results
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwards_in_arrival_order() {
        let sink = Arc::new(RecordingSink::default());
        let controller = controller(&sink, 4096);

        let results = submit_all(&controller, 1..=50).await;

        let order: Vec<u64> = sink.seen.lock().unwrap().iter().map(|(id, _)| *id).collect();
        assert_eq!(order, (1..=50).collect::<Vec<_>>());
        assert!(results.iter().all(ForwardResult::is_forwarded));
        assert_eq!(results[49].throttle_info.calls_this_minute, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_forwards_more_than_limit_per_window() {
        let sink = Arc::new(RecordingSink::default());
        let controller = controller(&sink, 5);
        let start = Instant::now();

        let results = submit_all(&controller, 1..=12).await;

        let seen = sink.seen.lock().unwrap().clone();
        let windows: Vec<u64> = seen
            .iter()
            .map(|(_, at)| at.duration_since(start).as_secs() / 60)
            .collect();
        assert_eq!(windows, vec![0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 2, 2]);

        let counts: Vec<u32> = results
            .iter()
            .map(|r| r.throttle_info.calls_this_minute)
            .collect();
        assert_eq!(counts, vec![1, 2, 3, 4, 5, 1, 2, 3, 4, 5, 1, 2]);
        assert!(results.iter().all(|r| r.throttle_info.throttle_limit == 5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_forward_is_isolated() {
        let sink = Arc::new(RecordingSink::failing(&[3]));
        let controller = controller(&sink, 4096);

        let results = submit_all(&controller, 1..=5).await;

        let failed = &results[2];
        assert!(!failed.is_forwarded());
        assert_eq!(failed.echo.id, 3);
        assert_eq!(failed.echo.response, SERVICE_ERROR_RESPONSE);
        assert!(failed.error.is_some());

        for result in results.iter().filter(|r| r.echo.id != 3) {
            assert!(result.is_forwarded());
            assert_eq!(result.echo.response, result.echo.original_message);
        }
        // No retry: call 3 reached the sink exactly once.
        let attempts = sink.seen.lock().unwrap().iter().filter(|(id, _)| *id == 3).count();
        assert_eq!(attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_drain_loop_per_busy_period() {
        let sink = Arc::new(RecordingSink::default());
        let controller = controller(&sink, 4096);

        submit_all(&controller, 1..=20).await;
        assert_eq!(controller.inner.drains_started.load(Ordering::Relaxed), 1);

        // Let the loop observe the empty queue and stop.
        tokio::time::sleep(PACE * 2).await;
        assert!(!controller.inner.lock_queue().processing);

        submit_all(&controller, 21..=25).await;
        assert_eq!(controller.inner.drains_started.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturated_calls_stay_queued() {
        let sink = Arc::new(RecordingSink::default());
        let controller = controller(&sink, 1);

        let first = controller.submit(Call::new(1, "1"));
        let second = controller.submit(Call::new(2, "2"));
        let third = controller.submit(Call::new(3, "3"));

        first.await.unwrap();
        assert_eq!(controller.queue_len(), 2);
        assert_eq!(controller.window().calls, 1);

        let second = second.await.unwrap();
        assert_eq!(second.throttle_info.calls_this_minute, 1);
        let third = third.await.unwrap();
        assert!(third.is_forwarded());
        assert_eq!(controller.queue_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_caller_does_not_stall_queue() {
        let sink = Arc::new(RecordingSink::default());
        let controller = controller(&sink, 4096);

        drop(controller.submit(Call::new(1, "gone")));
        let result = controller.submit(Call::new(2, "here")).await.unwrap();

        assert!(result.is_forwarded());
        assert_eq!(sink.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_forward_does_not_wedge_controller() {
        let sink = Arc::new(RecordingSink {
            panic_on: Some(2),
            ..RecordingSink::default()
        });
        let controller = controller(&sink, 4096);

        let first = controller.submit(Call::new(1, "1"));
        let second = controller.submit(Call::new(2, "2"));
        let third = controller.submit(Call::new(3, "3"));

        assert!(first.await.unwrap().is_forwarded());
        assert!(second.await.is_err());
        assert!(third.await.is_err());
        assert!(!controller.inner.lock_queue().processing);
        assert_eq!(controller.queue_len(), 0);

        let fourth = controller.submit(Call::new(4, "4")).await.unwrap();
        assert!(fourth.is_forwarded());
        assert_eq!(controller.inner.drains_started.load(Ordering::Relaxed), 2);
    }
}
