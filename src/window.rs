//! Fixed counting windows with a lazy reset.
//!
//! A window resets on the first access at or after `start + size`. The
//! controller spends its budget through [`RateWindow::try_acquire`], the sink
//! counts every arrival through [`RateWindow::record`].

use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::types::WindowSnapshot;

/// Fixed-size counting window shared by every caller of one component.
///
/// The lazy reset and whatever follows it (increment, capacity check or
/// snapshot) run inside the same critical section, so two concurrent
/// callers can never both claim the last unit of budget and a reset can
/// never happen twice for the same expiry.
#[derive(Debug)]
pub struct RateWindow {
    name: &'static str,
    limit: u32,
    size: Duration,
    state: Mutex<WindowState>,
}

#[derive(Debug)]
struct WindowState {
    count: u32,
    started: Instant,
    started_at: DateTime<Utc>,
}

/// Outcome of asking the window for one unit of budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Budget was available; `count` includes this call.
    Granted { count: u32 },
    /// The window is saturated until it rolls over in `retry_in`.
    Saturated { retry_in: Duration },
}

/// Outcome of counting a call that is processed regardless of budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recorded {
    pub count: u32,
    pub exceeded: bool,
}

impl RateWindow {
    pub fn new(name: &'static str, limit: u32, size: Duration) -> Self {
        Self {
            name,
            limit,
            size,
            state: Mutex::new(WindowState {
                count: 0,
                started: Instant::now(),
                started_at: Utc::now(),
            }),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn size(&self) -> Duration {
        self.size
    }

    /// Take one unit of budget if the current window still has some.
    pub fn try_acquire(&self) -> Admission {
        let mut state = self.lock();
        self.roll_if_expired(&mut state);

        if state.count >= self.limit {
            let elapsed = state.started.elapsed();
            return Admission::Saturated {
                retry_in: self.size.saturating_sub(elapsed),
            };
        }

        state.count += 1;
        Admission::Granted { count: state.count }
    }

    /// Count a call unconditionally and report whether it went over the limit.
    pub fn record(&self) -> Recorded {
        let mut state = self.lock();
        self.roll_if_expired(&mut state);

        state.count = state.count.saturating_add(1);
        Recorded {
            count: state.count,
            exceeded: state.count > self.limit,
        }
    }

    /// Current window contents. Applies the lazy reset but never counts.
    pub fn snapshot(&self) -> WindowSnapshot {
        let mut state = self.lock();
        self.roll_if_expired(&mut state);

        WindowSnapshot::new(state.count, state.started_at)
    }

    fn lock(&self) -> MutexGuard<'_, WindowState> {
        // No code path panics while holding the guard, so the state behind
        // a poisoned lock is still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn roll_if_expired(&self, state: &mut WindowState) {
        let now = Instant::now();
        if now.duration_since(state.started) < self.size {
            return;
        }

        tracing::info!(
            window = self.name,
            previous_calls = state.count,
            limit = self.limit,
            "Rate window reset"
        );
        state.count = 0;
        state.started = now;
        state.started_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::advance;

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn test_grants_until_limit_then_saturates() {
        let window = RateWindow::new("test", 3, MINUTE);

        assert_eq!(window.try_acquire(), Admission::Granted { count: 1 });
        assert_eq!(window.try_acquire(), Admission::Granted { count: 2 });
        assert_eq!(window.try_acquire(), Admission::Granted { count: 3 });

        advance(Duration::from_secs(20)).await;
        match window.try_acquire() {
            Admission::Saturated { retry_in } => assert_eq!(retry_in, Duration::from_secs(40)),
            other => panic!("expected saturation, got {:?}", other),
        }
        // A refused acquire does not consume budget.
        assert_eq!(window.snapshot().calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_boundary() {
        let window = RateWindow::new("test", 10, MINUTE);
        window.record();

        advance(MINUTE - Duration::from_millis(1)).await;
        assert_eq!(window.record().count, 2);

        advance(Duration::from_millis(2)).await;
        assert_eq!(window.record().count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturated_window_reopens_after_rollover() {
        let window = RateWindow::new("test", 1, MINUTE);
        assert_eq!(window.try_acquire(), Admission::Granted { count: 1 });
        assert!(matches!(window.try_acquire(), Admission::Saturated { .. }));

        advance(MINUTE).await;
        assert_eq!(window.try_acquire(), Admission::Granted { count: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_counts_every_call() {
        let window = RateWindow::new("test", 2, MINUTE);

        assert_eq!(window.record(), Recorded { count: 1, exceeded: false });
        assert_eq!(window.record(), Recorded { count: 2, exceeded: false });
        assert_eq!(window.record(), Recorded { count: 3, exceeded: true });
        assert_eq!(window.record(), Recorded { count: 4, exceeded: true });
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_does_not_count() {
        let window = RateWindow::new("test", 5, MINUTE);
        window.record();

        for _ in 0..10 {
            assert_eq!(window.snapshot().calls, 1);
        }

        advance(MINUTE).await;
        assert_eq!(window.snapshot().calls, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_never_exceeds_limit() {
        let window = Arc::new(RateWindow::new("test", 50, MINUTE));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..500 {
            let window = Arc::clone(&window);
            tasks.spawn(async move { window.try_acquire() });
        }

        let mut granted = Vec::new();
        while let Some(result) = tasks.join_next().await {
            if let Admission::Granted { count } = result.unwrap() {
                granted.push(count);
            }
        }

        granted.sort_unstable();
        assert_eq!(granted, (1..=50).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_record_counts_each_call_once() {
        let window = Arc::new(RateWindow::new("test", 50, MINUTE));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..500 {
            let window = Arc::clone(&window);
            tasks.spawn(async move { window.record() });
        }

        let mut counts = Vec::new();
        let mut exceeded = 0;
        while let Some(result) = tasks.join_next().await {
            let recorded = result.unwrap();
            assert_eq!(recorded.exceeded, recorded.count > 50);
            if recorded.exceeded {
                exceeded += 1;
            }
            counts.push(recorded.count);
        }

        counts.sort_unstable();
        assert_eq!(counts, (1..=500).collect::<Vec<_>>());
        assert_eq!(exceeded, 450);
        assert_eq!(window.snapshot().calls, 500);
    }
}
