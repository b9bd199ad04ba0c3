//! Phased load generator.
//!
//! A sequence runs `phases` one-minute phases. Phase `n` issues
//! `fan_out^n` calls at once and waits for every one of them to finish
//! before the inter-phase pause. Identifiers increase across the whole
//! sequence and are never reused within it.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};

use crate::error::{CallError, Error, Result};
use crate::types::{Call, ForwardResult, GeneratorStatus, PhaseSnapshot};

/// Service the generator sends its calls to.
pub trait CallTarget: Send + Sync + 'static {
    fn call(&self, call: Call) -> impl Future<Output = std::result::Result<ForwardResult, CallError>> + Send;

    fn target(&self) -> &str;
}

/// Most calls a single sequence may issue. The default plan issues 69,904.
pub const MAX_SEQUENCE_CALLS: u64 = 1_000_000;

/// Shape of one load sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadPlan {
    pub phases: u32,
    pub fan_out: u64,
    pub pause: Duration,
}

impl Default for LoadPlan {
    fn default() -> Self {
        Self {
            phases: 4,
            fan_out: 16,
            pause: Duration::from_secs(60),
        }
    }
}

impl LoadPlan {
    /// Calls issued in `phase`. Exact for any plan that passes [`LoadPlan::check`].
    pub fn calls_in_phase(&self, phase: u32) -> u64 {
        self.fan_out.saturating_pow(phase)
    }

    /// Calls issued by the whole sequence, `None` on overflow.
    pub fn total_calls(&self) -> Option<u64> {
        (1..=self.phases).try_fold(0u64, |total, phase| {
            total.checked_add(self.fan_out.checked_pow(phase)?)
        })
    }

    /// Reject plans that overflow or would issue more than [`MAX_SEQUENCE_CALLS`].
    pub fn check(&self) -> Result<u64> {
        match self.total_calls() {
            Some(total) if self.phases > 0 && total <= MAX_SEQUENCE_CALLS => Ok(total),
            Some(total) if self.phases > 0 => Err(Error::Config(format!(
                "load plan issues {} calls, more than the limit of {}",
                total, MAX_SEQUENCE_CALLS
            ))),
            Some(_) => Err(Error::Config("load plan has no phases".to_string())),
            None => Err(Error::Config(format!(
                "load plan of {} phases with fan-out {} overflows the call counter",
                self.phases, self.fan_out
            ))),
        }
    }

    pub fn describe(&self) -> String {
        (1..=self.phases)
            .map(|phase| format!("Minute {}: {} calls", phase, self.calls_in_phase(phase)))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Echoed,
    Rejected,
    Failed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PhaseReport {
    pub issued: u64,
    pub echoed: u64,
    pub rejected: u64,
    pub failed: u64,
}

impl PhaseReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Echoed => self.echoed += 1,
            Outcome::Rejected => self.rejected += 1,
            Outcome::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SequenceReport {
    pub phases: Vec<PhaseReport>,
}

impl SequenceReport {
    pub fn total_issued(&self) -> u64 {
        self.phases.iter().map(|phase| phase.issued).sum()
    }
}

#[derive(Debug)]
struct Progress {
    running: bool,
    current_phase: u32,
    next_id: u64,
    total_calls: u64,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            running: false,
            current_phase: 1,
            next_id: 1,
            total_calls: 0,
        }
    }
}

pub struct LoadGenerator<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for LoadGenerator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T> {
    target: T,
    plan: LoadPlan,
    total_calls: u64,
    progress: Mutex<Progress>,
}

/// Clears the running flag however the sequence task ends, including
/// panics and aborts, so a later start is never locked out.
struct RunningFlag<'a>(&'a Mutex<Progress>);

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        let mut progress = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        progress.running = false;
    }
}

impl<T: CallTarget> LoadGenerator<T> {
    pub fn new(target: T, plan: LoadPlan) -> Result<Self> {
        let total_calls = plan.check()?;
        Ok(Self {
            inner: Arc::new(Inner {
                target,
                plan,
                total_calls,
                progress: Mutex::new(Progress::default()),
            }),
        })
    }

    /// Start a sequence in the background.
    ///
    /// Fails with [`Error::AlreadyRunning`] while another sequence is in
    /// progress; at most one sequence runs per generator.
    pub fn start(&self) -> Result<JoinHandle<SequenceReport>> {
        {
            let mut progress = self.inner.lock_progress();
            if progress.running {
                tracing::warn!(phase = progress.current_phase, "Load sequence already running");
                return Err(Error::AlreadyRunning {
                    current_phase: self.inner.phase_snapshot(&progress),
                });
            }
            *progress = Progress {
                running: true,
                ..Progress::default()
            };
        }

        tracing::info!(
            phases = self.inner.plan.phases,
            total_calls = self.inner.total_calls,
            "Load sequence start requested"
        );
        Ok(tokio::spawn(Arc::clone(&self.inner).run_sequence()))
    }

    pub fn status(&self) -> GeneratorStatus {
        let progress = self.inner.lock_progress();
        GeneratorStatus {
            is_running: progress.running,
            current_minute: progress.current_phase,
            current_id: progress.next_id,
            total_calls: progress.total_calls,
            next_calls_count: progress
                .running
                .then(|| self.inner.plan.calls_in_phase(progress.current_phase)),
            throttle_service_url: self.inner.target.target().to_string(),
        }
    }

    /// Progress of the running sequence, `None` when idle.
    pub fn current_phase(&self) -> Option<PhaseSnapshot> {
        let progress = self.inner.lock_progress();
        progress
            .running
            .then(|| self.inner.phase_snapshot(&progress))
    }

    pub fn plan(&self) -> LoadPlan {
        self.inner.plan
    }

    pub fn target(&self) -> &str {
        self.inner.target.target()
    }
}

impl<T: CallTarget> Inner<T> {
    fn lock_progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn phase_snapshot(&self, progress: &Progress) -> PhaseSnapshot {
        PhaseSnapshot {
            minute: progress.current_phase,
            calls_this_minute: self.plan.calls_in_phase(progress.current_phase),
            total_calls: progress.total_calls,
        }
    }

    async fn run_sequence(self: Arc<Self>) -> SequenceReport {
        let _running = RunningFlag(&self.progress);
        let mut report = SequenceReport::default();

        for phase in 1..=self.plan.phases {
            self.lock_progress().current_phase = phase;

            let phase_report = Arc::clone(&self).run_phase(phase).await;
            tracing::info!(
                phase,
                issued = phase_report.issued,
                echoed = phase_report.echoed,
                rejected = phase_report.rejected,
                failed = phase_report.failed,
                "Phase complete"
            );
            report.phases.push(phase_report);

            if phase < self.plan.phases {
                tracing::info!(
                    pause_ms = self.plan.pause.as_millis() as u64,
                    next_phase = phase + 1,
                    "Pausing before next phase"
                );
                tokio::time::sleep(self.plan.pause).await;
            }
        }

        tracing::info!(total_calls = report.total_issued(), "Load sequence completed");
        report
    }

    async fn run_phase(self: Arc<Self>, phase: u32) -> PhaseReport {
        let count = self.plan.calls_in_phase(phase);
        let first_id = {
            let mut progress = self.lock_progress();
            let first = progress.next_id;
            progress.next_id = progress.next_id.saturating_add(count);
            progress.total_calls = progress.total_calls.saturating_add(count);
            first
        };

        tracing::info!(phase, calls = count, first_id, "Starting phase");

        let mut calls = JoinSet::new();
        for id in first_id..first_id.saturating_add(count) {
            let inner = Arc::clone(&self);
            calls.spawn(async move { inner.issue(id).await });
        }

        let mut report = PhaseReport {
            issued: count,
            ..PhaseReport::default()
        };
        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok(outcome) => report.record(outcome),
                Err(err) => {
                    tracing::error!(phase, error = %err, "Call task aborted");
                    report.record(Outcome::Failed);
                }
            }
        }
        report
    }

    async fn issue(&self, id: u64) -> Outcome {
        let call = Call::new(id, id.to_string());
        tracing::debug!(id, "Making call");

        match self.target.call(call).await {
            Ok(result) => {
                tracing::debug!(
                    id,
                    response = %result.echo.response,
                    rate_limit_exceeded = result.echo.rate_limit_exceeded,
                    "Received response"
                );
                if result.echo.rate_limit_exceeded {
                    Outcome::Rejected
                } else if result.is_forwarded() {
                    Outcome::Echoed
                } else {
                    Outcome::Failed
                }
            }
            Err(err) => {
                tracing::warn!(id, error = %err, "Call failed");
                Outcome::Failed
            }
        }
    }
}
