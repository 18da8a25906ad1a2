//! Run state shared between the orchestrator and the triggers.
//!
//! [`RunState`] is the only mutable state visible to more than one task: the
//! upload trigger claims it, the cancel trigger flips it, the status endpoint
//! reads it, and the orchestrator updates progress. Everything is atomic so no
//! lock is ever held across an `.await`.
//!
//! A run never touches `RunState` directly. It receives a [`RunContext`] that
//! remembers which *generation* of the state it belongs to. When a cancelled
//! run is still winding down and a new run starts, the old context sees the
//! generation change and keeps reporting "stop", so the new run's fresh
//! `should_continue = true` cannot resurrect it.

use crate::config::PipelineConfig;
use crate::error::NarrateError;
use crate::pipeline::wait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Converting,
    Recognizing,
    Enriching,
    Scripting,
    Synthesizing,
    Dispatching,
    Completed,
    Stopped,
    Failed,
}

impl Stage {
    fn as_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(v: u8) -> Stage {
        match v {
            1 => Stage::Converting,
            2 => Stage::Recognizing,
            3 => Stage::Enriching,
            4 => Stage::Scripting,
            5 => Stage::Synthesizing,
            6 => Stage::Dispatching,
            7 => Stage::Completed,
            8 => Stage::Stopped,
            9 => Stage::Failed,
            _ => Stage::Idle,
        }
    }
}

/// Process-wide run flags.
#[derive(Debug, Default)]
pub struct RunState {
    is_processing: AtomicBool,
    should_continue: AtomicBool,
    current_slide: AtomicUsize,
    stage: AtomicU8,
    generation: AtomicU64,
}

/// Point-in-time view of [`RunState`], as served by `GET /status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub is_processing: bool,
    pub should_continue: bool,
    pub current_slide: usize,
    pub stage: Stage,
}

impl RunState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing.load(Ordering::Acquire)
    }

    pub fn current_slide(&self) -> usize {
        self.current_slide.load(Ordering::Acquire)
    }

    pub fn stage(&self) -> Stage {
        Stage::from_u8(self.stage.load(Ordering::Acquire))
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            is_processing: self.is_processing(),
            should_continue: self.should_continue.load(Ordering::Acquire),
            current_slide: self.current_slide(),
            stage: self.stage(),
        }
    }

    /// Claim the processing guard for a new run.
    ///
    /// Fails with [`NarrateError::AlreadyProcessing`] while another run holds
    /// it; a busy pipeline rejects rather than queues.
    pub fn try_begin(self: &Arc<Self>) -> Result<RunGuard, NarrateError> {
        if self
            .is_processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(NarrateError::AlreadyProcessing);
        }
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.current_slide.store(0, Ordering::Release);
        self.stage.store(Stage::Idle.as_u8(), Ordering::Release);
        self.should_continue.store(true, Ordering::Release);
        debug!("Run generation {} claimed the processing guard", generation);
        Ok(RunGuard {
            state: Arc::clone(self),
            generation,
        })
    }

    /// The cancel trigger: stop the active run and release the guard.
    ///
    /// Returns whether a run was in flight. The run notices at its next
    /// page or batch boundary; an in-flight collaborator call is not
    /// interrupted.
    pub fn cancel(&self) -> bool {
        self.should_continue.store(false, Ordering::Release);
        let was_processing = self.is_processing.swap(false, Ordering::AcqRel);
        if was_processing {
            info!("Cancellation requested for the active run");
        }
        was_processing
    }
}

/// Holds `is_processing` for one run; releases it on drop.
#[derive(Debug)]
pub struct RunGuard {
    state: Arc<RunState>,
    generation: u64,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        // A later run may already own the flag if this one was cancelled.
        if self.state.generation.load(Ordering::Acquire) == self.generation {
            self.state.is_processing.store(false, Ordering::Release);
        }
    }
}

/// Per-run handle injected into every stage.
#[derive(Debug)]
pub struct RunContext {
    run_id: Uuid,
    guard: RunGuard,
    /// Milliseconds of file-readiness waiting this run may still spend.
    wait_budget_ms: AtomicU64,
}

impl RunContext {
    /// Claim `state` and build the context for a new run.
    pub fn begin(state: &Arc<RunState>, config: &PipelineConfig) -> Result<Self, NarrateError> {
        let guard = state.try_begin()?;
        Ok(Self::from_guard(guard, config))
    }

    /// Build the context around a guard the caller already holds.
    pub fn from_guard(guard: RunGuard, config: &PipelineConfig) -> Self {
        let budget = config.max_total_wait().as_millis().min(u64::MAX as u128) as u64;
        Self {
            run_id: Uuid::new_v4(),
            guard,
            wait_budget_ms: AtomicU64::new(budget),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state(&self) -> &Arc<RunState> {
        &self.guard.state
    }

    /// False once this run has been cancelled or superseded.
    pub fn should_continue(&self) -> bool {
        let state = &self.guard.state;
        state.should_continue.load(Ordering::Acquire)
            && state.generation.load(Ordering::Acquire) == self.guard.generation
    }

    /// Resolve once this run is cancelled or superseded, checking every `poll`.
    pub async fn stopped(&self, poll: Duration) {
        while self.should_continue() {
            tokio::time::sleep(poll).await;
        }
    }

    /// Request cancellation of this run (e.g. on Ctrl-C).
    pub fn cancel(&self) {
        if self.owns_state() {
            self.guard.state.cancel();
        }
    }

    pub fn set_stage(&self, stage: Stage) {
        if self.owns_state() {
            self.guard.state.stage.store(stage.as_u8(), Ordering::Release);
        }
    }

    /// Record the last fully processed page.
    pub fn set_current_slide(&self, page: usize) {
        if self.owns_state() {
            self.guard.state.current_slide.store(page, Ordering::Release);
        }
    }

    /// Remaining run-level wait budget.
    pub fn remaining_wait_budget(&self) -> Duration {
        Duration::from_millis(self.wait_budget_ms.load(Ordering::Acquire))
    }

    /// Wait for `path` to appear, charging the time spent to the run budget.
    ///
    /// The effective timeout is the smaller of `timeout` and what is left of
    /// the budget; once the budget is spent, this degrades to a single
    /// existence check.
    pub async fn await_file(&self, path: &Path, timeout: Duration, poll: Duration) -> bool {
        let budget = self.remaining_wait_budget();
        let effective = timeout.min(budget);
        if effective < timeout {
            warn!(
                "Wait for {} capped at {:?} by the run wait budget",
                path.display(),
                effective
            );
        }
        let start = Instant::now();
        let found = wait::await_file(path, effective, poll).await;
        let spent = start.elapsed().as_millis().min(u64::MAX as u128) as u64;
        let _ = self
            .wait_budget_ms
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| {
                Some(left.saturating_sub(spent))
            });
        found
    }

    fn owns_state(&self) -> bool {
        self.guard.state.generation.load(Ordering::Acquire) == self.guard.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_begin_is_rejected_while_busy() {
        let state = RunState::new();
        let config = PipelineConfig::default();
        let ctx = RunContext::begin(&state, &config).unwrap();
        assert!(state.is_processing());
        let err = RunContext::begin(&state, &config).unwrap_err();
        assert!(matches!(err, NarrateError::AlreadyProcessing));
        drop(ctx);
        assert!(!state.is_processing());
        assert!(RunContext::begin(&state, &config).is_ok());
    }

    #[test]
    fn cancel_flips_both_flags() {
        let state = RunState::new();
        let ctx = RunContext::begin(&state, &PipelineConfig::default()).unwrap();
        assert!(ctx.should_continue());
        assert!(state.cancel());
        assert!(!ctx.should_continue());
        assert!(!state.is_processing());
        assert!(!state.cancel(), "second cancel finds nothing running");
    }

    #[test]
    fn cancelled_run_stays_stopped_when_a_new_run_starts() {
        let state = RunState::new();
        let config = PipelineConfig::default();
        let old = RunContext::begin(&state, &config).unwrap();
        state.cancel();
        let new = RunContext::begin(&state, &config).unwrap();
        assert!(new.should_continue());
        assert!(!old.should_continue());

        // The superseded run must not clobber the new run's progress or guard.
        old.set_current_slide(9);
        old.set_stage(Stage::Stopped);
        drop(old);
        assert!(state.is_processing());
        assert_eq!(state.current_slide(), 0);
        assert_eq!(state.stage(), Stage::Idle);
        drop(new);
        assert!(!state.is_processing());
    }

    #[test]
    fn snapshot_reflects_progress() {
        let state = RunState::new();
        let ctx = RunContext::begin(&state, &PipelineConfig::default()).unwrap();
        ctx.set_stage(Stage::Dispatching);
        ctx.set_current_slide(4);
        let snap = state.snapshot();
        assert_eq!(
            snap,
            RunSnapshot {
                is_processing: true,
                should_continue: true,
                current_slide: 4,
                stage: Stage::Dispatching,
            }
        );
    }

    #[tokio::test]
    async fn wait_budget_caps_and_drains() {
        let dir = tempfile::tempdir().unwrap();
        let state = RunState::new();
        let config = PipelineConfig::builder()
            .max_total_wait_secs(0)
            .build()
            .unwrap();
        let ctx = RunContext::begin(&state, &config).unwrap();
        let start = Instant::now();
        let found = ctx
            .await_file(
                &dir.path().join("never.png"),
                Duration::from_secs(30),
                Duration::from_millis(10),
            )
            .await;
        assert!(!found);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(ctx.remaining_wait_budget(), Duration::ZERO);
    }
}
