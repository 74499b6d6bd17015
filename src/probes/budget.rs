use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::probes::failure::ProbeFailure;

/// Why an awaited step stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// The caller's token fired.
    Cancelled,
    /// The probe's own deadline passed.
    TimedOut,
}

/// One probe invocation's time budget merged with the caller's cancellation token.
///
/// Every suspension point goes through [`Budget::run`], so a token firing and
/// the deadline passing are reported as distinct outcomes.
#[derive(Debug, Clone)]
pub struct Budget {
    started: Instant,
    deadline: Instant,
    total_ms: u64,
    cancel: CancellationToken,
}

impl Budget {
    pub fn start(total_ms: u64, cancel: &CancellationToken) -> Self {
        let started = Instant::now();
        Self {
            started,
            deadline: started + Duration::from_millis(total_ms),
            total_ms,
            cancel: cancel.clone(),
        }
    }

    pub fn total_ms(&self) -> u64 {
        self.total_ms
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Await `fut` until it finishes, the token fires, or the deadline passes.
    /// Cancellation wins ties.
    pub async fn race<F: Future>(&self, fut: F) -> Result<F::Output, Interrupt> {
        self.race_until(self.deadline, fut).await
    }

    /// Like [`Budget::race`] but never waits longer than `cap`.
    pub async fn race_capped<F: Future>(&self, cap: Duration, fut: F) -> Result<F::Output, Interrupt> {
        let capped = Instant::now() + cap;
        self.race_until(capped.min(self.deadline), fut).await
    }

    async fn race_until<F: Future>(&self, deadline: Instant, fut: F) -> Result<F::Output, Interrupt> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupt::Cancelled),
            _ = sleep_until(deadline) => Err(Interrupt::TimedOut),
            out = fut => Ok(out),
        }
    }

    /// [`Budget::race`] with the interrupt already turned into a failure naming `stage`.
    pub async fn run<F: Future>(&self, stage: &str, fut: F) -> Result<F::Output, ProbeFailure> {
        self.race(fut).await.map_err(|i| self.interrupted(stage, i))
    }

    pub fn interrupted(&self, stage: &str, interrupt: Interrupt) -> ProbeFailure {
        match interrupt {
            Interrupt::Cancelled => ProbeFailure::cancelled(),
            Interrupt::TimedOut => ProbeFailure::timed_out(stage, self.total_ms),
        }
    }
}
