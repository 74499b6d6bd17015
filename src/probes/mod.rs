pub mod budget;
pub mod failure;
pub mod helper;
pub mod mtls;
pub mod params;
pub mod tls_cert;
pub mod websocket;

pub use budget::{Budget, Interrupt};
pub use failure::{FailureKind, ProbeFailure, ProbeOutcome, ProbeSuccess};
pub use mtls::MtlsProbe;
pub use params::{ParamError, Params};
pub use tls_cert::TlsCertProbe;
pub use websocket::WebSocketProbe;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::types::{
    ExecutionContext, TestDefinition, TestError, TestResult, TestStatus, TimingBreakdown,
};

#[async_trait]
pub trait Probe: Send + Sync {
    /// Run one check. Never panics; every failure ends up in the returned result.
    async fn execute(
        &self,
        def: &TestDefinition,
        ctx: Option<&ExecutionContext>,
        cancel: &CancellationToken,
    ) -> TestResult;
    /// Type tag this probe answers to in `TestDefinition::kind`.
    fn kind(&self) -> &'static str;
    /// Human name for logging
    fn name(&self) -> &'static str {
        "generic"
    }
}

pub type ProbeHandle = Arc<dyn Probe>;

pub fn default_probes() -> Vec<ProbeHandle> {
    vec![
        Arc::new(TlsCertProbe::new()),
        Arc::new(MtlsProbe::new()),
        Arc::new(WebSocketProbe::new()),
    ]
}

/// Lookup from type tag to probe.
#[derive(Clone)]
pub struct ProbeRegistry {
    probes: Vec<ProbeHandle>,
}

impl Default for ProbeRegistry {
    fn default() -> Self {
        Self::new(default_probes())
    }
}

impl ProbeRegistry {
    pub fn new(probes: Vec<ProbeHandle>) -> Self {
        Self { probes }
    }

    pub fn get(&self, kind: &str) -> Option<ProbeHandle> {
        self.probes
            .iter()
            .find(|p| p.kind().eq_ignore_ascii_case(kind))
            .cloned()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.probes.iter().map(|p| p.kind()).collect()
    }

    /// Dispatch on `def.kind`; an unknown tag is a configuration failure.
    pub async fn execute(
        &self,
        def: &TestDefinition,
        ctx: Option<&ExecutionContext>,
        cancel: &CancellationToken,
    ) -> TestResult {
        match self.get(&def.kind) {
            Some(probe) => probe.execute(def, ctx, cancel).await,
            None => {
                let known = self.kinds().join(", ");
                run_guarded(def, cancel, async move {
                    Err(ProbeFailure::configuration(format!(
                        "unknown test type '{}' (known: {})",
                        def.kind, known
                    )))
                })
                .await
            }
        }
    }
}

/// Shared envelope around a probe body: stamps times, short-circuits a
/// pre-cancelled token, turns panics into failures, builds the result.
pub async fn run_guarded<F>(def: &TestDefinition, cancel: &CancellationToken, body: F) -> TestResult
where
    F: Future<Output = ProbeOutcome>,
{
    let start_time = Utc::now();
    let started = Instant::now();
    debug!(test_id = %def.id, test_type = %def.kind, "probe started");

    let outcome = if cancel.is_cancelled() {
        Err(ProbeFailure::cancelled())
    } else {
        match AssertUnwindSafe(body).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(ProbeFailure::internal(panic_message(panic.as_ref()))),
        }
    };

    let elapsed = started.elapsed();
    let result = build_result(def, start_time, elapsed.as_millis() as u64, outcome);
    match result.status {
        TestStatus::Pass => info!(test_id = %def.id, duration_ms = result.duration_ms, "{}", result.human_summary),
        TestStatus::Skipped => info!(test_id = %def.id, "{}", result.human_summary),
        TestStatus::Fail => warn!(
            test_id = %def.id,
            category = %result.category().map(|c| c.to_string()).unwrap_or_default(),
            "{}",
            result.human_summary
        ),
    }
    result
}

fn build_result(
    def: &TestDefinition,
    start_time: chrono::DateTime<Utc>,
    duration_ms: u64,
    outcome: ProbeOutcome,
) -> TestResult {
    let end_time = start_time + chrono::Duration::milliseconds(duration_ms as i64);
    let (status, summary, details, error, mut evidence) = match outcome {
        Ok(ok) => (TestStatus::Pass, ok.summary, ok.details, None, ok.evidence),
        Err(fail) => {
            let message = if fail.message.trim().is_empty() {
                fail.summary.clone()
            } else {
                fail.message
            };
            let error = TestError {
                category: fail.kind.category(),
                message: if message.trim().is_empty() { fail.kind.as_str().to_string() } else { message },
                stack_trace: fail.details.clone(),
                exception_type: Some(fail.kind.as_str().to_string()),
            };
            (fail.kind.status(), fail.summary, fail.details, Some(error), fail.evidence)
        }
    };

    if let Some(ev) = evidence.as_mut() {
        match ev.timing.as_mut() {
            Some(t) => t.total_ms = duration_ms,
            None => ev.timing = Some(TimingBreakdown { total_ms: duration_ms, ..Default::default() }),
        }
    }

    let human_summary = if summary.trim().is_empty() {
        match status {
            TestStatus::Pass => "Test passed".to_string(),
            TestStatus::Fail => "Test failed".to_string(),
            TestStatus::Skipped => "Test cancelled".to_string(),
        }
    } else {
        summary
    };

    TestResult {
        test_id: def.id.clone(),
        test_type: def.kind.clone(),
        display_name: def.display_name.clone(),
        status,
        start_time,
        end_time,
        duration_ms,
        human_summary,
        technical_details: details,
        error,
        evidence,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("probe panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("probe panicked: {}", s)
    } else {
        "probe panicked".to_string()
    }
}
