use std::error::Error as StdError;

use crate::probes::params::ParamError;
use crate::types::{ErrorCategory, TestEvidence, TestStatus};

/// Closed set of ways a probe invocation can go wrong. The category a failure
/// reports is derived from this and nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Bad or missing parameter.
    Parameter,
    /// Caller-supplied artifact (certificate bundle) unusable.
    Artifact,
    /// Endpoint reachable but an assertion about it failed.
    Assertion,
    Connect,
    Tls,
    Handshake,
    Protocol,
    Decode,
    TimedOut,
    Cancelled,
    /// A probe panicked.
    Internal,
}

impl FailureKind {
    pub fn category(self) -> ErrorCategory {
        match self {
            FailureKind::Parameter | FailureKind::Artifact => ErrorCategory::Configuration,
            FailureKind::Assertion => ErrorCategory::Validation,
            FailureKind::Connect
            | FailureKind::Tls
            | FailureKind::Handshake
            | FailureKind::Protocol
            | FailureKind::Decode => ErrorCategory::Network,
            FailureKind::TimedOut => ErrorCategory::Timeout,
            FailureKind::Cancelled | FailureKind::Internal => ErrorCategory::Unknown,
        }
    }

    pub fn status(self) -> TestStatus {
        match self {
            FailureKind::Cancelled => TestStatus::Skipped,
            _ => TestStatus::Fail,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Parameter => "ParameterError",
            FailureKind::Artifact => "ArtifactError",
            FailureKind::Assertion => "AssertionFailed",
            FailureKind::Connect => "ConnectError",
            FailureKind::Tls => "TlsError",
            FailureKind::Handshake => "HandshakeError",
            FailureKind::Protocol => "ProtocolError",
            FailureKind::Decode => "DecodeError",
            FailureKind::TimedOut => "TimedOut",
            FailureKind::Cancelled => "Cancelled",
            FailureKind::Internal => "InternalError",
        }
    }
}

/// Tagged failure carried out of a probe body and turned into a `TestResult`.
#[derive(Debug, Clone)]
pub struct ProbeFailure {
    pub kind: FailureKind,
    pub summary: String,
    pub message: String,
    pub details: Option<String>,
    /// Whatever was gathered before the failure.
    pub evidence: Option<TestEvidence>,
}

impl ProbeFailure {
    pub fn new(kind: FailureKind, summary: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            summary: summary.into(),
            message: message.into(),
            details: None,
            evidence: None,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(FailureKind::Parameter, format!("Configuration error: {}", message), message)
    }

    pub fn artifact(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(FailureKind::Artifact, format!("Configuration error: {}", message), message)
    }

    /// Validation failures use the same sentence for summary and message.
    pub fn assertion(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(FailureKind::Assertion, message.clone(), message)
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "Test cancelled before completion", "cancelled")
    }

    pub fn timed_out(stage: &str, budget_ms: u64) -> Self {
        Self::new(
            FailureKind::TimedOut,
            format!("{} did not complete within the {} ms timeout", stage, budget_ms),
            format!("{} timed out after {} ms", stage, budget_ms),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(FailureKind::Internal, "Probe failed unexpectedly", message)
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_evidence(mut self, evidence: TestEvidence) -> Self {
        self.evidence = Some(evidence);
        self
    }

    pub fn maybe_evidence(mut self, evidence: Option<TestEvidence>) -> Self {
        if evidence.is_some() {
            self.evidence = evidence;
        }
        self
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }
}

impl From<ParamError> for ProbeFailure {
    fn from(e: ParamError) -> Self {
        ProbeFailure::configuration(e.to_string())
    }
}

pub struct ProbeSuccess {
    pub summary: String,
    pub details: Option<String>,
    pub evidence: Option<TestEvidence>,
}

pub type ProbeOutcome = Result<ProbeSuccess, ProbeFailure>;

/// `outer -> cause -> root cause`, for technical details.
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut cur = err.source();
    while let Some(cause) = cur {
        let text = cause.to_string();
        if parts.last() != Some(&text) {
            parts.push(text);
        }
        cur = cause.source();
    }
    parts.join(" -> ")
}
