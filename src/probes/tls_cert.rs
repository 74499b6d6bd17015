// src/probes/tls_cert.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use openssl::hash::MessageDigest;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use openssl::x509::{X509, X509StoreContextRef, X509VerifyResult};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_openssl::SslStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use x509_parser::prelude::*;

use super::budget::Budget;
use super::failure::{FailureKind, ProbeFailure, ProbeOutcome, ProbeSuccess};
use super::helper::{connect_with_budget, plural};
use super::params::{ParamError, Params};
use super::{run_guarded, Probe};
use crate::types::{ExecutionContext, TestDefinition, TestEvidence, TestResult, TimingBreakdown};

pub const KIND: &str = "tls-certificate";

/// Connects, captures the leaf certificate (even when the chain does not
/// verify) and checks its validity window and identity.
#[derive(Clone, Default)]
pub struct TlsCertProbe {
    trusted_roots: Vec<X509>,
}

impl TlsCertProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust an extra root on top of the platform store.
    pub fn with_trusted_root(mut self, root: X509) -> Self {
        self.trusted_roots.push(root);
        self
    }
}

#[derive(Debug, Clone)]
pub struct TlsCertParams {
    pub host: String,
    pub port: u16,
    pub warning_days: i64,
    pub timeout_ms: u64,
    pub skip_chain_validation: bool,
    pub expected_subject: Option<String>,
    pub expected_issuer: Option<String>,
    pub expected_thumbprint: Option<String>,
}

impl TlsCertParams {
    pub fn from_definition(def: &TestDefinition) -> Result<Self, ParamError> {
        let p = Params::new(def);
        let non_blank = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        Ok(Self {
            host: p.required_str("host")?.trim().to_string(),
            port: p.port("port", 443)?,
            warning_days: p.int_in_range("warningDaysBeforeExpiry", 30, 0, i64::MAX)?,
            timeout_ms: p.timeout_ms(10_000)?,
            skip_chain_validation: p.bool_or("skipChainValidation", false)?,
            expected_subject: non_blank(p.optional_str("expectedSubject")?),
            expected_issuer: non_blank(p.optional_str("expectedIssuer")?),
            expected_thumbprint: non_blank(p.optional_str("expectedThumbprint")?),
        })
    }
}

/// Chain-status flags the verify callback can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    /// A certificate in the chain is expired or not yet valid.
    NotTimeValid,
    UntrustedRoot,
    PartialChain,
    NameMismatch,
    Revoked,
    InvalidSignature,
    Other,
}

// X509_V_ERR_* codes from openssl/x509_vfy.h
const V_ERR_UNABLE_TO_GET_ISSUER_CERT: i32 = 2;
const V_ERR_CERT_SIGNATURE_FAILURE: i32 = 7;
const V_ERR_CERT_NOT_YET_VALID: i32 = 9;
const V_ERR_CERT_HAS_EXPIRED: i32 = 10;
const V_ERR_DEPTH_ZERO_SELF_SIGNED_CERT: i32 = 18;
const V_ERR_SELF_SIGNED_CERT_IN_CHAIN: i32 = 19;
const V_ERR_UNABLE_TO_GET_ISSUER_CERT_LOCALLY: i32 = 20;
const V_ERR_UNABLE_TO_VERIFY_LEAF_SIGNATURE: i32 = 21;
const V_ERR_CERT_REVOKED: i32 = 23;
const V_ERR_CERT_UNTRUSTED: i32 = 27;
const V_ERR_HOSTNAME_MISMATCH: i32 = 62;
const V_ERR_IP_ADDRESS_MISMATCH: i32 = 64;

impl ChainStatus {
    pub fn from_code(code: i32) -> Self {
        match code {
            V_ERR_CERT_NOT_YET_VALID | V_ERR_CERT_HAS_EXPIRED => ChainStatus::NotTimeValid,
            V_ERR_DEPTH_ZERO_SELF_SIGNED_CERT | V_ERR_SELF_SIGNED_CERT_IN_CHAIN | V_ERR_CERT_UNTRUSTED => {
                ChainStatus::UntrustedRoot
            }
            V_ERR_UNABLE_TO_GET_ISSUER_CERT
            | V_ERR_UNABLE_TO_GET_ISSUER_CERT_LOCALLY
            | V_ERR_UNABLE_TO_VERIFY_LEAF_SIGNATURE => ChainStatus::PartialChain,
            V_ERR_HOSTNAME_MISMATCH | V_ERR_IP_ADDRESS_MISMATCH => ChainStatus::NameMismatch,
            V_ERR_CERT_REVOKED => ChainStatus::Revoked,
            V_ERR_CERT_SIGNATURE_FAILURE => ChainStatus::InvalidSignature,
            _ => ChainStatus::Other,
        }
    }

    /// Only validity-window problems may be overridden. Anything else fails
    /// the handshake.
    pub fn is_overridable(self) -> bool {
        matches!(self, ChainStatus::NotTimeValid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainError {
    pub status: ChainStatus,
    pub depth: u32,
    pub detail: String,
}

impl ChainError {
    fn from_verify(result: X509VerifyResult, depth: u32) -> Self {
        Self {
            status: ChainStatus::from_code(result.as_raw()),
            depth,
            detail: result.error_string().to_string(),
        }
    }

    fn describe(&self) -> String {
        format!("{} (depth {})", self.detail, self.depth)
    }
}

/// Handshake acceptance policy: skip requested, no errors, or only
/// validity-window errors.
pub fn chain_policy_allows(skip_chain_validation: bool, errors: &[ChainError]) -> bool {
    skip_chain_validation || errors.iter().all(|e| e.status.is_overridable())
}

/// State shared with the openssl verify callback.
#[derive(Default)]
struct HandshakeCapture {
    leaf: Mutex<Option<X509>>,
    errors: Mutex<Vec<ChainError>>,
}

impl HandshakeCapture {
    fn verify(&self, preverify_ok: bool, ctx: &mut X509StoreContextRef, skip: bool) -> bool {
        let depth = ctx.error_depth();
        if depth == 0 {
            if let (Some(cert), Ok(mut slot)) = (ctx.current_cert(), self.leaf.lock()) {
                *slot = Some(cert.to_owned());
            }
        }
        if preverify_ok {
            return true;
        }
        let err = ChainError::from_verify(ctx.error(), depth);
        match self.errors.lock() {
            Ok(mut errors) => {
                errors.push(err);
                chain_policy_allows(skip, &errors)
            }
            Err(_) => chain_policy_allows(skip, &[err]),
        }
    }

    fn leaf(&self) -> Option<X509> {
        self.leaf.lock().ok().and_then(|l| l.clone())
    }

    fn errors(&self) -> Vec<ChainError> {
        self.errors.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

/// Fields read off the leaf certificate.
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    pub subject: String,
    pub common_name: Option<String>,
    pub issuer: String,
    pub thumbprint: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub dns_names: Vec<String>,
}

impl CertificateInfo {
    pub fn from_x509(cert: &X509) -> Result<Self, String> {
        let der = cert.to_der().map_err(|e| format!("DER encoding failed: {}", e))?;
        let (_, parsed) = parse_x509_certificate(&der).map_err(|e| format!("certificate parse failed: {}", e))?;

        let to_utc = |t: &ASN1Time| {
            DateTime::<Utc>::from_timestamp(t.timestamp(), 0)
                .ok_or_else(|| format!("certificate time out of range: {}", t))
        };

        let mut dns_names = Vec::new();
        if let Ok(Some(ext)) = parsed.subject_alternative_name() {
            for name in ext.value.general_names.iter() {
                if let GeneralName::DNSName(d) = name {
                    dns_names.push(d.to_string());
                }
            }
        }

        let digest = cert
            .digest(MessageDigest::sha1())
            .map_err(|e| format!("thumbprint failed: {}", e))?;

        let common_name = parsed
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(|cn| cn.to_string());

        Ok(Self {
            subject: parsed.subject().to_string(),
            common_name,
            issuer: parsed.issuer().to_string(),
            thumbprint: digest.iter().map(|b| format!("{:02X}", b)).collect(),
            not_before: to_utc(&parsed.validity().not_before)?,
            not_after: to_utc(&parsed.validity().not_after)?,
            dns_names,
        })
    }

    /// Whole days left, floored. Negative once expired.
    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now).num_seconds().div_euclid(86_400)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateEvidence {
    pub host: String,
    pub port: u16,
    pub subject: String,
    pub issuer: String,
    pub thumbprint: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub days_until_expiry: i64,
    pub subject_alternative_names: Vec<String>,
    pub protocol_version: Option<String>,
    pub chain_errors: Vec<String>,
    pub chain_validation_skipped: bool,
}

impl CertificateEvidence {
    fn new(params: &TlsCertParams, info: &CertificateInfo, protocol: Option<String>, errors: &[ChainError], now: DateTime<Utc>) -> Self {
        Self {
            host: params.host.clone(),
            port: params.port,
            subject: info.subject.clone(),
            issuer: info.issuer.clone(),
            thumbprint: info.thumbprint.clone(),
            not_before: info.not_before,
            not_after: info.not_after,
            days_until_expiry: info.days_until_expiry(now),
            subject_alternative_names: info.dns_names.clone(),
            protocol_version: protocol,
            chain_errors: errors.iter().map(ChainError::describe).collect(),
            chain_validation_skipped: params.skip_chain_validation,
        }
    }
}

fn fmt_date(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d").to_string()
}

/// Checks run in order, first failure wins. `Ok` carries the pass summary,
/// `Err` the failure sentence.
pub fn evaluate(info: &CertificateInfo, params: &TlsCertParams, now: DateTime<Utc>) -> Result<String, String> {
    let host = &params.host;
    if info.not_after < now {
        let days_ago = (now - info.not_after).num_days();
        let ago = if days_ago == 0 { "less than a day".to_string() } else { plural(days_ago, "day") };
        return Err(format!(
            "Certificate for {} expired {} ago on {}",
            host,
            ago,
            fmt_date(info.not_after)
        ));
    }
    if info.not_before > now {
        return Err(format!(
            "Certificate for {} is not valid until {}",
            host,
            fmt_date(info.not_before)
        ));
    }

    let days = info.days_until_expiry(now);
    if days < params.warning_days {
        return Err(format!(
            "Certificate for {} expires in {} on {}, inside the {}-day warning threshold",
            host,
            plural(days, "day"),
            fmt_date(info.not_after),
            params.warning_days
        ));
    }

    if let Some(expected) = &params.expected_subject {
        let needle = expected.to_lowercase();
        let in_subject = info.subject.to_lowercase().contains(&needle);
        let in_sans = info.dns_names.iter().any(|s| s.eq_ignore_ascii_case(expected));
        if !in_subject && !in_sans {
            let sans = if info.dns_names.is_empty() { "(none)".to_string() } else { info.dns_names.join(", ") };
            return Err(format!(
                "Certificate does not match expected subject '{}'. Subject: {}; SANs: {}",
                expected, info.subject, sans
            ));
        }
    }

    if let Some(expected) = &params.expected_issuer {
        if !info.issuer.to_lowercase().contains(&expected.to_lowercase()) {
            return Err(format!(
                "Certificate issuer '{}' does not match expected '{}'",
                info.issuer, expected
            ));
        }
    }

    if let Some(expected) = &params.expected_thumbprint {
        if !info.thumbprint.eq_ignore_ascii_case(expected) {
            return Err(format!(
                "Certificate thumbprint {} does not match expected {}",
                info.thumbprint, expected
            ));
        }
    }

    Ok(format!(
        "Certificate for {} is valid for {} (expires {})",
        host,
        plural(days, "day"),
        fmt_date(info.not_after)
    ))
}

fn setup_failure(e: openssl::error::ErrorStack) -> ProbeFailure {
    ProbeFailure::new(FailureKind::Tls, "Could not set up the TLS client", e.to_string())
}

impl TlsCertProbe {
    async fn check(&self, def: &TestDefinition, cancel: &CancellationToken) -> ProbeOutcome {
        let params = TlsCertParams::from_definition(def)?;
        debug!(host = %params.host, port = params.port, skip_chain = params.skip_chain_validation, "tls certificate probe");
        let budget = Budget::start(params.timeout_ms, cancel);
        let target = format!("{}:{}", params.host, params.port);

        let tcp = connect_with_budget(&params.host, params.port, &budget).await?;
        let connect_ms = budget.elapsed_ms();

        let capture = Arc::new(HandshakeCapture::default());
        let mut builder = SslConnector::builder(SslMethod::tls_client()).map_err(setup_failure)?;
        for root in &self.trusted_roots {
            builder.cert_store_mut().add_cert(root.clone()).map_err(setup_failure)?;
        }
        let skip = params.skip_chain_validation;
        let cb_capture = capture.clone();
        builder.set_verify_callback(SslVerifyMode::PEER, move |ok, ctx| cb_capture.verify(ok, ctx, skip));
        let connector = builder.build();

        // SNI + hostname verification both use the configured host
        let ssl = connector
            .configure()
            .and_then(|c| c.into_ssl(&params.host))
            .map_err(setup_failure)?;
        let mut stream = SslStream::new(ssl, tcp).map_err(setup_failure)?;

        let handshake = budget.run("TLS handshake", Pin::new(&mut stream).connect()).await?;
        let now = Utc::now();
        let chain_errors = capture.errors();

        if let Err(e) = handshake {
            let evidence = capture.leaf().and_then(|leaf| {
                CertificateInfo::from_x509(&leaf)
                    .ok()
                    .map(|info| TestEvidence::from_data(&CertificateEvidence::new(&params, &info, None, &chain_errors, now)))
            });
            let rejected: Vec<String> = chain_errors
                .iter()
                .filter(|c| !c.status.is_overridable())
                .map(ChainError::describe)
                .collect();
            let summary = if rejected.is_empty() {
                format!("TLS handshake with {} failed: {}", target, e)
            } else {
                format!("Certificate chain for {} was rejected: {}", target, rejected.join("; "))
            };
            return Err(ProbeFailure::new(FailureKind::Tls, summary, format!("TLS handshake failed: {}", e))
                .with_details(format!("{:?}", e))
                .maybe_evidence(evidence));
        }

        let protocol = stream.ssl().version_str().to_string();
        let leaf = stream.ssl().peer_certificate().or_else(|| capture.leaf());
        let handshake_ms = budget.elapsed_ms();

        // best-effort close_notify
        let _ = budget.race_capped(Duration::from_millis(500), stream.shutdown()).await;
        drop(stream);

        let Some(leaf) = leaf else {
            return Err(ProbeFailure::new(
                FailureKind::Tls,
                format!("{} completed the TLS handshake without presenting a certificate", target),
                "no peer certificate",
            ));
        };
        let info = CertificateInfo::from_x509(&leaf).map_err(|e| {
            ProbeFailure::new(FailureKind::Decode, format!("Could not read the certificate presented by {}", target), e)
        })?;

        let timing = TimingBreakdown {
            total_ms: budget.elapsed_ms(),
            connect_ms: Some(connect_ms),
            execute_ms: Some(handshake_ms.saturating_sub(connect_ms)),
        };
        let evidence = TestEvidence::from_data(&CertificateEvidence::new(&params, &info, Some(protocol.clone()), &chain_errors, now))
            .with_timing(timing);

        let mut details = format!(
            "Subject: {}\nIssuer: {}\nThumbprint: {}\nNotBefore: {}\nNotAfter: {}\nProtocol: {}",
            info.subject,
            info.issuer,
            info.thumbprint,
            info.not_before.to_rfc3339(),
            info.not_after.to_rfc3339(),
            protocol
        );
        if !chain_errors.is_empty() {
            details.push_str("\nChain errors: ");
            details.push_str(&chain_errors.iter().map(ChainError::describe).collect::<Vec<_>>().join("; "));
        }

        match evaluate(&info, &params, now) {
            Ok(summary) => Ok(ProbeSuccess { summary, details: Some(details), evidence: Some(evidence) }),
            Err(message) => Err(ProbeFailure::assertion(message).with_details(details).with_evidence(evidence)),
        }
    }
}

#[async_trait]
impl Probe for TlsCertProbe {
    async fn execute(
        &self,
        def: &TestDefinition,
        _ctx: Option<&ExecutionContext>,
        cancel: &CancellationToken,
    ) -> TestResult {
        run_guarded(def, cancel, self.check(def, cancel)).await
    }

    fn kind(&self) -> &'static str {
        KIND
    }

    fn name(&self) -> &'static str {
        "tls"
    }
}
