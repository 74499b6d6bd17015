use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use openssl::ssl::{SslConnector, SslMethod};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_openssl::SslStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::{CloseCode, Data, OpCode};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::budget::{Budget, Interrupt};
use super::failure::{error_chain, FailureKind, ProbeFailure, ProbeOutcome, ProbeSuccess};
use super::helper::{connect_with_budget, describe_io_error, truncate_for_display};
use super::params::{ParamError, Params};
use super::{run_guarded, Probe};
use crate::types::{ExecutionContext, TestDefinition, TestEvidence, TestResult, TimingBreakdown};

pub const KIND: &str = "websocket";

pub const MAX_MESSAGE_BYTES: usize = 8192;
const SUMMARY_PREVIEW_CHARS: usize = 200;
const EVIDENCE_PREVIEW_CHARS: usize = 1024;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Plain TCP or TLS, boxed so the handshake code does not care which.
trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

type Socket = WebSocketStream<Box<dyn Transport>>;

/// Opens a WebSocket, optionally exchanges one message, and closes it.
#[derive(Clone, Default)]
pub struct WebSocketProbe;

impl WebSocketProbe {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug, Clone)]
pub struct WebSocketParams {
    pub url: Url,
    pub timeout_ms: u64,
    pub message: Option<String>,
    pub expected_response: Option<String>,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub subprotocol: Option<String>,
}

impl WebSocketParams {
    pub fn from_definition(def: &TestDefinition) -> Result<Self, ParamError> {
        let p = Params::new(def);
        let raw_url = p.required_str("url")?;
        let url = Url::parse(raw_url.trim()).map_err(|e| ParamError::invalid("url", e.to_string()))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ParamError::invalid(
                "url",
                format!("must use ws:// or wss:// (got {}://)", url.scheme()),
            ));
        }
        if url.host_str().is_none() {
            return Err(ParamError::invalid("url", "missing host"));
        }

        let message = p.optional_str("message")?.filter(|m| !m.is_empty());
        if let Some(m) = &message {
            if m.len() > MAX_MESSAGE_BYTES {
                return Err(ParamError::invalid(
                    "message",
                    format!("{} bytes exceeds the {}-byte limit", m.len(), MAX_MESSAGE_BYTES),
                ));
            }
        }
        let expected_response = p.optional_str("expectedResponse")?.filter(|m| !m.is_empty());
        if expected_response.is_some() && message.is_none() {
            return Err(ParamError::invalid("expectedResponse", "requires 'message' to be set"));
        }

        let mut headers = Vec::new();
        for (name, value) in p.string_pairs("headers")? {
            let n = HeaderName::from_bytes(name.trim().as_bytes())
                .map_err(|_| ParamError::invalid("headers", format!("'{}' is not a valid header name", name)))?;
            let v = HeaderValue::from_str(&value)
                .map_err(|_| ParamError::invalid("headers", format!("value for '{}' is not a valid header value", name)))?;
            headers.push((n, v));
        }

        let subprotocol = p
            .optional_str("subprotocol")?
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        if let Some(sp) = &subprotocol {
            HeaderValue::from_str(sp).map_err(|_| ParamError::invalid("subprotocol", "not a valid token"))?;
        }

        Ok(Self {
            url,
            timeout_ms: p.timeout_ms(10_000)?,
            message,
            expected_response,
            headers,
            subprotocol,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Text,
    Binary,
}

/// What the receive loop ended with.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    /// A full logical message.
    Message { kind: MessageKind, data: Vec<u8> },
    /// The peer closed (or the stream ended), possibly mid-message.
    Closed {
        partial: Option<(MessageKind, Vec<u8>)>,
        frame: Option<CloseFrame<'static>>,
    },
}

/// Reassembles one logical message from whatever the socket yields. Whole
/// messages arrive as `Text`/`Binary`; raw `Frame`s are stitched until FIN.
#[derive(Debug, Default)]
pub struct ResponseAssembler {
    buf: Vec<u8>,
    kind: Option<MessageKind>,
}

impl ResponseAssembler {
    /// Feed one item. `Some` once the message is complete or the peer closed.
    pub fn push(&mut self, msg: Message) -> Option<Received> {
        match msg {
            Message::Text(text) => {
                self.buf.extend_from_slice(text.as_bytes());
                self.kind.get_or_insert(MessageKind::Text);
                Some(self.take())
            }
            Message::Binary(bytes) => {
                self.buf.extend_from_slice(&bytes);
                self.kind.get_or_insert(MessageKind::Binary);
                Some(self.take())
            }
            Message::Frame(frame) => {
                let header = frame.header();
                match header.opcode {
                    OpCode::Data(Data::Text) => self.kind = Some(MessageKind::Text),
                    OpCode::Data(Data::Binary) => self.kind = Some(MessageKind::Binary),
                    OpCode::Data(Data::Continue) => {}
                    _ => return None,
                }
                let is_final = header.is_final;
                self.buf.extend_from_slice(frame.payload());
                if is_final {
                    Some(self.take())
                } else {
                    None
                }
            }
            Message::Ping(_) | Message::Pong(_) => None,
            Message::Close(frame) => Some(self.closed(frame)),
        }
    }

    /// Stream ended with no close frame.
    pub fn finish(&mut self) -> Received {
        self.closed(None)
    }

    fn take(&mut self) -> Received {
        Received::Message {
            kind: self.kind.take().unwrap_or(MessageKind::Text),
            data: std::mem::take(&mut self.buf),
        }
    }

    fn closed(&mut self, frame: Option<CloseFrame<'static>>) -> Received {
        let partial = if self.buf.is_empty() {
            None
        } else {
            Some((self.kind.take().unwrap_or(MessageKind::Text), std::mem::take(&mut self.buf)))
        };
        Received::Closed { partial, frame }
    }
}

/// RFC 6455 close-code names.
pub fn close_status_name(code: CloseCode) -> String {
    let name = match code {
        CloseCode::Normal => "NormalClosure",
        CloseCode::Away => "EndpointUnavailable",
        CloseCode::Protocol => "ProtocolError",
        CloseCode::Unsupported => "InvalidMessageType",
        CloseCode::Status => "Empty",
        CloseCode::Abnormal => "Abnormal",
        CloseCode::Invalid => "InvalidPayloadData",
        CloseCode::Policy => "PolicyViolation",
        CloseCode::Size => "MessageTooBig",
        CloseCode::Extension => "MandatoryExtension",
        CloseCode::Error => "InternalServerError",
        other => return format!("Code{}", u16::from(other)),
    };
    name.to_string()
}

fn protocol_phrase(p: &ProtocolError) -> &'static str {
    match p {
        ProtocolError::WrongHttpMethod | ProtocolError::WrongHttpVersion => "unsupported protocol version",
        ProtocolError::MissingConnectionUpgradeHeader
        | ProtocolError::MissingUpgradeWebSocketHeader
        | ProtocolError::MissingSecWebSocketVersionHeader
        | ProtocolError::MissingSecWebSocketKey
        | ProtocolError::SecWebSocketAcceptKeyMismatch => "handshake header error",
        ProtocolError::SecWebSocketSubProtocolError(_) => "subprotocol negotiation failed",
        ProtocolError::HandshakeIncomplete | ProtocolError::ResetWithoutClosingHandshake => {
            "connection closed prematurely"
        }
        ProtocolError::HttparseError(_) => "malformed handshake response",
        _ => "protocol violation",
    }
}

/// Kind and human phrase for a tungstenite error.
pub fn describe_ws_error(e: &WsError) -> (FailureKind, String) {
    match e {
        WsError::Io(io) => (FailureKind::Connect, describe_io_error(io).to_string()),
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            (FailureKind::Protocol, "connection closed prematurely".to_string())
        }
        WsError::Protocol(p) => (FailureKind::Handshake, protocol_phrase(p).to_string()),
        WsError::Http(resp) => (
            FailureKind::Handshake,
            format!("server rejected the upgrade with HTTP {}", resp.status().as_u16()),
        ),
        WsError::HttpFormat(_) => (FailureKind::Handshake, "malformed HTTP in handshake".to_string()),
        WsError::Url(_) => (FailureKind::Parameter, "invalid WebSocket URL".to_string()),
        WsError::Capacity(_) => (FailureKind::Protocol, "message exceeds the size limit".to_string()),
        WsError::Utf8 => (FailureKind::Protocol, "invalid UTF-8 in text message".to_string()),
        _ => (FailureKind::Protocol, "protocol error".to_string()),
    }
}

fn ws_failure(stage: &str, url: &Url, e: &WsError) -> ProbeFailure {
    let (kind, phrase) = describe_ws_error(e);
    let chain = error_chain(e);
    ProbeFailure::new(kind, format!("WebSocket {} failed for {}: {}", stage, url, phrase), chain.clone())
        .with_details(chain)
}

fn handshake_used_budget(connect_ms: u64, total_ms: u64) -> ProbeFailure {
    let pct = if total_ms == 0 { 100 } else { connect_ms.saturating_mul(100) / total_ms };
    ProbeFailure::new(
        FailureKind::TimedOut,
        format!(
            "WebSocket handshake took {} ms of the {} ms timeout ({}%), leaving no time to exchange messages",
            connect_ms, total_ms, pct
        ),
        format!("timeout exhausted by handshake after {} ms", connect_ms),
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketEvidence {
    pub url: String,
    pub connect_ms: u64,
    pub requested_subprotocol: Option<String>,
    pub subprotocol: Option<String>,
    pub sent_message: Option<String>,
    pub received_message: Option<String>,
    pub received_bytes: Option<usize>,
    pub message_type: Option<MessageKind>,
    pub close_status: Option<String>,
    pub close_description: Option<String>,
}

impl WebSocketEvidence {
    fn record_close(&mut self, frame: Option<&CloseFrame<'_>>) {
        match frame {
            Some(f) => {
                self.close_status = Some(close_status_name(f.code));
                self.close_description = Some(f.reason.to_string()).filter(|r| !r.is_empty());
            }
            None => self.close_status = Some("Empty".to_string()),
        }
    }
}

async fn open_transport(params: &WebSocketParams, budget: &Budget) -> Result<Box<dyn Transport>, ProbeFailure> {
    let host = params.url.host_str().unwrap_or_default().to_string();
    let port = params.url.port_or_known_default().unwrap_or(80);
    let tcp = connect_with_budget(&host, port, budget).await?;
    if params.url.scheme() != "wss" {
        return Ok(Box::new(tcp));
    }

    let tls_setup = |e: openssl::error::ErrorStack| {
        ProbeFailure::new(FailureKind::Tls, "Could not set up the TLS client", e.to_string())
    };
    let connector = SslConnector::builder(SslMethod::tls_client()).map_err(tls_setup)?.build();
    let ssl = connector.configure().and_then(|c| c.into_ssl(&host)).map_err(tls_setup)?;
    let mut stream = SslStream::new(ssl, tcp).map_err(tls_setup)?;
    if let Err(e) = budget.run("TLS handshake", Pin::new(&mut stream).connect()).await? {
        return Err(ProbeFailure::new(
            FailureKind::Tls,
            format!("TLS handshake with {}:{} failed: {}", host, port, e),
            e.to_string(),
        ));
    }
    Ok(Box::new(stream))
}

async fn receive_response(ws: &mut Socket) -> Result<Received, WsError> {
    let mut assembler = ResponseAssembler::default();
    loop {
        match ws.next().await {
            None => return Ok(assembler.finish()),
            Some(Err(e)) => return Err(e),
            Some(Ok(msg)) => {
                if let Some(done) = assembler.push(msg) {
                    return Ok(done);
                }
            }
        }
    }
}

/// Close handshake bounded by `CLOSE_TIMEOUT`; on failure the socket is
/// dropped, which aborts the connection.
async fn close_gracefully(mut ws: Socket, budget: &Budget, evidence: &mut WebSocketEvidence) -> Result<(), ProbeFailure> {
    let outcome = budget
        .race_capped(CLOSE_TIMEOUT, async {
            ws.close(Some(CloseFrame { code: CloseCode::Normal, reason: "".into() })).await?;
            while let Some(msg) = ws.next().await {
                match msg {
                    Ok(Message::Close(frame)) => return Ok(Some(frame)),
                    Ok(_) => continue,
                    Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => break,
                    Err(e) => return Err(e),
                }
            }
            Ok::<_, WsError>(None)
        })
        .await;

    match outcome {
        Ok(Ok(Some(frame))) => evidence.record_close(frame.as_ref()),
        Ok(Ok(None)) => evidence.record_close(None),
        Ok(Err(e)) => {
            debug!(error = %e, "graceful close failed, aborting");
            evidence.close_status = Some("Aborted".to_string());
        }
        Err(Interrupt::TimedOut) => {
            debug!("graceful close timed out, aborting");
            evidence.close_status = Some("Aborted".to_string());
        }
        Err(Interrupt::Cancelled) => return Err(ProbeFailure::cancelled()),
    }
    Ok(())
}

impl WebSocketProbe {
    async fn check(&self, def: &TestDefinition, cancel: &CancellationToken) -> ProbeOutcome {
        let params = WebSocketParams::from_definition(def)?;
        debug!(url = %params.url, has_message = params.message.is_some(), "websocket probe");
        let budget = Budget::start(params.timeout_ms, cancel);

        let mut request = params
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ProbeFailure::configuration(format!("parameter 'url' is invalid: {}", e)))?;
        for (name, value) in &params.headers {
            request.headers_mut().append(name.clone(), value.clone());
        }
        if let Some(sp) = &params.subprotocol {
            let value = HeaderValue::from_str(sp)
                .map_err(|_| ProbeFailure::configuration("parameter 'subprotocol' is invalid"))?;
            request.headers_mut().insert("Sec-WebSocket-Protocol", value);
        }

        let transport = open_transport(&params, &budget).await?;
        let handshake = tokio_tungstenite::client_async(request, transport);
        let (mut ws, response) = match budget.run("handshake", handshake).await? {
            Ok(pair) => pair,
            Err(e) => return Err(ws_failure("handshake", &params.url, &e)),
        };
        let connect_ms = budget.elapsed_ms();
        let negotiated = response
            .headers()
            .get("sec-websocket-protocol")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let mut data = WebSocketEvidence {
            url: params.url.to_string(),
            connect_ms,
            requested_subprotocol: params.subprotocol.clone(),
            subprotocol: negotiated.clone(),
            sent_message: params.message.clone(),
            received_message: None,
            received_bytes: None,
            message_type: None,
            close_status: None,
            close_description: None,
        };
        let timing = |budget: &Budget| TimingBreakdown {
            total_ms: budget.elapsed_ms(),
            connect_ms: Some(connect_ms),
            execute_ms: Some(budget.elapsed_ms().saturating_sub(connect_ms)),
        };

        let Some(message) = params.message.clone() else {
            close_gracefully(ws, &budget, &mut data).await?;
            let evidence = TestEvidence::from_data(&data).with_timing(timing(&budget));
            return Ok(ProbeSuccess {
                summary: format!(
                    "WebSocket connected to {} in {} ms{}",
                    params.url,
                    connect_ms,
                    negotiated.map(|s| format!(" (subprotocol {})", s)).unwrap_or_default()
                ),
                details: None,
                evidence: Some(evidence),
            });
        };

        if budget.is_exhausted() {
            return Err(handshake_used_budget(connect_ms, budget.total_ms())
                .with_evidence(TestEvidence::from_data(&data)));
        }

        if let Err(e) = budget.run("sending message", ws.send(Message::Text(message))).await? {
            return Err(ws_failure("send", &params.url, &e).with_evidence(TestEvidence::from_data(&data)));
        }

        let received = match budget.run("waiting for a response", receive_response(&mut ws)).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                return Err(ws_failure("receive", &params.url, &e).with_evidence(TestEvidence::from_data(&data)));
            }
            Err(f) => return Err(f.with_evidence(TestEvidence::from_data(&data))),
        };

        let (kind, payload, server_closed) = match received {
            Received::Message { kind, data } => (kind, data, None),
            Received::Closed { partial: Some((kind, data)), frame } => (kind, data, Some(frame)),
            Received::Closed { partial: None, frame } => {
                data.record_close(frame.as_ref());
                return Err(ProbeFailure::new(
                    FailureKind::Protocol,
                    format!("WebSocket server at {} closed the connection without sending any response data", params.url),
                    "closed without sending any response data",
                )
                .with_evidence(TestEvidence::from_data(&data)));
            }
        };

        let text = match kind {
            MessageKind::Text => String::from_utf8_lossy(&payload).into_owned(),
            MessageKind::Binary => format!("<{} bytes binary>", payload.len()),
        };
        data.message_type = Some(kind);
        data.received_bytes = Some(payload.len());
        data.received_message = Some(truncate_for_display(&text, EVIDENCE_PREVIEW_CHARS));

        match server_closed {
            Some(frame) => data.record_close(frame.as_ref()),
            None => close_gracefully(ws, &budget, &mut data).await?,
        }

        let details = format!(
            "URL: {}\nConnect: {} ms\nSubprotocol: {}\nReceived: {} bytes ({:?})\nClose status: {}",
            params.url,
            connect_ms,
            data.subprotocol.as_deref().unwrap_or("(none)"),
            payload.len(),
            kind,
            data.close_status.as_deref().unwrap_or("(none)")
        );
        let evidence = TestEvidence::from_data(&data).with_timing(timing(&budget));

        if let Some(expected) = &params.expected_response {
            let matches = kind == MessageKind::Text && payload == expected.as_bytes();
            if !matches {
                let actual = match kind {
                    MessageKind::Text => format!("'{}'", truncate_for_display(&text, SUMMARY_PREVIEW_CHARS)),
                    MessageKind::Binary => format!("a binary frame ({} bytes)", payload.len()),
                };
                return Err(ProbeFailure::assertion(format!(
                    "Expected response '{}' but received {}",
                    truncate_for_display(expected, SUMMARY_PREVIEW_CHARS),
                    actual
                ))
                .with_details(details)
                .with_evidence(evidence));
            }
        }

        Ok(ProbeSuccess {
            summary: format!(
                "WebSocket exchange with {} succeeded: connected in {} ms, received {} bytes",
                params.url,
                connect_ms,
                payload.len()
            ),
            details: Some(details),
            evidence: Some(evidence),
        })
    }
}

#[async_trait]
impl Probe for WebSocketProbe {
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
        "websocket"
    }
}
