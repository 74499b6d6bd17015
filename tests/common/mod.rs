// tests/common/mod.rs
// Local servers and throwaway certificates for the probe integration tests.
#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::ssl::{Ssl, SslAcceptor, SslMethod, SslVerifyMode};
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
};
use openssl::x509::{X509NameBuilder, X509};
use std::io::Write;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_openssl::SslStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::{CloseCode, Data, OpCode};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::Frame;
use tokio_tungstenite::tungstenite::Message;

const DAY_SECS: i64 = 86_400;

static SERIAL: AtomicU32 = AtomicU32::new(1);

pub struct Issued {
    pub cert: X509,
    pub key: PKey<Private>,
}

#[derive(Clone, Copy)]
pub enum Usage {
    Server,
    Client,
}

fn new_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

fn offset_time(days: i64) -> Asn1Time {
    let now = chrono::Utc::now().timestamp();
    Asn1Time::from_unix(now + days * DAY_SECS).unwrap()
}

fn name(cn: &str) -> openssl::x509::X509Name {
    let mut b = X509NameBuilder::new().unwrap();
    b.append_entry_by_text("O", "Probe Test").unwrap();
    b.append_entry_by_text("CN", cn).unwrap();
    b.build()
}

pub fn ca(cn: &str) -> Issued {
    let key = new_key();
    let mut b = X509::builder().unwrap();
    b.set_version(2).unwrap();
    let serial = BigNum::from_u32(SERIAL.fetch_add(1, Ordering::SeqCst)).unwrap();
    b.set_serial_number(&serial.to_asn1_integer().unwrap()).unwrap();
    b.set_subject_name(&name(cn)).unwrap();
    b.set_issuer_name(&name(cn)).unwrap();
    b.set_pubkey(&key).unwrap();
    b.set_not_before(&offset_time(-1)).unwrap();
    b.set_not_after(&offset_time(3650)).unwrap();
    b.append_extension(BasicConstraints::new().critical().ca().build().unwrap()).unwrap();
    b.append_extension(KeyUsage::new().critical().key_cert_sign().crl_sign().build().unwrap())
        .unwrap();
    b.sign(&key, MessageDigest::sha256()).unwrap();
    Issued { cert: b.build(), key }
}

/// Leaf for `localhost` / `127.0.0.1`, valid from `from_days` to `to_days`
/// relative to now. `issuer: None` makes it self-signed.
pub fn leaf(issuer: Option<&Issued>, cn: &str, from_days: i64, to_days: i64, usage: Usage) -> Issued {
    let key = new_key();
    let mut b = X509::builder().unwrap();
    b.set_version(2).unwrap();
    let serial = BigNum::from_u32(SERIAL.fetch_add(1, Ordering::SeqCst)).unwrap();
    b.set_serial_number(&serial.to_asn1_integer().unwrap()).unwrap();
    b.set_subject_name(&name(cn)).unwrap();
    match issuer {
        Some(ca) => b.set_issuer_name(ca.cert.subject_name()).unwrap(),
        None => b.set_issuer_name(&name(cn)).unwrap(),
    }
    b.set_pubkey(&key).unwrap();
    b.set_not_before(&offset_time(from_days)).unwrap();
    b.set_not_after(&offset_time(to_days)).unwrap();

    let san = SubjectAlternativeName::new()
        .dns("localhost")
        .ip("127.0.0.1")
        .build(&b.x509v3_context(issuer.map(|c| &*c.cert), None))
        .unwrap();
    b.append_extension(san).unwrap();
    let eku = match usage {
        Usage::Server => ExtendedKeyUsage::new().server_auth().build().unwrap(),
        Usage::Client => ExtendedKeyUsage::new().client_auth().build().unwrap(),
    };
    b.append_extension(eku).unwrap();
    b.append_extension(KeyUsage::new().critical().digital_signature().build().unwrap())
        .unwrap();

    match issuer {
        Some(ca) => b.sign(&ca.key, MessageDigest::sha256()).unwrap(),
        None => b.sign(&key, MessageDigest::sha256()).unwrap(),
    }
    Issued { cert: b.build(), key }
}

/// PKCS#12 bundle on disk; keep the handle alive for the file to exist.
pub fn write_pfx(id: &Issued, passphrase: &str) -> tempfile::NamedTempFile {
    let bundle = Pkcs12::builder()
        .name("client")
        .pkey(&id.key)
        .cert(&id.cert)
        .build2(passphrase)
        .unwrap();
    let mut file = tempfile::Builder::new().suffix(".pfx").tempfile().unwrap();
    file.write_all(&bundle.to_der().unwrap()).unwrap();
    file.flush().unwrap();
    file
}

/// PKCS#12 bundle holding only the certificate, no private key.
pub fn write_cert_only_pfx(id: &Issued, passphrase: &str) -> tempfile::NamedTempFile {
    let bundle = Pkcs12::builder().name("client").cert(&id.cert).build2(passphrase).unwrap();
    let mut file = tempfile::Builder::new().suffix(".pfx").tempfile().unwrap();
    file.write_all(&bundle.to_der().unwrap()).unwrap();
    file.flush().unwrap();
    file
}

/// Keys of an evidence object must be exactly `expected`, in order, and the
/// object must survive a trip through its typed struct unchanged.
pub fn assert_evidence_fields<T>(data: &serde_json::Value, expected: &[&str])
where
    T: serde::de::DeserializeOwned + serde::Serialize,
{
    let keys: Vec<&str> = data.as_object().expect("object").keys().map(|k| k.as_str()).collect();
    assert_eq!(keys, expected);
    let typed: T = serde_json::from_value(data.clone()).unwrap();
    assert_eq!(&serde_json::to_value(&typed).unwrap(), data);
}

pub struct TlsServerConfig<'a> {
    pub identity: &'a Issued,
    pub chain: Option<&'a Issued>,
    /// When set, clients must present a certificate issued by this CA.
    pub client_ca: Option<&'a Issued>,
    /// When set, each connection gets this HTTP status back.
    pub http_status: Option<u16>,
}

fn acceptor(cfg: &TlsServerConfig<'_>) -> SslAcceptor {
    let mut b = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server()).unwrap();
    b.set_private_key(&cfg.identity.key).unwrap();
    b.set_certificate(&cfg.identity.cert).unwrap();
    if let Some(ca) = cfg.chain {
        b.add_extra_chain_cert(ca.cert.clone()).unwrap();
    }
    if let Some(ca) = cfg.client_ca {
        b.cert_store_mut().add_cert(ca.cert.clone()).unwrap();
        b.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
    }
    b.build()
}

async fn read_request_head<S: tokio::io::AsyncRead + Unpin>(s: &mut S) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        match s.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
        if buf.len() > 64 * 1024 {
            return;
        }
    }
}

/// TLS server on an ephemeral port; serves until the test runtime ends.
pub async fn spawn_tls_server(cfg: TlsServerConfig<'_>) -> SocketAddr {
    let acceptor = Arc::new(acceptor(&cfg));
    let status = cfg.http_status;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let ssl = Ssl::new(acceptor.context()).unwrap();
                let mut tls = SslStream::new(ssl, tcp).unwrap();
                if Pin::new(&mut tls).accept().await.is_err() {
                    return;
                }
                if let Some(code) = status {
                    read_request_head(&mut tls).await;
                    let body = format!("status {}", code);
                    let resp = format!(
                        "HTTP/1.1 {} Test\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        code,
                        body.len(),
                        body
                    );
                    let _ = tls.write_all(resp.as_bytes()).await;
                }
                let _ = tls.shutdown().await;
            });
        }
    });
    addr
}

#[derive(Clone, Copy)]
pub enum WsBehavior {
    /// Echo each text message back.
    Echo,
    /// Answer any message with "pi" + "ng" as two fragments.
    Fragmented,
    /// Read one message, then close without replying.
    CloseWithoutData,
    /// Read one message, then go silent.
    Hang,
    /// Echo each text message back as a binary frame.
    BinaryEcho,
}

pub async fn spawn_ws_server(behavior: WsBehavior) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            tokio::spawn(serve_ws(tcp, behavior));
        }
    });
    addr
}

async fn serve_ws(tcp: TcpStream, behavior: WsBehavior) {
    let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
        return;
    };
    while let Some(Ok(msg)) = ws.next().await {
        match (behavior, msg) {
            (WsBehavior::Echo, Message::Text(t)) => {
                if ws.send(Message::Text(t)).await.is_err() {
                    break;
                }
            }
            (WsBehavior::Fragmented, Message::Text(_)) => {
                let first = Frame::message(b"pi".to_vec(), OpCode::Data(Data::Text), false);
                let last = Frame::message(b"ng".to_vec(), OpCode::Data(Data::Continue), true);
                let _ = ws.send(Message::Frame(first)).await;
                let _ = ws.send(Message::Frame(last)).await;
            }
            (WsBehavior::CloseWithoutData, Message::Text(_)) => {
                let frame = CloseFrame { code: CloseCode::Normal, reason: "bye".into() };
                let _ = ws.close(Some(frame)).await;
            }
            (WsBehavior::BinaryEcho, Message::Text(t)) => {
                if ws.send(Message::Binary(t.into_bytes())).await.is_err() {
                    break;
                }
            }
            (WsBehavior::Hang, Message::Text(_)) => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                break;
            }
            _ => {}
        }
    }
}

/// Plain HTTP server that refuses every upgrade with `status`.
pub async fn spawn_http_rejecting(status: u16) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut tcp, _)) = listener.accept().await {
            tokio::spawn(async move {
                read_request_head(&mut tcp).await;
                let resp = format!("HTTP/1.1 {} Forbidden\r\nContent-Length: 0\r\nConnection: close\r\n\r\n", status);
                let _ = tcp.write_all(resp.as_bytes()).await;
                let _ = tcp.shutdown().await;
            });
        }
    });
    addr
}
