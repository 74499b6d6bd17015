use std::io;
use tokio::net::TcpStream;

use crate::probes::budget::Budget;
use crate::probes::failure::{FailureKind, ProbeFailure};

/// Open a TCP connection under the budget. Connect errors come back as
/// `Connect` failures with a socket-specific phrase.
pub async fn connect_with_budget(host: &str, port: u16, budget: &Budget) -> Result<TcpStream, ProbeFailure> {
    let addr = format!("{}:{}", host, port);
    match budget.run("TCP connect", TcpStream::connect(&addr)).await? {
        Ok(stream) => Ok(stream),
        Err(e) => Err(ProbeFailure::new(
            FailureKind::Connect,
            format!("Could not connect to {}: {}", addr, describe_io_error(&e)),
            format!("connect to {} failed: {}", addr, e),
        )),
    }
}

/// Human phrase for socket-level errors.
pub fn describe_io_error(e: &io::Error) -> &'static str {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => "connection refused",
        io::ErrorKind::ConnectionReset => "connection reset by peer",
        io::ErrorKind::ConnectionAborted => "connection aborted",
        io::ErrorKind::NotConnected => "socket not connected",
        io::ErrorKind::HostUnreachable => "host unreachable",
        io::ErrorKind::NetworkUnreachable => "network unreachable",
        io::ErrorKind::AddrNotAvailable => "address not available",
        io::ErrorKind::TimedOut => "socket timed out",
        io::ErrorKind::BrokenPipe => "broken pipe",
        io::ErrorKind::UnexpectedEof => "connection closed unexpectedly",
        _ => {
            // resolver failures surface as Other/Uncategorized with a
            // platform-specific message
            let text = e.to_string().to_ascii_lowercase();
            if text.contains("lookup") || text.contains("resolve") || text.contains("name or service") {
                "host name could not be resolved"
            } else {
                "socket error"
            }
        }
    }
}

pub fn push_line(out: &mut String, label: &str, value: &str) {
    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str(label);
    out.push_str(": ");
    out.push_str(value);
}

/// Cut to at most `max` characters, marking the cut.
pub fn truncate_for_display(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push_str("...");
    out
}

/// `1 day`, `2 days`.
pub fn plural(n: i64, unit: &str) -> String {
    if n == 1 || n == -1 {
        format!("{} {}", n, unit)
    } else {
        format!("{} {}s", n, unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plural_forms() {
        assert_eq!(plural(1, "day"), "1 day");
        assert_eq!(plural(2, "day"), "2 days");
        assert_eq!(plural(0, "day"), "0 days");
    }

    #[test]
    fn truncation_keeps_short_strings() {
        assert_eq!(truncate_for_display("ping", 10), "ping");
        assert_eq!(truncate_for_display("abcdef", 3), "abc...");
        // multibyte safe
        assert_eq!(truncate_for_display("ééé", 2), "éé...");
    }

    #[test]
    fn io_phrases() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(describe_io_error(&refused), "connection refused");
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(describe_io_error(&reset), "connection reset by peer");
        let dns = io::Error::new(io::ErrorKind::Other, "failed to lookup address information");
        assert_eq!(describe_io_error(&dns), "host name could not be resolved");
    }

    #[tokio::test]
    async fn refused_connect_is_network() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let token = tokio_util::sync::CancellationToken::new();
        let budget = Budget::start(2_000, &token);
        let err = connect_with_budget("127.0.0.1", port, &budget).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Connect);
        assert!(err.summary.contains("connection refused"), "{}", err.summary);
    }
}
