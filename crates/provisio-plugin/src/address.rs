//! Handshake address validation.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::net::TcpStream;

use crate::error::{PluginError, PluginResult};

/// Default ceiling for the reachability dial.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

fn address_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\d{2,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}:\d{4,6}$")
            .expect("address pattern is a valid regex")
    })
}

/// Syntactic check of a handshake line. Surrounding whitespace is ignored.
pub fn parse_address(line: &str) -> PluginResult<String> {
    let candidate = line.trim();
    if address_pattern().is_match(candidate) {
        Ok(candidate.to_string())
    } else {
        Err(PluginError::InvalidAddress {
            address: candidate.to_string(),
            reason: "expected dotted-quad host and port".to_string(),
        })
    }
}

/// Full validation: the line must parse and the address must accept a TCP
/// connection within `dial_timeout`.
pub async fn validate_address(line: &str, dial_timeout: Duration) -> PluginResult<String> {
    let address = parse_address(line)?;
    match tokio::time::timeout(dial_timeout, TcpStream::connect(&address)).await {
        Ok(Ok(_stream)) => Ok(address),
        Ok(Err(source)) => Err(PluginError::Unreachable { address, source }),
        Err(_) => Err(PluginError::Unreachable {
            address,
            source: std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("no answer within {}s", dial_timeout.as_secs_f64()),
            ),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_loopback_with_port() {
        assert_eq!(
            parse_address("127.0.0.1:54321\n").unwrap(),
            "127.0.0.1:54321"
        );
    }

    #[test]
    fn test_rejects_garbage() {
        for line in ["not-an-address", "localhost:8080", "127.0.0.1", "1.2.3.4:80", ""] {
            assert!(
                matches!(parse_address(line), Err(PluginError::InvalidAddress { .. })),
                "{line:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_dial_succeeds_against_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let validated = validate_address(&addr, DEFAULT_DIAL_TIMEOUT).await.unwrap();
        assert_eq!(validated, addr);
    }

    #[tokio::test]
    async fn test_dial_fails_when_nothing_listens() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = validate_address(&addr, DEFAULT_DIAL_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Unreachable { .. }));
    }
}
