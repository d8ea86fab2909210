//! Target availability probing.
//!
//! One bounded-timeout TCP connection attempt; any successful establishment
//! counts as reachable. Shared by the per-connection gate, the wake
//! coordinator's poll loop, and the health-check loops.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

/// Check whether `host:port` accepts a TCP connection within `limit`.
///
/// Never returns an error: timeout, refusal, resolution failure, and every
/// other OS-level connect error all read as "unreachable". The probe
/// connection is dropped immediately on success.
pub async fn probe(host: &str, port: u16, limit: Duration) -> bool {
    let addr = format!("{}:{}", host, port);
    match timeout(limit, TcpStream::connect(&addr)).await {
        Ok(Ok(_stream)) => {
            trace!(addr = %addr, "probe: reachable");
            true
        }
        Ok(Err(e)) => {
            trace!(addr = %addr, error = %e, "probe: connect failed");
            false
        }
        Err(_) => {
            trace!(addr = %addr, "probe: timed out");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_probe_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(probe("127.0.0.1", port, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_probe_refused() {
        // Bind then drop to find a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!probe("127.0.0.1", port, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_probe_bad_host() {
        assert!(!probe("host.invalid", 80, Duration::from_secs(1)).await);
    }
}
