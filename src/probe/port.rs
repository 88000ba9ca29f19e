//! Port availability probe.
//!
//! Binds a throwaway listener and drops it straight away. Tokio sets
//! `SO_REUSEADDR` on Unix listeners, so TIME_WAIT sockets left behind by a
//! previous server run do not read as occupied there. Windows has no
//! equivalent guarantee; a port may briefly look busy after a stop.

use tokio::net::TcpListener;

/// Interface the supervisor probes before a launch, whatever host the
/// server itself will bind.
pub const LOOPBACK: &str = "127.0.0.1";

/// Returns true when a listener can be bound on `host:port`.
pub async fn is_available(host: &str, port: u16) -> bool {
    match TcpListener::bind((host, port)).await {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(e) => {
            tracing::debug!(host = %host, port = port, error = %e, "port probe bind failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bound_port_is_unavailable() {
        let holder = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = holder.local_addr().unwrap().port();
        assert!(!is_available("127.0.0.1", port).await);
    }

    #[tokio::test]
    async fn test_released_port_is_available() {
        let holder = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = holder.local_addr().unwrap().port();
        drop(holder);
        assert!(is_available("127.0.0.1", port).await);
    }

    #[tokio::test]
    async fn test_probe_does_not_hold_the_port() {
        let holder = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = holder.local_addr().unwrap().port();
        drop(holder);
        assert!(is_available("127.0.0.1", port).await);
        // A second probe right after the first must still succeed
        assert!(is_available("127.0.0.1", port).await);
    }

    #[tokio::test]
    async fn test_loopback_probe_sees_loopback_holder() {
        let holder = TcpListener::bind((LOOPBACK, 0)).await.unwrap();
        let port = holder.local_addr().unwrap().port();
        assert!(!is_available(LOOPBACK, port).await);
    }
}
