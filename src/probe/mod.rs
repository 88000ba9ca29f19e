//! Readiness probes used by the supervisor.
//!
//! `port` answers "can the server bind here?", `health` answers "is the
//! server answering requests?". Neither probe raises: both degrade to a
//! negative answer on any error.

pub mod health;
pub mod port;

/// Host to connect to when the server binds `host`.
///
/// Wildcard binds are reached through loopback.
pub fn connect_host(host: &str) -> &str {
    match host {
        "0.0.0.0" | "" => "127.0.0.1",
        "::" | "[::]" => "[::1]",
        other => other,
    }
}

/// Base URL of the server bound at `host:port`.
pub fn base_url(host: &str, port: u16) -> String {
    format!("http://{}:{}", connect_host(host), port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_hosts_map_to_loopback() {
        assert_eq!(connect_host("0.0.0.0"), "127.0.0.1");
        assert_eq!(connect_host("::"), "[::1]");
        assert_eq!(connect_host("10.0.0.5"), "10.0.0.5");
    }

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("0.0.0.0", 8000), "http://127.0.0.1:8000");
        assert_eq!(base_url("localhost", 9000), "http://localhost:9000");
    }
}
