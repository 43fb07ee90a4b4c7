//! TCP port occupancy checks.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

/// Answers whether something is listening on a local port.
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn is_in_use(&self, port: u16) -> bool;
}

/// Probe that attempts a TCP connection to the loopback address.
#[derive(Debug, Clone)]
pub struct TcpPortProbe {
    timeout: Duration,
}

impl Default for TcpPortProbe {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(500),
        }
    }
}

impl TcpPortProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl PortProbe for TcpPortProbe {
    async fn is_in_use(&self, port: u16) -> bool {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }
}

/// First free port in `start..start + max_attempts`.
///
/// Probes exactly `max_attempts` ports at most, stopping early at the top of
/// the port range.
pub async fn find_free_port(probe: &dyn PortProbe, start: u16, max_attempts: u16) -> Option<u16> {
    for offset in 0..max_attempts {
        let port = start.checked_add(offset)?;
        if !probe.is_in_use(port).await {
            return Some(port);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeProbe {
        busy: HashSet<u16>,
        probes: AtomicUsize,
    }

    impl FakeProbe {
        fn busy(ports: impl IntoIterator<Item = u16>) -> Self {
            Self {
                busy: ports.into_iter().collect(),
                probes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PortProbe for FakeProbe {
        async fn is_in_use(&self, port: u16) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.busy.contains(&port)
        }
    }

    #[tokio::test]
    async fn test_skips_occupied_ports() {
        let probe = FakeProbe::busy([5051, 5052, 5053]);
        assert_eq!(find_free_port(&probe, 5051, 5).await, Some(5054));
        assert_eq!(probe.probes.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let probe = FakeProbe::busy(5000..5010);
        assert_eq!(find_free_port(&probe, 5000, 10).await, None);
        assert_eq!(probe.probes.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_stops_at_end_of_range() {
        let probe = FakeProbe::busy([u16::MAX]);
        assert_eq!(find_free_port(&probe, u16::MAX, 5).await, None);
        assert_eq!(probe.probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tcp_probe_sees_listener() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = TcpPortProbe::new();
        assert!(probe.is_in_use(port).await);
        drop(listener);
        assert!(!probe.is_in_use(port).await);
    }
}
