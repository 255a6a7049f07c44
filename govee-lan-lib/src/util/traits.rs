use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;

use crate::util::discovery::RawDatagram;

/// One request/response exchange with a device.
///
/// Implementations open whatever socket they need per call, so a failed
/// exchange never poisons the next attempt. The production implementation is
/// [`crate::util::udp::UdpTransport`]; tests substitute scripted fakes.
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Sends `payload` to `host:port`.
    ///
    /// When `expect_reply` is set, waits up to `timeout` for exactly one
    /// inbound datagram and returns its bytes. A missing reply is reported as
    /// an [`io::ErrorKind::TimedOut`] error.
    async fn exchange(
        &self,
        host: &str,
        port: u16,
        payload: &[u8],
        expect_reply: bool,
        timeout: Duration,
    ) -> io::Result<Option<Vec<u8>>>;
}

/// Scans a single local interface for devices.
///
/// The production implementation is
/// [`crate::util::discovery::MulticastProbe`].
#[async_trait]
pub trait InterfaceProbe: Send + Sync {
    /// Sends the scan probe out of `local_ip` and collects every reply that
    /// arrives before `timeout` elapses.
    async fn probe(&self, local_ip: Ipv4Addr, timeout: Duration) -> anyhow::Result<Vec<RawDatagram>>;
}
