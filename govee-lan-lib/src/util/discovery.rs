use std::cmp::max;
use std::collections::{BTreeSet, HashSet};
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use derivative::Derivative;
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{timeout, Instant};

use crate::control_interface::Reply;
use crate::util::envelope::CommandEnvelope;
use crate::util::traits::InterfaceProbe;
use crate::util::udp::MAX_DATAGRAM_SIZE;

/// Multicast group devices listen on for scan probes.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
/// Port scan probes are sent to.
pub const SCAN_PORT: u16 = 4001;
/// Port devices send scan replies to.
pub const REPLY_PORT: u16 = 4002;
/// Default per-interface listening window.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(2);

// Any routable address works; nothing is sent.
const OUTBOUND_PROBE_ADDRESS: &str = "8.8.8.8:80";

/// A datagram received on the reply port, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDatagram {
    pub source: Ipv4Addr,
    pub bytes: Vec<u8>,
}

/// One device that answered a scan.
///
/// Two replies are equal when they come from the same address.
#[derive(Derivative)]
#[derivative(Hash, PartialEq, Eq)]
#[derive(Debug, Clone, Serialize)]
pub struct ScanReply {
    pub ip_address: Ipv4Addr,
    #[derivative(Hash = "ignore", PartialEq = "ignore")]
    pub data: Reply,
    #[derivative(Hash = "ignore", PartialEq = "ignore")]
    pub device_type: String,
    #[derivative(Hash = "ignore", PartialEq = "ignore")]
    pub device_name: String,
    #[derivative(Hash = "ignore", PartialEq = "ignore")]
    pub sku: String,
}

impl ScanReply {
    /// Decodes a reply, deriving the display fields from `msg.devType`,
    /// `msg.devName` and `msg.sku`. Missing or malformed fields fall back to
    /// placeholders instead of failing.
    pub fn from_datagram(datagram: &RawDatagram) -> Self {
        let data = Reply::decode(&datagram.bytes);
        let msg = data.as_json().and_then(|value| value.get("msg"));
        let field = |name: &str| {
            msg.and_then(|msg| msg.get(name))
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        ScanReply {
            ip_address: datagram.source,
            device_type: field("devType").unwrap_or_else(|| "Unknown".to_string()),
            device_name: field("devName")
                .unwrap_or_else(|| format!("Govee Light ({})", datagram.source)),
            sku: field("sku").unwrap_or_else(|| "N/A".to_string()),
            data,
        }
    }
}

impl Display for ScanReply {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "IP: {}, Name: {}, Type: {}, SKU: {}",
            self.ip_address, self.device_name, self.device_type, self.sku
        )
    }
}

/// Addresses and timings used by [`MulticastProbe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryConfig {
    pub multicast_group: Ipv4Addr,
    pub scan_port: u16,
    pub reply_port: u16,
    /// Longest single wait on the socket, so the overall deadline is honored
    /// even when nothing answers.
    pub recv_poll: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            multicast_group: MULTICAST_GROUP,
            scan_port: SCAN_PORT,
            reply_port: REPLY_PORT,
            recv_poll: Duration::from_millis(400),
        }
    }
}

/**
Scans one interface with a multicast probe plus a broadcast fallback.

The socket joins the multicast group on the given interface and pins the
outbound multicast interface to it as well; otherwise a multi-homed host sends
the probe out of the default route only.
 */
#[derive(Debug, Clone, Copy, Default)]
pub struct MulticastProbe {
    pub config: DiscoveryConfig,
}

impl MulticastProbe {
    pub fn new(config: DiscoveryConfig) -> Self {
        MulticastProbe { config }
    }

    fn open_socket(&self, local_ip: Ipv4Addr) -> anyhow::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("Failed to create UDP socket")?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;

        let bind_address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.reply_port));
        socket
            .bind(&bind_address.into())
            .with_context(|| format!("Failed to bind {}", bind_address))?;
        socket
            .join_multicast_v4(&self.config.multicast_group, &local_ip)
            .with_context(|| format!("Failed to join multicast group on {}", local_ip))?;
        socket
            .set_multicast_if_v4(&local_ip)
            .with_context(|| format!("Failed to select multicast interface {}", local_ip))?;
        socket.set_multicast_ttl_v4(1)?;
        socket.set_nonblocking(true)?;

        UdpSocket::from_std(socket.into()).context("Failed to register socket with the runtime")
    }
}

#[async_trait]
impl InterfaceProbe for MulticastProbe {
    async fn probe(&self, local_ip: Ipv4Addr, given_timeout: Duration) -> anyhow::Result<Vec<RawDatagram>> {
        let socket = self.open_socket(local_ip)?;

        let probe = CommandEnvelope::scan().to_bytes()?;
        socket
            .send_to(&probe, (self.config.multicast_group, self.config.scan_port))
            .await
            .context("Failed to send multicast scan")?;
        socket
            .send_to(&probe, (Ipv4Addr::BROADCAST, self.config.scan_port))
            .await
            .context("Failed to send broadcast scan")?;

        let mut replies = Vec::new();
        let mut seen = HashSet::new();
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let timeout_end = Instant::now() + given_timeout;

        loop {
            let now = Instant::now();
            if now >= timeout_end {
                break;
            }
            let wait = self.config.recv_poll.min(timeout_end - now);

            match timeout(wait, socket.recv_from(&mut buffer)).await {
                Ok(Ok((number_of_bytes, SocketAddr::V4(source)))) => {
                    let ip = *source.ip();
                    if !seen.insert(ip) {
                        debug!("Found device {} again, skipping", ip);
                        continue;
                    }
                    debug!("Reply from {} on {}", source, local_ip);
                    replies.push(RawDatagram {
                        source: ip,
                        bytes: buffer[..number_of_bytes].to_vec(),
                    });
                }
                Ok(Ok((_, source))) => debug!("Ignoring reply from {}", source),
                // Some platforms surface ICMP errors from the probe here.
                Ok(Err(e)) => debug!("Receive on {} failed: {}", local_ip, e),
                Err(_) => continue,
            }
        }

        Ok(replies)
    }
}

pub struct Discovery;

impl Discovery {
    /// Scans every local IPv4 interface for devices.
    pub async fn find_devices(given_timeout: Duration) -> Vec<ScanReply> {
        let interfaces = Self::local_ipv4s().await;
        info!("Local IPv4 addresses: {:?}", interfaces);
        if interfaces.is_empty() {
            warn!("No usable local IPv4 address found, nothing to scan");
        }
        Self::discover_on(&MulticastProbe::default(), &interfaces, given_timeout).await
    }

    /**
    Scans `interfaces` one after another with `probe`.

    A failing interface is logged and contributes nothing; the remaining
    interfaces are still scanned. Results are deduplicated by source address.
     */
    pub async fn discover_on<P>(probe: &P, interfaces: &[Ipv4Addr], given_timeout: Duration) -> Vec<ScanReply>
    where
        P: InterfaceProbe + ?Sized,
    {
        let mut per_interface = Vec::with_capacity(interfaces.len());
        for &local_ip in interfaces {
            info!("Scanning from {}", local_ip);
            match probe.probe(local_ip, given_timeout).await {
                Ok(replies) => per_interface.push(replies),
                Err(e) => error!("Error scanning {}: {:#}", local_ip, e),
            }
        }

        let devices = Self::merge(per_interface);
        info!("Found {} unique device(s)", devices.len());
        if devices.is_empty() {
            info!("No replies. Common causes are a host firewall, AP isolation or guest Wi-Fi, or a router that blocks multicast.");
        }
        devices
    }

    /// Merges per-interface replies, keeping the first reply seen per address.
    pub fn merge(per_interface: Vec<Vec<RawDatagram>>) -> Vec<ScanReply> {
        let mut seen = HashSet::new();
        per_interface
            .into_iter()
            .flatten()
            .filter(|datagram| seen.insert(datagram.source))
            .map(|datagram| ScanReply::from_datagram(&datagram))
            .collect()
    }

    /**
    Non-loopback IPv4 addresses of this host, sorted.

    Combines the addresses the hostname resolves to with the source address
    the OS would pick for an outbound connection, since either one alone can
    miss interfaces depending on the host's network configuration.
     */
    pub async fn local_ipv4s() -> Vec<Ipv4Addr> {
        let mut addresses = BTreeSet::new();

        match hostname::get() {
            Ok(name) => match name.to_str() {
                Some(name) => match lookup_host((name, 0)).await {
                    Ok(resolved) => addresses.extend(resolved.filter_map(|a| match a.ip() {
                        IpAddr::V4(ip) => Some(ip),
                        IpAddr::V6(_) => None,
                    })),
                    Err(e) => debug!("Failed to resolve hostname {}: {}", name, e),
                },
                None => debug!("Hostname is not valid UTF-8"),
            },
            Err(e) => debug!("Failed to read hostname: {}", e),
        }

        match Self::outbound_ipv4().await {
            Ok(ip) => {
                addresses.insert(ip);
            }
            Err(e) => debug!("Failed to determine outbound address: {:#}", e),
        }

        addresses.into_iter().filter(|ip| Self::is_scannable(*ip)).collect()
    }

    fn is_scannable(ip: Ipv4Addr) -> bool {
        !ip.is_loopback() && !ip.is_unspecified()
    }

    async fn outbound_ipv4() -> anyhow::Result<Ipv4Addr> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(OUTBOUND_PROBE_ADDRESS).await?;
        match socket.local_addr()?.ip() {
            IpAddr::V4(ip) => Ok(ip),
            IpAddr::V6(ip) => Err(anyhow::anyhow!("Unexpected IPv6 local address {}", ip)),
        }
    }

    pub fn pretty_print_devices(devices: &[ScanReply]) {
        let max_ip_width = devices
            .iter()
            .map(|d| d.ip_address.to_string().len())
            .max()
            .unwrap_or(0)
            .max("IP Address".len());
        let max_name_width = devices
            .iter()
            .map(|d| max(d.device_name.len(), 20))
            .max()
            .unwrap_or(20);
        let max_type_width = devices
            .iter()
            .map(|d| d.device_type.len())
            .max()
            .unwrap_or(0)
            .max("Type".len());
        let max_sku_width = devices
            .iter()
            .map(|d| d.sku.len())
            .max()
            .unwrap_or(0)
            .max("SKU".len());

        println!(
            "{:<ip_width$} {:<name_width$} {:<type_width$} {:<sku_width$}",
            "IP Address",
            "Device Name",
            "Type",
            "SKU",
            ip_width = max_ip_width + 2,
            name_width = max_name_width + 2,
            type_width = max_type_width + 2,
            sku_width = max_sku_width + 2,
        );
        println!(
            "{:<ip_width$} {:<name_width$} {:<type_width$} {:<sku_width$}",
            "-".repeat(max_ip_width),
            "-".repeat(max_name_width),
            "-".repeat(max_type_width),
            "-".repeat(max_sku_width),
            ip_width = max_ip_width + 2,
            name_width = max_name_width + 2,
            type_width = max_type_width + 2,
            sku_width = max_sku_width + 2,
        );
        for device in devices {
            println!(
                "{:<ip_width$} {:<name_width$} {:<type_width$} {:<sku_width$}",
                device.ip_address,
                device.device_name,
                device.device_type,
                device.sku,
                ip_width = max_ip_width + 2,
                name_width = max_name_width + 2,
                type_width = max_type_width + 2,
                sku_width = max_sku_width + 2,
            );
        }
    }
}
