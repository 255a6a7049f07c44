use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::Value;

/// Number of packets kept by [`PacketMonitor::default`].
pub const DEFAULT_MAX_PACKETS: usize = 100;

/// One outgoing datagram as seen by the diagnostics log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PacketLogEntry {
    pub timestamp: DateTime<Local>,
    pub protocol: &'static str,
    pub destination_ip: String,
    pub destination_port: u16,
    pub payload_json: Value,
    pub payload_size: usize,
    pub payload_hex: String,
    /// Lossy UTF-8 rendering of the payload.
    pub payload_text: String,
}

impl PacketLogEntry {
    pub fn new(destination_ip: &str, destination_port: u16, payload: Value, bytes: &[u8]) -> Self {
        PacketLogEntry {
            timestamp: Local::now(),
            protocol: "UDP",
            destination_ip: destination_ip.to_string(),
            destination_port,
            payload_json: payload,
            payload_size: bytes.len(),
            payload_hex: hex::encode(bytes),
            payload_text: String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

/// Fixed-capacity ring buffer of outgoing packets.
///
/// Shared between every sender through an `Arc`; appends from concurrent
/// senders are serialized by an internal lock.
#[derive(Debug)]
pub struct PacketMonitor {
    packets: Mutex<VecDeque<PacketLogEntry>>,
    max_packets: usize,
}

impl Default for PacketMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKETS)
    }
}

impl PacketMonitor {
    pub fn new(max_packets: usize) -> Self {
        PacketMonitor {
            packets: Mutex::new(VecDeque::with_capacity(max_packets)),
            max_packets,
        }
    }

    // A panic while holding the lock cannot leave the deque half-updated,
    // so a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, VecDeque<PacketLogEntry>> {
        self.packets.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends an entry, evicting the oldest ones once over capacity.
    pub fn record(&self, entry: PacketLogEntry) {
        let mut packets = self.lock();
        packets.push_back(entry);
        while packets.len() > self.max_packets {
            packets.pop_front();
        }
    }

    /// All retained entries, newest first.
    pub fn list(&self) -> Vec<PacketLogEntry> {
        self.lock().iter().rev().cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_packets
    }
}
