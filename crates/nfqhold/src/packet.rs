// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Packet values handed to the consumer and the handler contract.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Why a packet's hold ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// The consumer called [`Packet::release`].
    ConsumerRequested,
    /// The packet exceeded the maximum hold time.
    Timeout,
    /// The owning connection failed and was retired.
    ConnectionFailure,
}

/// Consumer contract for captured packets.
///
/// Packets should be released as soon as possible by invoking
/// [`Packet::release`]; packets not released by the consumer are
/// released automatically after the maximum hold time. Every
/// `on_packet` call is matched by exactly one `on_release` call.
pub trait Handler: Send + Sync {
    /// Called once per captured, non-dropped packet. Runs inline with
    /// packet intake and must not block for long.
    fn on_packet(&self, packet: Packet);

    /// Called exactly once per packet previously delivered via
    /// [`Handler::on_packet`].
    fn on_release(&self, id: u32, reason: ReleaseReason);
}

/// A captured packet held in user space.
///
/// The value is a snapshot: mutating it has no effect on the held
/// kernel packet. Call [`Packet::release`] to request early release;
/// the call is idempotent and remains safe after the owning connection
/// has been retired (it simply becomes a no-op).
pub struct Packet {
    /// Queue-local packet ID, unique within the owning connection.
    pub id: u32,
    /// Kernel capture timestamp, when available.
    pub timestamp: Option<SystemTime>,
    /// Firewall mark on the packet.
    pub mark: Option<u32>,
    /// Hardware protocol (e.g. EtherType).
    pub hw_protocol: Option<u16>,
    /// Captured payload bytes.
    pub payload: Vec<u8>,

    /// Release hook wired to the owning connection.
    release: Arc<dyn Fn() + Send + Sync>,
}

impl Packet {
    pub(crate) fn new(
        id: u32,
        timestamp: Option<SystemTime>,
        mark: Option<u32>,
        hw_protocol: Option<u16>,
        payload: Vec<u8>,
        release: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        Self {
            id,
            timestamp,
            mark,
            hw_protocol,
            payload,
            release,
        }
    }

    /// Request release of this packet. Idempotent.
    pub fn release(&self) {
        (self.release)();
    }
}

impl fmt::Display for Packet {
    /// Short summary: `Packet(id;timestamp;mark=m)` with the optional
    /// fields omitted when absent.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Packet({}", self.id)?;
        if let Some(ts) = self.timestamp {
            match ts.duration_since(UNIX_EPOCH) {
                Ok(d) => write!(f, ";{}.{:09}", d.as_secs(), d.subsec_nanos())?,
                Err(_) => write!(f, ";<pre-epoch>")?,
            }
        }
        if let Some(mark) = self.mark {
            write!(f, ";mark={}", mark)?;
        }
        write!(f, ")")
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("id", &self.id)
            .field("timestamp", &self.timestamp)
            .field("mark", &self.mark)
            .field("hw_protocol", &self.hw_protocol)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
