// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Queue transport abstraction.
//!
//! The kernel packet-queueing facility is reached through the
//! [`QueueTransport`] trait, produced by a [`TransportFactory`]. The
//! connector never talks netlink directly; a factory backed by a real
//! NFQUEUE binding is supplied by the embedding agent, and tests
//! substitute an in-memory mock.
//!
//! Callback delivery model: after [`QueueTransport::register_callbacks`]
//! the transport invokes [`QueueCallbacks::on_packet`] once per captured
//! packet and [`QueueCallbacks::on_error`] on read failures, on its own
//! delivery thread(s), potentially concurrently with the connector's
//! event loop.

use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Disposition returned to the kernel for a captured packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Let the packet continue through the pipeline.
    Accept,
    /// Discard the packet.
    Drop,
    /// Re-inject the packet at the start of the capture point.
    Repeat,
}

/// Attributes of one captured packet as delivered by the transport.
#[derive(Debug, Clone)]
pub struct PacketAttribute {
    /// Queue-local packet ID. Unique within one connection; restarts
    /// after a reconnect.
    pub packet_id: u32,
    /// Kernel capture timestamp, when available.
    pub timestamp: Option<SystemTime>,
    /// Firewall mark on the packet.
    pub mark: Option<u32>,
    /// Hardware protocol (e.g. EtherType).
    pub hw_protocol: Option<u16>,
    /// Captured payload, up to the configured max packet length.
    pub payload: Option<Vec<u8>>,
}

/// Error reported by the transport's read path.
#[derive(Debug)]
pub enum TransportError {
    /// Socket read timed out; reading continues.
    Timeout,
    /// Transient failure; reading continues.
    Temporary(io::Error),
    /// Unrecoverable socket failure; the connection must be retired.
    Fatal(io::Error),
}

impl TransportError {
    /// Whether the connection can keep reading after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Temporary(_))
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "socket read timeout"),
            Self::Temporary(e) => write!(f, "temporary socket error: {}", e),
            Self::Fatal(e) => write!(f, "fatal socket error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Timeout => None,
            Self::Temporary(e) | Self::Fatal(e) => Some(e),
        }
    }
}

/// Return value of [`QueueCallbacks::on_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    /// Keep delivering callbacks for this connection.
    Continue,
    /// Deliver no further callbacks for this connection.
    Stop,
}

/// Hooks registered against one transport connection.
pub trait QueueCallbacks: Send + Sync {
    /// Called once per captured packet.
    fn on_packet(&self, attribute: PacketAttribute);

    /// Called when the read path fails. Returning [`CallbackAction::Stop`]
    /// means the transport must stop delivering callbacks.
    fn on_error(&self, error: TransportError) -> CallbackAction;
}

/// One open connection to the kernel queue.
///
/// Implementations must drop their registered callbacks when closed so
/// that retired connections can be reclaimed.
pub trait QueueTransport: Send + Sync {
    /// Register the packet and error hooks. Called exactly once, right
    /// after the transport is opened; an error here is fatal for the
    /// connection attempt.
    fn register_callbacks(&self, callbacks: Arc<dyn QueueCallbacks>) -> io::Result<()>;

    /// Set the verdict for a single packet.
    fn set_verdict(&self, packet_id: u32, verdict: Verdict) -> io::Result<()>;

    /// Set the verdict for a single packet, also applying a mark.
    fn set_verdict_with_mark(&self, packet_id: u32, verdict: Verdict, mark: u32)
        -> io::Result<()>;

    /// Set the verdict for `packet_id` and every earlier outstanding
    /// packet on this connection.
    fn set_verdict_batch(&self, packet_id: u32, verdict: Verdict) -> io::Result<()>;

    /// Close the connection. Outstanding packets are dropped by the
    /// kernel when the socket closes.
    fn close(&self) -> io::Result<()>;
}

/// Parameters handed to [`TransportFactory::open`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub queue_id: u16,
    pub max_queue_len: u32,
    pub max_packet_len: u32,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Kernel accepts traffic automatically when the queue is full.
    pub fail_open: bool,
}

/// Factory producing queue transports, one per connection attempt.
pub trait TransportFactory: Send + Sync {
    fn open(&self, config: &TransportConfig) -> io::Result<Box<dyn QueueTransport>>;
}

impl<F> TransportFactory for F
where
    F: Fn(&TransportConfig) -> io::Result<Box<dyn QueueTransport>> + Send + Sync,
{
    fn open(&self, config: &TransportConfig) -> io::Result<Box<dyn QueueTransport>> {
        self(config)
    }
}
