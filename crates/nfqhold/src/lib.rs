// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # nfqhold - userspace packet hold-and-release for NFQUEUE
//!
//! A connection manager for a kernel packet queue (NFQUEUE): captured
//! packets are held in user space until the consumer decides their
//! fate or a maximum hold time elapses, at which point a verdict
//! (accept / drop / repeat-with-mark) is returned to the kernel. The
//! typical use is delaying a packet decision until out-of-band state
//! arrives, e.g. holding packets while a DNS response updates an
//! allow-list, without losing packets or destabilizing the firewall
//! pipeline.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use nfqhold::{ConnectorConfig, Handler, NfqueueConnector, Packet, ReleaseReason};
//! use std::sync::Arc;
//!
//! struct Holder;
//!
//! impl Handler for Holder {
//!     fn on_packet(&self, packet: Packet) {
//!         // Decide asynchronously, then:
//!         packet.release();
//!     }
//!     fn on_release(&self, id: u32, reason: ReleaseReason) {
//!         println!("packet {} released: {:?}", id, reason);
//!     }
//! }
//!
//! let connector = NfqueueConnector::new(
//!     ConnectorConfig::new(100),
//!     Arc::new(Holder),
//!     Arc::new(my_netlink_factory),
//! );
//! let guard = connector.connect();
//! // ... guard.stop() disconnects and force-releases everything.
//! ```
//!
//! ## Guarantees
//!
//! - Every packet delivered via [`Handler::on_packet`] receives exactly
//!   one [`Handler::on_release`], whether the release was requested by
//!   the consumer, forced by the hold timeout, or caused by a
//!   connection failure.
//! - [`Packet::release`] is idempotent and safe to call after the
//!   owning connection has been retired.
//! - Unrecoverable socket errors trigger a transparent reconnect; the
//!   connector only fails hard when the queue cannot be opened at all.
//!
//! ## Modules Overview
//!
//! - [`config`] - connector configuration and verdict policy
//! - [`transport`] - the pluggable kernel-queue transport seam
//! - [`metrics`] - atomic instrumentation counters
//! - [`time`] - clock abstraction (manual clock for tests)

pub mod config;
mod connection;
pub mod connector;
pub mod error;
pub mod metrics;
pub mod packet;
pub mod time;
pub mod transport;

mod list;
mod ratelimit;

pub use config::{ConnectorConfig, VerdictPolicy};
pub use connector::{ConnectorGuard, NfqueueConnector};
pub use error::{ConnectError, Result};
pub use metrics::{MetricsSnapshot, QueueMetrics};
pub use packet::{Handler, Packet, ReleaseReason};
pub use time::{Clock, ManualClock, SystemClock};
pub use transport::{
    CallbackAction, PacketAttribute, QueueCallbacks, QueueTransport, TransportConfig,
    TransportError, TransportFactory, Verdict,
};
