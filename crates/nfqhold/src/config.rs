// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connector configuration.
//!
//! All values are fixed once the connector is constructed; the event
//! loop and the transport hooks read them without synchronization.

use crate::transport::Verdict;
use std::time::Duration;

/// Default maximum number of bytes copied per captured packet.
pub const DEFAULT_MAX_PACKET_LEN: u32 = 1024;

/// Default maximum kernel queue length.
pub const DEFAULT_MAX_QUEUE_LEN: u32 = 100;

/// Default maximum time a packet may be held in user space.
pub const DEFAULT_MAX_HOLD_TIME: Duration = Duration::from_secs(2);

/// Default interval between age-based release checks.
pub const DEFAULT_HOLD_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Socket read timeout passed to the transport.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Socket write timeout passed to the transport.
pub const WRITE_TIMEOUT: Duration = Duration::from_millis(200);

/// Attempts per verdict dispatch before giving up.
pub const SET_VERDICT_ATTEMPTS: u32 = 3;

/// Minimum spacing between repeated error log lines.
pub const ERROR_LOG_INTERVAL: Duration = Duration::from_secs(15);

/// Disposition applied to packets when they are released.
///
/// `Repeat` re-injects the packet at the top of the capture point and
/// therefore must carry a do-not-repeat mark: a looped-back packet
/// with the mark set is dropped on intake instead of being recaptured
/// forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictPolicy {
    /// Accept released packets.
    Accept,
    /// Drop released packets.
    Drop,
    /// Re-inject released packets, tagging them with `dnr_mark`.
    Repeat {
        /// Mark bit(s) set on re-injected packets.
        dnr_mark: u32,
    },
}

impl VerdictPolicy {
    /// The wire verdict for this policy.
    pub(crate) fn verdict(self) -> Verdict {
        match self {
            Self::Accept => Verdict::Accept,
            Self::Drop => Verdict::Drop,
            Self::Repeat { .. } => Verdict::Repeat,
        }
    }

    /// The do-not-repeat mark, 0 when the policy does not re-inject.
    pub(crate) fn dnr_mark(self) -> u32 {
        match self {
            Self::Repeat { dnr_mark } => dnr_mark,
            _ => 0,
        }
    }
}

/// Immutable configuration for a [`NfqueueConnector`](crate::NfqueueConnector).
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Kernel queue identifier to bind.
    pub queue_id: u16,
    /// Maximum kernel queue length.
    pub max_queue_len: u32,
    /// Maximum bytes copied per captured packet.
    pub max_packet_len: u32,
    /// Maximum time a packet may be held before forced release.
    pub max_hold_time: Duration,
    /// Interval between age-based release checks.
    pub hold_check_interval: Duration,
    /// Disposition applied to released packets.
    pub verdict: VerdictPolicy,
    /// Kernel accepts traffic automatically when the queue is full.
    pub fail_open: bool,
}

impl ConnectorConfig {
    /// Configuration for `queue_id` with default limits and an Accept
    /// verdict policy.
    pub fn new(queue_id: u16) -> Self {
        Self {
            queue_id,
            max_queue_len: DEFAULT_MAX_QUEUE_LEN,
            max_packet_len: DEFAULT_MAX_PACKET_LEN,
            max_hold_time: DEFAULT_MAX_HOLD_TIME,
            hold_check_interval: DEFAULT_HOLD_CHECK_INTERVAL,
            verdict: VerdictPolicy::Accept,
            fail_open: false,
        }
    }

    pub fn with_max_queue_len(mut self, len: u32) -> Self {
        self.max_queue_len = len;
        self
    }

    pub fn with_max_packet_len(mut self, len: u32) -> Self {
        self.max_packet_len = len;
        self
    }

    pub fn with_max_hold_time(mut self, max_hold_time: Duration) -> Self {
        self.max_hold_time = max_hold_time;
        self
    }

    pub fn with_hold_check_interval(mut self, interval: Duration) -> Self {
        self.hold_check_interval = interval;
        self
    }

    pub fn with_verdict(mut self, verdict: VerdictPolicy) -> Self {
        self.verdict = verdict;
        self
    }

    pub fn with_fail_open(mut self) -> Self {
        self.fail_open = true;
        self
    }
}
