// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Queue instrumentation with atomic counters and latency accumulators.
//!
//! Thread-safe: counters use atomics (Relaxed ordering). Metrics are
//! purely observational and never affect packet handling. A snapshot
//! can be taken at any time via [`QueueMetrics::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters and gauges for a single connector.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    /// Total packets delivered by the transport, including dropped ones.
    packets_seen: AtomicU64,
    /// Gauge: packets currently held or pending release.
    packets_held: AtomicU64,
    /// Packets dropped because the do-not-repeat mark was already set.
    dnr_dropped: AtomicU64,
    /// Packets dropped because they carried no payload.
    no_payload_dropped: AtomicU64,
    /// Packets the consumer explicitly released.
    released_by_consumer: AtomicU64,
    /// Packets released after exceeding the max hold time.
    released_by_timeout: AtomicU64,
    /// Packets force-released because the connection closed.
    connection_closed_dropped: AtomicU64,
    /// Connection shutdowns (each one triggers a reconnect).
    shutdowns: AtomicU64,
    /// Verdict dispatches that failed after all retry attempts.
    verdict_failures: AtomicU64,

    // Latency accumulators: nanosecond sum + sample count.
    time_in_queue_ns: AtomicU64,
    time_in_queue_samples: AtomicU64,
    hold_time_ns: AtomicU64,
    hold_time_samples: AtomicU64,
}

impl QueueMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc_packets_seen(&self) {
        self.packets_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_packets_held(&self, held: u64) {
        self.packets_held.store(held, Ordering::Relaxed);
    }

    pub(crate) fn inc_dnr_dropped(&self) {
        self.dnr_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_no_payload_dropped(&self) {
        self.no_payload_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_released_by_consumer(&self) {
        self.released_by_consumer.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_released_by_timeout(&self, n: u64) {
        self.released_by_timeout.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_connection_closed_dropped(&self, n: u64) {
        self.connection_closed_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn inc_shutdowns(&self) {
        self.shutdowns.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_verdict_failures(&self) {
        self.verdict_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn observe_time_in_queue(&self, elapsed: Duration) {
        self.time_in_queue_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.time_in_queue_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn observe_hold_time(&self, elapsed: Duration) {
        self.hold_time_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.hold_time_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Load all counters into a plain snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_seen: self.packets_seen.load(Ordering::Relaxed),
            packets_held: self.packets_held.load(Ordering::Relaxed),
            dnr_dropped: self.dnr_dropped.load(Ordering::Relaxed),
            no_payload_dropped: self.no_payload_dropped.load(Ordering::Relaxed),
            released_by_consumer: self.released_by_consumer.load(Ordering::Relaxed),
            released_by_timeout: self.released_by_timeout.load(Ordering::Relaxed),
            connection_closed_dropped: self.connection_closed_dropped.load(Ordering::Relaxed),
            shutdowns: self.shutdowns.load(Ordering::Relaxed),
            verdict_failures: self.verdict_failures.load(Ordering::Relaxed),
            avg_time_in_queue: Self::average(
                self.time_in_queue_ns.load(Ordering::Relaxed),
                self.time_in_queue_samples.load(Ordering::Relaxed),
            ),
            avg_hold_time: Self::average(
                self.hold_time_ns.load(Ordering::Relaxed),
                self.hold_time_samples.load(Ordering::Relaxed),
            ),
        }
    }

    fn average(total_ns: u64, samples: u64) -> Option<Duration> {
        if samples == 0 {
            return None;
        }
        Some(Duration::from_nanos(total_ns / samples))
    }
}

/// Point-in-time view of [`QueueMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub packets_seen: u64,
    pub packets_held: u64,
    pub dnr_dropped: u64,
    pub no_payload_dropped: u64,
    pub released_by_consumer: u64,
    pub released_by_timeout: u64,
    pub connection_closed_dropped: u64,
    pub shutdowns: u64,
    pub verdict_failures: u64,
    pub avg_time_in_queue: Option<Duration>,
    pub avg_hold_time: Option<Duration>,
}
