// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! State and release algorithms for a single queue connection.
//!
//! A [`Connection`] wraps one open transport and tracks every packet
//! captured on it in two intrusive lists: "held" (awaiting a release
//! trigger) and "to-release" (verdict pending dispatch). All list
//! state sits behind one mutex; the lock is held only for list
//! mutation, never across a verdict call, so packet intake is never
//! blocked on the kernel write path.
//!
//! Verdict dispatch is only ever performed from the connector's event
//! loop and only for the active connection. Packets belonging to
//! retired connections have already been dropped by the kernel when
//! the socket closed, so a stale release request simply finds its
//! record gone and becomes a no-op.

use crate::config::SET_VERDICT_ATTEMPTS;
use crate::connector::ConnectorShared;
use crate::list::{ListTag, PacketArena, PacketList, PacketRecord, RecordHandle};
use crate::packet::{Packet, ReleaseReason};
use crate::transport::{
    CallbackAction, PacketAttribute, QueueCallbacks, QueueTransport, TransportError, Verdict,
};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::SystemTime;

const VERDICT_FAILED: &str = "failed to set the queue verdict for the packet";
const VERDICT_BATCH_FAILED: &str = "failed to set the queue verdict for a batch of packets";
const VERDICT_MARK_FAILED: &str =
    "failed to set the queue verdict with do-not-repeat mark for the packet";
const DNR_MARK_SET: &str = "dropping packet with do-not-repeat mark";
const NO_PAYLOAD: &str = "dropping packet with no payload";

/// Mutable connection state, guarded by the connection lock.
struct ConnState {
    arena: PacketArena,
    held: PacketList,
    to_release: PacketList,
    /// Highest packet ID seen on this connection.
    current_packet_id: u32,
    /// ID of the oldest packet not yet released to the kernel. Used to
    /// detect ID wraparound, in which case batch release is skipped.
    oldest_packet_id: u32,
}

/// A released record, copied out of the arena before the lock is
/// dropped so that verdicts and handler callbacks run unlocked.
struct ReleasedEntry {
    id: u32,
    reason: ReleaseReason,
    hold_time: std::time::Instant,
}

/// One connection to the kernel queue.
pub(crate) struct Connection {
    /// Identity on the disconnect channel; the event loop only acts on
    /// requests matching the active connection's serial.
    serial: u64,
    shared: Arc<ConnectorShared>,
    transport: Box<dyn QueueTransport>,
    state: Mutex<ConnState>,
}

impl Connection {
    pub(crate) fn new(
        serial: u64,
        shared: Arc<ConnectorShared>,
        transport: Box<dyn QueueTransport>,
    ) -> Self {
        Self {
            serial,
            shared,
            transport,
            state: Mutex::new(ConnState {
                arena: PacketArena::new(),
                held: PacketList::new(ListTag::Held),
                to_release: PacketList::new(ListTag::ToRelease),
                current_packet_id: 0,
                oldest_packet_id: 0,
            }),
        }
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    /// Register this connection's hooks with the transport.
    pub(crate) fn register(conn: &Arc<Connection>) -> io::Result<()> {
        conn.transport
            .register_callbacks(Arc::new(ConnHooks(Arc::clone(conn))))
    }

    /// Packet intake hook, invoked by the transport for every captured
    /// packet, potentially concurrently with the event loop.
    fn packet_hook(conn: &Arc<Connection>, attribute: PacketAttribute) {
        let shared = &conn.shared;
        shared.metrics.inc_packets_seen();

        let dnr_mark = shared.config.verdict.dnr_mark();
        if let Some(mark) = attribute.mark {
            if mark & dnr_mark != 0 {
                // Loop guard: this packet was already released with a
                // Repeat verdict and came back around.
                shared
                    .intake_errors
                    .error(format_args!("[Connection] {}", DNR_MARK_SET));
                conn.set_verdict(attribute.packet_id, Verdict::Drop, VERDICT_FAILED);
                shared.metrics.inc_dnr_dropped();
                return;
            }
        }

        let payload = match attribute.payload {
            Some(payload) => payload,
            None => {
                shared
                    .intake_errors
                    .error(format_args!("[Connection] {}", NO_PAYLOAD));
                conn.set_verdict(attribute.packet_id, Verdict::Drop, VERDICT_FAILED);
                shared.metrics.inc_no_payload_dropped();
                return;
            }
        };

        let hold_time = shared.clock.now();
        let (handle, total_held) = {
            let mut state = conn.state.lock();
            let ConnState {
                arena,
                held,
                to_release,
                current_packet_id,
                ..
            } = &mut *state;
            let handle = arena.insert(PacketRecord::new(attribute.packet_id, hold_time));
            held.push_back(arena, handle);
            *current_packet_id = attribute.packet_id;
            (handle, held.len() + to_release.len())
        };

        // Pending-release packets are still technically held.
        shared.metrics.set_packets_held(total_held as u64);
        if let Some(ts) = attribute.timestamp {
            if let Ok(elapsed) = SystemTime::now().duration_since(ts) {
                shared.metrics.observe_time_in_queue(elapsed);
            }
        }

        let release_conn = Arc::clone(conn);
        let packet = Packet::new(
            attribute.packet_id,
            attribute.timestamp,
            attribute.mark,
            attribute.hw_protocol,
            payload,
            Arc::new(move || release_conn.prepare_for_release(handle)),
        );
        log::debug!(
            "[Connection] queue {}: invoking handler for {}",
            shared.config.queue_id,
            packet
        );
        shared.handler.on_packet(packet);
    }

    /// Error hook, invoked by the transport's read path.
    fn error_hook(&self, error: TransportError) -> CallbackAction {
        if error.is_recoverable() {
            return CallbackAction::Continue;
        }

        // The event loop performs the actual disconnect; it checks the
        // serial so a request from a retired connection is ignored.
        log::info!(
            "[Connection] queue {}: unrecoverable socket error: {}",
            self.shared.config.queue_id,
            error
        );
        let _ = self.shared.disconnect_tx.send(self.serial);
        CallbackAction::Stop
    }

    /// Move a packet from "held" to "to-release" and nudge the event
    /// loop. Runs in the consumer's context; a packet that has already
    /// left the held list (double release, timeout race, retired
    /// connection) is left alone.
    fn prepare_for_release(&self, handle: RecordHandle) {
        {
            let mut state = self.state.lock();
            let ConnState {
                arena,
                held,
                to_release,
                ..
            } = &mut *state;
            match arena.get(handle) {
                Some(record) if record.owner() == Some(ListTag::Held) => {
                    log::debug!("[Connection] release requested for packet {}", record.id);
                }
                _ => {
                    log::debug!("[Connection] release requested for already-released packet");
                    return;
                }
            }
            held.unlink(arena, handle);
            to_release.push_back(arena, handle);
        }

        self.shared.metrics.inc_released_by_consumer();

        // Single-slot trigger; a signal already pending is enough.
        let _ = self.shared.release_tx.try_send(());
    }

    /// Move every packet held for at least the max hold time to the
    /// to-release list, then dispatch. Only called from the event loop.
    pub(crate) fn release_by_age(&self) {
        let now = self.shared.clock.now();
        let max_hold = self.shared.config.max_hold_time;

        let mut expired = 0u64;
        {
            let mut state = self.state.lock();
            let ConnState {
                arena,
                held,
                to_release,
                ..
            } = &mut *state;
            while let Some(handle) = held.first(arena) {
                let record = arena
                    .get(handle)
                    .expect("held list references a reclaimed record");
                // Arrival order implies hold-time order: the first
                // record still within budget ends the scan.
                if now.duration_since(record.hold_time) < max_hold {
                    break;
                }
                log::debug!(
                    "[Connection] packet {} has passed the max hold time",
                    record.id
                );
                held.unlink(arena, handle);
                if let Some(record) = arena.get_mut(handle) {
                    record.reason = ReleaseReason::Timeout;
                }
                to_release.push_back(arena, handle);
                expired += 1;
            }
        }

        if expired > 0 {
            self.shared.metrics.add_released_by_timeout(expired);
        }
        self.release();
    }

    /// Drain the to-release list and issue verdicts, batching where
    /// safe. Only called from the event loop, for the active
    /// connection.
    ///
    /// A record may join the batch only when no held packet has a
    /// lower ID, matching the kernel's batch-verdict semantics of
    /// "this packet and every earlier outstanding one". Batching is
    /// skipped entirely when the policy needs a do-not-repeat mark
    /// (no batch-with-mark primitive) or when the ID space appears to
    /// have wrapped (current ID below the oldest outstanding ID).
    pub(crate) fn release(&self) {
        let policy = self.shared.config.verdict;
        let verdict = policy.verdict();
        let dnr_mark = policy.dnr_mark();

        let mut batch: Vec<ReleasedEntry> = Vec::new();
        let mut individual: Vec<ReleasedEntry> = Vec::new();
        let mut batch_id: u32 = 0;
        let held_len;
        {
            let mut state = self.state.lock();
            if state.to_release.is_empty() {
                return;
            }
            let ConnState {
                arena,
                held,
                to_release,
                current_packet_id,
                oldest_packet_id,
            } = &mut *state;

            let oldest_held_id = held
                .first(arena)
                .and_then(|handle| arena.get(handle).map(|r| r.id));
            log::debug!(
                "[Connection] dispatching releases (current={}, oldest={}, dnr_mark={})",
                current_packet_id,
                oldest_packet_id,
                dnr_mark
            );

            let individual_only = dnr_mark != 0 || *current_packet_id < *oldest_packet_id;
            while let Some(handle) = to_release.pop_front(arena) {
                let record = arena.free(handle);
                let entry = ReleasedEntry {
                    id: record.id,
                    reason: record.reason,
                    hold_time: record.hold_time,
                };
                let batchable =
                    !individual_only && oldest_held_id.map_or(true, |oldest| oldest > entry.id);
                if batchable {
                    if entry.id > batch_id {
                        batch_id = entry.id;
                    }
                    batch.push(entry);
                } else {
                    individual.push(entry);
                }
            }

            // Everything pending release is gone, so the oldest
            // outstanding packet is now the head of the held list.
            *oldest_packet_id = oldest_held_id.unwrap_or(0);
            held_len = held.len();
        }

        self.shared.metrics.set_packets_held(held_len as u64);
        let now = self.shared.clock.now();

        // Batch first: it covers every earlier outstanding packet and
        // makes the remaining individual verdicts cheaper.
        if !batch.is_empty() {
            log::debug!("[Connection] sending batch release for packet {}", batch_id);
            self.set_verdict_batch(batch_id, verdict, VERDICT_BATCH_FAILED);
            for entry in &batch {
                self.shared
                    .metrics
                    .observe_hold_time(now.duration_since(entry.hold_time));
                self.shared.handler.on_release(entry.id, entry.reason);
            }
        }

        for entry in &individual {
            if dnr_mark == 0 {
                log::debug!("[Connection] sending release for packet {}", entry.id);
                self.set_verdict(entry.id, verdict, VERDICT_FAILED);
            } else {
                log::debug!(
                    "[Connection] sending release with mark for packet {}",
                    entry.id
                );
                self.set_verdict_with_mark(entry.id, verdict, dnr_mark, VERDICT_MARK_FAILED);
            }
            self.shared
                .metrics
                .observe_hold_time(now.duration_since(entry.hold_time));
            self.shared.handler.on_release(entry.id, entry.reason);
        }
    }

    /// Close the transport, logging (but not propagating) failures.
    pub(crate) fn close_transport(&self) {
        if let Err(e) = self.transport.close() {
            log::warn!(
                "[Connection] queue {}: failed to close queue socket: {}",
                self.shared.config.queue_id,
                e
            );
        }
    }

    /// Close the transport and force-release every outstanding packet
    /// as a connection failure. Only called from the event loop, for
    /// the connection being retired; no verdict can race the teardown.
    pub(crate) fn disconnect(&self) {
        self.close_transport();

        let drained: Vec<u32> = {
            let mut state = self.state.lock();
            let ConnState {
                arena,
                held,
                to_release,
                ..
            } = &mut *state;
            let mut drained = Vec::with_capacity(held.len() + to_release.len());
            while let Some(handle) = held.pop_front(arena) {
                drained.push(arena.free(handle).id);
            }
            while let Some(handle) = to_release.pop_front(arena) {
                drained.push(arena.free(handle).id);
            }
            drained
        };

        let metrics = &self.shared.metrics;
        metrics.add_connection_closed_dropped(drained.len() as u64);
        metrics.set_packets_held(0);
        metrics.inc_shutdowns();

        for id in drained {
            self.shared
                .handler
                .on_release(id, ReleaseReason::ConnectionFailure);
        }
    }

    fn set_verdict(&self, packet_id: u32, verdict: Verdict, failure_message: &str) {
        let mut last_err = None;
        for _ in 0..SET_VERDICT_ATTEMPTS {
            match self.transport.set_verdict(packet_id, verdict) {
                Ok(()) => return,
                Err(e) => last_err = Some(e),
            }
        }
        self.verdict_failed(packet_id, failure_message, last_err);
    }

    fn set_verdict_with_mark(
        &self,
        packet_id: u32,
        verdict: Verdict,
        mark: u32,
        failure_message: &str,
    ) {
        let mut last_err = None;
        for _ in 0..SET_VERDICT_ATTEMPTS {
            match self.transport.set_verdict_with_mark(packet_id, verdict, mark) {
                Ok(()) => return,
                Err(e) => last_err = Some(e),
            }
        }
        self.verdict_failed(packet_id, failure_message, last_err);
    }

    fn set_verdict_batch(&self, packet_id: u32, verdict: Verdict, failure_message: &str) {
        let mut last_err = None;
        for _ in 0..SET_VERDICT_ATTEMPTS {
            match self.transport.set_verdict_batch(packet_id, verdict) {
                Ok(()) => return,
                Err(e) => last_err = Some(e),
            }
        }
        self.verdict_failed(packet_id, failure_message, last_err);
    }

    /// All attempts failed. The kernel-side packet is beyond recovery
    /// at this point, so this is counted and logged but never
    /// escalated; the release notification still fires.
    fn verdict_failed(&self, packet_id: u32, failure_message: &str, last_err: Option<io::Error>) {
        self.shared.metrics.inc_verdict_failures();
        match last_err {
            Some(e) => self.shared.verdict_errors.error(format_args!(
                "[Connection] {} (packet {}): {}",
                failure_message, packet_id, e
            )),
            None => self.shared.verdict_errors.error(format_args!(
                "[Connection] {} (packet {})",
                failure_message, packet_id
            )),
        };
    }
}

/// Adapter registered with the transport; keeps the connection alive
/// for as long as the transport may still deliver callbacks.
struct ConnHooks(Arc<Connection>);

impl QueueCallbacks for ConnHooks {
    fn on_packet(&self, attribute: PacketAttribute) {
        Connection::packet_hook(&self.0, attribute);
    }

    fn on_error(&self, error: TransportError) -> CallbackAction {
        self.0.error_hook(error)
    }
}
