// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Queue connection orchestration.
//!
//! [`NfqueueConnector`] owns the connect -> process -> disconnect ->
//! reconnect loop. One dedicated background thread runs the loop; it
//! is the only place that dispatches verdicts, which guarantees
//! releases only ever target the active connection. The transport's
//! packet/error hooks run on the transport's own delivery context and
//! communicate with the loop exclusively through channels:
//!
//! - a single-slot release trigger (consumer requested a release),
//! - a disconnect channel carrying the requesting connection's serial,
//! - a periodic hold-check tick for age-based release,
//! - a cancellation channel owned by the caller.
//!
//! Failing to open the queue or register callbacks is fatal: without
//! the queue the connector cannot provide its hold guarantee, so the
//! error is surfaced instead of retried.

use crate::config::{ConnectorConfig, ERROR_LOG_INTERVAL, READ_TIMEOUT, WRITE_TIMEOUT};
use crate::connection::Connection;
use crate::error::{ConnectError, Result};
use crate::metrics::QueueMetrics;
use crate::packet::Handler;
use crate::ratelimit::RateLimitedLog;
use crate::time::{Clock, SystemClock};
use crate::transport::{TransportConfig, TransportFactory};
use crossbeam::channel::{bounded, tick, Receiver, Sender, TryRecvError};
use crossbeam::select;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

/// State shared between the connector, its event loop, and every
/// connection it opens.
pub(crate) struct ConnectorShared {
    pub(crate) config: ConnectorConfig,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) factory: Arc<dyn TransportFactory>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) metrics: Arc<QueueMetrics>,

    /// Single-slot release trigger; duplicate signals are dropped.
    pub(crate) release_tx: Sender<()>,
    release_rx: Receiver<()>,

    /// Disconnect requests, keyed by connection serial so the loop
    /// only reconnects for the connection that is actually active.
    pub(crate) disconnect_tx: Sender<u64>,
    disconnect_rx: Receiver<u64>,

    // Test hook for blocking the event loop; not part of the
    // production contract.
    debug_block_tx: Sender<()>,
    debug_block_rx: Receiver<()>,
    debug_ack_tx: Sender<()>,
    debug_ack_rx: Receiver<()>,

    /// Rate-limited logger for per-packet intake errors.
    pub(crate) intake_errors: RateLimitedLog,
    /// Rate-limited logger for verdict dispatch failures.
    pub(crate) verdict_errors: RateLimitedLog,

    next_serial: AtomicU64,
}

/// Why the event loop returned for the current connection.
enum LoopExit {
    /// Reconnect after retiring the active connection.
    Disconnect,
    /// Caller cancelled; do not reconnect.
    Cancelled,
}

/// Connection manager for one kernel packet queue.
///
/// Captured packets are handed to the [`Handler`] and held until the
/// consumer releases them or the max hold time elapses; on socket
/// failure the connector force-releases everything and reconnects
/// transparently. Every packet delivered via `on_packet` receives
/// exactly one `on_release`, whatever happens to the connection.
pub struct NfqueueConnector {
    shared: Arc<ConnectorShared>,
}

impl NfqueueConnector {
    /// Create a connector. No connection is made until
    /// [`NfqueueConnector::connect`] or
    /// [`NfqueueConnector::connect_blocking`] is called.
    pub fn new(
        config: ConnectorConfig,
        handler: Arc<dyn Handler>,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let (release_tx, release_rx) = bounded(1);
        let (disconnect_tx, disconnect_rx) = bounded(1);
        let (debug_block_tx, debug_block_rx) = bounded(1);
        let (debug_ack_tx, debug_ack_rx) = bounded(1);

        log::debug!("[Connector] creating connector: {:?}", config);

        Self {
            shared: Arc::new(ConnectorShared {
                config,
                handler,
                factory,
                clock: Arc::new(SystemClock),
                metrics: Arc::new(QueueMetrics::new()),
                release_tx,
                release_rx,
                disconnect_tx,
                disconnect_rx,
                debug_block_tx,
                debug_block_rx,
                debug_ack_tx,
                debug_ack_rx,
                intake_errors: RateLimitedLog::new(ERROR_LOG_INTERVAL),
                verdict_errors: RateLimitedLog::new(ERROR_LOG_INTERVAL),
                next_serial: AtomicU64::new(1),
            }),
        }
    }

    /// Substitute the clock used for hold-time tracking. Must be
    /// called before connecting.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        Arc::get_mut(&mut self.shared)
            .expect("with_clock must be called before connect")
            .clock = clock;
        self
    }

    /// The connector's instrumentation counters.
    pub fn metrics(&self) -> Arc<QueueMetrics> {
        Arc::clone(&self.shared.metrics)
    }

    /// Start connection and packet processing on a background thread.
    ///
    /// Returns a guard that cancels the loop (disconnecting and
    /// force-releasing all outstanding packets) when stopped or
    /// dropped. A fatal open/register failure panics the background
    /// thread and the panic resurfaces when the guard is stopped or
    /// dropped; use [`NfqueueConnector::connect_blocking`] to observe
    /// such errors as a `Result` instead.
    pub fn connect(&self) -> ConnectorGuard {
        let (cancel_tx, cancel_rx) = bounded::<()>(1);
        let shared = Arc::clone(&self.shared);

        #[allow(clippy::expect_used)] // thread spawn failure is unrecoverable
        let thread = std::thread::Builder::new()
            .name(format!("nfqhold-queue-{}", self.shared.config.queue_id))
            .spawn(move || {
                if let Err(e) = connection_loop(&shared, &cancel_rx) {
                    log::error!("[Connector] unable to connect to the queue: {}", e);
                    panic!("unable to connect to queue {}: {}", shared.config.queue_id, e);
                }
            })
            .expect("failed to spawn queue connector thread");

        ConnectorGuard {
            cancel_tx: Some(cancel_tx),
            thread: Some(thread),
        }
    }

    /// Run connection and packet processing on the caller's thread
    /// until `cancel` is signalled (or its sender dropped).
    ///
    /// Returns the fatal error when the queue cannot be opened or the
    /// callbacks cannot be registered.
    pub fn connect_blocking(&self, cancel: Receiver<()>) -> Result<()> {
        connection_loop(&self.shared, &cancel)
    }

    /// Block or unblock the event loop: call once to block, again to
    /// unblock. Returns once the loop has acknowledged. Test helper
    /// for making multi-release sequences deterministic; not part of
    /// the production contract.
    pub fn debug_block_and_unblock(&self) {
        let _ = self.shared.debug_block_tx.send(());
        let _ = self.shared.debug_ack_rx.recv();
    }
}

/// Cancels the background connection loop when stopped or dropped.
pub struct ConnectorGuard {
    /// Dropping this signals cancellation via channel disconnect.
    cancel_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ConnectorGuard {
    /// Cancel the loop and wait for the thread to finish.
    ///
    /// If the loop thread panicked (fatal connect failure), the panic
    /// is resumed on the caller: a connector that could not reach its
    /// queue must not fail silently.
    pub fn stop(&mut self) {
        drop(self.cancel_tx.take());
        if let Some(thread) = self.thread.take() {
            if let Err(panic) = thread.join() {
                std::panic::resume_unwind(panic);
            }
        }
    }
}

impl Drop for ConnectorGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            // Already unwinding; resuming the worker's panic here
            // would abort the process.
            drop(self.cancel_tx.take());
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        } else {
            self.stop();
        }
    }
}

/// Outer loop: keep a connection open until cancelled.
fn connection_loop(shared: &Arc<ConnectorShared>, cancel: &Receiver<()>) -> Result<()> {
    let ticker = tick(shared.config.hold_check_interval);

    loop {
        match cancel.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return Ok(()),
            Err(TryRecvError::Empty) => {}
        }

        let conn = open_connection(shared)?;
        let exit = process_queue_events(shared, &conn, cancel, &ticker);

        log::info!(
            "[Connector] disconnecting from queue {}",
            shared.config.queue_id
        );
        conn.disconnect();

        if matches!(exit, LoopExit::Cancelled) {
            return Ok(());
        }
    }
}

/// Open a transport and register the connection's hooks.
fn open_connection(shared: &Arc<ConnectorShared>) -> Result<Arc<Connection>> {
    let config = &shared.config;
    let transport_config = TransportConfig {
        queue_id: config.queue_id,
        max_queue_len: config.max_queue_len,
        max_packet_len: config.max_packet_len,
        read_timeout: READ_TIMEOUT,
        write_timeout: WRITE_TIMEOUT,
        fail_open: config.fail_open,
    };

    log::debug!("[Connector] connecting to queue {}", config.queue_id);
    let transport = shared
        .factory
        .open(&transport_config)
        .map_err(ConnectError::Open)?;

    let serial = shared.next_serial.fetch_add(1, Ordering::Relaxed);
    let conn = Arc::new(Connection::new(serial, Arc::clone(shared), transport));

    if let Err(e) = Connection::register(&conn) {
        // The transport opened but is unusable; close it right away.
        log::warn!(
            "[Connector] failed to register callbacks with queue socket: {}",
            e
        );
        conn.close_transport();
        return Err(ConnectError::Register(e));
    }

    log::debug!("[Connector] connected to queue {}", config.queue_id);
    Ok(conn)
}

/// Inner loop: process release triggers, age ticks, and disconnect
/// requests for the active connection.
fn process_queue_events(
    shared: &ConnectorShared,
    conn: &Arc<Connection>,
    cancel: &Receiver<()>,
    ticker: &Receiver<Instant>,
) -> LoopExit {
    loop {
        select! {
            recv(shared.disconnect_rx) -> msg => {
                // Requests from retired connections are dropped: their
                // packets were already force-released on disconnect.
                if msg.map(|serial| serial == conn.serial()).unwrap_or(false) {
                    return LoopExit::Disconnect;
                }
            }
            recv(shared.release_rx) -> _ => {
                // A disconnect may have landed at the same time. It
                // wins: the queue is unregistered and every packet in
                // it has been dropped by the kernel.
                if disconnect_requested(shared, conn) {
                    return LoopExit::Disconnect;
                }
                conn.release();
            }
            recv(ticker) -> _ => {
                if disconnect_requested(shared, conn) {
                    return LoopExit::Disconnect;
                }
                conn.release_by_age();
            }
            recv(cancel) -> _ => {
                return LoopExit::Cancelled;
            }
            recv(shared.debug_block_rx) -> msg => {
                if msg.is_ok() {
                    // Acknowledge the block, then hold until the next
                    // signal unblocks us.
                    let _ = shared.debug_ack_tx.send(());
                    let _ = shared.debug_block_rx.recv();
                    let _ = shared.debug_ack_tx.send(());
                }
            }
        }
    }
}

/// Drain a pending disconnect request, reporting whether it targets
/// the active connection.
fn disconnect_requested(shared: &ConnectorShared, conn: &Arc<Connection>) -> bool {
    matches!(shared.disconnect_rx.try_recv(), Ok(serial) if serial == conn.serial())
}
