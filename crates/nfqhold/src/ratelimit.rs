// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Rate-limited error logging.
//!
//! Some failure paths (verdict dispatch, loop-guard drops) can fire on
//! every packet when the surrounding firewall is misconfigured. These
//! are logged through a [`RateLimitedLog`] which emits at most one
//! `error!` per interval and counts the suppressed occurrences.

use parking_lot::Mutex;
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct State {
    last_emit: Option<Instant>,
    suppressed: u64,
}

/// Emits at most one error-level log line per interval.
#[derive(Debug)]
pub(crate) struct RateLimitedLog {
    interval: Duration,
    state: Mutex<State>,
}

impl RateLimitedLog {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Mutex::new(State {
                last_emit: None,
                suppressed: 0,
            }),
        }
    }

    /// Log `message` at error level unless one was emitted within the
    /// interval. Returns whether the line was emitted.
    pub(crate) fn error(&self, message: fmt::Arguments<'_>) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        match state.last_emit {
            Some(last) if now.duration_since(last) < self.interval => {
                state.suppressed += 1;
                false
            }
            _ => {
                let suppressed = state.suppressed;
                state.last_emit = Some(now);
                state.suppressed = 0;
                drop(state);
                if suppressed > 0 {
                    log::error!("{} ({} similar errors suppressed)", message, suppressed);
                } else {
                    log::error!("{}", message);
                }
                true
            }
        }
    }
}
