// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fibonacci backoff for blocked publishes.
//!
//! The window starts at `[0, 1]`. Each step appends the sum of the window,
//! pops the oldest value and waits a tenth of it in seconds:
//!
//! ```text
//! popped: 0, 1, 1, 2, 3, 5, 8, 13, ...   wait: 0.0s, 0.1s, 0.1s, 0.2s, ...
//! ```
//!
//! A popped value above the escalation threshold means the connection is
//! stuck: the caller reconnects and the window restarts at `[0, 1]`.

use std::time::Duration;

/// Popped value above which the backoff escalates to a reconnect.
pub const ESCALATION_THRESHOLD: u64 = 300;

/// Milliseconds slept per unit of popped value.
const MILLIS_PER_UNIT: u64 = 100;

/// What the caller should do after a rejected publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStep {
    /// Sleep, then retry.
    Wait(Duration),
    /// Reconnect, sleep, then retry with a fresh window.
    Escalate(Duration),
}

impl BackoffStep {
    /// Sleep duration of this step.
    pub fn delay(&self) -> Duration {
        match self {
            Self::Wait(d) | Self::Escalate(d) => *d,
        }
    }
}

/// Fibonacci backoff window.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    window: [u64; 2],
    threshold: u64,
}

impl Default for FibonacciBackoff {
    fn default() -> Self {
        Self::new()
    }
}

impl FibonacciBackoff {
    /// Backoff with the default escalation threshold.
    pub fn new() -> Self {
        Self::with_threshold(ESCALATION_THRESHOLD)
    }

    /// Backoff escalating once a popped value exceeds `threshold`.
    pub fn with_threshold(threshold: u64) -> Self {
        Self {
            window: [0, 1],
            threshold,
        }
    }

    /// Advance the window by one rejected attempt.
    pub fn next_step(&mut self) -> BackoffStep {
        let [oldest, newest] = self.window;
        self.window = [newest, oldest.saturating_add(newest)];

        let wait = Duration::from_millis(oldest.saturating_mul(MILLIS_PER_UNIT));
        if oldest > self.threshold {
            self.reset();
            BackoffStep::Escalate(wait)
        } else {
            BackoffStep::Wait(wait)
        }
    }

    /// Restart the window at `[0, 1]`.
    pub fn reset(&mut self) {
        self.window = [0, 1];
    }

    /// Value the next step will pop.
    pub fn peek(&self) -> u64 {
        self.window[0]
    }
}
