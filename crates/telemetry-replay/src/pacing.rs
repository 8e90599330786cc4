// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pacing loop.
//!
//! Replays either at a fixed message rate or at the pace recorded in the
//! source timestamps.

use crate::driver::{DriverStats, PublishDriver, Sleeper, TickOutcome};
use crate::publisher::Publisher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Sleep policy between ticks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pacing {
    /// Sleep `interval` after every tick.
    FixedRate { interval: Duration },

    /// Sleep the gap between consecutive record timestamps.
    SourcePaced { poll_interval: Duration },
}

impl Pacing {
    /// Fixed rate when `rate` (messages per second) is set, source paced otherwise.
    pub fn from_rate(rate: Option<f64>, poll_interval: Duration) -> Self {
        match rate.and_then(|r| Duration::try_from_secs_f64(1.0 / r).ok()) {
            Some(interval) => Self::FixedRate { interval },
            None => Self::SourcePaced { poll_interval },
        }
    }
}

/// Computes the sleep after each tick.
#[derive(Debug, Clone)]
pub struct PacingLoop {
    pacing: Pacing,
    last_timestamp_ms: Option<i64>,
}

impl PacingLoop {
    pub fn new(pacing: Pacing) -> Self {
        Self {
            pacing,
            last_timestamp_ms: None,
        }
    }

    /// Sleep owed after `outcome`.
    pub fn next_sleep(&mut self, outcome: &TickOutcome) -> Duration {
        if let TickOutcome::Idle(wait) = outcome {
            return *wait;
        }

        match self.pacing {
            Pacing::FixedRate { interval } => interval,
            Pacing::SourcePaced { poll_interval } => {
                let TickOutcome::Published { timestamp_ms } = *outcome else {
                    return poll_interval;
                };
                match self.last_timestamp_ms.replace(timestamp_ms) {
                    // Timestamps going backwards do not sleep.
                    Some(previous) => {
                        Duration::from_millis(timestamp_ms.saturating_sub(previous).max(0) as u64)
                    }
                    None => poll_interval,
                }
            }
        }
    }
}

/// Tick until the source is exhausted under `stop` or `running` goes false.
///
/// On exhaustion the driver drains in-flight messages before returning.
pub fn run<P, S>(
    driver: &mut PublishDriver<P>,
    pacing: Pacing,
    sleeper: &mut S,
    running: &AtomicBool,
) -> DriverStats
where
    P: Publisher,
    S: Sleeper,
{
    let mut pacer = PacingLoop::new(pacing);
    tracing::info!("Replay started ({:?})", pacing);

    while running.load(Ordering::SeqCst) {
        let outcome = driver.tick(sleeper);
        if outcome == TickOutcome::Exhausted {
            driver.drain(sleeper);
            break;
        }
        sleeper.sleep(pacer.next_sleep(&outcome));
    }

    let stats = driver.stats().clone();
    tracing::info!(
        "Replay finished: {} published, {} retries, {} escalations, {} skipped, {} abandoned",
        stats.published,
        stats.retries,
        stats.escalations,
        stats.skipped,
        stats.abandoned
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLL: Duration = Duration::from_millis(50);

    #[test]
    fn test_fixed_rate_interval() {
        let pacing = Pacing::from_rate(Some(10.0), POLL);
        let Pacing::FixedRate { interval } = pacing else {
            panic!("expected fixed rate, got {:?}", pacing);
        };
        assert_eq!(interval.as_millis(), 100);

        let mut pacer = PacingLoop::new(pacing);
        assert_eq!(pacer.next_sleep(&TickOutcome::Published { timestamp_ms: 0 }), interval);
        assert_eq!(pacer.next_sleep(&TickOutcome::NoRecord), interval);
        assert_eq!(pacer.next_sleep(&TickOutcome::Skipped), interval);
    }

    #[test]
    fn test_source_paced_sleeps_timestamp_gaps() {
        let mut pacer = PacingLoop::new(Pacing::from_rate(None, POLL));

        assert_eq!(pacer.next_sleep(&TickOutcome::Published { timestamp_ms: 1_000 }), POLL);
        assert_eq!(
            pacer.next_sleep(&TickOutcome::Published { timestamp_ms: 1_250 }),
            Duration::from_millis(250)
        );
        assert_eq!(pacer.next_sleep(&TickOutcome::NoRecord), POLL);
        assert_eq!(
            pacer.next_sleep(&TickOutcome::Published { timestamp_ms: 3_250 }),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_source_paced_backwards_timestamps_do_not_sleep() {
        let mut pacer = PacingLoop::new(Pacing::from_rate(None, POLL));
        pacer.next_sleep(&TickOutcome::Published { timestamp_ms: 5_000 });
        assert_eq!(
            pacer.next_sleep(&TickOutcome::Published { timestamp_ms: 4_000 }),
            Duration::ZERO
        );
    }

    #[test]
    fn test_idle_overrides_pacing() {
        let wait = Duration::from_secs(30);
        for pacing in [Pacing::from_rate(Some(10.0), POLL), Pacing::from_rate(None, POLL)] {
            let mut pacer = PacingLoop::new(pacing);
            assert_eq!(pacer.next_sleep(&TickOutcome::Idle(wait)), wait);
        }
    }
}
