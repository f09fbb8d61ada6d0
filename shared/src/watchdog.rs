//! # Link Watchdog
//!
//! Liveness check run from the task loop. Two stall patterns trigger a full
//! reinitialization of the slave driver:
//!
//! ```text
//!  stuck mid-transaction     outstanding && idle > T
//!  master went away          completed > 0 && idle > 2T
//!  recovery failed earlier   setup stored && !initialized
//! ```
//!
//! A pending re-arm request alone only re-arms one transaction.

use crate::config::IDLE_PATTERN;
use crate::engine::TransactionEngine;
use crate::traits::{Clock, SlaveBus};

/// What tripped the watchdog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StallReason {
    /// A transaction started but never completed
    StuckTransaction,
    /// No completion for twice the timeout
    MasterSilent,
    /// A previous recovery left the engine down
    ReinitPending,
}

/// Outcome of one watchdog evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WatchdogAction {
    None,
    Rearm,
    Recover(StallReason),
}

/// Stall detector and recovery driver
#[derive(Debug, Clone, Copy)]
pub struct Watchdog {
    timeout_ms: u32,
}

impl Watchdog {
    pub fn new(timeout_ms: u32) -> Self {
        Self { timeout_ms }
    }

    pub fn timeout_ms(&self) -> u32 {
        self.timeout_ms
    }

    /// Evaluate the engine without acting on it
    pub fn check<B: SlaveBus, C: Clock>(&self, engine: &TransactionEngine<B, C>) -> WatchdogAction {
        if !engine.is_initialized() {
            return if engine.bus_setup().is_some() {
                WatchdogAction::Recover(StallReason::ReinitPending)
            } else {
                WatchdogAction::None
            };
        }

        let activity = engine.activity();
        let idle_ms = engine.clock().elapsed_since(activity.last_activity_ms());

        if activity.is_outstanding() && idle_ms > self.timeout_ms {
            return WatchdogAction::Recover(StallReason::StuckTransaction);
        }
        if activity.completed() > 0 && idle_ms > self.timeout_ms.saturating_mul(2) {
            return WatchdogAction::Recover(StallReason::MasterSilent);
        }
        if engine.needs_rearm() {
            return WatchdogAction::Rearm;
        }
        WatchdogAction::None
    }

    /// Evaluate and act; returns what was done
    pub fn poll<B: SlaveBus, C: Clock>(&self, engine: &TransactionEngine<B, C>) -> WatchdogAction {
        let action = self.check(engine);
        match action {
            WatchdogAction::None => {}
            WatchdogAction::Rearm => {
                engine.ensure_transaction_queued();
            }
            WatchdogAction::Recover(reason) => {
                log::warn!(
                    "Watchdog: {:?}, last activity {} ms ago",
                    reason,
                    engine.clock().elapsed_since(engine.activity().last_activity_ms())
                );
                self.recover(engine);
            }
        }
        action
    }

    /// Tear the driver down and bring it back with the stored parameters
    ///
    /// Returns whether the engine is up afterwards. A failed attempt leaves it
    /// uninitialized; the next poll tries again.
    pub fn recover<B: SlaveBus, C: Clock>(&self, engine: &TransactionEngine<B, C>) -> bool {
        let attempt = engine.activity().begin_recovery();
        log::warn!("Watchdog: starting recovery attempt {}", attempt);

        let Some(setup) = engine.bus_setup() else {
            log::error!("Watchdog: no stored bus parameters, cannot recover");
            return false;
        };

        engine.teardown();
        engine.clock().delay_ms(engine.config().settle_delay_ms);

        if let Err(e) = engine.init(setup.pins, setup.mode) {
            log::error!("Watchdog: recovery attempt {} failed: {}", attempt, e);
            return false;
        }

        engine.activity().reset(engine.clock().now_ms());
        engine.clear_transfer_buffers();
        let discarded = engine.drain_queue();
        if discarded > 0 {
            log::info!("Watchdog: discarded {} queued packets", discarded);
        }
        if let Err(e) = engine.prepare_outbound(&IDLE_PATTERN) {
            log::error!("Watchdog: failed to seed idle pattern: {}", e);
        }

        log::info!("Watchdog: recovery attempt {} complete", attempt);
        true
    }
}
