//! Periodic health evaluation over [`LinkStats`].
//!
//! Each named check maps a stats snapshot to a [`HealthStatus`]; the overall
//! status is the worst of them. Status changes are logged once, on the tick
//! where they happen.

use heapless::Vec;

use crate::engine::LinkStats;

/// Maximum number of registered checks
pub const MAX_CHECKS: usize = 8;

/// Severity, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HealthStatus {
    #[default]
    Healthy,
    Warning,
    Error,
    Critical,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::Warning => "WARNING",
            HealthStatus::Error => "ERROR",
            HealthStatus::Critical => "CRITICAL",
        }
    }
}

pub type CheckFn = fn(&LinkStats) -> HealthStatus;

struct NamedCheck {
    name: &'static str,
    check: CheckFn,
    last: HealthStatus,
}

pub struct HealthCheck {
    checks: Vec<NamedCheck, MAX_CHECKS>,
    interval_ms: u32,
    last_run_ms: Option<u32>,
    overall: HealthStatus,
}

impl HealthCheck {
    /// Empty monitor, evaluated at most every `interval_ms`
    pub fn new(interval_ms: u32) -> Self {
        Self {
            checks: Vec::new(),
            interval_ms,
            last_run_ms: None,
            overall: HealthStatus::Healthy,
        }
    }

    /// Monitor with the built-in link checks registered
    pub fn with_link_checks(interval_ms: u32) -> Self {
        let mut health = Self::new(interval_ms);
        // Capacity is MAX_CHECKS, well above the three built-ins.
        let _ = health.register("spi_link", link_initialized);
        let _ = health.register("receive_backlog", receive_backlog);
        let _ = health.register("recovery_churn", recovery_churn);
        health
    }

    /// Add a named check; returns false when the table is full
    pub fn register(&mut self, name: &'static str, check: CheckFn) -> bool {
        self.checks
            .push(NamedCheck {
                name,
                check,
                last: HealthStatus::Healthy,
            })
            .is_ok()
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Worst status seen on the last evaluation
    pub fn overall(&self) -> HealthStatus {
        self.overall
    }

    /// Status of a single check from the last evaluation
    pub fn status_of(&self, name: &str) -> Option<HealthStatus> {
        self.checks
            .iter()
            .find(|check| check.name == name)
            .map(|check| check.last)
    }

    /// True when the interval has elapsed since the last run
    pub fn is_due(&self, now_ms: u32) -> bool {
        match self.last_run_ms {
            Some(last) => now_ms.wrapping_sub(last) >= self.interval_ms,
            None => true,
        }
    }

    /// Run every check if the interval elapsed; returns whether they ran
    pub fn update(&mut self, now_ms: u32, stats: &LinkStats) -> bool {
        if !self.is_due(now_ms) {
            return false;
        }
        self.last_run_ms = Some(now_ms);
        self.evaluate(stats);
        true
    }

    /// Run every check now
    pub fn evaluate(&mut self, stats: &LinkStats) -> HealthStatus {
        let mut overall = HealthStatus::Healthy;
        for entry in self.checks.iter_mut() {
            let status = (entry.check)(stats);
            if status != entry.last {
                match status {
                    HealthStatus::Healthy => {
                        log::info!("Health: {} recovered ({})", entry.name, status.as_str())
                    }
                    _ => log::warn!(
                        "Health: {} changed {} -> {}",
                        entry.name,
                        entry.last.as_str(),
                        status.as_str()
                    ),
                }
                entry.last = status;
            }
            overall = overall.max(status);
        }

        if overall != self.overall {
            log::info!(
                "Health: overall status {} -> {}",
                self.overall.as_str(),
                overall.as_str()
            );
            self.overall = overall;
        }
        overall
    }
}

/// Engine down is critical
pub fn link_initialized(stats: &LinkStats) -> HealthStatus {
    if stats.initialized {
        HealthStatus::Healthy
    } else {
        HealthStatus::Critical
    }
}

/// Receive queue filling up means the task loop is falling behind
pub fn receive_backlog(stats: &LinkStats) -> HealthStatus {
    match stats.buffer_status_percent {
        0..=49 => HealthStatus::Healthy,
        50..=89 => HealthStatus::Warning,
        _ => HealthStatus::Error,
    }
}

pub fn recovery_churn(stats: &LinkStats) -> HealthStatus {
    match stats.recovery_attempts {
        0 => HealthStatus::Healthy,
        1..=4 => HealthStatus::Warning,
        _ => HealthStatus::Error,
    }
}
