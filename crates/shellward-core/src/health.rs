//! Tier health - which isolation tier is active and which are known down
//!
//! The active tier only moves toward weaker isolation. A move is a
//! compare-and-set on the tier index, so when many executions hit the same
//! infrastructure failure at once exactly one of them performs (and logs)
//! the transition. Reads are lock-free.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use tracing::{info, warn};

use crate::backend::Tier;

const NEVER_CHECKED: i64 = i64::MIN;

struct TierState {
    configured: AtomicBool,
    available: AtomicBool,
    last_checked_ms: AtomicI64,
}

impl TierState {
    fn new() -> Self {
        Self {
            configured: AtomicBool::new(false),
            available: AtomicBool::new(false),
            last_checked_ms: AtomicI64::new(NEVER_CHECKED),
        }
    }
}

/// Outcome of [`BackendHealth::downgrade`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Downgrade {
    /// This caller moved the active tier
    Performed { from: Tier, to: Tier },
    /// Someone else already moved past `from`; the active tier is now this one
    AlreadyMoved(Tier),
    /// No weaker tier is left
    Exhausted,
}

/// Per-tier status as reported by [`BackendHealth::snapshot`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierStatus {
    pub tier: Tier,
    pub configured: bool,
    pub available: bool,
    pub last_checked: Option<DateTime<Utc>>,
}

/// Serializable view of the tier state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub active: Tier,
    pub tiers: Vec<TierStatus>,
}

impl HealthReport {
    pub fn status(&self, tier: Tier) -> Option<&TierStatus> {
        self.tiers.iter().find(|s| s.tier == tier)
    }
}

pub struct BackendHealth {
    active: AtomicU8,
    tiers: [TierState; 3],
}

impl BackendHealth {
    /// Build from health-check results. Tiers missing from `probes` are
    /// treated as not configured. The subprocess tier is always available.
    pub fn new(probes: &[(Tier, bool)]) -> Self {
        let health = Self {
            active: AtomicU8::new(Tier::Subprocess.index() as u8),
            tiers: [TierState::new(), TierState::new(), TierState::new()],
        };
        health.reset(probes);
        health
    }

    /// Replace all state with fresh probe results and pick the strongest
    /// available tier. This is the only way the active tier moves back up.
    pub fn reset(&self, probes: &[(Tier, bool)]) {
        let now = Utc::now().timestamp_millis();
        for tier in Tier::ALL {
            let probe = probes.iter().find(|(t, _)| *t == tier).map(|(_, ok)| *ok);
            let state = &self.tiers[tier.index()];
            let available = tier == Tier::Subprocess || probe.unwrap_or(false);
            state.configured.store(probe.is_some() || tier == Tier::Subprocess, Ordering::Release);
            state.available.store(available, Ordering::Release);
            state.last_checked_ms.store(
                if probe.is_some() { now } else { NEVER_CHECKED },
                Ordering::Release,
            );
        }

        let active = Tier::ALL
            .into_iter()
            .find(|t| self.is_available(*t))
            .unwrap_or(Tier::Subprocess);
        self.active.store(active.index() as u8, Ordering::Release);
        info!("Orchestrator: active isolation tier is {}", active);
    }

    pub fn active(&self) -> Tier {
        Tier::from_index(self.active.load(Ordering::Acquire) as usize).unwrap_or(Tier::Subprocess)
    }

    pub fn is_available(&self, tier: Tier) -> bool {
        self.tiers[tier.index()].available.load(Ordering::Acquire)
    }

    /// Record that `tier` failed to create its isolation unit
    pub fn mark_unavailable(&self, tier: Tier) {
        if tier == Tier::Subprocess {
            return;
        }
        let state = &self.tiers[tier.index()];
        state.available.store(false, Ordering::Release);
        state
            .last_checked_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    /// Mark `from` down and move the active tier to the next available one,
    /// unless another caller already moved it.
    pub fn downgrade(&self, from: Tier) -> Downgrade {
        self.mark_unavailable(from);

        let Some(to) = self.next_available(from) else {
            return Downgrade::Exhausted;
        };

        match self.active.compare_exchange(
            from.index() as u8,
            to.index() as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                warn!(
                    "Orchestrator: {} tier unavailable, downgrading to {}",
                    from, to
                );
                Downgrade::Performed { from, to }
            }
            Err(current) => {
                Downgrade::AlreadyMoved(Tier::from_index(current as usize).unwrap_or(Tier::Subprocess))
            }
        }
    }

    fn next_available(&self, from: Tier) -> Option<Tier> {
        Tier::ALL
            .into_iter()
            .filter(|t| *t > from)
            .find(|t| self.is_available(*t))
    }

    pub fn snapshot(&self) -> HealthReport {
        let tiers = Tier::ALL
            .into_iter()
            .map(|tier| {
                let state = &self.tiers[tier.index()];
                let ms = state.last_checked_ms.load(Ordering::Acquire);
                TierStatus {
                    tier,
                    configured: state.configured.load(Ordering::Acquire),
                    available: state.available.load(Ordering::Acquire),
                    last_checked: if ms == NEVER_CHECKED {
                        None
                    } else {
                        Utc.timestamp_millis_opt(ms).single()
                    },
                }
            })
            .collect();

        HealthReport {
            active: self.active(),
            tiers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn all_up() -> BackendHealth {
        BackendHealth::new(&[
            (Tier::Container, true),
            (Tier::Lightweight, true),
            (Tier::Subprocess, true),
        ])
    }

    #[test]
    fn test_starts_on_strongest_available() {
        assert_eq!(all_up().active(), Tier::Container);

        let health = BackendHealth::new(&[(Tier::Container, false), (Tier::Lightweight, true)]);
        assert_eq!(health.active(), Tier::Lightweight);

        let health = BackendHealth::new(&[(Tier::Container, false)]);
        assert_eq!(health.active(), Tier::Subprocess);
        assert!(health.is_available(Tier::Subprocess));
    }

    #[test]
    fn test_downgrade_skips_unavailable_tiers() {
        let health = BackendHealth::new(&[(Tier::Container, true), (Tier::Lightweight, false)]);
        assert_eq!(
            health.downgrade(Tier::Container),
            Downgrade::Performed {
                from: Tier::Container,
                to: Tier::Subprocess
            }
        );
        assert_eq!(health.active(), Tier::Subprocess);
        assert!(!health.is_available(Tier::Container));
    }

    #[test]
    fn test_downgrade_is_sticky_and_one_way() {
        let health = all_up();
        assert!(matches!(health.downgrade(Tier::Container), Downgrade::Performed { .. }));
        assert_eq!(health.active(), Tier::Lightweight);

        // a stale caller that still saw the container tier does not move it again
        assert_eq!(
            health.downgrade(Tier::Container),
            Downgrade::AlreadyMoved(Tier::Lightweight)
        );
        assert_eq!(health.active(), Tier::Lightweight);
    }

    #[test]
    fn test_subprocess_cannot_be_downgraded() {
        let health = BackendHealth::new(&[]);
        assert_eq!(health.downgrade(Tier::Subprocess), Downgrade::Exhausted);
        assert!(health.is_available(Tier::Subprocess));
    }

    #[test]
    fn test_concurrent_downgrade_happens_once() {
        let health = Arc::new(all_up());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let health = Arc::clone(&health);
                std::thread::spawn(move || health.downgrade(Tier::Container))
            })
            .collect();

        let performed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|d| matches!(d, Downgrade::Performed { .. }))
            .count();
        assert_eq!(performed, 1);
        assert_eq!(health.active(), Tier::Lightweight);
    }

    #[test]
    fn test_snapshot_and_reset() {
        let health = BackendHealth::new(&[(Tier::Container, true)]);
        health.downgrade(Tier::Container);

        let report = health.snapshot();
        assert_eq!(report.active, Tier::Subprocess);
        let container = report.status(Tier::Container).unwrap();
        assert!(container.configured);
        assert!(!container.available);
        assert!(container.last_checked.is_some());
        let lightweight = report.status(Tier::Lightweight).unwrap();
        assert!(!lightweight.configured);
        assert!(lightweight.last_checked.is_none());

        health.reset(&[(Tier::Container, true)]);
        assert_eq!(health.active(), Tier::Container);
    }

    #[test]
    fn test_report_serializes() {
        let json = serde_json::to_value(all_up().snapshot()).unwrap();
        assert_eq!(json["active"], "container");
        assert_eq!(json["tiers"].as_array().unwrap().len(), 3);
    }
}
