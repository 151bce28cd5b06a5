//! Reorg-safe confirmation of position reads.
//!
//! Each entity carries an explicit confirmation state. A raw read becomes a
//! [`ConfirmedState`] only after enough matching reads at non-decreasing block
//! heights; a disagreeing read discards the pending candidate.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::config::ReorgSettings;
use crate::position::{EntityId, RiskTier, TierThresholds};
use sentinel_chain::PositionSnapshot;

/// A snapshot that survived the required confirmation depth.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfirmedState {
    pub snapshot: PositionSnapshot,
    /// Unix seconds at confirmation
    pub confirmed_at: u64,
}

impl ConfirmedState {
    pub fn block_number(&self) -> u64 {
        self.snapshot.block_number
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmationState {
    Unconfirmed {
        candidate: PositionSnapshot,
        depth: u32,
        /// Last confirmed state, kept so block heights never go backwards
        last_confirmed: Option<ConfirmedState>,
    },
    Confirmed {
        state: ConfirmedState,
    },
}

impl ConfirmationState {
    fn floor_block(&self) -> u64 {
        match self {
            Self::Unconfirmed {
                candidate,
                last_confirmed,
                ..
            } => last_confirmed
                .as_ref()
                .map_or(candidate.block_number, |c| c.block_number().max(candidate.block_number)),
            Self::Confirmed { state } => state.block_number(),
        }
    }
}

/// Result of feeding one read to the tracker.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// Candidate accumulating confirmations
    Pending { depth: u32, required: u32 },
    /// Read older than what the tracker already holds; ignored
    Stale,
    /// Read disagreed with the pending candidate
    Reset { discarded_block: u64 },
    /// `newly` is set on the read that completed the confirmation
    Confirmed { state: ConfirmedState, newly: bool },
}

/// Tracker statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReorgStats {
    pub tracked: usize,
    pub confirmed: usize,
    pub pending: usize,
}

#[derive(Debug)]
pub struct ReorgTracker {
    settings: ReorgSettings,
    thresholds: TierThresholds,
    states: DashMap<EntityId, ConfirmationState>,
}

impl ReorgTracker {
    pub fn new(settings: ReorgSettings, thresholds: TierThresholds) -> Self {
        Self {
            settings,
            thresholds,
            states: DashMap::new(),
        }
    }

    /// Confirmations required before `candidate` is trusted.
    pub fn required_depth(&self, candidate: &PositionSnapshot) -> u32 {
        let tier = RiskTier::classify(candidate.health_factor(), &self.thresholds);
        if tier.is_critical_or_worse() {
            self.settings.critical_confirmations
        } else {
            self.settings.confirmations
        }
    }

    /// Whether two reads describe the same position within tolerance.
    pub fn matches(&self, a: &PositionSnapshot, b: &PositionSnapshot) -> bool {
        let (hf_a, hf_b) = (a.health_factor(), b.health_factor());
        let hf_match = if hf_a.is_infinite() || hf_b.is_infinite() {
            hf_a.is_infinite() && hf_b.is_infinite()
        } else {
            (hf_a - hf_b).abs() / hf_a.abs().max(0.001) <= self.settings.hf_tolerance
        };
        let value_match = |x: f64, y: f64| (x - y).abs() / x.abs().max(1.0) <= self.settings.value_tolerance;

        hf_match
            && value_match(a.collateral_usd, b.collateral_usd)
            && value_match(a.debt_usd, b.debt_usd)
    }

    /// Feed a raw read. All state changes for the entity happen under its entry lock.
    pub fn observe(&self, id: &EntityId, snapshot: PositionSnapshot, now: u64) -> Observation {
        match self.states.entry(id.clone()) {
            Entry::Vacant(entry) => {
                let required = self.required_depth(&snapshot);
                entry.insert(ConfirmationState::Unconfirmed {
                    candidate: snapshot,
                    depth: 0,
                    last_confirmed: None,
                });
                Observation::Pending { depth: 0, required }
            }
            Entry::Occupied(mut entry) => {
                if snapshot.block_number < entry.get().floor_block() {
                    return Observation::Stale;
                }
                let (next, observation) = self.transition(entry.get(), snapshot, now);
                if let Observation::Reset { discarded_block } = &observation {
                    debug!(entity = %id, discarded_block, "Pending read discarded");
                }
                *entry.get_mut() = next;
                observation
            }
        }
    }

    fn transition(
        &self,
        current: &ConfirmationState,
        snapshot: PositionSnapshot,
        now: u64,
    ) -> (ConfirmationState, Observation) {
        match current {
            ConfirmationState::Confirmed { state } => {
                if self.matches(&state.snapshot, &snapshot) {
                    let observation = Observation::Confirmed {
                        state: state.clone(),
                        newly: false,
                    };
                    (current.clone(), observation)
                } else {
                    let required = self.required_depth(&snapshot);
                    let next = ConfirmationState::Unconfirmed {
                        candidate: snapshot,
                        depth: 0,
                        last_confirmed: Some(state.clone()),
                    };
                    (next, Observation::Pending { depth: 0, required })
                }
            }
            ConfirmationState::Unconfirmed {
                candidate,
                depth,
                last_confirmed,
            } => {
                if self.matches(candidate, &snapshot) {
                    let depth = depth + 1;
                    let required = self.required_depth(candidate);
                    if depth >= required {
                        let state = ConfirmedState {
                            snapshot,
                            confirmed_at: now,
                        };
                        let next = ConfirmationState::Confirmed {
                            state: state.clone(),
                        };
                        (next, Observation::Confirmed { state, newly: true })
                    } else {
                        let next = ConfirmationState::Unconfirmed {
                            candidate: candidate.clone(),
                            depth,
                            last_confirmed: last_confirmed.clone(),
                        };
                        (next, Observation::Pending { depth, required })
                    }
                } else {
                    let discarded_block = candidate.block_number;
                    let next = match last_confirmed {
                        // Fork reverted to the state we already trusted
                        Some(confirmed) if self.matches(&confirmed.snapshot, &snapshot) => {
                            ConfirmationState::Confirmed {
                                state: confirmed.clone(),
                            }
                        }
                        _ => ConfirmationState::Unconfirmed {
                            candidate: snapshot,
                            depth: 0,
                            last_confirmed: last_confirmed.clone(),
                        },
                    };
                    (next, Observation::Reset { discarded_block })
                }
            }
        }
    }

    /// Most recent confirmed state, if any.
    pub fn confirmed(&self, id: &EntityId) -> Option<ConfirmedState> {
        self.states.get(id).and_then(|state| match state.value() {
            ConfirmationState::Confirmed { state } => Some(state.clone()),
            ConfirmationState::Unconfirmed { last_confirmed, .. } => last_confirmed.clone(),
        })
    }

    /// Lowest block a new read may carry without being stale.
    pub fn floor_block(&self, id: &EntityId) -> Option<u64> {
        self.states.get(id).map(|state| state.floor_block())
    }

    pub fn state(&self, id: &EntityId) -> Option<ConfirmationState> {
        self.states.get(id).map(|s| s.clone())
    }

    pub fn forget(&self, id: &EntityId) {
        self.states.remove(id);
    }

    pub fn stats(&self) -> ReorgStats {
        let mut stats = ReorgStats::default();
        for entry in self.states.iter() {
            stats.tracked += 1;
            match entry.value() {
                ConfirmationState::Confirmed { .. } => stats.confirmed += 1,
                ConfirmationState::Unconfirmed { .. } => stats.pending += 1,
            }
        }
        stats
    }
}
