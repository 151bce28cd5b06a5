//! Systemic-risk detection from liquidation event streams.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::CascadeSettings;
use sentinel_chain::{BlockRange, LiquidationEvent};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeTier {
    #[default]
    None,
    Warning,
    Critical,
    Severe,
}

impl CascadeTier {
    pub fn label(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Severe => "severe",
        }
    }
}

/// Escalation notice for one source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CascadeAlert {
    pub source: String,
    pub tier: CascadeTier,
    pub event_count: usize,
    pub total_value_usd: f64,
    /// Most recent distinct borrowers first
    pub affected_borrowers: Vec<String>,
    pub window: Duration,
    pub detected_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CascadeStats {
    pub source: String,
    pub event_count: usize,
    pub total_value_usd: f64,
    pub tier: CascadeTier,
    pub emitted_tier: CascadeTier,
    pub last_scanned_block: Option<u64>,
    pub lifetime_events: u64,
}

#[derive(Debug, Default)]
struct SourceWindow {
    events: VecDeque<LiquidationEvent>,
    seen: HashSet<(String, u64)>,
    total_value: f64,
    emitted: CascadeTier,
    cursor: Option<u64>,
    lifetime_events: u64,
}

impl SourceWindow {
    fn evict(&mut self, cutoff: u64) {
        let seen = &mut self.seen;
        self.events.retain(|event| {
            let keep = event.timestamp >= cutoff;
            if !keep {
                seen.remove(&event.identity());
            }
            keep
        });
        self.total_value = self.events.iter().map(|e| e.value_usd).sum();
    }
}

#[derive(Debug)]
pub struct CascadeDetector {
    settings: CascadeSettings,
    windows: DashMap<String, SourceWindow>,
}

impl CascadeDetector {
    pub fn new(settings: CascadeSettings) -> Self {
        Self {
            settings,
            windows: DashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.settings.window_secs)
    }

    /// Tier from count and value; the higher of the two wins.
    pub fn tier_for(&self, count: usize, value_usd: f64) -> CascadeTier {
        let s = &self.settings;
        let by_count = if count >= s.severe_count {
            CascadeTier::Severe
        } else if count >= s.critical_count {
            CascadeTier::Critical
        } else if count >= s.warning_count {
            CascadeTier::Warning
        } else {
            CascadeTier::None
        };
        let by_value = if value_usd >= s.severe_value_usd {
            CascadeTier::Severe
        } else if value_usd >= s.critical_value_usd {
            CascadeTier::Critical
        } else if value_usd >= s.warning_value_usd {
            CascadeTier::Warning
        } else {
            CascadeTier::None
        };
        by_count.max(by_value)
    }

    /// Add events for `source` and re-evaluate its window.
    ///
    /// Returns an alert only when the tier rises above the last emitted one.
    /// Duplicate events and events already outside the window are ignored.
    pub fn ingest(&self, source: &str, events: Vec<LiquidationEvent>, now: u64) -> Option<CascadeAlert> {
        let cutoff = now.saturating_sub(self.settings.window_secs);
        let mut window = self.windows.entry(source.to_string()).or_default();
        window.evict(cutoff);

        for event in events {
            if event.timestamp < cutoff || !window.seen.insert(event.identity()) {
                continue;
            }
            window.total_value += event.value_usd;
            window.lifetime_events += 1;
            window.events.push_back(event);
        }

        let tier = self.tier_for(window.events.len(), window.total_value);
        if tier > window.emitted {
            window.emitted = tier;
            let alert = CascadeAlert {
                source: source.to_string(),
                tier,
                event_count: window.events.len(),
                total_value_usd: window.total_value,
                affected_borrowers: self.affected(&window.events),
                window: self.window(),
                detected_at: now,
            };
            warn!(
                source,
                tier = tier.label(),
                events = alert.event_count,
                value_usd = alert.total_value_usd,
                "Liquidation cascade escalated"
            );
            Some(alert)
        } else {
            if tier < window.emitted {
                debug!(source, from = window.emitted.label(), to = tier.label(), "Cascade tier re-armed");
                window.emitted = tier;
            }
            None
        }
    }

    fn affected(&self, events: &VecDeque<LiquidationEvent>) -> Vec<String> {
        let mut ordered: Vec<&LiquidationEvent> = events.iter().collect();
        ordered.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.block_number.cmp(&a.block_number)));

        let mut borrowers: Vec<String> = Vec::new();
        for event in ordered {
            if borrowers.len() >= self.settings.max_affected {
                break;
            }
            if !borrowers.contains(&event.borrower) {
                borrowers.push(event.borrower.clone());
            }
        }
        borrowers
    }

    /// Next block range to scan, re-covering `overlap_blocks` behind the cursor.
    pub fn next_range(&self, source: &str, latest_block: u64) -> Option<BlockRange> {
        let cursor = self.windows.get(source).and_then(|w| w.cursor);
        let from = match cursor {
            Some(cursor) if cursor >= latest_block => return None,
            Some(cursor) => (cursor + 1).saturating_sub(self.settings.overlap_blocks),
            None => latest_block.saturating_sub(self.settings.initial_lookback_blocks),
        };
        let to = latest_block.min(from + self.settings.max_block_range.saturating_sub(1));
        Some(BlockRange::new(from, to))
    }

    /// Record that blocks up to `to` were scanned.
    pub fn advance(&self, source: &str, to: u64) {
        let mut window = self.windows.entry(source.to_string()).or_default();
        window.cursor = Some(window.cursor.map_or(to, |c| c.max(to)));
    }

    pub fn stats(&self, source: &str) -> Option<CascadeStats> {
        self.windows.get(source).map(|w| CascadeStats {
            source: source.to_string(),
            event_count: w.events.len(),
            total_value_usd: w.total_value,
            tier: self.tier_for(w.events.len(), w.total_value),
            emitted_tier: w.emitted,
            last_scanned_block: w.cursor,
            lifetime_events: w.lifetime_events,
        })
    }

    pub fn all_stats(&self) -> Vec<CascadeStats> {
        let mut sources: Vec<String> = self.windows.iter().map(|e| e.key().clone()).collect();
        sources.sort();
        sources.iter().filter_map(|s| self.stats(s)).collect()
    }
}
