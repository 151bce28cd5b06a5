//! Adaptive polling schedule for monitored entities.

use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::PollingSettings;
use crate::position::{EntityId, RiskTier};

/// Polling band derived from the latest health factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollBand {
    Critical,
    Medium,
    Low,
    /// No active position
    Idle,
}

#[derive(Debug, Clone)]
pub struct MonitoredEntity {
    pub id: EntityId,
    pub next_poll: Instant,
    pub interval: Duration,
    pub band: PollBand,
    pub health_factor: Option<f64>,
    pub tier: Option<RiskTier>,
    pub last_polled: Option<Instant>,
    pub consecutive_errors: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollingStats {
    pub tracked: usize,
    pub critical: usize,
    pub medium: usize,
    pub low: usize,
    pub idle: usize,
    pub erroring: usize,
}

#[derive(Debug)]
pub struct Scheduler {
    settings: PollingSettings,
    entities: DashMap<EntityId, MonitoredEntity>,
}

impl Scheduler {
    pub fn new(settings: PollingSettings) -> Self {
        Self {
            settings,
            entities: DashMap::new(),
        }
    }

    pub fn band_for(&self, health_factor: Option<f64>) -> PollBand {
        match health_factor {
            None => PollBand::Idle,
            Some(hf) if !hf.is_finite() => PollBand::Idle,
            Some(hf) if hf < self.settings.critical_hf => PollBand::Critical,
            Some(hf) if hf <= self.settings.medium_hf => PollBand::Medium,
            Some(_) => PollBand::Low,
        }
    }

    pub fn interval_for(&self, band: PollBand) -> Duration {
        let secs = match band {
            PollBand::Critical => self.settings.critical_interval_secs,
            PollBand::Medium => self.settings.medium_interval_secs,
            PollBand::Low => self.settings.low_interval_secs,
            PollBand::Idle => self.settings.idle_interval_secs,
        };
        Duration::from_secs(secs)
    }

    /// Start tracking `id`, due immediately. Returns false when already tracked.
    pub fn register(&self, id: EntityId, now: Instant) -> bool {
        if self.entities.contains_key(&id) {
            return false;
        }
        let band = PollBand::Idle;
        self.entities.insert(
            id.clone(),
            MonitoredEntity {
                id,
                next_poll: now,
                interval: self.interval_for(band),
                band,
                health_factor: None,
                tier: None,
                last_polled: None,
                consecutive_errors: 0,
            },
        );
        true
    }

    pub fn unregister(&self, id: &EntityId) -> Option<MonitoredEntity> {
        self.entities.remove(id).map(|(_, entity)| entity)
    }

    /// Entities whose next poll has elapsed, earliest first.
    pub fn due(&self, now: Instant) -> Vec<EntityId> {
        let mut due: Vec<(Instant, EntityId)> = self
            .entities
            .iter()
            .filter(|e| e.next_poll <= now)
            .map(|e| (e.next_poll, e.id.clone()))
            .collect();
        due.sort();
        due.into_iter().map(|(_, id)| id).collect()
    }

    /// Apply a completed poll. The new interval counts from `now`.
    pub fn reschedule(&self, id: &EntityId, health_factor: Option<f64>, tier: Option<RiskTier>, now: Instant) {
        let band = self.band_for(health_factor);
        let interval = self.interval_for(band);
        if let Some(mut entity) = self.entities.get_mut(id) {
            entity.band = band;
            entity.interval = interval;
            entity.health_factor = health_factor;
            entity.tier = tier;
            entity.next_poll = now + interval;
            entity.last_polled = Some(now);
            entity.consecutive_errors = 0;
        }
    }

    /// Re-poll soon after a read that produced no confirmed result, keeping the
    /// current band. The delay is the shorter of the critical interval and the
    /// entity's own interval.
    pub fn defer(&self, id: &EntityId, now: Instant, failed: bool) {
        let retry = self.interval_for(PollBand::Critical);
        if let Some(mut entity) = self.entities.get_mut(id) {
            entity.next_poll = now + retry.min(entity.interval);
            entity.last_polled = Some(now);
            if failed {
                entity.consecutive_errors += 1;
            }
        }
    }

    pub fn get(&self, id: &EntityId) -> Option<MonitoredEntity> {
        self.entities.get(id).map(|e| e.clone())
    }

    pub fn entities(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.entities.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn stats(&self) -> PollingStats {
        let mut stats = PollingStats::default();
        for entity in self.entities.iter() {
            stats.tracked += 1;
            match entity.band {
                PollBand::Critical => stats.critical += 1,
                PollBand::Medium => stats.medium += 1,
                PollBand::Low => stats.low += 1,
                PollBand::Idle => stats.idle += 1,
            }
            if entity.consecutive_errors > 0 {
                stats.erroring += 1;
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> Scheduler {
        Scheduler::new(PollingSettings::default())
    }

    #[test]
    fn test_bands_and_intervals() {
        let s = scheduler();
        assert_eq!(s.band_for(Some(1.1)), PollBand::Critical);
        assert_eq!(s.band_for(Some(1.3)), PollBand::Medium);
        assert_eq!(s.band_for(Some(2.0)), PollBand::Medium);
        assert_eq!(s.band_for(Some(2.01)), PollBand::Low);
        assert_eq!(s.band_for(Some(f64::INFINITY)), PollBand::Idle);
        assert_eq!(s.band_for(None), PollBand::Idle);

        assert_eq!(s.interval_for(s.band_for(Some(2.0))), Duration::from_secs(120));
        assert_eq!(s.interval_for(PollBand::Critical), Duration::from_secs(30));
        assert_eq!(s.interval_for(PollBand::Low), Duration::from_secs(300));
        assert_eq!(s.interval_for(PollBand::Idle), Duration::from_secs(600));
    }

    #[test]
    fn test_register_is_due_immediately() {
        let s = scheduler();
        let now = Instant::now();
        let id = EntityId::new("0xabc", "src");
        assert!(s.register(id.clone(), now));
        assert!(!s.register(id.clone(), now));
        assert_eq!(s.due(now), vec![id]);
    }

    #[test]
    fn test_reschedule_counts_from_now() {
        let s = scheduler();
        let start = Instant::now();
        let id = EntityId::new("0xabc", "src");
        s.register(id.clone(), start);

        s.reschedule(&id, Some(1.2), Some(RiskTier::Warning), start);
        assert!(s.due(start + Duration::from_secs(29)).is_empty());
        assert_eq!(s.due(start + Duration::from_secs(30)).len(), 1);

        // A healthier reading only affects the next schedule
        let later = start + Duration::from_secs(30);
        s.reschedule(&id, Some(3.0), Some(RiskTier::Healthy), later);
        let entity = s.get(&id).unwrap();
        assert_eq!(entity.band, PollBand::Low);
        assert_eq!(entity.next_poll, later + Duration::from_secs(300));
    }

    #[test]
    fn test_defer_keeps_band() {
        let s = scheduler();
        let start = Instant::now();
        let id = EntityId::new("0xabc", "src");
        s.register(id.clone(), start);
        s.reschedule(&id, Some(1.2), None, start);

        s.defer(&id, start + Duration::from_secs(30), true);
        let entity = s.get(&id).unwrap();
        assert_eq!(entity.band, PollBand::Critical);
        assert_eq!(entity.consecutive_errors, 1);
        assert_eq!(entity.next_poll, start + Duration::from_secs(60));
        assert_eq!(s.stats().erroring, 1);

        // Idle entities still retry on the critical cadence
        let idle = EntityId::new("0xidle", "src");
        s.register(idle.clone(), start);
        s.defer(&idle, start, false);
        let entity = s.get(&idle).unwrap();
        assert_eq!(entity.band, PollBand::Idle);
        assert_eq!(entity.next_poll, start + Duration::from_secs(30));
        assert_eq!(entity.consecutive_errors, 0);
    }

    #[test]
    fn test_due_order_and_stats() {
        let s = scheduler();
        let start = Instant::now();
        let a = EntityId::new("a", "src");
        let b = EntityId::new("b", "src");
        s.register(a.clone(), start);
        s.register(b.clone(), start);
        s.reschedule(&a, Some(1.5), None, start);
        s.reschedule(&b, Some(1.1), None, start);

        assert_eq!(s.due(start + Duration::from_secs(200)), vec![b.clone(), a.clone()]);

        let stats = s.stats();
        assert_eq!(stats.tracked, 2);
        assert_eq!(stats.critical, 1);
        assert_eq!(stats.medium, 1);

        s.unregister(&a);
        assert_eq!(s.entities(), vec![b]);
    }
}
