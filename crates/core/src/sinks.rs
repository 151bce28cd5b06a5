//! Outbound seams: notification delivery and best-effort persistence.

use std::collections::HashMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::alert::{AlertMessage, AlertPreferences};
use crate::cascade::CascadeAlert;
use crate::position::{EntityId, RiskTier};
use crate::reorg::ConfirmedState;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Position(AlertMessage),
    Cascade(CascadeAlert),
}

impl Notification {
    /// Recipient key: the account, or `cascade:<source>` for systemic alerts.
    pub fn recipient(&self) -> String {
        match self {
            Self::Position(message) => message.account.clone(),
            Self::Cascade(alert) => format!("cascade:{}", alert.source),
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync + Debug {
    async fn deliver(&self, notification: &Notification) -> anyhow::Result<()>;
}

#[async_trait]
pub trait PersistenceSink: Send + Sync + Debug {
    async fn record_snapshot(&self, id: &EntityId, state: &ConfirmedState) -> anyhow::Result<()>;

    /// Preferences for `account`, if any were stored.
    async fn load_preferences(&self, account: &str) -> anyhow::Result<Option<AlertPreferences>>;
}

/// Writes notifications to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn deliver(&self, notification: &Notification) -> anyhow::Result<()> {
        match notification {
            Notification::Position(message) if message.tier >= RiskTier::Critical => {
                warn!(account = %message.account, tier = %message.tier, "{}", message.text());
            }
            Notification::Position(message) => {
                info!(account = %message.account, tier = %message.tier, "{}", message.text());
            }
            Notification::Cascade(alert) => {
                warn!(
                    source = %alert.source,
                    tier = alert.tier.label(),
                    events = alert.event_count,
                    value_usd = alert.total_value_usd,
                    borrowers = ?alert.affected_borrowers,
                    "Liquidation cascade"
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPersistence;

#[async_trait]
impl PersistenceSink for NoopPersistence {
    async fn record_snapshot(&self, _id: &EntityId, _state: &ConfirmedState) -> anyhow::Result<()> {
        Ok(())
    }

    async fn load_preferences(&self, _account: &str) -> anyhow::Result<Option<AlertPreferences>> {
        Ok(None)
    }
}

/// One line of the snapshot journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub recorded_at: DateTime<Utc>,
    pub account: String,
    pub source: String,
    pub block_number: u64,
    pub confirmed_at: u64,
    pub collateral_usd: f64,
    pub debt_usd: f64,
    pub liquidation_threshold: f64,
    pub health_factor: Option<f64>,
}

/// Append-only JSON-lines journal of confirmed snapshots.
#[derive(Debug)]
pub struct JsonLinesPersistence {
    path: PathBuf,
    writer: Mutex<()>,
    preferences: HashMap<String, AlertPreferences>,
}

impl JsonLinesPersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(()),
            preferences: HashMap::new(),
        }
    }

    pub fn with_preferences(mut self, preferences: HashMap<String, AlertPreferences>) -> Self {
        self.preferences = preferences;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every recorded snapshot for `id`, oldest first.
    pub async fn history(&self, id: &EntityId) -> anyhow::Result<Vec<SnapshotRecord>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", self.path.display())),
        };
        let mut records = Vec::new();
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            let record: SnapshotRecord = serde_json::from_str(line).context("malformed journal line")?;
            if record.account == id.account && record.source == id.source {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl PersistenceSink for JsonLinesPersistence {
    async fn record_snapshot(&self, id: &EntityId, state: &ConfirmedState) -> anyhow::Result<()> {
        let snapshot = &state.snapshot;
        let hf = snapshot.health_factor();
        let record = SnapshotRecord {
            recorded_at: Utc::now(),
            account: id.account.clone(),
            source: id.source.clone(),
            block_number: snapshot.block_number,
            confirmed_at: state.confirmed_at,
            collateral_usd: snapshot.collateral_usd,
            debt_usd: snapshot.debt_usd,
            liquidation_threshold: snapshot.liquidation_threshold,
            health_factor: hf.is_finite().then_some(hf),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let _guard = self.writer.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn load_preferences(&self, account: &str) -> anyhow::Result<Option<AlertPreferences>> {
        Ok(self.preferences.get(account).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_chain::PositionSnapshot;

    fn confirmed(collateral: f64, block: u64) -> ConfirmedState {
        ConfirmedState {
            snapshot: PositionSnapshot::new(collateral, 4_000.0, 0.8, block),
            confirmed_at: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn test_json_lines_journal() {
        let path = std::env::temp_dir().join(format!("sentinel-journal-{}.jsonl", std::process::id()));
        let _ = tokio::fs::remove_file(&path).await;
        let sink = JsonLinesPersistence::new(&path);

        let a = EntityId::new("0xa", "aave-v3:ethereum");
        let b = EntityId::new("0xb", "aave-v3:ethereum");
        sink.record_snapshot(&a, &confirmed(10_000.0, 1)).await.unwrap();
        sink.record_snapshot(&b, &confirmed(8_000.0, 1)).await.unwrap();
        sink.record_snapshot(&a, &confirmed(5_000.0, 2)).await.unwrap();

        let history = sink.history(&a).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].block_number, 2);
        assert_eq!(history[1].health_factor, Some(1.0));

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_missing_journal_is_empty() {
        let sink = JsonLinesPersistence::new("/nonexistent/sentinel/journal.jsonl");
        assert!(sink.history(&EntityId::new("a", "b")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_preferences_lookup() {
        let mut preferences = HashMap::new();
        preferences.insert(
            "0xa".to_string(),
            AlertPreferences {
                muted: true,
                ..Default::default()
            },
        );
        let sink = JsonLinesPersistence::new("unused.jsonl").with_preferences(preferences);
        assert!(sink.load_preferences("0xa").await.unwrap().unwrap().muted);
        assert!(sink.load_preferences("0xb").await.unwrap().is_none());
        assert!(NoopPersistence.load_preferences("0xa").await.unwrap().is_none());
    }
}
