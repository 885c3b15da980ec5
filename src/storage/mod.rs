pub mod composite;
pub mod file;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use thiserror::Error;

use crate::config::{DataStorageConfig, StorageMode};
use crate::domain::{CoordinatorState, Decision, PricePoint, PvForecastPoint, Session, Snapshot};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("all storage back-ends failed: {0}")]
    AllBackendsFailed(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Which audit stream a decision belongs to. Charging and selling decisions
/// are persisted under different record names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionKind {
    Charging,
    Selling,
}

impl DecisionKind {
    pub fn file_prefix(self) -> &'static str {
        match self {
            DecisionKind::Charging => "charging_decision",
            DecisionKind::Selling => "battery_selling_decision",
        }
    }
}

/// Uniform persistence for telemetry, decisions, sessions and forecasts.
///
/// Back-end failures are returned as errors but callers treat them as
/// degraded conditions, never fatal; the composite store applies its own
/// success rule on top.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn save_snapshots(&self, batch: &[Snapshot]) -> StorageResult<()>;
    async fn snapshots(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<Snapshot>>;

    async fn save_state(&self, state: &CoordinatorState) -> StorageResult<()>;
    async fn latest_states(&self, limit: usize) -> StorageResult<Vec<CoordinatorState>>;

    async fn save_decision(&self, decision: &Decision, kind: DecisionKind) -> StorageResult<()>;
    async fn decisions(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<Decision>>;

    async fn save_session(&self, session: &Session) -> StorageResult<()>;
    async fn sessions(&self, from: DateTime<Utc>, to: DateTime<Utc>)
        -> StorageResult<Vec<Session>>;

    /// Current day plan, replace semantics (crash-safe temp+rename).
    async fn save_charging_plan(&self, day: NaiveDate, plan: &[Session]) -> StorageResult<()>;

    async fn save_market_prices(&self, points: &[PricePoint]) -> StorageResult<()>;
    async fn save_pv_forecast(&self, points: &[PvForecastPoint]) -> StorageResult<()>;
    async fn save_weather(&self, observed_at: DateTime<Utc>, payload: &serde_json::Value)
        -> StorageResult<()>;

    /// True when the back-end can currently accept writes.
    async fn health_check(&self) -> bool;
}

/// Build the storage stack selected by configuration.
pub async fn build_storage(cfg: &DataStorageConfig) -> anyhow::Result<Arc<dyn Storage>> {
    match cfg.mode {
        StorageMode::File => Ok(Arc::new(file::FileStorage::new(cfg.file.base_path.clone()))),
        StorageMode::Database => {
            let db = sqlite::SqliteStorage::connect(&cfg.database).await?;
            Ok(Arc::new(db))
        }
        StorageMode::Composite => {
            let primary: Arc<dyn Storage> =
                Arc::new(sqlite::SqliteStorage::connect(&cfg.database).await?);
            let secondary: Arc<dyn Storage> =
                Arc::new(file::FileStorage::new(cfg.file.base_path.clone()));
            Ok(Arc::new(composite::CompositeStorage::new(
                primary,
                vec![secondary],
                cfg.enable_fallback,
            )))
        }
    }
}
