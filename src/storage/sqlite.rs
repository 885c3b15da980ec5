use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, warn};

use super::{DecisionKind, Storage, StorageResult};
use crate::config::DatabaseStorageConfig;
use crate::domain::{CoordinatorState, Decision, PricePoint, PvForecastPoint, Session, Snapshot};

/// Embedded SQLite store. Rows carry an indexed timestamp column and the full
/// record as a JSON payload, so schema migrations never lose fields the
/// payload gained since.
pub struct SqliteStorage {
    pool: SqlitePool,
    batch_size: usize,
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS energy_data (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        payload TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_energy_data_timestamp ON energy_data (timestamp)",
    "CREATE TABLE IF NOT EXISTS system_state (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        payload TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_system_state_timestamp ON system_state (timestamp)",
    "CREATE TABLE IF NOT EXISTS coordinator_decisions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        kind TEXT NOT NULL,
        payload TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_decisions_timestamp ON coordinator_decisions (timestamp)",
    "CREATE TABLE IF NOT EXISTS charging_sessions (
        session_id TEXT PRIMARY KEY,
        timestamp TEXT NOT NULL,
        payload TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_charging_sessions_timestamp ON charging_sessions (timestamp)",
    "CREATE TABLE IF NOT EXISTS selling_sessions (
        session_id TEXT PRIMARY KEY,
        timestamp TEXT NOT NULL,
        payload TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_selling_sessions_timestamp ON selling_sessions (timestamp)",
    "CREATE TABLE IF NOT EXISTS charging_plan (
        day TEXT PRIMARY KEY,
        payload TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS weather_data (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        payload TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_weather_data_timestamp ON weather_data (timestamp)",
    "CREATE TABLE IF NOT EXISTS price_forecast (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        payload TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_price_forecast_timestamp ON price_forecast (timestamp)",
    "CREATE TABLE IF NOT EXISTS pv_forecast (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        payload TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_pv_forecast_timestamp ON pv_forecast (timestamp)",
    "CREATE TABLE IF NOT EXISTS market_prices (
        time_start TEXT PRIMARY KEY,
        payload TEXT NOT NULL
    )",
];

impl SqliteStorage {
    pub async fn connect(cfg: &DatabaseStorageConfig) -> StorageResult<Self> {
        if let Some(parent) = cfg.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(&cfg.path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(cfg.pool_size)
            .connect_with(options)
            .await?;

        for statement in SCHEMA.iter().copied() {
            sqlx::query(statement).execute(&pool).await?;
        }
        debug!(path=%cfg.path.display(), pool_size = cfg.pool_size, "sqlite storage ready");
        Ok(Self {
            pool,
            batch_size: cfg.batch_size,
        })
    }

    #[cfg(test)]
    pub async fn in_memory() -> StorageResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(SqliteConnectOptions::new().in_memory(true))
            .await?;
        for statement in SCHEMA.iter().copied() {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self {
            pool,
            batch_size: 100,
        })
    }

    fn session_table(kind: crate::domain::SessionKind) -> &'static str {
        match kind {
            crate::domain::SessionKind::Charging => "charging_sessions",
            crate::domain::SessionKind::Selling => "selling_sessions",
        }
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn save_snapshots(&self, batch: &[Snapshot]) -> StorageResult<()> {
        for chunk in batch.chunks(self.batch_size) {
            let mut tx = self.pool.begin().await?;
            for snapshot in chunk {
                sqlx::query("INSERT INTO energy_data (timestamp, payload) VALUES (?, ?)")
                    .bind(snapshot.timestamp.to_rfc3339())
                    .bind(serde_json::to_string(snapshot)?)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
        }
        Ok(())
    }

    async fn snapshots(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<Snapshot>> {
        let rows = sqlx::query(
            "SELECT payload FROM energy_data WHERE timestamp >= ? AND timestamp <= ? ORDER BY timestamp",
        )
        .bind(from.to_rfc3339())
        .bind(to.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.try_get("payload")?;
            out.push(serde_json::from_str(&payload)?);
        }
        Ok(out)
    }

    async fn save_state(&self, state: &CoordinatorState) -> StorageResult<()> {
        sqlx::query("INSERT INTO system_state (timestamp, payload) VALUES (?, ?)")
            .bind(state.last_tick.to_rfc3339())
            .bind(serde_json::to_string(state)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn latest_states(&self, limit: usize) -> StorageResult<Vec<CoordinatorState>> {
        let rows = sqlx::query(
            "SELECT payload FROM system_state ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows.into_iter().rev() {
            let payload: String = row.try_get("payload")?;
            out.push(serde_json::from_str(&payload)?);
        }
        Ok(out)
    }

    async fn save_decision(&self, decision: &Decision, kind: DecisionKind) -> StorageResult<()> {
        let kind_name = match kind {
            DecisionKind::Charging => "charging",
            DecisionKind::Selling => "selling",
        };
        sqlx::query("INSERT INTO coordinator_decisions (timestamp, kind, payload) VALUES (?, ?, ?)")
            .bind(decision.timestamp.to_rfc3339())
            .bind(kind_name)
            .bind(serde_json::to_string(decision)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn decisions(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<Decision>> {
        let rows = sqlx::query(
            "SELECT payload FROM coordinator_decisions WHERE timestamp >= ? AND timestamp <= ? ORDER BY timestamp",
        )
        .bind(from.to_rfc3339())
        .bind(to.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.try_get("payload")?;
            out.push(serde_json::from_str(&payload)?);
        }
        Ok(out)
    }

    async fn save_session(&self, session: &Session) -> StorageResult<()> {
        let table = Self::session_table(session.kind);
        let sql = format!(
            "INSERT INTO {table} (session_id, timestamp, payload) VALUES (?, ?, ?)
             ON CONFLICT(session_id) DO UPDATE SET timestamp = excluded.timestamp, payload = excluded.payload"
        );
        sqlx::query(&sql)
            .bind(session.id.to_string())
            .bind(session.started_at.to_rfc3339())
            .bind(serde_json::to_string(session)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn sessions(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<Session>> {
        let mut out = Vec::new();
        for table in ["charging_sessions", "selling_sessions"] {
            let sql = format!(
                "SELECT payload FROM {table} WHERE timestamp >= ? AND timestamp <= ? ORDER BY timestamp"
            );
            let rows = sqlx::query(&sql)
                .bind(from.to_rfc3339())
                .bind(to.to_rfc3339())
                .fetch_all(&self.pool)
                .await?;
            for row in rows {
                let payload: String = row.try_get("payload")?;
                out.push(serde_json::from_str::<Session>(&payload)?);
            }
        }
        out.sort_by_key(|s| s.started_at);
        Ok(out)
    }

    async fn save_charging_plan(&self, day: NaiveDate, plan: &[Session]) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO charging_plan (day, payload) VALUES (?, ?)
             ON CONFLICT(day) DO UPDATE SET payload = excluded.payload",
        )
        .bind(day.format("%Y-%m-%d").to_string())
        .bind(serde_json::to_string(plan)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_market_prices(&self, points: &[PricePoint]) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;
        for point in points {
            sqlx::query(
                "INSERT INTO market_prices (time_start, payload) VALUES (?, ?)
                 ON CONFLICT(time_start) DO UPDATE SET payload = excluded.payload",
            )
            .bind(point.time_start.to_rfc3339())
            .bind(serde_json::to_string(point)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn save_pv_forecast(&self, points: &[PvForecastPoint]) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;
        for point in points {
            sqlx::query("INSERT INTO pv_forecast (timestamp, payload) VALUES (?, ?)")
                .bind(point.time_start.to_rfc3339())
                .bind(serde_json::to_string(point)?)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn save_weather(
        &self,
        observed_at: DateTime<Utc>,
        payload: &serde_json::Value,
    ) -> StorageResult<()> {
        sqlx::query("INSERT INTO weather_data (timestamp, payload) VALUES (?, ?)")
            .bind(observed_at.to_rfc3339())
            .bind(payload.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn health_check(&self) -> bool {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error=%e, "sqlite health check failed");
                false
            }
        }
    }
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage")
            .field("batch_size", &self.batch_size)
            .finish()
    }
}
