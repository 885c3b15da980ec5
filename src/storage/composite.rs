use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures::future::join_all;
use std::sync::Arc;
use tracing::warn;

use super::{DecisionKind, Storage, StorageError, StorageResult};
use crate::domain::{CoordinatorState, Decision, PricePoint, PvForecastPoint, Session, Snapshot};

/// Write-through wrapper over a primary store and ordered secondaries.
///
/// Writes fan out to every back-end concurrently; the composite succeeds when
/// the primary succeeded, or — with fallback enabled — when any secondary
/// did. Reads hit the primary first and fall back in order on error or empty
/// result. Diverged back-ends are not reconciled; this is a durability aid,
/// not a replicator.
pub struct CompositeStorage {
    primary: Arc<dyn Storage>,
    secondaries: Vec<Arc<dyn Storage>>,
    enable_fallback: bool,
}

impl CompositeStorage {
    pub fn new(
        primary: Arc<dyn Storage>,
        secondaries: Vec<Arc<dyn Storage>>,
        enable_fallback: bool,
    ) -> Self {
        Self {
            primary,
            secondaries,
            enable_fallback,
        }
    }

    fn combine(&self, primary: StorageResult<()>, secondaries: Vec<StorageResult<()>>) -> StorageResult<()> {
        let secondary_ok = secondaries.iter().any(|r| r.is_ok());
        match primary {
            Ok(()) => {
                for result in secondaries {
                    if let Err(e) = result {
                        warn!(error=%e, "secondary storage write failed");
                    }
                }
                Ok(())
            }
            Err(primary_err) if self.enable_fallback && secondary_ok => {
                warn!(error=%primary_err, "primary storage write failed, secondary succeeded");
                Ok(())
            }
            Err(primary_err) => Err(StorageError::AllBackendsFailed(primary_err.to_string())),
        }
    }

    async fn write_all<'a, F>(&'a self, op: F) -> StorageResult<()>
    where
        F: Fn(
            &'a dyn Storage,
        )
            -> futures::future::BoxFuture<'a, StorageResult<()>>,
    {
        let primary_fut = op(self.primary.as_ref());
        let secondary_futs = self.secondaries.iter().map(|s| op(s.as_ref()));
        let (primary, secondaries) = tokio::join!(primary_fut, join_all(secondary_futs));
        self.combine(primary, secondaries)
    }

    async fn read_with_fallback<'a, T, F>(&'a self, op: F) -> StorageResult<Vec<T>>
    where
        F: Fn(
            &'a dyn Storage,
        )
            -> futures::future::BoxFuture<'a, StorageResult<Vec<T>>>,
    {
        match op(self.primary.as_ref()).await {
            Ok(records) if !records.is_empty() => return Ok(records),
            Ok(records) => {
                if !self.enable_fallback {
                    return Ok(records);
                }
            }
            Err(e) => {
                if !self.enable_fallback {
                    return Err(e);
                }
                warn!(error=%e, "primary storage read failed, trying secondaries");
            }
        }

        for secondary in &self.secondaries {
            match op(secondary.as_ref()).await {
                Ok(records) if !records.is_empty() => return Ok(records),
                Ok(_) => continue,
                Err(e) => warn!(error=%e, "secondary storage read failed"),
            }
        }
        Ok(Vec::new())
    }
}

#[async_trait]
impl Storage for CompositeStorage {
    async fn save_snapshots(&self, batch: &[Snapshot]) -> StorageResult<()> {
        self.write_all(|s| Box::pin(s.save_snapshots(batch))).await
    }

    async fn snapshots(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<Snapshot>> {
        self.read_with_fallback(|s| Box::pin(s.snapshots(from, to)))
            .await
    }

    async fn save_state(&self, state: &CoordinatorState) -> StorageResult<()> {
        self.write_all(|s| Box::pin(s.save_state(state))).await
    }

    async fn latest_states(&self, limit: usize) -> StorageResult<Vec<CoordinatorState>> {
        self.read_with_fallback(|s| Box::pin(s.latest_states(limit)))
            .await
    }

    async fn save_decision(&self, decision: &Decision, kind: DecisionKind) -> StorageResult<()> {
        self.write_all(|s| Box::pin(s.save_decision(decision, kind)))
            .await
    }

    async fn decisions(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<Decision>> {
        self.read_with_fallback(|s| Box::pin(s.decisions(from, to)))
            .await
    }

    async fn save_session(&self, session: &Session) -> StorageResult<()> {
        self.write_all(|s| Box::pin(s.save_session(session))).await
    }

    async fn sessions(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<Session>> {
        self.read_with_fallback(|s| Box::pin(s.sessions(from, to)))
            .await
    }

    async fn save_charging_plan(&self, day: NaiveDate, plan: &[Session]) -> StorageResult<()> {
        self.write_all(|s| Box::pin(s.save_charging_plan(day, plan)))
            .await
    }

    async fn save_market_prices(&self, points: &[PricePoint]) -> StorageResult<()> {
        self.write_all(|s| Box::pin(s.save_market_prices(points)))
            .await
    }

    async fn save_pv_forecast(&self, points: &[PvForecastPoint]) -> StorageResult<()> {
        self.write_all(|s| Box::pin(s.save_pv_forecast(points)))
            .await
    }

    async fn save_weather(
        &self,
        observed_at: DateTime<Utc>,
        payload: &serde_json::Value,
    ) -> StorageResult<()> {
        self.write_all(|s| Box::pin(s.save_weather(observed_at, payload)))
            .await
    }

    async fn health_check(&self) -> bool {
        if self.primary.health_check().await {
            return true;
        }
        if !self.enable_fallback {
            return false;
        }
        for secondary in &self.secondaries {
            if secondary.health_check().await {
                return true;
            }
        }
        false
    }
}

impl std::fmt::Debug for CompositeStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeStorage")
            .field("secondaries", &self.secondaries.len())
            .field("enable_fallback", &self.enable_fallback)
            .finish()
    }
}
