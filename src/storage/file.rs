use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{DecisionKind, Storage, StorageResult};
use crate::domain::{CoordinatorState, Decision, PricePoint, PvForecastPoint, Session, Snapshot};

/// File-backed store: one JSON file per record kind per calendar day under
/// `base_path`, matching the layout consumed by the external log server.
///
/// Replace-kind files (daily snapshot arrays, charging plan, forecasts) are
/// written crash-safe via temp+rename; append kinds (state, sessions) use
/// line-delimited JSON.
pub struct FileStorage {
    base_path: PathBuf,
}

impl FileStorage {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn energy_dir(&self) -> PathBuf {
        self.base_path.join("energy_data")
    }

    fn snapshot_file(&self, day: NaiveDate) -> PathBuf {
        self.energy_dir()
            .join(format!("energy_data_{}.json", day.format("%Y-%m-%d")))
    }

    fn state_file(&self, day: NaiveDate) -> PathBuf {
        self.base_path
            .join(format!("coordinator_state_{}.json", day.format("%Y%m%d")))
    }

    fn sessions_file(&self, day: NaiveDate) -> PathBuf {
        self.base_path
            .join(format!("sessions_{}.json", day.format("%Y%m%d")))
    }

    fn plan_file(&self, day: NaiveDate) -> PathBuf {
        self.base_path
            .join(format!("charging_schedule_{}.json", day.format("%Y-%m-%d")))
    }

    async fn ensure_dirs(&self) -> StorageResult<()> {
        tokio::fs::create_dir_all(self.energy_dir()).await?;
        Ok(())
    }

    /// Atomic replace: write a sibling temp file, then rename over the target.
    async fn write_atomic(path: &Path, contents: &[u8]) -> StorageResult<()> {
        let tmp = path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn append_line(path: &Path, line: &str) -> StorageResult<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }

    async fn read_ndjson<T: serde::de::DeserializeOwned>(path: &Path) -> StorageResult<Vec<T>> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(error=%e, path=%path.display(), "skipping corrupt record line"),
            }
        }
        Ok(records)
    }

    fn days_in_range(from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<NaiveDate> {
        let mut days = Vec::new();
        let mut day = from.date_naive();
        let last = to.date_naive();
        while day <= last {
            days.push(day);
            day += Duration::days(1);
        }
        days
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn save_snapshots(&self, batch: &[Snapshot]) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.ensure_dirs().await?;

        let mut by_day: BTreeMap<NaiveDate, Vec<&Snapshot>> = BTreeMap::new();
        for snapshot in batch {
            by_day
                .entry(snapshot.timestamp.date_naive())
                .or_default()
                .push(snapshot);
        }

        for (day, snapshots) in by_day {
            let path = self.snapshot_file(day);
            let mut existing: Vec<Snapshot> = match tokio::fs::read_to_string(&path).await {
                Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                    warn!(error=%e, path=%path.display(), "daily snapshot file corrupt, rewriting");
                    Vec::new()
                }),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
                Err(e) => return Err(e.into()),
            };
            existing.extend(snapshots.into_iter().cloned());
            let contents = serde_json::to_vec(&existing)?;
            Self::write_atomic(&path, &contents).await?;
            debug!(day=%day, count = existing.len(), "persisted daily snapshots");
        }
        Ok(())
    }

    async fn snapshots(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<Snapshot>> {
        let mut out = Vec::new();
        for day in Self::days_in_range(from, to) {
            let path = self.snapshot_file(day);
            let daily: Vec<Snapshot> = match tokio::fs::read_to_string(&path).await {
                Ok(text) => serde_json::from_str(&text)?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            out.extend(
                daily
                    .into_iter()
                    .filter(|s| s.timestamp >= from && s.timestamp <= to),
            );
        }
        out.sort_by_key(|s| s.timestamp);
        Ok(out)
    }

    async fn save_state(&self, state: &CoordinatorState) -> StorageResult<()> {
        self.ensure_dirs().await?;
        let path = self.state_file(state.last_tick.date_naive());
        Self::append_line(&path, &serde_json::to_string(state)?).await
    }

    async fn latest_states(&self, limit: usize) -> StorageResult<Vec<CoordinatorState>> {
        // State files append all day; today's file plus yesterday's covers
        // any restart boundary.
        let today = Utc::now().date_naive();
        let mut states: Vec<CoordinatorState> =
            Self::read_ndjson(&self.state_file(today - Duration::days(1))).await?;
        states.extend(Self::read_ndjson::<CoordinatorState>(&self.state_file(today)).await?);
        let start = states.len().saturating_sub(limit);
        Ok(states.split_off(start))
    }

    async fn save_decision(&self, decision: &Decision, kind: DecisionKind) -> StorageResult<()> {
        self.ensure_dirs().await?;
        let path = self.energy_dir().join(format!(
            "{}_{}.json",
            kind.file_prefix(),
            decision.timestamp.format("%Y%m%d_%H%M%S")
        ));
        let contents = serde_json::to_vec_pretty(decision)?;
        Self::write_atomic(&path, &contents).await
    }

    async fn decisions(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<Decision>> {
        let mut out = Vec::new();
        let mut dir = match tokio::fs::read_dir(self.energy_dir()).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !(name.starts_with("charging_decision_")
                || name.starts_with("battery_selling_decision_"))
            {
                continue;
            }
            let text = tokio::fs::read_to_string(entry.path()).await?;
            match serde_json::from_str::<Decision>(&text) {
                Ok(decision) if decision.timestamp >= from && decision.timestamp <= to => {
                    out.push(decision)
                }
                Ok(_) => {}
                Err(e) => warn!(error=%e, file=%name, "skipping corrupt decision file"),
            }
        }
        out.sort_by_key(|d| d.timestamp);
        Ok(out)
    }

    async fn save_session(&self, session: &Session) -> StorageResult<()> {
        self.ensure_dirs().await?;
        let path = self.sessions_file(session.started_at.date_naive());
        Self::append_line(&path, &serde_json::to_string(session)?).await
    }

    async fn sessions(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<Session>> {
        // Session mutations are appended; the last record per id wins.
        let mut latest: BTreeMap<uuid::Uuid, Session> = BTreeMap::new();
        for day in Self::days_in_range(from, to) {
            for session in Self::read_ndjson::<Session>(&self.sessions_file(day)).await? {
                if session.started_at >= from && session.started_at <= to {
                    latest.insert(session.id, session);
                }
            }
        }
        let mut out: Vec<Session> = latest.into_values().collect();
        out.sort_by_key(|s| s.started_at);
        Ok(out)
    }

    async fn save_charging_plan(&self, day: NaiveDate, plan: &[Session]) -> StorageResult<()> {
        self.ensure_dirs().await?;
        let contents = serde_json::to_vec_pretty(plan)?;
        Self::write_atomic(&self.plan_file(day), &contents).await
    }

    async fn save_market_prices(&self, points: &[PricePoint]) -> StorageResult<()> {
        self.ensure_dirs().await?;
        let Some(first) = points.first() else { return Ok(()) };
        let path = self.energy_dir().join(format!(
            "market_prices_{}.json",
            first.time_start.date_naive().format("%Y-%m-%d")
        ));
        Self::write_atomic(&path, &serde_json::to_vec(points)?).await
    }

    async fn save_pv_forecast(&self, points: &[PvForecastPoint]) -> StorageResult<()> {
        self.ensure_dirs().await?;
        let Some(first) = points.first() else { return Ok(()) };
        let path = self.energy_dir().join(format!(
            "pv_forecast_{}.json",
            first.time_start.date_naive().format("%Y-%m-%d")
        ));
        Self::write_atomic(&path, &serde_json::to_vec(points)?).await
    }

    async fn save_weather(
        &self,
        observed_at: DateTime<Utc>,
        payload: &serde_json::Value,
    ) -> StorageResult<()> {
        self.ensure_dirs().await?;
        let path = self.base_path.join(format!(
            "weather_{}.json",
            observed_at.date_naive().format("%Y%m%d")
        ));
        let record = serde_json::json!({ "observed_at": observed_at, "payload": payload });
        Self::append_line(&path, &record.to_string()).await
    }

    async fn health_check(&self) -> bool {
        if let Err(e) = self.ensure_dirs().await {
            warn!(error=%e, "file storage health check failed");
            return false;
        }
        let probe = self.base_path.join(".health");
        match tokio::fs::write(&probe, b"ok").await {
            Ok(()) => {
                tokio::fs::remove_file(&probe).await.ok();
                true
            }
            Err(e) => {
                warn!(error=%e, "file storage not writable");
                false
            }
        }
    }
}

impl std::fmt::Debug for FileStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStorage")
            .field("base_path", &self.base_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        BatterySample, ConsumptionSample, GridSample, InverterInfo, PvSample, SessionKind,
    };
    use chrono::TimeZone;

    fn snapshot_at(ts: DateTime<Utc>) -> Snapshot {
        Snapshot {
            timestamp: ts,
            battery: BatterySample {
                soc_percent: Some(50.0),
                ..BatterySample::default()
            },
            pv: PvSample::default(),
            grid: GridSample::default(),
            consumption: ConsumptionSample::default(),
            inverter: InverterInfo::default(),
        }
    }

    #[tokio::test]
    async fn snapshots_round_trip_through_daily_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf());

        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let batch = vec![snapshot_at(t0), snapshot_at(t0 + Duration::minutes(5))];
        storage.save_snapshots(&batch).await.unwrap();
        // Second batch appends into the same daily array.
        storage
            .save_snapshots(&[snapshot_at(t0 + Duration::minutes(10))])
            .await
            .unwrap();

        let read = storage
            .snapshots(t0, t0 + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(read.len(), 3);
        assert!(read.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn decision_files_use_kind_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf());
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 0).unwrap();

        let decision = Decision::wait(ts, "test");
        storage
            .save_decision(&decision, DecisionKind::Selling)
            .await
            .unwrap();

        let expected = dir
            .path()
            .join("energy_data")
            .join("battery_selling_decision_20250601_123000.json");
        assert!(expected.exists());

        let read = storage
            .decisions(ts - Duration::hours(1), ts + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(read.len(), 1);
    }

    #[tokio::test]
    async fn charging_plan_is_replaced_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf());
        let day = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 2, 0, 0).unwrap();

        let plan_a = vec![Session::begin(SessionKind::Charging, now, 5.0, 2.0)];
        storage.save_charging_plan(day, &plan_a).await.unwrap();
        let plan_b = vec![Session::begin(SessionKind::Charging, now, 8.0, 3.0)];
        storage.save_charging_plan(day, &plan_b).await.unwrap();

        let text =
            std::fs::read_to_string(dir.path().join("charging_schedule_2025-06-01.json")).unwrap();
        let plan: Vec<Session> = serde_json::from_str(&text).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].planned_energy_kwh, 8.0);
        assert!(!dir.path().join("charging_schedule_2025-06-01.json.tmp").exists());
    }

    #[tokio::test]
    async fn session_updates_keep_last_record_per_id() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf());
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 2, 0, 0).unwrap();

        let mut session = Session::begin(SessionKind::Charging, now, 5.0, 2.0);
        storage.save_session(&session).await.unwrap();
        session.delivered_energy_kwh = 4.8;
        session.complete(now + Duration::hours(2));
        storage.save_session(&session).await.unwrap();

        let read = storage
            .sessions(now - Duration::hours(1), now + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].delivered_energy_kwh, 4.8);
    }

    #[tokio::test]
    async fn health_check_is_true_for_writable_dir() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf());
        assert!(storage.health_check().await);
    }
}
