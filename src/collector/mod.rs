use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::domain::{
    BatterySample, ConsumptionSample, GridSample, InverterInfo, InverterState, PvSample, Snapshot,
};
use crate::inverter::{InverterPort, InverterWorkMode, RuntimeData};
use crate::storage::Storage;

/// Average daily consumption, used by the decision engine's consumption
/// forecast. Implemented by the collector; the engine depends only on this
/// trait so there is no cycle between analyzer and collector.
#[async_trait]
pub trait DailyConsumptionProvider: Send + Sync {
    async fn average_daily_consumption_kwh(&self, days: u32) -> Option<f64>;
}

/// Daily aggregates, reset at local midnight rollover.
///
/// Energy totals prefer the inverter's own daily counters when present;
/// otherwise they fall back to power integration, where a missing power
/// sample contributes zero for that interval.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DailyAggregates {
    pub day: Option<NaiveDate>,
    pub pv_energy_wh: f64,
    pub grid_import_wh: f64,
    pub grid_export_wh: f64,
    pub consumption_wh: f64,
    pub pv_peak_w: f64,
    pub consumption_peak_w: f64,
    pub soc_min_percent: Option<f64>,
    pub soc_max_percent: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
struct HourBucket {
    sum_w: f64,
    samples: u32,
}

/// Polls the inverter on a fixed cadence and assembles canonical snapshots.
pub struct DataCollector {
    inverter: Arc<dyn InverterPort>,
    storage: Arc<dyn Storage>,
    history: RwLock<VecDeque<Snapshot>>,
    history_hours: u32,
    daily: RwLock<DailyAggregates>,
    consumption_by_hour: RwLock<[HourBucket; 24]>,
    avg_daily_cache: RwLock<Option<(DateTime<Utc>, f64)>>,
    pending: Mutex<Vec<Snapshot>>,
    persist_every: u32,
    sample_counter: Mutex<u32>,
}

impl DataCollector {
    pub fn new(
        inverter: Arc<dyn InverterPort>,
        storage: Arc<dyn Storage>,
        history_hours: u32,
        persist_every: u32,
    ) -> Self {
        Self {
            inverter,
            storage,
            history: RwLock::new(VecDeque::new()),
            history_hours,
            daily: RwLock::new(DailyAggregates::default()),
            consumption_by_hour: RwLock::new([HourBucket::default(); 24]),
            avg_daily_cache: RwLock::new(None),
            pending: Mutex::new(Vec::new()),
            persist_every: persist_every.max(1),
            sample_counter: Mutex::new(0),
        }
    }

    /// One sampling tick: read the inverter, normalize, update history and
    /// aggregates, and periodically flush to storage. Storage failures are
    /// logged, never propagated; the snapshot itself is still returned.
    pub async fn collect_once(&self, now: DateTime<Utc>) -> anyhow::Result<Snapshot> {
        let runtime = self.inverter.collect_all().await?;
        let snapshot = Self::normalize(now, runtime);

        self.push_history(snapshot.clone()).await;
        self.update_daily(&snapshot).await;
        self.update_consumption_history(&snapshot).await;

        let flush = {
            let mut pending = self.pending.lock().await;
            pending.push(snapshot.clone());
            let mut counter = self.sample_counter.lock().await;
            *counter += 1;
            if *counter >= self.persist_every {
                *counter = 0;
                Some(std::mem::take(&mut *pending))
            } else {
                None
            }
        };
        if let Some(batch) = flush {
            if let Err(e) = self.storage.save_snapshots(&batch).await {
                error!(error=%e, count = batch.len(), "snapshot persistence failed, keeping in memory");
                // Put the batch back so the next flush retries it, bounded so
                // a long outage cannot grow the queue without limit; the
                // oldest records are dropped first.
                let mut pending = self.pending.lock().await;
                let mut restored = batch;
                restored.append(&mut *pending);
                let cap = (self.persist_every as usize).saturating_mul(10).max(10);
                if restored.len() > cap {
                    let dropped = restored.len() - cap;
                    restored.drain(..dropped);
                    warn!(dropped, "pending snapshot queue overflow, oldest records dropped");
                }
                *pending = restored;
            }
        }

        Ok(snapshot)
    }

    /// Normalize vendor runtime data into the canonical snapshot shape.
    fn normalize(now: DateTime<Utc>, runtime: RuntimeData) -> Snapshot {
        let state = match runtime.status.work_mode {
            InverterWorkMode::Normal => InverterState::Normal,
            InverterWorkMode::Fault => InverterState::Fault,
            InverterWorkMode::Unknown => InverterState::Unknown,
        };
        Snapshot {
            timestamp: now,
            battery: BatterySample {
                soc_percent: runtime.battery.soc_percent,
                voltage_v: runtime.battery.voltage_v,
                current_a: runtime.battery.current_a,
                power_w: runtime.battery.power_w,
                temperature_c: runtime.battery.temperature_c,
                charging: runtime.battery.charging,
            },
            pv: PvSample {
                power_w: runtime.pv.power_w,
                string_power_w: runtime.pv.string_power_w,
                daily_energy_wh: runtime.pv.daily_energy_wh,
            },
            grid: GridSample {
                power_w: runtime.grid.power_w,
                voltage_v: runtime.grid.voltage_v,
                frequency_hz: runtime.grid.frequency_hz,
                phase_current_a: runtime.grid.phase_current_a,
                daily_import_wh: runtime.grid.daily_import_wh,
                daily_export_wh: runtime.grid.daily_export_wh,
            },
            consumption: ConsumptionSample {
                power_w: runtime.consumption.power_w,
                daily_energy_wh: runtime.consumption.daily_energy_wh,
            },
            inverter: InverterInfo {
                model: String::new(),
                serial: String::new(),
                state,
                error_codes: runtime.status.error_codes.into_iter().collect(),
            },
        }
    }

    async fn push_history(&self, snapshot: Snapshot) {
        let cutoff = snapshot.timestamp - chrono::Duration::hours(self.history_hours as i64);
        let mut history = self.history.write().await;
        history.push_back(snapshot);
        while history.front().is_some_and(|s| s.timestamp < cutoff) {
            history.pop_front();
        }
    }

    async fn update_daily(&self, snapshot: &Snapshot) {
        let day = snapshot.timestamp.date_naive();
        let mut daily = self.daily.write().await;

        let prev_timestamp = {
            // dt from the previous history entry; first sample of the day
            // integrates nothing.
            let history = self.history.read().await;
            history
                .iter()
                .rev()
                .nth(1)
                .map(|s| s.timestamp)
        };

        if daily.day != Some(day) {
            *daily = DailyAggregates {
                day: Some(day),
                ..DailyAggregates::default()
            };
        }

        if let Some(counter) = snapshot.pv.daily_energy_wh {
            daily.pv_energy_wh = counter;
        } else if let (Some(prev), Some(power)) = (prev_timestamp, snapshot.pv.power_w) {
            let dt_h = (snapshot.timestamp - prev).num_milliseconds() as f64 / 3_600_000.0;
            if dt_h > 0.0 && dt_h < 1.0 {
                daily.pv_energy_wh += power.max(0.0) * dt_h;
            }
        }

        if let Some(counter) = snapshot.grid.daily_import_wh {
            daily.grid_import_wh = counter;
        }
        if let Some(counter) = snapshot.grid.daily_export_wh {
            daily.grid_export_wh = counter;
        }
        if let Some(counter) = snapshot.consumption.daily_energy_wh {
            daily.consumption_wh = counter;
        } else if let (Some(prev), Some(power)) = (prev_timestamp, snapshot.consumption.power_w) {
            let dt_h = (snapshot.timestamp - prev).num_milliseconds() as f64 / 3_600_000.0;
            if dt_h > 0.0 && dt_h < 1.0 {
                daily.consumption_wh += power.max(0.0) * dt_h;
            }
        }

        if let Some(power) = snapshot.pv.power_w {
            daily.pv_peak_w = daily.pv_peak_w.max(power);
        }
        if let Some(power) = snapshot.consumption.power_w {
            daily.consumption_peak_w = daily.consumption_peak_w.max(power);
        }
        if let Some(soc) = snapshot.battery.soc_percent {
            daily.soc_min_percent = Some(daily.soc_min_percent.map_or(soc, |m| m.min(soc)));
            daily.soc_max_percent = Some(daily.soc_max_percent.map_or(soc, |m| m.max(soc)));
        }
    }

    async fn update_consumption_history(&self, snapshot: &Snapshot) {
        if let Some(power) = snapshot.consumption.power_w {
            let hour = snapshot.timestamp.hour() as usize;
            let mut buckets = self.consumption_by_hour.write().await;
            buckets[hour].sum_w += power;
            buckets[hour].samples += 1;
        }
    }

    /// Latest snapshot, if any sample has been taken.
    pub async fn latest(&self) -> Option<Snapshot> {
        self.history.read().await.back().cloned()
    }

    /// Copy of the rolling history for external readers.
    pub async fn history(&self) -> Vec<Snapshot> {
        self.history.read().await.iter().cloned().collect()
    }

    pub async fn daily_aggregates(&self) -> DailyAggregates {
        self.daily.read().await.clone()
    }

    /// Mean consumption for an hour of day, from the in-memory history.
    pub async fn hourly_consumption_w(&self, hour: u32) -> Option<f64> {
        let buckets = self.consumption_by_hour.read().await;
        let bucket = buckets.get(hour as usize)?;
        if bucket.samples == 0 {
            return None;
        }
        Some(bucket.sum_w / bucket.samples as f64)
    }

    /// Flush any buffered snapshots; called on shutdown.
    pub async fn flush(&self) {
        let batch = std::mem::take(&mut *self.pending.lock().await);
        if batch.is_empty() {
            return;
        }
        if let Err(e) = self.storage.save_snapshots(&batch).await {
            error!(error=%e, count = batch.len(), "final snapshot flush failed");
        }
    }

    /// Sampling loop; runs until the token is cancelled.
    pub async fn run_sampling(self: Arc<Self>, interval_seconds: u64, cancel: CancellationToken) {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(interval_seconds.max(1)));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.flush().await;
                    debug!("sampling loop stopped");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.collect_once(Utc::now()).await {
                        warn!(error=%e, "sample collection failed");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl DailyConsumptionProvider for DataCollector {
    async fn average_daily_consumption_kwh(&self, days: u32) -> Option<f64> {
        let now = Utc::now();
        {
            let cache = self.avg_daily_cache.read().await;
            if let Some((computed_at, value)) = &*cache {
                if (now - *computed_at).num_minutes() < 60 {
                    return Some(*value);
                }
            }
        }

        let from = now - chrono::Duration::days(days as i64);
        let snapshots = match self.storage.snapshots(from, now).await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                warn!(error=%e, "consumption history query failed");
                return None;
            }
        };
        if snapshots.is_empty() {
            return None;
        }

        // Daily total = max daily counter seen that day.
        let mut per_day: std::collections::BTreeMap<NaiveDate, f64> = Default::default();
        for snapshot in &snapshots {
            if let Some(wh) = snapshot.consumption.daily_energy_wh {
                let day = per_day.entry(snapshot.timestamp.date_naive()).or_insert(0.0);
                *day = day.max(wh);
            }
        }
        if per_day.is_empty() {
            return None;
        }
        let avg_kwh =
            per_day.values().sum::<f64>() / per_day.len() as f64 / 1000.0;

        let mut cache = self.avg_daily_cache.write().await;
        *cache = Some((now, avg_kwh));
        Some(avg_kwh)
    }
}

impl std::fmt::Debug for DataCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataCollector")
            .field("history_hours", &self.history_hours)
            .field("persist_every", &self.persist_every)
            .finish()
    }
}
