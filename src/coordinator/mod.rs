use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use thiserror::Error;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collector::{DailyConsumptionProvider, DataCollector};
use crate::config::AppConfig;
use crate::decision::{DecisionEngine, DecisionInputs, EngineSettings};
use crate::domain::{
    ChargingAction, CoordinatorPhase, CoordinatorState, Decision, DecisionPriority, PeakLabel,
    PricePoint, PvForecastPoint, Session, SessionKind, Snapshot,
};
use crate::forecast::{
    label_at, MarketPricePoint, MarketPriceSource, PeakLabelPoint, PeakLabelSource,
    PvForecastSource, WeatherSource,
};
use crate::inverter::{InverterPort, OperationMode, SafetyLimits};
use crate::pricing::{PriceAnalyzer, Tariff};
use crate::safety::{ComplianceReport, SafetySupervisor};
use crate::selling::{SellingAction, SellingDecision, SellingEngine, SessionBudget};
use crate::storage::{DecisionKind, Storage};

/// Boot failures, mapped to CLI exit codes: unreachable inverter (3), fatal
/// safety state (2), everything else (1).
#[derive(Debug, Error)]
pub enum BootError {
    #[error("inverter unreachable: {0}")]
    Inverter(#[from] crate::inverter::InverterError),
    #[error("fatal safety state at boot: {0}")]
    UnsafeAtBoot(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Everything the decision path needs from the outside world, fetched once
/// per decision and passed in so the path itself stays deterministic.
#[derive(Debug, Clone, Default)]
pub struct MarketData {
    pub price_points: Vec<PricePoint>,
    pub labels: Vec<PeakLabelPoint>,
    /// `None` when the PV forecast source failed.
    pub pv_forecast: Option<Vec<PvForecastPoint>>,
    pub forecast_confidence: f64,
}

/// Subsystem degradation flags surfaced in the status payload.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DegradedSubsystems {
    pub storage: bool,
    pub market_prices: bool,
    pub peak_hours: bool,
    pub pv_forecast: bool,
    pub weather: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub decision_count: u64,
    pub charging_sessions: u64,
    pub selling_sessions: u64,
    pub energy_charged_kwh: f64,
    pub energy_sold_kwh: f64,
    pub emergency_stops: u64,
}

/// Read-only status payload for the external dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct StatusPayload {
    pub state: CoordinatorPhase,
    pub running: bool,
    pub uptime_s: i64,
    pub last_decision_iso: Option<String>,
    pub decision_count: u64,
    pub current_snapshot: Option<Snapshot>,
    pub safety_status: crate::safety::SafetyAssessment,
    pub compliance_report: ComplianceReport,
    pub degraded: DegradedSubsystems,
    pub metrics: PerformanceMetrics,
}

/// Owns the control loop: collect → safety → decide → command → persist.
/// Only one decision is ever in flight; sampling runs in its own task.
pub struct MasterCoordinator {
    cfg: AppConfig,
    inverter: Arc<dyn InverterPort>,
    storage: Arc<dyn Storage>,
    collector: Arc<DataCollector>,
    engine: DecisionEngine,
    selling: SellingEngine,
    tariff: Tariff,
    analyzer: PriceAnalyzer,
    price_source: Option<Arc<dyn MarketPriceSource>>,
    peak_source: Option<Arc<dyn PeakLabelSource>>,
    pv_source: Option<Arc<dyn PvForecastSource>>,
    weather_source: Option<Arc<dyn WeatherSource>>,
    supervisor: Mutex<SafetySupervisor>,
    state: RwLock<CoordinatorState>,
    last_safety: RwLock<crate::safety::SafetyAssessment>,
    metrics: RwLock<PerformanceMetrics>,
    degraded: RwLock<DegradedSubsystems>,
    charging_session: Mutex<Option<Session>>,
    selling_session: Mutex<Option<Session>>,
    selling_budget: Mutex<SessionBudget>,
    last_executed_charge_at: Mutex<Option<DateTime<Utc>>>,
    last_health_check: Mutex<Option<DateTime<Utc>>>,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

/// After a charge starts, only safety events may interrupt it this long.
const MIN_SESSION_MINUTES: i64 = 15;

impl MasterCoordinator {
    pub fn new(
        cfg: AppConfig,
        inverter: Arc<dyn InverterPort>,
        storage: Arc<dyn Storage>,
        price_source: Option<Arc<dyn MarketPriceSource>>,
        peak_source: Option<Arc<dyn PeakLabelSource>>,
        pv_source: Option<Arc<dyn PvForecastSource>>,
        weather_source: Option<Arc<dyn WeatherSource>>,
    ) -> Self {
        let now = Utc::now();
        let collector = Arc::new(DataCollector::new(
            Arc::clone(&inverter),
            Arc::clone(&storage),
            cfg.coordinator.history_hours,
            cfg.coordinator.persist_every_samples,
        ));
        let limits = SafetyLimits::from_config(
            &cfg.coordinator.emergency_stop_conditions,
            &cfg.battery_management.soc_thresholds,
        );
        let supervisor = SafetySupervisor::new(
            limits,
            cfg.battery_management.clone(),
            cfg.coordinator.recovery_green_ticks,
        );
        let engine = DecisionEngine::new(EngineSettings::from_config(&cfg));
        let selling = SellingEngine::new(
            cfg.battery_selling.clone(),
            cfg.battery_management.capacity_kwh,
        );
        let tariff = Tariff::new(cfg.electricity_tariff.clone());
        let analyzer = PriceAnalyzer::new(cfg.price_analysis.clone());

        Self {
            inverter,
            storage,
            collector,
            engine,
            selling,
            tariff,
            analyzer,
            price_source,
            peak_source,
            pv_source,
            weather_source,
            supervisor: Mutex::new(supervisor),
            state: RwLock::new(CoordinatorState::new(now)),
            last_safety: RwLock::new(Default::default()),
            metrics: RwLock::new(PerformanceMetrics::default()),
            degraded: RwLock::new(DegradedSubsystems::default()),
            charging_session: Mutex::new(None),
            selling_session: Mutex::new(None),
            selling_budget: Mutex::new(SessionBudget::default()),
            last_executed_charge_at: Mutex::new(None),
            last_health_check: Mutex::new(None),
            started_at: now,
            cfg,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn collector(&self) -> Arc<DataCollector> {
        Arc::clone(&self.collector)
    }

    /// Connect the inverter and take the first snapshot. Fails when the
    /// inverter stays unreachable (exit code 3 at the CLI) or the site boots
    /// inside a fatal safety state (exit code 2).
    pub async fn initialize(&self) -> Result<(), BootError> {
        let info = self.inverter.connect(&self.cfg.inverter).await?;
        info!(model = %info.model, serial = %info.serial, "coordinator initializing");

        let snapshot = self
            .collector
            .collect_once(Utc::now())
            .await
            .context("initial data collection failed")?;

        let assessment = self.supervisor.lock().await.assess(&snapshot);
        if !assessment.is_safe() {
            return Err(BootError::UnsafeAtBoot(assessment.fatal.join("; ")));
        }

        // Depth-of-discharge limit from the configured SoC floor.
        let dod = (100.0 - self.cfg.battery_management.soc_thresholds.min).clamp(0.0, 100.0);
        if let Err(e) = self.inverter.set_battery_dod(dod as u8).await {
            warn!(error=%e, "setting battery DoD failed, vendor default stays");
        }
        *self.last_safety.write().await = assessment;

        let now = Utc::now();
        let mut state = self.state.write().await;
        state.transition(CoordinatorPhase::Monitoring, now);
        state.last_tick = now;
        Ok(())
    }

    /// Main control loop; returns after graceful shutdown.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let sampling = Arc::clone(&self.collector);
        let sampling_cancel = self.cancel.clone();
        let sampling_interval = self.cfg.coordinator.sampling_interval_seconds;
        tokio::spawn(async move {
            sampling.run_sampling(sampling_interval, sampling_cancel).await;
        });

        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            self.cfg.coordinator.sampling_interval_seconds.max(1),
        ));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.shutdown().await;
                    return Ok(());
                }
                _ = interval.tick() => {
                    let now = Utc::now();
                    if let Err(e) = self.tick(now).await {
                        warn!(error=%e, "coordinator tick failed");
                    }
                }
            }
        }
    }

    async fn tick(&self, now: DateTime<Utc>) -> Result<()> {
        let Some(snapshot) = self.collector.latest().await else {
            debug!("no snapshot yet, skipping tick");
            return Ok(());
        };

        // Stale data guard: never act on a snapshot older than one sampling
        // period (plus slack for slow polls).
        let max_age = chrono::Duration::seconds(
            (self.cfg.coordinator.sampling_interval_seconds * 2) as i64,
        );
        let stale = now - snapshot.timestamp > max_age;

        // Safety runs on every tick, before anything is commanded.
        let assessment = self.supervisor.lock().await.assess(&snapshot);
        let in_error = self.supervisor.lock().await.in_error();
        if !assessment.is_safe() {
            self.handle_emergency(now, &snapshot, &assessment).await;
            *self.last_safety.write().await = assessment;
            self.update_state(now, CoordinatorPhase::Error).await;
            return Ok(());
        }
        *self.last_safety.write().await = assessment;

        if in_error {
            // Still recovering; keep monitoring only.
            self.update_state(now, CoordinatorPhase::Error).await;
            return Ok(());
        }
        {
            let state = self.state.read().await;
            if state.phase == CoordinatorPhase::Error {
                drop(state);
                info!("safety recovered, resuming monitoring");
                self.update_state(now, CoordinatorPhase::Monitoring).await;
            }
        }

        if stale {
            warn!(age_s = (now - snapshot.timestamp).num_seconds(), "snapshot stale, skipping decision");
            self.touch_tick(now).await;
            return Ok(());
        }

        if self.decision_due(now).await {
            let market = self.refresh_market_data(now).await;
            let decision = self.decision_tick(now, &snapshot, &market).await?;
            debug!(action = %decision.action, reason = %decision.reason, "decision made");
        }

        self.health_check_if_due(now).await;
        self.touch_tick(now).await;
        self.persist_state().await;
        Ok(())
    }

    async fn health_check_if_due(&self, now: DateTime<Utc>) {
        let interval =
            chrono::Duration::minutes(self.cfg.coordinator.health_check_interval_minutes as i64);
        {
            let mut last = self.last_health_check.lock().await;
            match *last {
                Some(at) if now - at < interval => return,
                _ => *last = Some(now),
            }
        }

        let storage_ok = self.storage.health_check().await;
        if !storage_ok {
            warn!("persistence degraded, continuing with in-memory state");
        }
        self.degraded.write().await.storage = !storage_ok;

        if !self.inverter.is_connected().await {
            warn!("inverter session lost, attempting reconnect");
            if let Err(e) = self.inverter.connect(&self.cfg.inverter).await {
                error!(error=%e, "inverter reconnect failed");
            }
        }
    }

    async fn decision_due(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.read().await;
        match state.last_decision_at {
            None => true,
            Some(last) => {
                now - last
                    >= chrono::Duration::minutes(
                        self.cfg.coordinator.decision_interval_minutes as i64,
                    )
            }
        }
    }

    /// Fetch prices, labels and forecasts, tolerating individual failures.
    pub async fn refresh_market_data(&self, now: DateTime<Utc>) -> MarketData {
        let deadline =
            std::time::Duration::from_secs(self.cfg.coordinator.sampling_interval_seconds.max(10));
        let mut degraded = DegradedSubsystems::default();

        let labels = match &self.peak_source {
            Some(source) => {
                match tokio::time::timeout(deadline, source.hourly_labels()).await {
                    Ok(Ok(labels)) => labels,
                    Ok(Err(e)) => {
                        warn!(error=%e, "peak-hours fetch failed");
                        degraded.peak_hours = true;
                        Vec::new()
                    }
                    Err(_) => {
                        warn!("peak-hours fetch timed out");
                        degraded.peak_hours = true;
                        Vec::new()
                    }
                }
            }
            None => Vec::new(),
        };

        let raw_prices: Vec<MarketPricePoint> = match &self.price_source {
            Some(source) => match tokio::time::timeout(deadline, source.day_ahead_prices()).await {
                Ok(Ok(points)) => points,
                Ok(Err(e)) => {
                    warn!(error=%e, "day-ahead price fetch failed");
                    degraded.market_prices = true;
                    Vec::new()
                }
                Err(_) => {
                    warn!("day-ahead price fetch timed out");
                    degraded.market_prices = true;
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        let price_points = self.attach_final_prices(&raw_prices, &labels);
        if !price_points.is_empty() {
            if let Err(e) = self.storage.save_market_prices(&price_points).await {
                warn!(error=%e, "market price persistence failed");
            }
        }

        let pv_forecast = match &self.pv_source {
            Some(source) => match tokio::time::timeout(deadline, source.forecast()).await {
                Ok(Ok(points)) => {
                    if let Err(e) = self.storage.save_pv_forecast(&points).await {
                        warn!(error=%e, "pv forecast persistence failed");
                    }
                    Some(points)
                }
                Ok(Err(e)) => {
                    warn!(error=%e, "pv forecast fetch failed");
                    degraded.pv_forecast = true;
                    None
                }
                Err(_) => {
                    degraded.pv_forecast = true;
                    None
                }
            },
            None => None,
        };

        if let Some(source) = &self.weather_source {
            match tokio::time::timeout(deadline, source.forecast()).await {
                Ok(Ok(weather)) => {
                    if let Err(e) = self.storage.save_weather(now, &weather.raw).await {
                        warn!(error=%e, "weather persistence failed");
                    }
                }
                Ok(Err(e)) => {
                    warn!(error=%e, "weather fetch failed");
                    degraded.weather = true;
                }
                Err(_) => degraded.weather = true,
            }
        }

        let forecast_confidence = match &pv_forecast {
            Some(points) if !points.is_empty() => {
                points.iter().map(|p| p.confidence).sum::<f64>() / points.len() as f64
            }
            _ => 0.5,
        };

        degraded.storage = !self.storage.health_check().await;
        *self.degraded.write().await = degraded;

        MarketData {
            price_points,
            labels,
            pv_forecast,
            forecast_confidence,
        }
    }

    /// Single source of truth for retail prices: market points + tariff +
    /// per-hour peak labels.
    pub fn attach_final_prices(
        &self,
        raw: &[MarketPricePoint],
        labels: &[PeakLabelPoint],
    ) -> Vec<PricePoint> {
        raw.iter()
            .map(|point| {
                let label = label_at(labels, point.time_start);
                PricePoint {
                    time_start: point.time_start,
                    market_price_pln_mwh: point.price_pln_mwh,
                    final_price_pln_kwh: self.tariff.final_price_pln_kwh(
                        point.time_start,
                        point.price_pln_mwh,
                        label,
                    ),
                }
            })
            .collect()
    }

    /// One decision pass: charging engine, then the selling engine, with
    /// selling taking precedence only when safety allows and the charging
    /// decision is not critical.
    pub async fn decision_tick(
        &self,
        now: DateTime<Utc>,
        snapshot: &Snapshot,
        market: &MarketData,
    ) -> Result<Decision> {
        self.supervise_sessions(now, snapshot, market).await;

        let windows = self.analyzer.charging_windows(&market.price_points);
        let current_window = windows.iter().find(|w| w.contains(now));
        let peak_label = label_at(&market.labels, now);
        let cooldown_active = self.state.read().await.cooldown_active(now);
        let safety_ok = !self.supervisor.lock().await.in_error();
        let consumption_forecast_kw = self
            .collector
            .average_daily_consumption_kwh(7)
            .await
            .map(|kwh| kwh / 24.0);

        let inputs = DecisionInputs {
            now,
            snapshot,
            price_points: &market.price_points,
            current_window,
            pv_forecast: market.pv_forecast.as_deref(),
            consumption_forecast_kw,
            peak_label,
            cooldown_active,
            safety_ok,
        };
        let mut decision = self.engine.decide(&inputs);
        decision.safety_warnings = self.last_safety.read().await.warnings.clone();
        if !decision.safety_warnings.is_empty()
            && decision.priority < DecisionPriority::High
            && decision.action != ChargingAction::Wait
        {
            decision.priority = DecisionPriority::High;
        }

        // Selling pass. Only evaluated when the charging decision leaves
        // room for it.
        let selling_decision = if self.selling.enabled()
            && safety_ok
            && decision.priority < DecisionPriority::Critical
        {
            let budget = *self.selling_budget.lock().await;
            let current_price = inputs.current_final_price();
            Some(self.selling.evaluate(
                now,
                snapshot,
                current_price,
                &market.price_points,
                market.forecast_confidence,
                &budget,
            ))
        } else {
            None
        };

        if let Some(selling) = &selling_decision {
            self.persist_selling_decision(selling).await;
        }

        let sell_now = selling_decision
            .as_ref()
            .is_some_and(|s| s.action == SellingAction::SellNow);
        if sell_now {
            let selling = selling_decision.as_ref().unwrap();
            self.execute_selling(now, selling).await;
        } else {
            if let Some(selling) = &selling_decision {
                self.track_selling_wait(now, snapshot, selling).await;
            }
            self.execute_charging(now, snapshot, &decision).await;
        }

        if let Err(e) = self
            .storage
            .save_decision(&decision, DecisionKind::Charging)
            .await
        {
            warn!(error=%e, "decision persistence failed");
        }

        {
            let mut state = self.state.write().await;
            state.last_decision_at = Some(now);

            // A wait right after a charge arms the anti-chatter cooldown;
            // critical priorities bypass it at decision time.
            if decision.action == ChargingAction::Wait {
                let last_charge = *self.last_executed_charge_at.lock().await;
                if last_charge.is_some() {
                    state.wait_cooldown_until = Some(
                        now + chrono::Duration::minutes(self.cfg.coordinator.wait_cooldown_minutes),
                    );
                }
            }
        }
        self.metrics.write().await.decision_count += 1;

        Ok(decision)
    }

    async fn execute_charging(&self, now: DateTime<Utc>, snapshot: &Snapshot, decision: &Decision) {
        match decision.action {
            ChargingAction::ChargeGrid | ChargingAction::ChargeHybrid => {
                let rate_w = self.cfg.battery_management.charge_rate_kw * 1000.0;
                let power_pct =
                    ((decision.power_w / rate_w) * 100.0).clamp(10.0, 100.0) as u8;
                let target_soc = decision.target_soc_percent.clamp(0.0, 100.0) as u8;
                match self.inverter.start_charging(power_pct, target_soc).await {
                    Ok(()) => {
                        info!(power_pct, target_soc, action = %decision.action, "charging command issued");
                        self.open_charging_session(now, decision).await;
                        *self.last_executed_charge_at.lock().await = Some(now);
                        self.update_state(now, CoordinatorPhase::Charging).await;
                    }
                    Err(e) => error!(error=%e, "start charging failed"),
                }
            }
            ChargingAction::ChargePv => {
                // A running grid charge would fight the PV surplus.
                if snapshot.battery.charging {
                    if let Err(e) = self.inverter.stop_charging().await {
                        error!(error=%e, "stop grid charging before PV charge failed");
                    }
                }
                match self
                    .inverter
                    .set_operation_mode(
                        OperationMode::EcoCharge,
                        Some(decision.power_w.max(0.0) as u32),
                        Some(decision.target_soc_percent as u8),
                    )
                    .await
                {
                    Ok(()) => {
                        info!("PV charging mode set");
                        self.open_charging_session(now, decision).await;
                        *self.last_executed_charge_at.lock().await = Some(now);
                        self.update_state(now, CoordinatorPhase::Charging).await;
                    }
                    Err(e) => error!(error=%e, "set PV charge mode failed"),
                }
            }
            ChargingAction::Stop => {
                // A fresh session is only interruptible by safety events.
                let session_age = self
                    .charging_session
                    .lock()
                    .await
                    .as_ref()
                    .filter(|s| s.is_active())
                    .map(|s| now - s.started_at);
                if decision.priority < DecisionPriority::Critical
                    && session_age
                        .is_some_and(|age| age < chrono::Duration::minutes(MIN_SESSION_MINUTES))
                {
                    debug!("stop suppressed inside minimum session duration");
                    return;
                }
                if let Err(e) = self.inverter.stop_charging().await {
                    error!(error=%e, "stop charging failed");
                }
                self.close_charging_session(now, None).await;
                self.update_state(now, CoordinatorPhase::Monitoring).await;
            }
            ChargingAction::Discharge => {
                match self
                    .inverter
                    .set_operation_mode(
                        OperationMode::EcoDischarge,
                        Some(decision.power_w.max(0.0) as u32),
                        Some(decision.target_soc_percent as u8),
                    )
                    .await
                {
                    Ok(()) => {
                        info!(power_w = decision.power_w, "discharge mode set");
                        self.update_state(now, CoordinatorPhase::Optimizing).await;
                    }
                    Err(e) => error!(error=%e, "set discharge mode failed"),
                }
            }
            ChargingAction::Wait => {
                self.update_state(now, CoordinatorPhase::Monitoring).await;
            }
        }
    }

    async fn execute_selling(&self, now: DateTime<Utc>, selling: &SellingDecision) {
        let mut session_guard = self.selling_session.lock().await;
        if session_guard.as_ref().is_some_and(|s| s.is_active()) {
            debug!("selling session already active");
            return;
        }

        let power_w = self.cfg.battery_management.charge_rate_kw * 1000.0;
        let floor = selling.min_soc_floor_percent.clamp(0.0, 100.0) as u8;
        // Lift the export cap to the grid envelope for the session.
        let export_cap = self.cfg.coordinator.emergency_stop_conditions.grid_power_max_w;
        if let Err(e) = self.inverter.set_export_limit(export_cap as u32).await {
            warn!(error=%e, "raising export limit failed");
        }
        match self
            .inverter
            .set_operation_mode(OperationMode::EcoDischarge, Some(power_w as u32), Some(floor))
            .await
        {
            Ok(()) => {
                let mut session = Session::begin(
                    SessionKind::Selling,
                    now,
                    selling.available_energy_kwh,
                    0.0,
                );
                session.planned_cost_pln = -selling.expected_revenue_pln;
                if let Err(e) = self.storage.save_session(&session).await {
                    warn!(error=%e, "selling session persistence failed");
                }
                *session_guard = Some(session);

                let mut budget = self.selling_budget.lock().await;
                budget.sessions_today += 1;
                budget.waiting_since = None;
                budget.expected_peak_price = None;

                let mut metrics = self.metrics.write().await;
                metrics.selling_sessions += 1;
                metrics.energy_sold_kwh += selling.available_energy_kwh;

                info!(
                    energy_kwh = selling.available_energy_kwh,
                    price = selling.expected_price_pln_kwh,
                    "selling session started"
                );
                self.update_state(now, CoordinatorPhase::Selling).await;
            }
            Err(e) => error!(error=%e, "start selling failed"),
        }
    }

    /// Track a wait-for-peak recommendation and cancel it when conditions
    /// turn against waiting.
    async fn track_selling_wait(
        &self,
        now: DateTime<Utc>,
        snapshot: &Snapshot,
        selling: &SellingDecision,
    ) {
        let mut budget = self.selling_budget.lock().await;
        match selling.action {
            SellingAction::WaitForPeak | SellingAction::WaitForHigher => {
                if budget.waiting_since.is_none() {
                    budget.waiting_since = Some(now);
                    budget.expected_peak_price = selling
                        .timing
                        .as_ref()
                        .and_then(|t| t.peak_info.as_ref())
                        .map(|p| p.peak_price_pln_kwh);
                }
                let budget_copy = *budget;
                drop(budget);
                if let Some(reason) = self.selling.should_cancel_waiting(
                    now,
                    snapshot,
                    selling.expected_price_pln_kwh,
                    &budget_copy,
                ) {
                    warn!(%reason, "cancelling selling wait");
                    let mut budget = self.selling_budget.lock().await;
                    budget.waiting_since = None;
                    budget.expected_peak_price = None;
                }
            }
            _ => {
                budget.waiting_since = None;
                budget.expected_peak_price = None;
            }
        }
    }

    /// Close sessions whose goal has been reached: a charging session once
    /// the inverter stopped on its own (target SoC hit), a selling session
    /// once the SoC floor or the minimum selling price is crossed.
    async fn supervise_sessions(&self, now: DateTime<Utc>, snapshot: &Snapshot, market: &MarketData) {
        {
            let mut guard = self.charging_session.lock().await;
            if let Some(session) = guard.as_mut() {
                let started_recently = (now - session.started_at) < chrono::Duration::minutes(1);
                if session.is_active() && !snapshot.battery.charging && !started_recently {
                    session.delivered_energy_kwh = session.planned_energy_kwh;
                    session.realized_cost_pln = session.planned_cost_pln;
                    session.complete(now);
                    if let Err(e) = self.storage.save_session(session).await {
                        warn!(error=%e, "charging session completion persistence failed");
                    }
                    info!(session = %session.id, "charging session completed");
                }
            }
        }

        let mut guard = self.selling_session.lock().await;
        if let Some(session) = guard.as_mut() {
            if session.is_active() {
                let soc = snapshot.battery.soc_percent.unwrap_or(0.0);
                let current_price = {
                    // Same interval lookup the engines use.
                    let inputs = DecisionInputs {
                        now,
                        snapshot,
                        price_points: &market.price_points,
                        current_window: None,
                        pv_forecast: None,
                        consumption_forecast_kw: None,
                        peak_label: None,
                        cooldown_active: false,
                        safety_ok: true,
                    };
                    inputs.current_final_price()
                };
                let floor_hit = soc
                    <= self
                        .cfg
                        .battery_selling
                        .dynamic_soc_thresholds
                        .absolute_floor_soc;
                let price_gone = current_price
                    .is_some_and(|p| p < self.cfg.battery_selling.min_selling_price_pln);
                if floor_hit || price_gone {
                    session.complete(now);
                    if let Err(e) = self.storage.save_session(session).await {
                        warn!(error=%e, "selling session completion persistence failed");
                    }
                    self.selling_budget.lock().await.last_session_end = Some(now);
                    if let Err(e) = self
                        .inverter
                        .set_operation_mode(OperationMode::General, None, None)
                        .await
                    {
                        error!(error=%e, "restoring general mode after selling failed");
                    }
                    info!(session = %session.id, floor_hit, "selling session completed");
                }
            }
        }
    }

    async fn open_charging_session(&self, now: DateTime<Utc>, decision: &Decision) {
        let mut guard = self.charging_session.lock().await;
        if guard.as_ref().is_some_and(|s| s.is_active()) {
            return;
        }
        let session = Session::begin(
            SessionKind::Charging,
            now,
            decision.energy_kwh,
            decision.estimated_cost_pln,
        );
        if let Err(e) = self.storage.save_session(&session).await {
            warn!(error=%e, "charging session persistence failed");
        }
        if let Err(e) = self
            .storage
            .save_charging_plan(now.date_naive(), std::slice::from_ref(&session))
            .await
        {
            warn!(error=%e, "charging plan persistence failed");
        }
        let mut metrics = self.metrics.write().await;
        metrics.charging_sessions += 1;
        metrics.energy_charged_kwh += decision.energy_kwh;
        *guard = Some(session);
    }

    async fn close_charging_session(&self, now: DateTime<Utc>, abort_reason: Option<&str>) {
        let mut guard = self.charging_session.lock().await;
        if let Some(session) = guard.as_mut() {
            if session.is_active() {
                match abort_reason {
                    Some(reason) => session.abort(now, reason),
                    None => session.complete(now),
                }
                if let Err(e) = self.storage.save_session(session).await {
                    warn!(error=%e, "session close persistence failed");
                }
            }
        }
    }

    async fn handle_emergency(
        &self,
        now: DateTime<Utc>,
        snapshot: &Snapshot,
        assessment: &crate::safety::SafetyAssessment,
    ) {
        let incident = self
            .supervisor
            .lock()
            .await
            .incident_record(snapshot, assessment);
        error!(%incident, "emergency stop");

        if let Err(e) = self.inverter.emergency_stop().await {
            error!(error=%e, "emergency stop command failed");
        }
        self.close_charging_session(now, Some("emergency stop")).await;
        {
            let mut guard = self.selling_session.lock().await;
            if let Some(session) = guard.as_mut() {
                if session.is_active() {
                    session.abort(now, "emergency stop");
                    if let Err(e) = self.storage.save_session(session).await {
                        warn!(error=%e, "selling session abort persistence failed");
                    }
                }
            }
        }

        let mut decision = Decision::wait(now, incident);
        decision.action = ChargingAction::Stop;
        decision.priority = DecisionPriority::Critical;
        decision.confidence = 1.0;
        if let Err(e) = self
            .storage
            .save_decision(&decision, DecisionKind::Charging)
            .await
        {
            warn!(error=%e, "incident persistence failed");
        }
        self.metrics.write().await.emergency_stops += 1;
    }

    async fn persist_selling_decision(&self, selling: &SellingDecision) {
        let mut record = Decision::wait(selling.timestamp, selling.reason.clone());
        record.action = match selling.action {
            SellingAction::SellNow => ChargingAction::Discharge,
            _ => ChargingAction::Wait,
        };
        record.energy_kwh = selling.available_energy_kwh;
        record.duration_hours = if selling.action == SellingAction::SellNow {
            let rate = self.cfg.battery_management.charge_rate_kw.max(0.1);
            selling.available_energy_kwh / rate
        } else {
            0.0
        };
        record.power_w = self.cfg.battery_management.charge_rate_kw * 1000.0;
        record.target_soc_percent = selling.min_soc_floor_percent;
        record.estimated_savings_pln = selling.expected_revenue_pln;
        record.confidence = selling.confidence;
        if let Err(e) = self
            .storage
            .save_decision(&record, DecisionKind::Selling)
            .await
        {
            warn!(error=%e, "selling decision persistence failed");
        }
    }

    async fn update_state(&self, now: DateTime<Utc>, phase: CoordinatorPhase) {
        self.state.write().await.transition(phase, now);
    }

    async fn touch_tick(&self, now: DateTime<Utc>) {
        let mut state = self.state.write().await;
        state.last_tick = now;
        // Reset the daily selling budget at local midnight rollover.
        drop(state);
        let mut budget = self.selling_budget.lock().await;
        if let Some(last_end) = budget.last_session_end {
            if last_end.date_naive() != now.date_naive() {
                budget.sessions_today = 0;
            }
        }
    }

    async fn persist_state(&self) {
        let state = self.state.read().await.clone();
        if let Err(e) = self.storage.save_state(&state).await {
            debug!(error=%e, "state persistence failed");
        }
    }

    /// Status payload for the external dashboard.
    pub async fn status(&self) -> StatusPayload {
        let state = self.state.read().await.clone();
        let snapshot = self.collector.latest().await;
        let compliance = self
            .supervisor
            .lock()
            .await
            .compliance_report(snapshot.as_ref());
        StatusPayload {
            state: state.phase,
            running: !self.cancel.is_cancelled(),
            uptime_s: (Utc::now() - self.started_at).num_seconds(),
            last_decision_iso: state.last_decision_at.map(|t| t.to_rfc3339()),
            decision_count: self.metrics.read().await.decision_count,
            current_snapshot: snapshot,
            safety_status: self.last_safety.read().await.clone(),
            compliance_report: compliance,
            degraded: *self.degraded.read().await,
            metrics: self.metrics.read().await.clone(),
        }
    }

    /// Graceful shutdown: stop active sessions, flush persistence, save the
    /// final state.
    async fn shutdown(&self) {
        info!("coordinator shutting down");
        let now = Utc::now();

        let charging_active = self
            .charging_session
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| s.is_active());
        if charging_active {
            if let Err(e) = self.inverter.stop_charging().await {
                error!(error=%e, "stop charging on shutdown failed");
            }
            self.close_charging_session(now, Some("shutdown")).await;
        }

        self.collector.flush().await;
        self.persist_state().await;
        if let Err(e) = self.inverter.disconnect().await {
            warn!(error=%e, "inverter disconnect failed");
        }
        info!("shutdown complete");
    }
}
