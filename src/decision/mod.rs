pub mod hybrid;
pub mod legacy;
pub mod night;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::config::{
    AggressiveChargingConfig, AppConfig, DecisionEngineMode, PvConsumptionConfig, SocThresholds,
};
use crate::domain::{
    ChargingAction, Decision, DecisionPriority, PeakLabel, PricePoint, PriceWindow,
    PvForecastPoint, Snapshot,
};
use crate::pricing::windows::current_percentile;
use crate::pricing::PriceAnalyzer;

/// Engine knobs distilled from the application config.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub mode: DecisionEngineMode,
    pub soc: SocThresholds,
    pub capacity_kwh: f64,
    pub charge_rate_kw: f64,
    pub pv: PvConsumptionConfig,
    pub aggressive: AggressiveChargingConfig,
    pub selling_enabled: bool,
    pub min_selling_soc: f64,
    pub reference_price_pln_mwh: f64,
    pub analyzer: PriceAnalyzer,
}

impl EngineSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            mode: cfg.coordinator.decision_engine,
            soc: cfg.battery_management.soc_thresholds.clone(),
            capacity_kwh: cfg.battery_management.capacity_kwh,
            charge_rate_kw: cfg.battery_management.charge_rate_kw,
            pv: cfg.pv_consumption_analysis.clone(),
            aggressive: cfg.coordinator.cheapest_price_aggressive_charging.clone(),
            selling_enabled: cfg.battery_selling.enabled,
            min_selling_soc: cfg.battery_selling.min_battery_soc,
            reference_price_pln_mwh: cfg.price_analysis.reference_price_pln_mwh,
            analyzer: PriceAnalyzer::new(cfg.price_analysis.clone()),
        }
    }
}

/// Everything one decision needs, captured at a single instant. `decide` is
/// a pure function of this struct: same inputs, same decision.
#[derive(Debug, Clone)]
pub struct DecisionInputs<'a> {
    pub now: DateTime<Utc>,
    pub snapshot: &'a Snapshot,
    /// Price horizon with final prices attached, sorted by time.
    pub price_points: &'a [PricePoint],
    /// Window containing `now`, if the horizon covers it.
    pub current_window: Option<&'a PriceWindow>,
    /// `None` means the PV forecast source failed this tick.
    pub pv_forecast: Option<&'a [PvForecastPoint]>,
    /// Expected average house load over the next hours, kW.
    pub consumption_forecast_kw: Option<f64>,
    pub peak_label: Option<PeakLabel>,
    pub cooldown_active: bool,
    pub safety_ok: bool,
}

impl<'a> DecisionInputs<'a> {
    pub fn soc(&self) -> Option<f64> {
        self.snapshot.battery.soc_percent
    }

    pub fn currently_charging(&self) -> bool {
        self.snapshot.battery.charging
    }

    /// The price point whose interval contains `now`.
    pub fn current_point(&self) -> Option<&'a PricePoint> {
        let interval = match self.price_points {
            [first, second, ..] => second.time_start - first.time_start,
            _ => Duration::minutes(15),
        };
        let interval = if interval > Duration::zero() {
            interval
        } else {
            Duration::minutes(15)
        };
        self.price_points
            .iter()
            .find(|p| p.time_start <= self.now && self.now < p.time_start + interval)
    }

    pub fn current_final_price(&self) -> Option<f64> {
        self.current_point().map(|p| p.final_price_pln_kwh)
    }

    pub fn current_market_price(&self) -> Option<f64> {
        self.current_point().map(|p| p.market_price_pln_mwh)
    }

    /// Rank of the current final price within the horizon, 1–100.
    pub fn current_price_percentile(&self) -> Option<u8> {
        let price = self.current_final_price()?;
        let prices: Vec<f64> = self
            .price_points
            .iter()
            .map(|p| p.final_price_pln_kwh)
            .collect();
        Some(current_percentile(&prices, price))
    }
}

/// Decision engine facade: runs the configured mode, then the gates every
/// mode must respect (safety, peak-hours policy, wait cooldown).
#[derive(Debug, Clone)]
pub struct DecisionEngine {
    settings: EngineSettings,
}

impl DecisionEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn decide(&self, inputs: &DecisionInputs<'_>) -> Decision {
        let scores = legacy::compute_scores(
            inputs.current_final_price(),
            inputs.soc(),
            inputs.snapshot.pv.power_w,
            inputs.snapshot.consumption.power_w,
            self.settings.pv.pv_overproduction_threshold_w,
        );

        // Safety gate: an unsafe site never starts anything.
        if !inputs.safety_ok {
            let action = if inputs.currently_charging() {
                ChargingAction::Stop
            } else {
                ChargingAction::Wait
            };
            let mut decision = Decision::wait(inputs.now, "Safety envelope violated, holding");
            decision.action = action;
            decision.priority = DecisionPriority::High;
            decision.confidence = 1.0;
            decision.scores = scores;
            return decision;
        }

        let decision = match self.settings.mode {
            DecisionEngineMode::TimingAware => hybrid::decide(&self.settings, inputs, scores),
            DecisionEngineMode::Legacy => self.decide_legacy(inputs, scores),
        };

        let decision = self.apply_peak_policy(decision, inputs);
        self.apply_cooldown(decision, inputs)
    }

    fn decide_legacy(
        &self,
        inputs: &DecisionInputs<'_>,
        scores: crate::domain::ScoreBreakdown,
    ) -> Decision {
        let action = legacy::determine_action(
            &scores,
            inputs.soc(),
            inputs.snapshot.pv.power_w,
            inputs.snapshot.consumption.power_w,
            self.settings.pv.pv_overproduction_threshold_w,
            self.settings.soc.critical,
            inputs.currently_charging(),
        );
        let confidence = legacy::confidence(&scores);
        let reason = legacy::reasoning(&scores, action);

        let mut decision = match action {
            ChargingAction::ChargeGrid => {
                let critical = inputs
                    .soc()
                    .is_some_and(|soc| soc <= self.settings.soc.critical);
                let target = if critical { 100.0 } else { 80.0 };
                let mut d = hybrid::sized_charge(
                    &self.settings,
                    inputs,
                    ChargingAction::ChargeGrid,
                    target,
                    self.settings.charge_rate_kw,
                    0.95,
                    reason,
                );
                d.priority = if critical {
                    DecisionPriority::Critical
                } else {
                    DecisionPriority::Medium
                };
                d
            }
            ChargingAction::Stop => {
                let mut d = Decision::wait(inputs.now, reason);
                d.action = ChargingAction::Stop;
                d.priority = DecisionPriority::Medium;
                d
            }
            _ => Decision::wait(inputs.now, reason),
        };
        decision.confidence = if decision.priority == DecisionPriority::Critical {
            decision.confidence.max(0.95)
        } else {
            confidence
        };
        decision.scores = scores;
        decision
    }

    /// Kompas policy: required reduction is a hard regulatory block on any
    /// grid-drawing charge, whatever its priority; recommended saving defers
    /// non-critical charge starts. PV-only charging stays allowed.
    fn apply_peak_policy(&self, decision: Decision, inputs: &DecisionInputs<'_>) -> Decision {
        match inputs.peak_label {
            Some(PeakLabel::RequiredReduction) if decision.action.draws_from_grid() => {
                debug!(blocked = %decision.action, "peak-hours hard block");
                let mut wait = Decision::wait(
                    inputs.now,
                    format!(
                        "Peak hours: required reduction in force, grid charging blocked (was: {})",
                        decision.reason
                    ),
                );
                wait.priority = DecisionPriority::High;
                wait.confidence = 0.95;
                wait.scores = decision.scores;
                wait
            }
            Some(PeakLabel::RecommendedSaving)
                if decision.action.starts_charge()
                    && decision.priority < DecisionPriority::Critical =>
            {
                let mut wait = Decision::wait(
                    inputs.now,
                    format!(
                        "Peak hours: recommended saving, deferring charge start (was: {})",
                        decision.reason
                    ),
                );
                wait.confidence = 0.85;
                wait.scores = decision.scores;
                wait
            }
            _ => decision,
        }
    }

    /// Anti-chatter: a recent wait suppresses non-critical charge starts.
    fn apply_cooldown(&self, decision: Decision, inputs: &DecisionInputs<'_>) -> Decision {
        if inputs.cooldown_active
            && decision.action.starts_charge()
            && decision.priority < DecisionPriority::Critical
        {
            let mut wait = Decision::wait(
                inputs.now,
                format!("Wait cooldown active, suppressing: {}", decision.reason),
            );
            wait.confidence = decision.confidence;
            wait.scores = decision.scores;
            return wait;
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PriceAnalysisConfig;
    use crate::domain::{
        BatterySample, ConsumptionSample, GridSample, InverterInfo, PvSample,
    };
    use chrono::TimeZone;

    pub(crate) fn settings() -> EngineSettings {
        EngineSettings {
            mode: DecisionEngineMode::TimingAware,
            soc: SocThresholds::default(),
            capacity_kwh: 20.0,
            charge_rate_kw: 5.0,
            pv: PvConsumptionConfig::default(),
            aggressive: AggressiveChargingConfig::default(),
            selling_enabled: false,
            min_selling_soc: 80.0,
            reference_price_pln_mwh: 400.0,
            analyzer: PriceAnalyzer::new(PriceAnalysisConfig::default()),
        }
    }

    pub(crate) fn snapshot(
        soc: f64,
        pv_w: f64,
        consumption_w: f64,
        charging: bool,
    ) -> Snapshot {
        Snapshot {
            timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap(),
            battery: BatterySample {
                soc_percent: Some(soc),
                voltage_v: Some(400.0),
                current_a: Some(0.0),
                power_w: Some(0.0),
                temperature_c: Some(25.0),
                charging,
            },
            pv: PvSample {
                power_w: Some(pv_w),
                string_power_w: vec![],
                daily_energy_wh: None,
            },
            grid: GridSample::default(),
            consumption: ConsumptionSample {
                power_w: Some(consumption_w),
                daily_energy_wh: None,
            },
            inverter: InverterInfo::default(),
        }
    }

    pub(crate) fn flat_prices(market: f64, now: DateTime<Utc>, hours: i64) -> Vec<PricePoint> {
        (0..hours * 4)
            .map(|i| PricePoint {
                time_start: now + Duration::minutes(15 * i),
                market_price_pln_mwh: market,
                final_price_pln_kwh: market / 1000.0 + 0.0892,
            })
            .collect()
    }

    fn inputs<'a>(
        now: DateTime<Utc>,
        snapshot: &'a Snapshot,
        points: &'a [PricePoint],
        window: Option<&'a PriceWindow>,
    ) -> DecisionInputs<'a> {
        DecisionInputs {
            now,
            snapshot,
            price_points: points,
            current_window: window,
            pv_forecast: None,
            consumption_forecast_kw: None,
            peak_label: None,
            cooldown_active: false,
            safety_ok: true,
        }
    }

    #[test]
    fn emergency_soc_charges_despite_very_expensive_price() {
        let engine = DecisionEngine::new(settings());
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let snap = snapshot(4.0, 0.0, 800.0, false);
        let points = flat_prices(1110.8, now, 6); // 1.20 PLN/kWh final
        let inputs = inputs(now, &snap, &points, None);

        let decision = engine.decide(&inputs);
        assert_eq!(decision.action, ChargingAction::ChargeGrid);
        assert_eq!(decision.priority, DecisionPriority::Critical);
        assert!(decision.confidence >= 0.95);
        assert!(decision.reason.to_lowercase().contains("emergency battery"));
        assert!(decision.is_well_formed());
    }

    #[test]
    fn required_reduction_vetoes_in_window_charge() {
        let engine = DecisionEngine::new(settings());
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let snap = snapshot(45.0, 0.0, 800.0, false);
        let points = flat_prices(200.0, now, 6); // low band
        let windows = engine.settings().analyzer.charging_windows(&points);
        let window = windows.first();
        assert!(window.is_some(), "low flat prices must form a window");

        let mut input = inputs(now, &snap, &points, window);
        input.peak_label = Some(PeakLabel::RequiredReduction);
        let decision = engine.decide(&input);
        assert_eq!(decision.action, ChargingAction::Wait);
        assert!(decision.reason.to_lowercase().contains("required reduction"));
    }

    #[test]
    fn required_reduction_does_not_block_pv_charging() {
        let engine = DecisionEngine::new(settings());
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let snap = snapshot(55.0, 4000.0, 1500.0, false);
        let points = flat_prices(400.0, now, 6);
        let mut input = inputs(now, &snap, &points, None);
        input.peak_label = Some(PeakLabel::RequiredReduction);

        let decision = engine.decide(&input);
        assert_eq!(decision.action, ChargingAction::ChargePv);
    }

    #[test]
    fn pv_overproduction_prefers_pv_charge() {
        let engine = DecisionEngine::new(settings());
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let snap = snapshot(55.0, 4000.0, 1500.0, false);
        let points = flat_prices(400.0, now, 6);
        let decision = engine.decide(&inputs(now, &snap, &points, None));

        assert_eq!(decision.action, ChargingAction::ChargePv);
        assert_ne!(decision.action, ChargingAction::ChargeGrid);
        assert!(decision.is_well_formed());
    }

    #[test]
    fn cooldown_suppresses_non_critical_starts() {
        let engine = DecisionEngine::new(settings());
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let snap = snapshot(45.0, 0.0, 800.0, false);
        let points = flat_prices(200.0, now, 6);
        let windows = engine.settings().analyzer.charging_windows(&points);
        let mut input = inputs(now, &snap, &points, windows.first());
        input.cooldown_active = true;

        let decision = engine.decide(&input);
        assert_eq!(decision.action, ChargingAction::Wait);
        assert!(decision.reason.contains("cooldown"));
    }

    #[test]
    fn cooldown_does_not_block_emergency() {
        let engine = DecisionEngine::new(settings());
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let snap = snapshot(4.0, 0.0, 800.0, false);
        let points = flat_prices(200.0, now, 6);
        let mut input = inputs(now, &snap, &points, None);
        input.cooldown_active = true;

        let decision = engine.decide(&input);
        assert_eq!(decision.action, ChargingAction::ChargeGrid);
        assert_eq!(decision.priority, DecisionPriority::Critical);
    }

    #[test]
    fn unsafe_site_yields_stop_or_wait() {
        let engine = DecisionEngine::new(settings());
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let points = flat_prices(100.0, now, 6);

        let idle = snapshot(15.0, 0.0, 800.0, false);
        let mut input = inputs(now, &idle, &points, None);
        input.safety_ok = false;
        assert_eq!(engine.decide(&input).action, ChargingAction::Wait);

        let charging = snapshot(15.0, 0.0, 800.0, true);
        let mut input = inputs(now, &charging, &points, None);
        input.safety_ok = false;
        assert_eq!(engine.decide(&input).action, ChargingAction::Stop);
    }

    #[test]
    fn decide_is_deterministic() {
        let engine = DecisionEngine::new(settings());
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let snap = snapshot(45.0, 1200.0, 900.0, false);
        let points = flat_prices(300.0, now, 6);
        let input = inputs(now, &snap, &points, None);

        let a = engine.decide(&input);
        let b = engine.decide(&input);
        assert_eq!(a.action, b.action);
        assert_eq!(a.reason, b.reason);
        assert_eq!(a.scores, b.scores);
        assert_eq!(a.confidence, b.confidence);
    }

    #[test]
    fn in_window_charge_uses_grid_without_pv_forecast() {
        let engine = DecisionEngine::new(settings());
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 1, 0, 0).unwrap();
        let snap = snapshot(45.0, 0.0, 800.0, false);
        let points = flat_prices(100.0, now, 6); // very low band
        let windows = engine.settings().analyzer.charging_windows(&points);
        let decision = engine.decide(&inputs(now, &snap, &points, windows.first()));

        assert_eq!(decision.action, ChargingAction::ChargeGrid);
        assert!(decision.energy_kwh > 0.0);
        assert!(decision.duration_hours > 0.0);
    }

    #[test]
    fn night_preparation_is_refused_above_the_soc_threshold() {
        let engine = DecisionEngine::new(settings());
        // 02:00 Warsaw, cheap now, expensive block tomorrow, poor PV — but
        // the battery already holds 75%.
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let mut snap = snapshot(75.0, 0.0, 400.0, false);
        snap.timestamp = now;
        let points: Vec<PricePoint> = (0..36 * 4)
            .map(|i| {
                let hour = i / 4;
                let market = if (22..30).contains(&hour) { 950.0 } else { 160.0 };
                PricePoint {
                    time_start: now + Duration::minutes(15 * i),
                    market_price_pln_mwh: market,
                    final_price_pln_kwh: market / 1000.0 + 0.0892,
                }
            })
            .collect();
        let forecast: Vec<crate::domain::PvForecastPoint> = (0..36)
            .map(|h| crate::domain::PvForecastPoint {
                time_start: now + Duration::hours(h),
                forecasted_power_kw: 0.2,
                confidence: 0.8,
            })
            .collect();

        // No current window passed: the cheap night run is below the Low
        // band anyway, so only the night rule could start a grid charge.
        let mut input = inputs(now, &snap, &points, None);
        input.pv_forecast = Some(&forecast);
        let decision = engine.decide(&input);
        assert_ne!(decision.action, ChargingAction::ChargeGrid);
        assert_ne!(decision.priority, DecisionPriority::Critical);
    }

    #[test]
    fn strong_pv_forecast_in_window_prefers_hybrid_charge() {
        let engine = DecisionEngine::new(settings());
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let snap = snapshot(40.0, 200.0, 800.0, false);
        let points = flat_prices(200.0, now, 6);
        let windows = engine.settings().analyzer.charging_windows(&points);
        let forecast: Vec<crate::domain::PvForecastPoint> = (0..6)
            .map(|h| crate::domain::PvForecastPoint {
                time_start: now + Duration::hours(h),
                forecasted_power_kw: 3.0,
                confidence: 0.8,
            })
            .collect();

        let mut input = inputs(now, &snap, &points, windows.first());
        input.pv_forecast = Some(&forecast);
        let decision = engine.decide(&input);

        assert_eq!(decision.action, ChargingAction::ChargeHybrid);
        assert!(decision.reason.contains("hybrid"));
        assert!(decision.is_well_formed());
    }

    #[test]
    fn expected_house_load_shrinks_the_pv_share() {
        let engine = DecisionEngine::new(settings());
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let snap = snapshot(40.0, 200.0, 800.0, false);
        let points = flat_prices(200.0, now, 6);
        let windows = engine.settings().analyzer.charging_windows(&points);
        let forecast: Vec<crate::domain::PvForecastPoint> = (0..6)
            .map(|h| crate::domain::PvForecastPoint {
                time_start: now + Duration::hours(h),
                forecasted_power_kw: 1.0,
                confidence: 0.8,
            })
            .collect();

        // 1 kW of PV minus a forecast 1 kW house load leaves nothing for the
        // battery: plain grid charging.
        let mut input = inputs(now, &snap, &points, windows.first());
        input.pv_forecast = Some(&forecast);
        input.consumption_forecast_kw = Some(1.0);
        let decision = engine.decide(&input);
        assert_eq!(decision.action, ChargingAction::ChargeGrid);
    }

    #[test]
    fn legacy_mode_stops_grid_charge_on_overproduction() {
        let mut s = settings();
        s.mode = DecisionEngineMode::Legacy;
        let engine = DecisionEngine::new(s);
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let snap = snapshot(55.0, 4000.0, 1500.0, true);
        let points = flat_prices(300.0, now, 6);
        let decision = engine.decide(&inputs(now, &snap, &points, None));
        assert_eq!(decision.action, ChargingAction::Stop);
    }
}
