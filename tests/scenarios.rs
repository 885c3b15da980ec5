//! End-to-end decision scenarios: literal inputs through the full engine
//! stack, checked against expected actions, priorities and reasons.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

use pv_edge_coordinator::config::AppConfig;
use pv_edge_coordinator::coordinator::{MarketData, MasterCoordinator};
use pv_edge_coordinator::domain::{
    BatterySample, ChargingAction, ConsumptionSample, DecisionPriority, GridSample, InverterInfo,
    PeakLabel, PricePoint, PvForecastPoint, PvSample, Snapshot,
};
use pv_edge_coordinator::forecast::PeakLabelPoint;
use pv_edge_coordinator::inverter::simulated::SimulatedInverter;
use pv_edge_coordinator::inverter::InverterPort;
use pv_edge_coordinator::selling::{SellingAction, SellingEngine, SessionBudget};
use pv_edge_coordinator::storage::file::FileStorage;

fn config_yaml(base_path: &std::path::Path) -> String {
    format!(
        r#"
inverter:
  vendor: simulated
  ip_address: 127.0.0.1
  port: 8899
battery_management:
  capacity_kwh: 20.0
coordinator:
  decision_interval_minutes: 15
electricity_tariff:
  tariff_type: flat
battery_selling:
  enabled: true
  dynamic_soc_thresholds:
    enabled: true
data_storage:
  mode: file
  file:
    base_path: {}
"#,
        base_path.display()
    )
}

async fn coordinator_with_soc(
    dir: &std::path::Path,
    soc: f64,
) -> (Arc<MasterCoordinator>, Arc<SimulatedInverter>) {
    let value: serde_yaml::Value = serde_yaml::from_str(&config_yaml(dir)).unwrap();
    let cfg = AppConfig::from_value(value).unwrap();
    let inverter = Arc::new(SimulatedInverter::with_soc(soc));
    inverter.connect(&cfg.inverter).await.unwrap();
    let storage = Arc::new(FileStorage::new(dir.to_path_buf()));
    let coordinator = Arc::new(MasterCoordinator::new(
        cfg,
        inverter.clone(),
        storage,
        None,
        None,
        None,
        None,
    ));
    (coordinator, inverter)
}

fn snapshot(now: DateTime<Utc>, soc: f64, pv_w: f64, consumption_w: f64, charging: bool) -> Snapshot {
    Snapshot {
        timestamp: now,
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
            daily_energy_wh: Some(0.0),
        },
        grid: GridSample {
            voltage_v: Some(230.0),
            power_w: Some(0.0),
            ..GridSample::default()
        },
        consumption: ConsumptionSample {
            power_w: Some(consumption_w),
            daily_energy_wh: Some(0.0),
        },
        inverter: InverterInfo::default(),
    }
}

fn flat_market(now: DateTime<Utc>, market_pln_mwh: f64, hours: i64) -> MarketData {
    let price_points = (0..hours * 4)
        .map(|i| {
            let time_start = now + Duration::minutes(15 * i);
            PricePoint {
                time_start,
                market_price_pln_mwh: market_pln_mwh,
                final_price_pln_kwh: market_pln_mwh / 1000.0 + 0.0892,
            }
        })
        .collect();
    MarketData {
        price_points,
        labels: Vec::new(),
        pv_forecast: Some(Vec::new()),
        forecast_confidence: 0.8,
    }
}

/// S1: SoC 4%, very expensive price, label normal -> critical grid charge.
#[tokio::test]
async fn s1_critical_soc_override() {
    let dir = tempfile::tempdir().unwrap();
    let (coordinator, _inverter) = coordinator_with_soc(dir.path(), 4.0).await;
    let now = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
    let snap = snapshot(now, 4.0, 0.0, 800.0, false);

    // 1.20 PLN/kWh final.
    let mut market = flat_market(now, 1110.8, 24);
    market.labels = (0..24)
        .map(|h| PeakLabelPoint {
            time: now + Duration::hours(h),
            label: PeakLabel::Normal,
        })
        .collect();

    let decision = coordinator.decision_tick(now, &snap, &market).await.unwrap();
    assert_eq!(decision.action, ChargingAction::ChargeGrid);
    assert_eq!(decision.priority, DecisionPriority::Critical);
    assert!(decision.confidence >= 0.95);
    assert!(decision.reason.to_lowercase().contains("emergency battery"));
}

/// S2: SoC 45%, low band, required reduction -> wait, nothing commanded.
#[tokio::test]
async fn s2_required_reduction_veto() {
    let dir = tempfile::tempdir().unwrap();
    let (coordinator, inverter) = coordinator_with_soc(dir.path(), 45.0).await;
    let now = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
    let snap = snapshot(now, 45.0, 0.0, 800.0, false);

    let mut market = flat_market(now, 200.0, 24);
    market.labels = (0..24)
        .map(|h| PeakLabelPoint {
            time: now + Duration::hours(h),
            label: PeakLabel::RequiredReduction,
        })
        .collect();

    let decision = coordinator.decision_tick(now, &snap, &market).await.unwrap();
    assert_eq!(decision.action, ChargingAction::Wait);
    assert!(decision.reason.to_lowercase().contains("required reduction"));
    let battery = inverter.read_battery().await.unwrap();
    assert!(!battery.charging, "no command may reach the inverter");
}

/// S3: PV 4000 W, consumption 1500 W, threshold 500 W, SoC 55% -> PV charge,
/// and an active grid charge is stopped first.
#[tokio::test]
async fn s3_pv_overproduction() {
    let dir = tempfile::tempdir().unwrap();
    let (coordinator, inverter) = coordinator_with_soc(dir.path(), 55.0).await;
    let now = Utc.with_ymd_and_hms(2025, 6, 1, 11, 0, 0).unwrap();

    // A grid charge is already running.
    inverter.start_charging(60, 90).await.unwrap();
    let snap = snapshot(now, 55.0, 4000.0, 1500.0, true);

    let market = flat_market(now, 400.0, 24);
    let decision = coordinator.decision_tick(now, &snap, &market).await.unwrap();
    assert_eq!(decision.action, ChargingAction::ChargePv);
    assert_ne!(decision.action, ChargingAction::ChargeGrid);

    let battery = inverter.read_battery().await.unwrap();
    assert!(!battery.charging, "grid charge stopped before PV charging");
}

/// S4: night hour, bottom-quartile price, poor PV tomorrow, >=4 expensive
/// hours tomorrow, SoC 25% -> grid charge to 100%, critical.
#[tokio::test]
async fn s4_night_charging_preparation() {
    let dir = tempfile::tempdir().unwrap();
    let (coordinator, _inverter) = coordinator_with_soc(dir.path(), 25.0).await;
    // 02:00 Warsaw = 00:00 UTC in summer.
    let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
    let snap = snapshot(now, 25.0, 0.0, 400.0, false);

    // Cheap night, expensive block tomorrow morning; prices only cover the
    // horizon, so the current interval is in the bottom quartile.
    let price_points: Vec<PricePoint> = (0..36 * 4)
        .map(|i| {
            let time_start = now + Duration::minutes(15 * i);
            let hour = i / 4;
            let market = if (22..30).contains(&hour) { 950.0 } else { 160.0 };
            PricePoint {
                time_start,
                market_price_pln_mwh: market,
                final_price_pln_kwh: market / 1000.0 + 0.0892,
            }
        })
        .collect();
    // Tomorrow's PV averages 0.2 kW, under the 0.3 kWh/h poor-PV threshold.
    let pv_forecast: Vec<PvForecastPoint> = (0..36)
        .map(|h| PvForecastPoint {
            time_start: now + Duration::hours(h),
            forecasted_power_kw: 0.2,
            confidence: 0.8,
        })
        .collect();
    let market = MarketData {
        price_points,
        labels: Vec::new(),
        pv_forecast: Some(pv_forecast),
        forecast_confidence: 0.8,
    };

    let decision = coordinator.decision_tick(now, &snap, &market).await.unwrap();
    assert_eq!(decision.action, ChargingAction::ChargeGrid);
    assert_eq!(decision.target_soc_percent, 100.0);
    assert_eq!(decision.priority, DecisionPriority::Critical);
    assert!(decision.reason.to_lowercase().contains("night charging"));
}

/// S5: price at forecast peak with decline ahead, SoC 85% -> sell now.
#[test]
fn s5_sell_at_peak() {
    let yaml = r#"
enabled: true
dynamic_soc_thresholds:
  enabled: true
"#;
    let cfg: pv_edge_coordinator::config::BatterySellingConfig =
        serde_yaml::from_str(yaml).unwrap();
    let engine = SellingEngine::new(cfg, 20.0);

    // 19:00 Warsaw peak hour.
    let now = Utc.with_ymd_and_hms(2025, 6, 1, 17, 0, 0).unwrap();
    let mut prices = vec![0.95, 0.95];
    for i in 0..22 {
        prices.push(0.90 - 0.02 * i as f64);
    }
    let horizon: Vec<PricePoint> = prices
        .iter()
        .enumerate()
        .map(|(i, price)| PricePoint {
            time_start: now + Duration::minutes(15 * i as i64),
            market_price_pln_mwh: price * 1000.0,
            final_price_pln_kwh: *price,
        })
        .collect();

    let snap = snapshot(now, 85.0, 0.0, 800.0, false);
    let decision = engine.evaluate(now, &snap, Some(0.95), &horizon, 0.95, &SessionBudget::default());

    assert_eq!(decision.action, SellingAction::SellNow);
    assert!(decision.confidence >= 0.9);
    let reason = decision.reason.to_lowercase();
    assert!(reason.contains("peak") || reason.contains("high"));
}

/// S6: super-premium price at SoC 52%: allowed in a peak hour with a
/// recharge opportunity, blocked outside peak hours.
#[test]
fn s6_dynamic_floor_super_premium() {
    let yaml = r#"
enabled: true
dynamic_soc_thresholds:
  enabled: true
"#;
    let cfg: pv_edge_coordinator::config::BatterySellingConfig =
        serde_yaml::from_str(yaml).unwrap();
    let engine = SellingEngine::new(cfg, 20.0);

    let build_horizon = |now: DateTime<Utc>| -> Vec<PricePoint> {
        let mut prices = vec![1.5; 8];
        prices.extend(vec![0.35; 8]); // recharge opportunity (<= 0.7 * 1.5)
        prices
            .iter()
            .enumerate()
            .map(|(i, price)| PricePoint {
                time_start: now + Duration::minutes(15 * i as i64),
                market_price_pln_mwh: price * 1000.0,
                final_price_pln_kwh: *price,
            })
            .collect()
    };

    // In a peak hour (19:00 Warsaw): floor drops to 50%, selling allowed.
    let peak = Utc.with_ymd_and_hms(2025, 6, 1, 17, 0, 0).unwrap();
    let snap = snapshot(peak, 52.0, 0.0, 800.0, false);
    let allowed = engine.evaluate(
        peak,
        &snap,
        Some(1.5),
        &build_horizon(peak),
        0.9,
        &SessionBudget::default(),
    );
    assert_eq!(allowed.min_soc_floor_percent, 50.0);
    assert_ne!(allowed.action, SellingAction::Blocked);

    // Same inputs at noon: static 80% floor applies.
    let off_peak = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
    let snap = snapshot(off_peak, 52.0, 0.0, 800.0, false);
    let blocked = engine.evaluate(
        off_peak,
        &snap,
        Some(1.5),
        &build_horizon(off_peak),
        0.9,
        &SessionBudget::default(),
    );
    assert_eq!(blocked.action, SellingAction::Blocked);
    assert!(blocked.reason.contains("below 80% threshold"));
}
