use chrono::{DateTime, Utc};

use super::night;
use super::{DecisionInputs, EngineSettings};
use crate::domain::{
    ChargingAction, Decision, DecisionPriority, PriceBand, PvForecastPoint, ScoreBreakdown,
};

/// Charge efficiency per source; PV-side conversion loses less than a full
/// AC round trip.
const GRID_CHARGE_EFFICIENCY: f64 = 0.95;
const PV_CHARGE_EFFICIENCY: f64 = 0.98;

/// Hybrid charging is preferred once in-window PV covers this share of the
/// energy need.
const HYBRID_PV_SHARE: f64 = 0.30;

/// Timing-aware decision logic. Rules apply in order, first match wins; the
/// peak-hours policy and cooldown gates run afterwards in the engine facade.
pub fn decide(
    settings: &EngineSettings,
    inputs: &DecisionInputs<'_>,
    scores: ScoreBreakdown,
) -> Decision {
    let soc = inputs.soc();
    let current_price = inputs.current_final_price();
    let current_band = inputs
        .current_market_price()
        .map(|market| settings.analyzer.classify(market));

    // Rule 1: emergency SoC. Charges regardless of price; only the
    // regulatory hard block can still stop it downstream.
    if let Some(soc) = soc {
        if soc <= settings.soc.emergency {
            let mut decision = sized_charge(
                settings,
                inputs,
                ChargingAction::ChargeGrid,
                100.0,
                settings.charge_rate_kw,
                GRID_CHARGE_EFFICIENCY,
                format!(
                    "Emergency battery level ({soc:.0}% <= {:.0}%), charging from grid immediately",
                    settings.soc.emergency
                ),
            );
            decision.priority = DecisionPriority::Critical;
            decision.confidence = 1.0;
            decision.scores = scores;
            return decision;
        }

        // Rule 2: critical SoC. Ignores weather-aware waits.
        if soc <= settings.soc.critical {
            let mut decision = sized_charge(
                settings,
                inputs,
                ChargingAction::ChargeGrid,
                settings.pv.max_night_charging_soc.max(80.0),
                settings.charge_rate_kw,
                GRID_CHARGE_EFFICIENCY,
                format!(
                    "Critical battery level ({soc:.0}% <= {:.0}%), charging despite conditions",
                    settings.soc.critical
                ),
            );
            decision.priority = DecisionPriority::Critical;
            decision.confidence = 0.95;
            decision.scores = scores;
            return decision;
        }
    }

    // Rule 5: PV overproduction charges from surplus, never the grid.
    if let (Some(net), Some(soc)) = (inputs.snapshot.net_pv_power_w(), soc) {
        if net >= settings.pv.pv_overproduction_threshold_w && soc < 95.0 {
            let surplus_kw = net / 1000.0;
            let mut decision = sized_charge(
                settings,
                inputs,
                ChargingAction::ChargePv,
                95.0,
                surplus_kw,
                PV_CHARGE_EFFICIENCY,
                format!(
                    "PV overproduction ({net:.0}W surplus), charging battery from PV"
                ),
            );
            decision.priority = DecisionPriority::High;
            decision.confidence = blend_confidence(0.9, &scores);
            decision.scores = scores;
            return decision;
        }
    }

    // Night-charging preparation for a poor-PV, expensive tomorrow. Takes
    // precedence over plain in-window charging: its conditions are stricter
    // and its target higher. Only a battery still at or below the
    // night-charging SoC threshold is considered at all.
    let night = night::assess(
        &settings.pv,
        inputs.now,
        soc,
        current_price,
        inputs.price_points,
        inputs.pv_forecast,
    );
    if night.applies {
        if let Some(soc) = soc {
            if soc < night.target_soc_percent {
                let mut decision = sized_charge(
                    settings,
                    inputs,
                    ChargingAction::ChargeGrid,
                    night.target_soc_percent,
                    settings.charge_rate_kw,
                    GRID_CHARGE_EFFICIENCY,
                    night.reason.clone(),
                );
                decision.priority = if night.tomorrow_pv_poor {
                    DecisionPriority::Critical
                } else {
                    DecisionPriority::High
                };
                decision.confidence = blend_confidence(
                    if night.pv_forecast_missing { 0.7 } else { 0.9 },
                    &scores,
                );
                decision.scores = scores;
                return decision;
            }
        }
    }

    // Rule 6: inside a low-price window with enough time left.
    if let (Some(window), Some(soc)) = (inputs.current_window, soc) {
        let remaining = window.remaining_hours(inputs.now);
        if window.band <= PriceBand::Low && remaining >= settings.analyzer.min_charging_duration_hours() {
            let target = window_charge_target(settings, inputs);
            if soc < target {
                let energy_need_kwh = (target - soc) / 100.0 * settings.capacity_kwh;
                // Only the PV surplus over the expected house load can reach
                // the battery.
                let house_kwh =
                    inputs.consumption_forecast_kw.unwrap_or(0.0).max(0.0) * remaining;
                let pv_in_window_kwh = (pv_energy_between(inputs.pv_forecast, inputs.now, window.end)
                    - house_kwh)
                    .max(0.0);
                let pv_share = if energy_need_kwh > 0.0 {
                    pv_in_window_kwh / energy_need_kwh
                } else {
                    0.0
                };

                let (action, power_kw, efficiency, reason) = if pv_share >= HYBRID_PV_SHARE {
                    (
                        ChargingAction::ChargeHybrid,
                        settings.charge_rate_kw + pv_in_window_kwh / remaining.max(0.1),
                        (GRID_CHARGE_EFFICIENCY + PV_CHARGE_EFFICIENCY) / 2.0,
                        format!(
                            "{} window with {:.1}h left, PV covers {:.0}% of need, hybrid charging",
                            window.band, remaining, pv_share * 100.0
                        ),
                    )
                } else {
                    (
                        ChargingAction::ChargeGrid,
                        settings.charge_rate_kw,
                        GRID_CHARGE_EFFICIENCY,
                        format!(
                            "{} window with {:.1}h left (avg {:.0} PLN/MWh), charging from grid",
                            window.band, remaining, window.avg_price_pln_mwh
                        ),
                    )
                };

                let mut decision =
                    sized_charge(settings, inputs, action, target, power_kw, efficiency, reason);
                decision.priority = if window.band == PriceBand::VeryLow {
                    DecisionPriority::High
                } else {
                    DecisionPriority::Medium
                };
                decision.confidence = blend_confidence(0.85, &scores);
                decision.scores = scores;
                return decision;
            }
        }
    }

    // Rule 7: rising PV forecast; waiting beats charging at a so-so price.
    // With almost no PV on the roof right now the forecast slope is not
    // trusted and grid charging stays on the table.
    if let (Some(pv_now), Some(soc)) = (inputs.snapshot.pv.power_w, soc) {
        if pv_now >= settings.pv.low_pv_override_w
            && current_band.is_some_and(|band| band > PriceBand::VeryLow)
            && pv_forecast_rising(inputs.pv_forecast, inputs.now, pv_now)
        {
            if soc < 40.0 {
                let mut decision = sized_charge(
                    settings,
                    inputs,
                    ChargingAction::ChargeGrid,
                    settings.pv.max_night_charging_soc,
                    settings.charge_rate_kw,
                    GRID_CHARGE_EFFICIENCY,
                    format!("PV forecast rising but SoC {soc:.0}% too low to wait"),
                );
                decision.priority = DecisionPriority::Medium;
                decision.confidence = blend_confidence(0.7, &scores);
                decision.scores = scores;
                return decision;
            }
            let mut decision = Decision::wait(
                inputs.now,
                "PV forecast improving, waiting for free solar charge",
            );
            decision.confidence = blend_confidence(0.7, &scores);
            decision.scores = scores;
            return decision;
        }
    }

    // High-price discharge: cover a house deficit from the battery instead of
    // importing at peak prices. Only with selling enabled and plenty of SoC.
    if settings.selling_enabled {
        if let (Some(net), Some(soc), Some(band)) =
            (inputs.snapshot.net_pv_power_w(), soc, current_band)
        {
            if band >= PriceBand::High && soc > settings.min_selling_soc && net < 0.0 {
                let deficit_kw = -net / 1000.0;
                let duration = 1.0f64;
                let energy = deficit_kw * duration;
                let mut decision = Decision {
                    timestamp: inputs.now,
                    action: ChargingAction::Discharge,
                    target_soc_percent: settings.min_selling_soc,
                    power_w: -net,
                    duration_hours: duration,
                    energy_kwh: energy,
                    estimated_cost_pln: 0.0,
                    estimated_savings_pln: current_price.unwrap_or(0.0) * energy,
                    priority: DecisionPriority::Medium,
                    confidence: blend_confidence(0.75, &scores),
                    reason: format!(
                        "High prices ({band} band), covering {deficit_kw:.1}kW house deficit from battery"
                    ),
                    scores: scores.clone(),
                    safety_warnings: Vec::new(),
                };
                decision.scores = scores;
                return decision;
            }
        }
    }

    // Rule 9: nothing worth doing.
    let mut decision = Decision::wait(inputs.now, wait_reason(current_band, soc));
    decision.confidence = blend_confidence(0.6, &scores);
    decision.scores = scores;
    decision
}

fn wait_reason(band: Option<PriceBand>, soc: Option<f64>) -> String {
    match (band, soc) {
        (Some(band), Some(soc)) => {
            format!("No favorable charging conditions ({band} prices, SoC {soc:.0}%)")
        }
        _ => "No favorable charging conditions".to_string(),
    }
}

/// Blend a rule's base confidence with the agreement of the legacy scores.
fn blend_confidence(rule_confidence: f64, scores: &ScoreBreakdown) -> f64 {
    let agreement = (100.0 - scores.variance() / 10.0).clamp(0.0, 100.0) / 100.0;
    (rule_confidence * 0.7 + agreement * 0.3).clamp(0.0, 1.0)
}

/// Target SoC for in-window grid charging: the selling floor keeps the
/// battery sellable, and the aggressive-charging tiers push higher when the
/// current price sits in the cheapest tail of the day.
fn window_charge_target(settings: &EngineSettings, inputs: &DecisionInputs<'_>) -> f64 {
    let mut target = 80.0f64;
    if settings.selling_enabled {
        target = target.max(settings.min_selling_soc);
    }
    if settings.aggressive.enabled {
        if let Some(price) = inputs.current_final_price() {
            let prices: Vec<f64> = inputs
                .price_points
                .iter()
                .map(|p| p.final_price_pln_kwh)
                .collect();
            let super_cheap = crate::pricing::windows::percentile(&prices, 10.0);
            let cheap = crate::pricing::windows::percentile(
                &prices,
                settings.aggressive.price_threshold_percent,
            );
            if super_cheap.is_some_and(|threshold| price <= threshold) {
                target = target.max(settings.aggressive.super_cheap_target_soc);
            } else if cheap.is_some_and(|threshold| price <= threshold) {
                target = target.max(settings.aggressive.cheap_target_soc);
            }
        }
    }
    target.min(settings.soc.max)
}

/// PV forecast energy (kWh) between two instants.
fn pv_energy_between(
    forecast: Option<&[PvForecastPoint]>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> f64 {
    let Some(points) = forecast else { return 0.0 };
    if points.len() < 2 {
        return points
            .iter()
            .filter(|p| p.time_start >= from && p.time_start < to)
            .map(|p| p.forecasted_power_kw)
            .sum();
    }
    let step_h = (points[1].time_start - points[0].time_start).num_seconds() as f64 / 3600.0;
    points
        .iter()
        .filter(|p| p.time_start >= from && p.time_start < to)
        .map(|p| p.forecasted_power_kw * step_h.max(0.0))
        .sum()
}

/// Rising when the near-term forecast average beats current output by 20%.
fn pv_forecast_rising(
    forecast: Option<&[PvForecastPoint]>,
    now: DateTime<Utc>,
    current_pv_w: f64,
) -> bool {
    let Some(points) = forecast else { return false };
    let horizon = now + chrono::Duration::hours(2);
    let upcoming: Vec<f64> = points
        .iter()
        .filter(|p| p.time_start >= now && p.time_start < horizon)
        .map(|p| p.forecasted_power_kw * 1000.0)
        .collect();
    if upcoming.is_empty() {
        return false;
    }
    let avg = upcoming.iter().sum::<f64>() / upcoming.len() as f64;
    avg > current_pv_w * 1.2
}

/// Build a sized charge decision: energy from the SoC gap, duration from the
/// effective power, cost from the current price with per-source efficiency.
pub(crate) fn sized_charge(
    settings: &EngineSettings,
    inputs: &DecisionInputs<'_>,
    action: ChargingAction,
    target_soc: f64,
    power_kw: f64,
    efficiency: f64,
    reason: String,
) -> Decision {
    let soc = inputs.soc().unwrap_or(50.0);
    let target = target_soc.clamp(0.0, 100.0);
    let energy_kwh = ((target - soc) / 100.0 * settings.capacity_kwh).max(0.0);
    let power_kw = power_kw.max(0.1);
    let duration_hours = if energy_kwh > 0.0 { energy_kwh / power_kw } else { 0.0 };

    let drawn_kwh = energy_kwh / efficiency.clamp(0.5, 1.0);
    let price = inputs.current_final_price().unwrap_or(0.0);
    let estimated_cost_pln = if action == ChargingAction::ChargePv {
        0.0
    } else {
        drawn_kwh * price
    };
    let reference_final = settings.reference_price_pln_mwh / 1000.0;
    let market_now = inputs.current_market_price().unwrap_or(reference_final * 1000.0);
    let estimated_savings_pln = if action == ChargingAction::ChargePv {
        drawn_kwh * price
    } else {
        ((reference_final - market_now / 1000.0) * drawn_kwh).max(0.0)
    };

    Decision {
        timestamp: inputs.now,
        action,
        target_soc_percent: target,
        power_w: power_kw * 1000.0,
        duration_hours,
        energy_kwh,
        estimated_cost_pln,
        estimated_savings_pln,
        priority: DecisionPriority::Medium,
        confidence: 0.5,
        reason,
        scores: ScoreBreakdown::default(),
        safety_warnings: Vec::new(),
    }
}
