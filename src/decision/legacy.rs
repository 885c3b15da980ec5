use crate::domain::{ChargingAction, ScoreBreakdown};

/// Factor weights for the legacy engine.
pub const WEIGHT_PRICE: f64 = 0.40;
pub const WEIGHT_BATTERY: f64 = 0.25;
pub const WEIGHT_PV: f64 = 0.20;
pub const WEIGHT_CONSUMPTION: f64 = 0.15;

/// Piecewise score of the current final price (PLN/kWh); cheaper is better.
/// Neutral 50 when the feed is unavailable.
pub fn price_score(final_price_pln_kwh: Option<f64>) -> f64 {
    match final_price_pln_kwh {
        None => 50.0,
        Some(price) if price <= 0.20 => 100.0,
        Some(price) if price <= 0.40 => 80.0,
        Some(price) if price <= 0.60 => 40.0,
        Some(_) => 0.0,
    }
}

/// Lower SoC scores higher; a full battery needs nothing.
pub fn battery_score(soc_percent: Option<f64>) -> f64 {
    match soc_percent {
        None => 50.0,
        Some(soc) if soc <= 20.0 => 100.0,
        Some(soc) if soc <= 40.0 => 80.0,
        Some(soc) if soc <= 70.0 => 40.0,
        Some(soc) if soc <= 90.0 => 10.0,
        Some(_) => 0.0,
    }
}

/// Scores the PV/consumption balance. Overproduction means grid charging is
/// pointless (0); a deep deficit makes charging urgent.
pub fn pv_score(
    pv_power_w: Option<f64>,
    consumption_power_w: Option<f64>,
    overproduction_threshold_w: f64,
) -> f64 {
    let (Some(pv), Some(consumption)) = (pv_power_w, consumption_power_w) else {
        return 50.0;
    };
    let net = pv - consumption;

    if net > overproduction_threshold_w {
        0.0
    } else if net < 0.0 {
        let deficit = -net;
        if deficit >= 2000.0 {
            100.0
        } else if deficit >= 1000.0 {
            80.0
        } else {
            60.0
        }
    } else if net >= overproduction_threshold_w * 0.5 {
        10.0
    } else {
        30.0
    }
}

pub fn consumption_score(consumption_power_w: Option<f64>) -> f64 {
    match consumption_power_w {
        None => 50.0,
        Some(power) if power >= 3000.0 => 100.0,
        Some(power) if power >= 1000.0 => 60.0,
        Some(power) if power >= 100.0 => 30.0,
        Some(_) => 0.0,
    }
}

pub fn compute_scores(
    final_price_pln_kwh: Option<f64>,
    soc_percent: Option<f64>,
    pv_power_w: Option<f64>,
    consumption_power_w: Option<f64>,
    overproduction_threshold_w: f64,
) -> ScoreBreakdown {
    let price = price_score(final_price_pln_kwh);
    let battery = battery_score(soc_percent);
    let pv = pv_score(pv_power_w, consumption_power_w, overproduction_threshold_w);
    let consumption = consumption_score(consumption_power_w);
    let total = price * WEIGHT_PRICE
        + battery * WEIGHT_BATTERY
        + pv * WEIGHT_PV
        + consumption * WEIGHT_CONSUMPTION;
    ScoreBreakdown {
        price,
        battery,
        pv,
        consumption,
        total,
    }
}

/// Threshold-based action selection with the PV-overproduction and critical
/// SoC overrides applied before the score gates.
#[allow(clippy::too_many_arguments)]
pub fn determine_action(
    scores: &ScoreBreakdown,
    soc_percent: Option<f64>,
    pv_power_w: Option<f64>,
    consumption_power_w: Option<f64>,
    overproduction_threshold_w: f64,
    critical_soc: f64,
    currently_charging: bool,
) -> ChargingAction {
    if soc_percent.is_some_and(|soc| soc <= critical_soc) {
        return ChargingAction::ChargeGrid;
    }

    let net = match (pv_power_w, consumption_power_w) {
        (Some(pv), Some(consumption)) => Some(pv - consumption),
        _ => None,
    };

    // PV overproduction stops any grid-driven charge regardless of the total.
    if net.is_some_and(|n| n > overproduction_threshold_w) {
        return if currently_charging {
            ChargingAction::Stop
        } else {
            ChargingAction::Wait
        };
    }

    // Deep PV deficit with a low battery starts a charge early.
    if net.is_some_and(|n| n < -1000.0) && soc_percent.is_some_and(|soc| soc <= 40.0) {
        if !currently_charging {
            return ChargingAction::ChargeGrid;
        }
    }

    if scores.total >= 70.0 {
        return ChargingAction::ChargeGrid;
    }
    if scores.total <= 30.0 && currently_charging {
        return ChargingAction::Stop;
    }
    if currently_charging {
        return ChargingAction::ChargeGrid;
    }
    ChargingAction::Wait
}

/// Confidence from signal agreement: lower variance across the four scores
/// means a clearer picture. Returned in 0..=1.
pub fn confidence(scores: &ScoreBreakdown) -> f64 {
    (100.0 - scores.variance() / 10.0).clamp(0.0, 100.0) / 100.0
}

/// Human-readable factor summary for the audit record.
pub fn reasoning(scores: &ScoreBreakdown, action: ChargingAction) -> String {
    let mut reasons = Vec::new();

    if scores.price >= 80.0 {
        reasons.push("low electricity prices".to_string());
    } else if scores.price <= 20.0 {
        reasons.push("high electricity prices".to_string());
    }

    if scores.battery >= 80.0 {
        reasons.push("low battery level".to_string());
    } else if scores.battery <= 20.0 {
        reasons.push("battery nearly full".to_string());
    }

    if scores.pv == 0.0 {
        reasons.push("PV overproduction, no grid charging needed".to_string());
    } else if scores.pv >= 80.0 {
        reasons.push("PV deficit, charging needed".to_string());
    } else if scores.pv >= 60.0 {
        reasons.push("PV insufficient for consumption".to_string());
    }

    if scores.consumption >= 80.0 {
        reasons.push("high consumption".to_string());
    } else if scores.consumption <= 20.0 {
        reasons.push("low consumption".to_string());
    }

    if action == ChargingAction::Stop && scores.pv == 0.0 {
        reasons.push("stopping grid charging during PV overproduction".to_string());
    }

    if reasons.is_empty() {
        reasons.push("balanced conditions".to_string());
    }
    format!("Decision based on: {}", reasons.join(", "))
}
