pub mod timing;

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Europe::Warsaw;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::BatterySellingConfig;
use crate::domain::{PricePoint, Snapshot};
pub use timing::{RiskLevel, SellingTiming, TimingDecision, TimingRecommendation};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SellingAction {
    SellNow,
    WaitForPeak,
    WaitForHigher,
    NoOpportunity,
    Blocked,
}

/// Outcome of one selling evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SellingDecision {
    pub timestamp: DateTime<Utc>,
    pub action: SellingAction,
    pub min_soc_floor_percent: f64,
    pub available_energy_kwh: f64,
    pub expected_price_pln_kwh: f64,
    pub expected_revenue_pln: f64,
    pub confidence: f64,
    pub reason: String,
    pub timing: Option<TimingRecommendation>,
}

/// Session bookkeeping the engine needs to honor the daily budget.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionBudget {
    pub sessions_today: u32,
    pub last_session_end: Option<DateTime<Utc>>,
    pub waiting_since: Option<DateTime<Utc>>,
    pub expected_peak_price: Option<f64>,
}

/// Battery selling engine: opportunity gates, dynamic SoC floors, smart
/// timing, and cancel-wait supervision.
#[derive(Debug, Clone)]
pub struct SellingEngine {
    cfg: BatterySellingConfig,
    capacity_kwh: f64,
    timing: SellingTiming,
}

impl SellingEngine {
    pub fn new(cfg: BatterySellingConfig, capacity_kwh: f64) -> Self {
        let timing = SellingTiming::new(cfg.smart_timing.clone());
        Self {
            cfg,
            capacity_kwh,
            timing,
        }
    }

    pub fn enabled(&self) -> bool {
        self.cfg.enabled
    }

    /// Evaluate the selling opportunity at `now`. Pure in its inputs.
    pub fn evaluate(
        &self,
        now: DateTime<Utc>,
        snapshot: &Snapshot,
        current_price: Option<f64>,
        price_points: &[PricePoint],
        forecast_confidence: f64,
        budget: &SessionBudget,
    ) -> SellingDecision {
        let soc = snapshot.battery.soc_percent.unwrap_or(0.0);

        if !self.cfg.enabled {
            return self.blocked(now, soc, 0.0, "battery selling disabled");
        }
        let Some(price) = current_price else {
            return self.blocked(now, soc, 0.0, "no current price available");
        };
        if price < self.cfg.min_selling_price_pln {
            return self.blocked(
                now,
                soc,
                price,
                format!(
                    "price {price:.3} PLN/kWh below minimum selling price {:.2}",
                    self.cfg.min_selling_price_pln
                ),
            );
        }

        // Dynamic floor, never below the absolute safety floor.
        let floor = self.min_selling_soc(now, price, price_points);
        if soc < floor {
            return self.blocked(
                now,
                soc,
                price,
                format!("SoC {soc:.0}% below {floor:.0}% threshold"),
            );
        }
        let absolute_floor = self.cfg.dynamic_soc_thresholds.absolute_floor_soc;
        if soc < absolute_floor {
            return self.blocked(
                now,
                soc,
                price,
                format!("SoC {soc:.0}% below absolute safety floor {absolute_floor:.0}%"),
            );
        }

        // Daily session budget and spacing.
        if budget.sessions_today >= self.cfg.smart_timing.max_sessions_per_day {
            return self.blocked(
                now,
                soc,
                price,
                format!(
                    "daily selling budget exhausted ({} sessions)",
                    budget.sessions_today
                ),
            );
        }
        if let Some(last_end) = budget.last_session_end {
            let gap_hours = (now - last_end).num_seconds() as f64 / 3600.0;
            if gap_hours < self.cfg.smart_timing.min_session_gap_hours {
                return self.blocked(
                    now,
                    soc,
                    price,
                    format!("only {gap_hours:.1}h since last session"),
                );
            }
        }

        let available_kwh = ((soc - floor.max(absolute_floor)) / 100.0 * self.capacity_kwh).max(0.0);
        let recommendation =
            self.timing
                .analyze(now, price, price_points, available_kwh, forecast_confidence);

        let action = match recommendation.decision {
            TimingDecision::SellNow => SellingAction::SellNow,
            TimingDecision::WaitForPeak => SellingAction::WaitForPeak,
            TimingDecision::WaitForHigher => SellingAction::WaitForHigher,
            TimingDecision::NoOpportunity => SellingAction::NoOpportunity,
        };
        debug!(%action, soc, price, floor, "selling evaluation");

        SellingDecision {
            timestamp: now,
            action,
            min_soc_floor_percent: floor,
            available_energy_kwh: available_kwh,
            expected_price_pln_kwh: recommendation.expected_price_pln_kwh,
            expected_revenue_pln: recommendation.expected_price_pln_kwh * available_kwh,
            confidence: recommendation.confidence,
            reason: recommendation.reasoning.clone(),
            timing: Some(recommendation),
        }
    }

    /// Minimum SoC at which selling is allowed for this price.
    ///
    /// Cheaper tiers require a fuller battery; premium tiers lower the floor
    /// but only when the hour is a configured peak hour and the forecast
    /// shows a recharge opportunity (a future price at or below
    /// `recharge_price_ratio` of the current one), where so configured. The
    /// absolute safety floor is never crossed.
    pub fn min_selling_soc(
        &self,
        now: DateTime<Utc>,
        current_price: f64,
        price_points: &[PricePoint],
    ) -> f64 {
        let dynamic = &self.cfg.dynamic_soc_thresholds;
        if !dynamic.enabled {
            return self.cfg.min_battery_soc;
        }

        let tier_floor = if current_price >= dynamic.super_premium_price_threshold {
            dynamic.super_premium_min_soc
        } else if current_price >= dynamic.premium_price_threshold {
            dynamic.premium_min_soc
        } else if current_price >= dynamic.very_high_price_threshold {
            dynamic.very_high_min_soc
        } else if current_price >= dynamic.high_price_threshold {
            dynamic.high_min_soc
        } else {
            return self.cfg.min_battery_soc;
        };

        // A floor below the static one is a concession; it must be earned.
        if tier_floor < self.cfg.min_battery_soc {
            if dynamic.require_peak_hours && !self.is_peak_hour(now) {
                return self.cfg.min_battery_soc;
            }
            if dynamic.require_recharge_forecast
                && !self.has_recharge_opportunity(now, current_price, price_points)
            {
                return self.cfg.min_battery_soc;
            }
        }

        tier_floor.max(dynamic.absolute_floor_soc)
    }

    fn is_peak_hour(&self, now: DateTime<Utc>) -> bool {
        let hour = now.with_timezone(&Warsaw).hour();
        self.cfg.peak_hours.contains(&hour)
    }

    fn has_recharge_opportunity(
        &self,
        now: DateTime<Utc>,
        current_price: f64,
        price_points: &[PricePoint],
    ) -> bool {
        let ratio = self.cfg.dynamic_soc_thresholds.recharge_price_ratio;
        price_points
            .iter()
            .any(|p| p.time_start > now && p.final_price_pln_kwh <= current_price * ratio)
    }

    /// While waiting for a forecast peak: reasons to stop waiting and act.
    pub fn should_cancel_waiting(
        &self,
        now: DateTime<Utc>,
        snapshot: &Snapshot,
        current_price: f64,
        budget: &SessionBudget,
    ) -> Option<String> {
        let soc = snapshot.battery.soc_percent.unwrap_or(0.0);
        if soc < self.cfg.safety_margin_soc {
            return Some(format!(
                "SoC {soc:.0}% fell below safety margin {:.0}%",
                self.cfg.safety_margin_soc
            ));
        }
        if let Some(since) = budget.waiting_since {
            let waited_hours = (now - since).num_seconds() as f64 / 3600.0;
            if waited_hours >= self.cfg.smart_timing.max_wait_time_hours {
                return Some(format!("max wait time of {waited_hours:.1}h elapsed"));
            }
        }
        if let Some(consumption) = snapshot.consumption.power_w {
            if consumption > self.cfg.consumption_spike_threshold_w {
                return Some(format!(
                    "house consumption spiked to {consumption:.0}W"
                ));
            }
        }
        if let Some(expected_peak) = budget.expected_peak_price {
            if current_price > expected_peak {
                return Some(format!(
                    "realized price {current_price:.3} exceeds forecast peak {expected_peak:.3}"
                ));
            }
        }
        None
    }

    fn blocked(
        &self,
        now: DateTime<Utc>,
        soc: f64,
        price: f64,
        reason: impl Into<String>,
    ) -> SellingDecision {
        SellingDecision {
            timestamp: now,
            action: SellingAction::Blocked,
            min_soc_floor_percent: self.cfg.min_battery_soc,
            available_energy_kwh: ((soc - self.cfg.min_battery_soc) / 100.0 * self.capacity_kwh)
                .max(0.0),
            expected_price_pln_kwh: price,
            expected_revenue_pln: 0.0,
            confidence: 1.0,
            reason: reason.into(),
            timing: None,
        }
    }
}
