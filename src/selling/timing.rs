use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SmartTimingConfig;
use crate::domain::PricePoint;
use crate::pricing::windows::{current_percentile, normalized_slope};
use crate::pricing::PriceTrend;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TimingDecision {
    SellNow,
    WaitForPeak,
    WaitForHigher,
    NoOpportunity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Highest price ahead within the wait budget, when it is meaningfully above
/// the current price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeakInfo {
    pub peak_time: DateTime<Utc>,
    pub peak_price_pln_kwh: f64,
    pub time_to_peak_hours: f64,
    pub price_increase_percent: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingRecommendation {
    pub decision: TimingDecision,
    pub confidence: f64,
    pub reasoning: String,
    pub expected_price_pln_kwh: f64,
    pub opportunity_cost_pln: f64,
    pub peak_info: Option<PeakInfo>,
    pub wait_hours: f64,
    pub risk_level: RiskLevel,
}

/// Timing engine for battery selling: percentile context, peak detection,
/// trend, opportunity cost, then an ordered rule chain.
#[derive(Debug, Clone)]
pub struct SellingTiming {
    cfg: SmartTimingConfig,
}

struct PriceContext {
    percentile: u8,
    max_price: f64,
    is_peak_price: bool,
    is_high_price: bool,
}

impl SellingTiming {
    pub fn new(cfg: SmartTimingConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &SmartTimingConfig {
        &self.cfg
    }

    /// Recommend sell-now vs wait for a current price and a forecast horizon.
    /// Pure in its inputs; `now` is injected by the caller.
    pub fn analyze(
        &self,
        now: DateTime<Utc>,
        current_price: f64,
        price_points: &[PricePoint],
        available_kwh: f64,
        forecast_confidence: f64,
    ) -> TimingRecommendation {
        let lookahead_end = now + chrono::Duration::hours(self.cfg.forecast_lookahead_hours as i64);
        let horizon: Vec<&PricePoint> = price_points
            .iter()
            .filter(|p| p.time_start >= now && p.time_start < lookahead_end)
            .collect();

        if horizon.is_empty() {
            return self.immediate_sell(now, current_price, "no price forecast in lookahead");
        }

        let context = Self::price_context(current_price, &horizon);
        let peak = self.detect_peak(now, current_price, &horizon, forecast_confidence);
        let trend = self.detect_trend(now, &horizon);
        let opportunity_cost = peak
            .as_ref()
            .map(|p| (p.peak_price_pln_kwh - current_price) * available_kwh)
            .unwrap_or(0.0)
            .max(0.0);

        self.make_decision(
            now,
            current_price,
            context,
            peak,
            trend,
            opportunity_cost,
            forecast_confidence,
        )
    }

    fn price_context(current_price: f64, horizon: &[&PricePoint]) -> PriceContext {
        let prices: Vec<f64> = horizon.iter().map(|p| p.final_price_pln_kwh).collect();
        let percentile = current_percentile(&prices, current_price);
        let max_price = prices.iter().cloned().fold(current_price, f64::max);
        PriceContext {
            percentile,
            max_price,
            is_peak_price: percentile >= 90,
            is_high_price: percentile >= 75,
        }
    }

    fn detect_peak(
        &self,
        now: DateTime<Utc>,
        current_price: f64,
        horizon: &[&PricePoint],
        forecast_confidence: f64,
    ) -> Option<PeakInfo> {
        let wait_end = now
            + chrono::Duration::seconds((self.cfg.max_wait_time_hours * 3600.0) as i64);
        let candidate = horizon
            .iter()
            .filter(|p| p.time_start < wait_end)
            .max_by(|a, b| {
                a.final_price_pln_kwh
                    .partial_cmp(&b.final_price_pln_kwh)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })?;

        if current_price <= 0.0 {
            return None;
        }
        let increase_percent =
            (candidate.final_price_pln_kwh - current_price) / current_price * 100.0;
        if increase_percent < self.cfg.min_peak_difference_percent {
            return None;
        }
        let time_to_peak_hours = (candidate.time_start - now).num_seconds() as f64 / 3600.0;
        // Confidence decays the further out the peak sits.
        let confidence =
            (forecast_confidence * (1.0 - 0.05 * time_to_peak_hours)).clamp(0.0, 1.0);

        Some(PeakInfo {
            peak_time: candidate.time_start,
            peak_price_pln_kwh: candidate.final_price_pln_kwh,
            time_to_peak_hours,
            price_increase_percent: increase_percent,
            confidence,
        })
    }

    fn detect_trend(&self, now: DateTime<Utc>, horizon: &[&PricePoint]) -> PriceTrend {
        let window_end = now
            + chrono::Duration::seconds((self.cfg.trend_window_hours * 3600.0) as i64);
        let series: Vec<(f64, f64)> = horizon
            .iter()
            .filter(|p| p.time_start < window_end)
            .map(|p| {
                (
                    (p.time_start - now).num_seconds() as f64 / 3600.0,
                    p.final_price_pln_kwh,
                )
            })
            .collect();
        let slope = normalized_slope(&series);
        if slope > self.cfg.rising_threshold {
            PriceTrend::Rising
        } else if slope < self.cfg.falling_threshold {
            PriceTrend::Falling
        } else {
            PriceTrend::Stable
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn make_decision(
        &self,
        now: DateTime<Utc>,
        current_price: f64,
        context: PriceContext,
        peak: Option<PeakInfo>,
        trend: PriceTrend,
        opportunity_cost: f64,
        forecast_confidence: f64,
    ) -> TimingRecommendation {
        let near_peak_threshold = context.max_price * self.cfg.near_peak_threshold_percent / 100.0;

        // Rule 1: already at the peak.
        if context.is_peak_price && current_price >= near_peak_threshold {
            return TimingRecommendation {
                decision: TimingDecision::SellNow,
                confidence: 0.95,
                reasoning: format!(
                    "Current price {current_price:.3} PLN/kWh is at peak (top 10%, {}th percentile)",
                    context.percentile
                ),
                expected_price_pln_kwh: current_price,
                opportunity_cost_pln: 0.0,
                peak_info: None,
                wait_hours: 0.0,
                risk_level: RiskLevel::Low,
            };
        }

        // Rule 2: falling with nothing better ahead.
        let peak_increase = peak.as_ref().map(|p| p.price_increase_percent).unwrap_or(0.0);
        if trend == PriceTrend::Falling && peak_increase < 5.0 {
            return TimingRecommendation {
                decision: TimingDecision::SellNow,
                confidence: 0.85,
                reasoning: format!(
                    "Price is falling and no significant peak ahead, selling at {current_price:.3} PLN/kWh"
                ),
                expected_price_pln_kwh: current_price,
                opportunity_cost_pln: 0.0,
                peak_info: peak,
                wait_hours: 0.0,
                risk_level: RiskLevel::Medium,
            };
        }

        // Rule 3: a significantly better peak is worth waiting for.
        if let Some(info) = &peak {
            if info.price_increase_percent >= self.cfg.significant_savings_percent {
                return TimingRecommendation {
                    decision: TimingDecision::WaitForPeak,
                    confidence: (info.confidence * forecast_confidence).clamp(0.0, 1.0),
                    reasoning: format!(
                        "Peak expected in {:.1}h at {:.3} PLN/kWh (+{:.1}%, opportunity {:.2} PLN)",
                        info.time_to_peak_hours,
                        info.peak_price_pln_kwh,
                        info.price_increase_percent,
                        opportunity_cost
                    ),
                    expected_price_pln_kwh: info.peak_price_pln_kwh,
                    opportunity_cost_pln: opportunity_cost,
                    wait_hours: info.time_to_peak_hours,
                    risk_level: if info.time_to_peak_hours < 2.0 {
                        RiskLevel::Low
                    } else {
                        RiskLevel::Medium
                    },
                    peak_info: peak,
                };
            }
        }

        // Rule 4: high price near the horizon maximum.
        if context.is_high_price && current_price >= near_peak_threshold {
            return TimingRecommendation {
                decision: TimingDecision::SellNow,
                confidence: 0.80,
                reasoning: format!(
                    "Current price {current_price:.3} PLN/kWh is high (top 25%, within {:.0}% of peak)",
                    self.cfg.near_peak_threshold_percent
                ),
                expected_price_pln_kwh: current_price,
                opportunity_cost_pln: opportunity_cost,
                peak_info: peak,
                wait_hours: 0.0,
                risk_level: RiskLevel::Low,
            };
        }

        // Rule 5: moderate improvement within the wait budget.
        if let Some(info) = &peak {
            if info.price_increase_percent >= self.cfg.marginal_savings_percent
                && info.time_to_peak_hours <= self.cfg.max_wait_time_hours
            {
                return TimingRecommendation {
                    decision: TimingDecision::WaitForHigher,
                    confidence: (info.confidence * forecast_confidence * 0.8).clamp(0.0, 1.0),
                    reasoning: format!(
                        "Moderate price improvement expected in {:.1}h (+{:.1}%)",
                        info.time_to_peak_hours, info.price_increase_percent
                    ),
                    expected_price_pln_kwh: info.peak_price_pln_kwh,
                    opportunity_cost_pln: opportunity_cost,
                    wait_hours: info.time_to_peak_hours,
                    risk_level: RiskLevel::Medium,
                    peak_info: peak,
                };
            }
        }

        // Rule 6: price simply is not high enough.
        if !context.is_high_price {
            return TimingRecommendation {
                decision: TimingDecision::NoOpportunity,
                confidence: 0.90,
                reasoning: format!(
                    "Current price {current_price:.3} PLN/kWh below high threshold ({}th percentile)",
                    context.percentile
                ),
                expected_price_pln_kwh: current_price,
                opportunity_cost_pln: 0.0,
                peak_info: peak,
                wait_hours: 0.0,
                risk_level: RiskLevel::High,
            };
        }

        // Rule 7: conservative capture.
        TimingRecommendation {
            decision: TimingDecision::SellNow,
            confidence: 0.70,
            reasoning: format!(
                "No strong signal to wait, selling at current price {current_price:.3} PLN/kWh"
            ),
            expected_price_pln_kwh: current_price,
            opportunity_cost_pln: opportunity_cost,
            peak_info: peak,
            wait_hours: 0.0,
            risk_level: RiskLevel::Medium,
        }
    }

    fn immediate_sell(
        &self,
        _now: DateTime<Utc>,
        current_price: f64,
        reason: &str,
    ) -> TimingRecommendation {
        TimingRecommendation {
            decision: TimingDecision::SellNow,
            confidence: 0.5,
            reasoning: reason.to_string(),
            expected_price_pln_kwh: current_price,
            opportunity_cost_pln: 0.0,
            peak_info: None,
            wait_hours: 0.0,
            risk_level: RiskLevel::Medium,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn timing() -> SellingTiming {
        SellingTiming::new(SmartTimingConfig::default())
    }

    fn points(now: DateTime<Utc>, prices: &[f64]) -> Vec<PricePoint> {
        prices
            .iter()
            .enumerate()
            .map(|(i, price)| PricePoint {
                time_start: now + chrono::Duration::minutes(15 * i as i64),
                market_price_pln_mwh: price * 1000.0,
                final_price_pln_kwh: *price,
            })
            .collect()
    }

    #[test]
    fn sell_now_at_peak_with_decline_ahead() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 17, 0, 0).unwrap();
        // Peak now, steady decline over six hours.
        let mut prices = vec![0.95, 0.95];
        for i in 0..22 {
            prices.push(0.90 - 0.02 * i as f64);
        }
        let horizon = points(now, &prices);
        let rec = timing().analyze(now, 0.95, &horizon, 5.0, 0.9);

        assert_eq!(rec.decision, TimingDecision::SellNow);
        assert!(rec.confidence >= 0.9);
        let reason = rec.reasoning.to_lowercase();
        assert!(reason.contains("peak") || reason.contains("high"));
    }

    #[test]
    fn waits_for_significant_peak() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 15, 0, 0).unwrap();
        // Flat 0.60 now, peak of 0.90 (+50%) in two hours.
        let mut prices = vec![0.60; 8];
        prices.extend_from_slice(&[0.75, 0.90, 0.90, 0.80]);
        prices.extend(vec![0.60; 8]);
        let horizon = points(now, &prices);
        let rec = timing().analyze(now, 0.60, &horizon, 5.0, 0.9);

        assert_eq!(rec.decision, TimingDecision::WaitForPeak);
        assert!(rec.opportunity_cost_pln > 0.0);
        assert!(rec.wait_hours > 0.0);
        assert!(rec.peak_info.is_some());
    }

    #[test]
    fn no_opportunity_on_cheap_prices_without_peak() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 3, 0, 0).unwrap();
        // Gently drifting cheap prices: no peak worth 15%, nothing high.
        let prices: Vec<f64> = (0..24).map(|i| 0.30 + 0.001 * i as f64).collect();
        let horizon = points(now, &prices);
        let rec = timing().analyze(now, 0.30, &horizon, 5.0, 0.9);
        assert_eq!(rec.decision, TimingDecision::NoOpportunity);
    }

    #[test]
    fn falling_trend_without_peak_sells_now() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 18, 0, 0).unwrap();
        let prices: Vec<f64> = (0..24).map(|i| 0.90 - 0.02 * i as f64).collect();
        let horizon = points(now, &prices);
        let rec = timing().analyze(now, 0.92, &horizon, 5.0, 0.9);
        assert_eq!(rec.decision, TimingDecision::SellNow);
    }

    #[test]
    fn empty_horizon_degrades_to_conservative_sell() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 18, 0, 0).unwrap();
        let rec = timing().analyze(now, 0.80, &[], 5.0, 0.9);
        assert_eq!(rec.decision, TimingDecision::SellNow);
        assert!(rec.confidence <= 0.5);
    }
}
