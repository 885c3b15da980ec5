use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::config::PriceAnalysisConfig;
use crate::domain::{PriceBand, PricePoint, PriceWindow};

/// Overall price movement across a horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PriceTrend {
    Rising,
    Falling,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Volatility {
    Low,
    Medium,
    High,
}

/// Percentile summary of a price horizon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceStats {
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub volatility: Volatility,
    pub trend: PriceTrend,
}

/// Classifies prices into bands and detects contiguous windows.
#[derive(Debug, Clone)]
pub struct PriceAnalyzer {
    cfg: PriceAnalysisConfig,
}

impl PriceAnalyzer {
    pub fn new(cfg: PriceAnalysisConfig) -> Self {
        Self { cfg }
    }

    pub fn min_charging_duration_hours(&self) -> f64 {
        self.cfg.min_charging_duration_hours
    }

    /// Monotone classification of a market price (PLN/MWh) into a band.
    pub fn classify(&self, market_price_pln_mwh: f64) -> PriceBand {
        if market_price_pln_mwh <= self.cfg.very_low_price_threshold {
            PriceBand::VeryLow
        } else if market_price_pln_mwh <= self.cfg.low_price_threshold {
            PriceBand::Low
        } else if market_price_pln_mwh <= self.cfg.medium_price_threshold {
            PriceBand::Medium
        } else if market_price_pln_mwh <= self.cfg.high_price_threshold {
            PriceBand::High
        } else {
            PriceBand::VeryHigh
        }
    }

    /// All maximal same-band windows over the points, in time order.
    ///
    /// Runs separated by a feed gap of at most `max_gap_minutes` merge when
    /// they share a band. No two adjacent windows share a band.
    pub fn find_windows(&self, points: &[PricePoint]) -> Vec<PriceWindow> {
        if points.is_empty() {
            return Vec::new();
        }
        let mut sorted: Vec<&PricePoint> = points.iter().collect();
        sorted.sort_by_key(|p| p.time_start);
        let interval = Self::interval_of(&sorted);
        let max_gap = Duration::minutes(self.cfg.max_gap_minutes);

        let mut windows = Vec::new();
        let mut run: Vec<&PricePoint> = vec![sorted[0]];
        let mut run_band = self.classify(sorted[0].market_price_pln_mwh);

        for point in &sorted[1..] {
            let band = self.classify(point.market_price_pln_mwh);
            let prev_end = run.last().map(|p| p.time_start + interval)
                .unwrap_or(point.time_start);
            let gap = point.time_start - prev_end;
            if band == run_band && gap <= max_gap {
                run.push(point);
            } else {
                windows.push(self.build_window(&run, run_band, interval));
                run = vec![point];
                run_band = band;
            }
        }
        windows.push(self.build_window(&run, run_band, interval));
        windows
    }

    /// Charge candidates: band at most `Low`, long enough to matter, ranked
    /// by savings potential (desc) then start (asc).
    pub fn charging_windows(&self, points: &[PricePoint]) -> Vec<PriceWindow> {
        let mut windows: Vec<PriceWindow> = self
            .find_windows(points)
            .into_iter()
            .filter(|w| {
                w.band <= PriceBand::Low
                    && w.duration_hours >= self.cfg.min_charging_duration_hours
            })
            .collect();
        windows.sort_by(|a, b| {
            b.savings_potential_pln
                .partial_cmp(&a.savings_potential_pln)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.start.cmp(&b.start))
        });
        windows
    }

    /// Sell candidates: band at least `High`, ranked by average price (desc)
    /// then start (asc).
    pub fn selling_windows(&self, points: &[PricePoint]) -> Vec<PriceWindow> {
        let mut windows: Vec<PriceWindow> = self
            .find_windows(points)
            .into_iter()
            .filter(|w| {
                w.band >= PriceBand::High
                    && w.duration_hours >= self.cfg.min_charging_duration_hours
            })
            .collect();
        windows.sort_by(|a, b| {
            b.avg_price_pln_mwh
                .partial_cmp(&a.avg_price_pln_mwh)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.start.cmp(&b.start))
        });
        windows
    }

    pub fn window_at(&self, points: &[PricePoint], at: DateTime<Utc>) -> Option<PriceWindow> {
        self.find_windows(points).into_iter().find(|w| w.contains(at))
    }

    fn build_window(
        &self,
        run: &[&PricePoint],
        band: PriceBand,
        interval: Duration,
    ) -> PriceWindow {
        let prices: Vec<f64> = run.iter().map(|p| p.market_price_pln_mwh).collect();
        let start = run[0].time_start;
        let end = run[run.len() - 1].time_start + interval;
        let duration_hours = (end - start).num_seconds() as f64 / 3600.0;
        let avg = prices.iter().sum::<f64>() / prices.len() as f64;
        let (min, max) = prices
            .iter()
            .cloned()
            .minmax_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .into_option()
            .unwrap_or((avg, avg));

        let savings_per_mwh = (self.cfg.reference_price_pln_mwh - avg).max(0.0);
        // Longer windows are worth more, capped at two hours.
        let duration_weight = (duration_hours / 2.0).min(1.0);
        let savings_potential_pln = savings_per_mwh * duration_weight * band.savings_weight();

        PriceWindow {
            start,
            end,
            duration_hours,
            band,
            avg_price_pln_mwh: avg,
            min_price_pln_mwh: min,
            max_price_pln_mwh: max,
            savings_potential_pln,
        }
    }

    /// Market interval inferred from the feed; day-ahead data is quarter-hourly.
    fn interval_of(sorted: &[&PricePoint]) -> Duration {
        sorted
            .windows(2)
            .map(|pair| pair[1].time_start - pair[0].time_start)
            .filter(|d| *d > Duration::zero())
            .min()
            .unwrap_or_else(|| Duration::minutes(15))
    }
}

/// p-th percentile (0–100) of final prices, nearest-rank.
pub fn percentile(prices: &[f64], p: f64) -> Option<f64> {
    if prices.is_empty() {
        return None;
    }
    let mut sorted = prices.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted.get(rank.min(sorted.len() - 1)).copied()
}

/// Count-based rank of `price` within `prices`, as an integer percent 1–100.
pub fn current_percentile(prices: &[f64], price: f64) -> u8 {
    if prices.is_empty() {
        return 50;
    }
    let below_or_equal = prices.iter().filter(|p| **p <= price).count();
    let rank = (below_or_equal as f64 / prices.len() as f64 * 100.0).round() as i64;
    rank.clamp(1, 100) as u8
}

/// Slope of a least-squares fit over (hours, price) pairs, normalized by the
/// mean price so thresholds are unit-free.
pub fn normalized_slope(series: &[(f64, f64)]) -> f64 {
    if series.len() < 2 {
        return 0.0;
    }
    let n = series.len() as f64;
    let mean_x = series.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = series.iter().map(|(_, y)| y).sum::<f64>() / n;
    let numerator: f64 = series
        .iter()
        .map(|(x, y)| (x - mean_x) * (y - mean_y))
        .sum();
    let denominator: f64 = series.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
    if denominator == 0.0 || mean_y.abs() < f64::EPSILON {
        return 0.0;
    }
    (numerator / denominator) / mean_y
}

impl PriceAnalyzer {
    /// Summary statistics over the horizon's final prices.
    pub fn stats(&self, points: &[PricePoint]) -> Option<PriceStats> {
        if points.is_empty() {
            return None;
        }
        let prices: Vec<f64> = points.iter().map(|p| p.final_price_pln_kwh).collect();
        let n = prices.len() as f64;
        let mean = prices.iter().sum::<f64>() / n;
        let median = percentile(&prices, 50.0)?;
        let min = prices.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = prices.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

        let variance = prices.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / n;
        let relative_stddev = if mean.abs() > f64::EPSILON {
            variance.sqrt() / mean
        } else {
            0.0
        };
        let volatility = if relative_stddev < 0.1 {
            Volatility::Low
        } else if relative_stddev < 0.3 {
            Volatility::Medium
        } else {
            Volatility::High
        };

        let origin = points[0].time_start;
        let series: Vec<(f64, f64)> = points
            .iter()
            .map(|p| {
                (
                    (p.time_start - origin).num_seconds() as f64 / 3600.0,
                    p.final_price_pln_kwh,
                )
            })
            .collect();
        let slope = normalized_slope(&series);
        let trend = if slope > 0.02 {
            PriceTrend::Rising
        } else if slope < -0.02 {
            PriceTrend::Falling
        } else {
            PriceTrend::Stable
        };

        Some(PriceStats {
            mean,
            median,
            min,
            max,
            volatility,
            trend,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn analyzer() -> PriceAnalyzer {
        PriceAnalyzer::new(PriceAnalysisConfig::default())
    }

    fn points_from(prices: &[f64]) -> Vec<PricePoint> {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        prices
            .iter()
            .enumerate()
            .map(|(i, price)| PricePoint {
                time_start: t0 + Duration::minutes(15 * i as i64),
                market_price_pln_mwh: *price,
                final_price_pln_kwh: price / 1000.0 + 0.0892,
            })
            .collect()
    }

    #[test]
    fn classification_is_monotone_at_boundaries() {
        let a = analyzer();
        assert_eq!(a.classify(150.0), PriceBand::VeryLow);
        assert_eq!(a.classify(150.01), PriceBand::Low);
        assert_eq!(a.classify(250.0), PriceBand::Low);
        assert_eq!(a.classify(400.0), PriceBand::Medium);
        assert_eq!(a.classify(600.0), PriceBand::High);
        assert_eq!(a.classify(600.01), PriceBand::VeryHigh);
    }

    #[test]
    fn adjacent_windows_never_share_a_band() {
        let a = analyzer();
        let points = points_from(&[100.0, 120.0, 300.0, 320.0, 100.0, 90.0, 700.0]);
        let windows = a.find_windows(&points);
        assert!(windows.len() >= 3);
        for pair in windows.windows(2) {
            assert_ne!(pair[0].band, pair[1].band);
        }
    }

    #[test]
    fn windows_cover_the_input_span() {
        let a = analyzer();
        let points = points_from(&[100.0, 120.0, 300.0, 320.0, 100.0]);
        let windows = a.find_windows(&points);
        let total: f64 = windows.iter().map(|w| w.duration_hours).sum();
        // 5 quarter-hour points = 1.25 h.
        assert!((total - 1.25).abs() < 1e-9);
        assert_eq!(windows.first().unwrap().start, points[0].time_start);
    }

    #[test]
    fn short_windows_are_dropped_for_charging() {
        let mut cfg = PriceAnalysisConfig::default();
        cfg.min_charging_duration_hours = 1.0;
        let a = PriceAnalyzer::new(cfg);
        // One cheap quarter-hour between expensive runs.
        let points = points_from(&[500.0, 100.0, 500.0, 500.0, 500.0]);
        assert!(a.charging_windows(&points).is_empty());
    }

    #[test]
    fn runs_merge_across_small_feed_gaps() {
        let a = analyzer();
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let mut points = points_from(&[100.0, 110.0]);
        // Gap of 30 minutes (two missing intervals), same band after.
        points.push(PricePoint {
            time_start: t0 + Duration::minutes(75),
            market_price_pln_mwh: 105.0,
            final_price_pln_kwh: 0.194,
        });
        let windows = a.find_windows(&points);
        assert_eq!(windows.len(), 1, "same-band runs bridge the gap");
    }

    #[test]
    fn charging_windows_rank_by_savings_then_start() {
        let a = analyzer();
        // Two cheap windows: the deeper one ranks first despite starting later.
        let points = points_from(&[
            240.0, 240.0, 240.0, 240.0, // low band, 1 h
            500.0, 500.0, // separator
            80.0, 80.0, 80.0, 80.0, // very low band, 1 h
        ]);
        let windows = a.charging_windows(&points);
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].band, PriceBand::VeryLow);
        assert!(windows[0].savings_potential_pln > windows[1].savings_potential_pln);
    }

    #[test]
    fn current_percentile_is_count_based() {
        let prices = vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0];
        assert_eq!(current_percentile(&prices, 1.0), 100);
        assert_eq!(current_percentile(&prices, 0.1), 10);
        assert_eq!(current_percentile(&prices, 0.05), 1);
        assert_eq!(current_percentile(&prices, 0.55), 50);
    }

    #[test]
    fn stats_detect_rising_trend_and_volatility() {
        let points = points_from(&[100.0, 200.0, 300.0, 400.0, 500.0, 600.0, 700.0, 800.0]);
        let stats = analyzer().stats(&points).unwrap();
        assert_eq!(stats.trend, PriceTrend::Rising);
        assert_eq!(stats.volatility, Volatility::High);
        assert!(stats.max > stats.min);
    }

    #[test]
    fn flat_prices_are_stable_and_quiet() {
        let points = points_from(&[400.0; 8]);
        let stats = analyzer().stats(&points).unwrap();
        assert_eq!(stats.trend, PriceTrend::Stable);
        assert_eq!(stats.volatility, Volatility::Low);
    }
}
