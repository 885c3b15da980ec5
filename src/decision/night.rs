use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Europe::Warsaw;

use crate::config::PvConsumptionConfig;
use crate::domain::{PricePoint, PvForecastPoint};
use crate::pricing::windows::{current_percentile, percentile};

/// Night charging must undercut tomorrow's peak by at least this much.
const MIN_ARBITRAGE_MARGIN_PLN_KWH: f64 = 0.05;

/// Night-charging assessment: should the battery be filled overnight to ride
/// through a poor-PV, expensive day tomorrow?
#[derive(Debug, Clone)]
pub struct NightAssessment {
    pub applies: bool,
    pub target_soc_percent: f64,
    pub tomorrow_pv_poor: bool,
    pub pv_forecast_missing: bool,
    pub tomorrow_high_price_hours: u32,
    pub current_price_percentile: u8,
    pub reason: String,
}

impl NightAssessment {
    fn skip(reason: impl Into<String>) -> Self {
        Self {
            applies: false,
            target_soc_percent: 0.0,
            tomorrow_pv_poor: false,
            pv_forecast_missing: false,
            tomorrow_high_price_hours: 0,
            current_price_percentile: 0,
            reason: reason.into(),
        }
    }
}

/// Evaluate the night-charging strategy. Hours are interpreted in local
/// (Warsaw) time, matching the operator's tariff clock.
pub fn assess(
    cfg: &PvConsumptionConfig,
    now: DateTime<Utc>,
    battery_soc: Option<f64>,
    current_final_price: Option<f64>,
    price_points: &[PricePoint],
    pv_forecast: Option<&[PvForecastPoint]>,
) -> NightAssessment {
    if !cfg.night_charging_enabled {
        return NightAssessment::skip("night charging disabled");
    }
    let local = now.with_timezone(&Warsaw);
    if !cfg.night_hours.contains(&local.hour()) {
        return NightAssessment::skip("outside configured night hours");
    }
    // Precondition on the current charge level: a battery already above the
    // threshold does not get topped up overnight at all.
    let Some(soc) = battery_soc else {
        return NightAssessment::skip("no SoC reading available");
    };
    if soc > cfg.min_night_charging_soc {
        return NightAssessment::skip(format!(
            "SoC {soc:.0}% already above night-charging threshold {:.0}%",
            cfg.min_night_charging_soc
        ));
    }
    let Some(current_price) = current_final_price else {
        return NightAssessment::skip("no current price available");
    };
    if price_points.is_empty() {
        return NightAssessment::skip("no price horizon available");
    }

    // Cheap-enough gate: current price must sit at or below the horizon's
    // bottom-quartile price. Quantile values, not count ranks, so plateaus
    // of identical cheap prices still qualify.
    let final_prices: Vec<f64> = price_points.iter().map(|p| p.final_price_pln_kwh).collect();
    let price_rank = current_percentile(&final_prices, current_price);
    let quartile_price = percentile(&final_prices, 25.0).unwrap_or(f64::NEG_INFINITY);
    if current_price > quartile_price {
        return NightAssessment {
            current_price_percentile: price_rank,
            ..NightAssessment::skip(format!(
                "current price not cheap enough for night charging ({price_rank}th percentile)"
            ))
        };
    }
    // Charging tonight must beat tomorrow's prices by a real margin; a flat
    // horizon offers no arbitrage to prepare for.
    let horizon_max = final_prices.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if horizon_max - quartile_price < MIN_ARBITRAGE_MARGIN_PLN_KWH {
        return NightAssessment {
            current_price_percentile: price_rank,
            ..NightAssessment::skip("no price spread across the horizon")
        };
    }

    let tomorrow = (local + chrono::Duration::days(1)).date_naive();

    // Tomorrow's PV outlook; a failed feed is treated as poor when configured.
    let (tomorrow_pv_poor, pv_forecast_missing) = match pv_forecast {
        None => (cfg.assume_poor_pv_on_api_failure, true),
        Some(points) => {
            let tomorrow_kw: Vec<f64> = points
                .iter()
                .filter(|p| p.time_start.with_timezone(&Warsaw).date_naive() == tomorrow)
                .map(|p| p.forecasted_power_kw)
                .collect();
            if tomorrow_kw.is_empty() {
                (cfg.assume_poor_pv_on_api_failure, true)
            } else {
                let avg_kw = tomorrow_kw.iter().sum::<f64>() / tomorrow_kw.len() as f64;
                (avg_kw < cfg.poor_pv_threshold_kwh_per_hour, false)
            }
        }
    };

    // Tomorrow's expensive hours, counted against the horizon-wide
    // high-price percentile.
    let threshold = percentile(&final_prices, cfg.high_price_threshold_percentile * 100.0)
        .unwrap_or(f64::INFINITY);
    let mut expensive_hours: std::collections::BTreeSet<(u32, u32)> = Default::default();
    for point in price_points {
        let point_local = point.time_start.with_timezone(&Warsaw);
        if point_local.date_naive() == tomorrow && point.final_price_pln_kwh >= threshold {
            expensive_hours.insert((point_local.ordinal(), point_local.hour()));
        }
    }
    let tomorrow_high_price_hours = expensive_hours.len() as u32;

    if tomorrow_high_price_hours < 4 {
        return NightAssessment {
            tomorrow_pv_poor,
            pv_forecast_missing,
            tomorrow_high_price_hours,
            current_price_percentile: price_rank,
            ..NightAssessment::skip(format!(
                "tomorrow has only {tomorrow_high_price_hours} expensive hours"
            ))
        };
    }

    let (target, reason) = if tomorrow_pv_poor {
        (
            cfg.night_charging_target_soc_poor_pv,
            format!(
                "night charging: poor PV expected tomorrow{} and {} expensive hours ahead",
                if pv_forecast_missing {
                    " (forecast unavailable, assuming poor)"
                } else {
                    ""
                },
                tomorrow_high_price_hours
            ),
        )
    } else {
        (
            cfg.max_night_charging_soc,
            format!(
                "night charging: {} expensive hours tomorrow, topping up to {:.0}%",
                tomorrow_high_price_hours, cfg.max_night_charging_soc
            ),
        )
    };

    NightAssessment {
        applies: true,
        target_soc_percent: target,
        tomorrow_pv_poor,
        pv_forecast_missing,
        tomorrow_high_price_hours,
        current_price_percentile: price_rank,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    /// 02:00 Warsaw = 00:00 UTC in summer.
    fn night_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
    }

    /// Cheap night, expensive tomorrow evening.
    fn price_horizon(now: DateTime<Utc>) -> Vec<PricePoint> {
        let mut points = Vec::new();
        for hour in 0..36i64 {
            let time = now + chrono::Duration::hours(hour);
            // Hours 18..30 from now land on tomorrow with a high plateau.
            let market = if (18..30).contains(&hour) { 900.0 } else { 150.0 };
            points.push(PricePoint {
                time_start: time,
                market_price_pln_mwh: market,
                final_price_pln_kwh: market / 1000.0 + 0.0892,
            });
        }
        points
    }

    fn poor_pv_tomorrow(now: DateTime<Utc>) -> Vec<PvForecastPoint> {
        (0..36)
            .map(|hour| PvForecastPoint {
                time_start: now + chrono::Duration::hours(hour),
                forecasted_power_kw: 0.2,
                confidence: 0.8,
            })
            .collect()
    }

    #[test]
    fn poor_pv_and_expensive_tomorrow_targets_full_charge() {
        let cfg = PvConsumptionConfig::default();
        let now = night_now();
        let points = price_horizon(now);
        let pv = poor_pv_tomorrow(now);
        let assessment = assess(&cfg, now, Some(25.0), Some(0.239), &points, Some(&pv));
        assert!(assessment.applies, "{}", assessment.reason);
        assert!(assessment.tomorrow_pv_poor);
        assert_eq!(assessment.target_soc_percent, 100.0);
        assert!(assessment.tomorrow_high_price_hours >= 4);
    }

    #[test]
    fn good_pv_caps_target_at_max_night_soc() {
        let cfg = PvConsumptionConfig::default();
        let now = night_now();
        let points = price_horizon(now);
        let pv: Vec<PvForecastPoint> = (0..36)
            .map(|hour| PvForecastPoint {
                time_start: now + chrono::Duration::hours(hour),
                forecasted_power_kw: 3.5,
                confidence: 0.8,
            })
            .collect();
        let assessment = assess(&cfg, now, Some(25.0), Some(0.239), &points, Some(&pv));
        assert!(assessment.applies);
        assert!(!assessment.tomorrow_pv_poor);
        assert_eq!(assessment.target_soc_percent, 80.0);
    }

    #[test]
    fn missing_forecast_assumes_poor_pv() {
        let cfg = PvConsumptionConfig::default();
        let now = night_now();
        let points = price_horizon(now);
        let assessment = assess(&cfg, now, Some(25.0), Some(0.239), &points, None);
        assert!(assessment.applies);
        assert!(assessment.tomorrow_pv_poor);
        assert!(assessment.pv_forecast_missing);
        assert_eq!(assessment.target_soc_percent, 100.0);
    }

    #[test]
    fn soc_above_threshold_skips_night_charging_outright() {
        let cfg = PvConsumptionConfig::default();
        let now = night_now();
        let points = price_horizon(now);
        let pv = poor_pv_tomorrow(now);
        // Poor PV and an expensive tomorrow, but the battery is already at
        // 75%: night charging is refused before any forecast analysis.
        let assessment = assess(&cfg, now, Some(75.0), Some(0.239), &points, Some(&pv));
        assert!(!assessment.applies);
        assert!(assessment.reason.contains("above night-charging threshold"));

        // Exactly at the threshold still qualifies.
        let at_threshold = assess(
            &cfg,
            now,
            Some(cfg.min_night_charging_soc),
            Some(0.239),
            &points,
            Some(&pv),
        );
        assert!(at_threshold.applies, "{}", at_threshold.reason);
    }

    #[test]
    fn missing_soc_reading_skips_night_charging() {
        let cfg = PvConsumptionConfig::default();
        let now = night_now();
        let points = price_horizon(now);
        let assessment = assess(&cfg, now, None, Some(0.239), &points, None);
        assert!(!assessment.applies);
    }

    #[test]
    fn expensive_current_price_blocks_night_charge() {
        let cfg = PvConsumptionConfig::default();
        let now = night_now();
        let points = price_horizon(now);
        let assessment = assess(&cfg, now, Some(25.0), Some(0.989), &points, None);
        assert!(!assessment.applies);
    }

    #[test]
    fn daytime_never_applies() {
        let cfg = PvConsumptionConfig::default();
        // 12:00 Warsaw.
        let noon = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let points = price_horizon(noon);
        let assessment = assess(&cfg, noon, Some(25.0), Some(0.1), &points, None);
        assert!(!assessment.applies);
    }
}
