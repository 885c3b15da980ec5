use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One 15-minute day-ahead market interval with its derived retail price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricePoint {
    pub time_start: DateTime<Utc>,
    /// Wholesale clearing price as published (PLN/MWh).
    pub market_price_pln_mwh: f64,
    /// Retail price after tariff components (PLN/kWh).
    pub final_price_pln_kwh: f64,
}

/// Discrete price classification. Ordering is by expensiveness, so the
/// classifier can be checked for monotonicity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    strum_macros::Display, strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PriceBand {
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl PriceBand {
    /// Weight used when ranking charging windows; cheap bands are worth more.
    pub fn savings_weight(self) -> f64 {
        match self {
            PriceBand::VeryLow => 1.5,
            PriceBand::Low => 1.2,
            PriceBand::Medium => 1.0,
            PriceBand::High => 0.8,
            PriceBand::VeryHigh => 0.5,
        }
    }
}

/// Maximal contiguous run of price points sharing a band.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_hours: f64,
    pub band: PriceBand,
    pub avg_price_pln_mwh: f64,
    pub min_price_pln_mwh: f64,
    pub max_price_pln_mwh: f64,
    pub savings_potential_pln: f64,
}

impl PriceWindow {
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }

    /// Window duration still ahead of `now`, in hours.
    pub fn remaining_hours(&self, now: DateTime<Utc>) -> f64 {
        if now >= self.end {
            return 0.0;
        }
        let from = if now > self.start { now } else { self.start };
        (self.end - from).num_seconds() as f64 / 3600.0
    }
}

/// Grid operator's coarse hourly stress signal (Kompas).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
    strum_macros::Display, strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PeakLabel {
    RecommendedUse,
    Normal,
    RecommendedSaving,
    RequiredReduction,
}

impl PeakLabel {
    /// Wire codes 0..=3 as published by the operator.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(PeakLabel::RecommendedUse),
            1 => Some(PeakLabel::Normal),
            2 => Some(PeakLabel::RecommendedSaving),
            3 => Some(PeakLabel::RequiredReduction),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            PeakLabel::RecommendedUse => 0,
            PeakLabel::Normal => 1,
            PeakLabel::RecommendedSaving => 2,
            PeakLabel::RequiredReduction => 3,
        }
    }
}

/// One PV production forecast interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PvForecastPoint {
    pub time_start: DateTime<Utc>,
    pub forecasted_power_kw: f64,
    /// 0.0..=1.0
    pub confidence: f64,
}

impl fmt::Display for PriceWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} window {} .. {} ({:.2}h, avg {:.1} PLN/MWh)",
            self.band,
            self.start.format("%H:%M"),
            self.end.format("%H:%M"),
            self.duration_hours,
            self.avg_price_pln_mwh
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn band_ordering_tracks_expensiveness() {
        assert!(PriceBand::VeryLow < PriceBand::Low);
        assert!(PriceBand::Low < PriceBand::Medium);
        assert!(PriceBand::Medium < PriceBand::High);
        assert!(PriceBand::High < PriceBand::VeryHigh);
    }

    #[test]
    fn peak_label_codes_round_trip() {
        for code in 0..=3u8 {
            let label = PeakLabel::from_code(code).unwrap();
            assert_eq!(label.code(), code);
        }
        assert!(PeakLabel::from_code(4).is_none());
    }

    #[test]
    fn remaining_hours_clamps_to_window() {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let window = PriceWindow {
            start,
            end: start + chrono::Duration::hours(2),
            duration_hours: 2.0,
            band: PriceBand::Low,
            avg_price_pln_mwh: 200.0,
            min_price_pln_mwh: 180.0,
            max_price_pln_mwh: 220.0,
            savings_potential_pln: 100.0,
        };
        assert_eq!(window.remaining_hours(start), 2.0);
        assert_eq!(
            window.remaining_hours(start + chrono::Duration::minutes(90)),
            0.5
        );
        assert_eq!(window.remaining_hours(start + chrono::Duration::hours(3)), 0.0);
    }
}
