use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use chrono_tz::Europe::Warsaw;

use crate::config::{TariffConfig, TariffType};
use crate::domain::PeakLabel;

/// Converts wholesale market prices into final retail prices.
///
/// This is the single source of truth for "current price": both the decision
/// and the selling engine consume prices produced here, so the two paths can
/// never disagree for the same input.
#[derive(Debug, Clone)]
pub struct Tariff {
    cfg: TariffConfig,
}

impl Tariff {
    pub fn new(cfg: TariffConfig) -> Self {
        Self { cfg }
    }

    pub fn tariff_type(&self) -> TariffType {
        self.cfg.tariff_type
    }

    /// Final retail price in PLN/kWh for a market price in PLN/MWh.
    ///
    /// G14-dynamic consumes the peak label for the hour; the feed's presence
    /// is enforced at boot, so a missing label here (a gap in the feed) falls
    /// back to the normal-hour component.
    pub fn final_price_pln_kwh(
        &self,
        time: DateTime<Utc>,
        market_price_pln_mwh: f64,
        peak_label: Option<PeakLabel>,
    ) -> f64 {
        let energy = market_price_pln_mwh / 1000.0;
        energy + self.component_pln_kwh(time, peak_label)
    }

    fn component_pln_kwh(&self, time: DateTime<Utc>, peak_label: Option<PeakLabel>) -> f64 {
        match self.cfg.tariff_type {
            TariffType::Flat => self.cfg.sc_component_pln_kwh,
            TariffType::G12w => {
                if Self::is_g12w_night_zone(time) {
                    self.cfg.sc_component_pln_kwh
                } else {
                    self.cfg.g12w_day_component_pln_kwh
                }
            }
            TariffType::G14dynamic => {
                let multiplier = match peak_label.unwrap_or(PeakLabel::Normal) {
                    PeakLabel::Normal => 1.0,
                    PeakLabel::RecommendedSaving => 2.0,
                    PeakLabel::RequiredReduction => 4.0,
                    // Operator invites consumption in these hours.
                    PeakLabel::RecommendedUse => 0.5,
                };
                self.cfg.g14_base_component_pln_kwh * multiplier
            }
        }
    }

    /// G12W night zones in local (Warsaw) time: 22:00–06:00, 13:00–15:00,
    /// and all weekend hours.
    fn is_g12w_night_zone(time: DateTime<Utc>) -> bool {
        let local = time.with_timezone(&Warsaw);
        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return true;
        }
        let hour = local.hour();
        hour >= 22 || hour < 6 || (13..15).contains(&hour)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tariff(tariff_type: TariffType) -> Tariff {
        Tariff::new(TariffConfig {
            tariff_type,
            sc_component_pln_kwh: 0.0892,
            g12w_day_component_pln_kwh: 0.3566,
            g14_base_component_pln_kwh: 0.0892,
        })
    }

    #[test]
    fn flat_adds_sc_component() {
        let t = tariff(TariffType::Flat);
        let time = Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap();
        let price = t.final_price_pln_kwh(time, 400.0, None);
        assert!((price - 0.4892).abs() < 1e-9);
    }

    #[test]
    fn g12w_day_and_night_zones() {
        let t = tariff(TariffType::G12w);
        // Monday 10:00 UTC = 12:00 Warsaw in summer: day zone.
        let day = Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap();
        assert!((t.final_price_pln_kwh(day, 400.0, None) - (0.4 + 0.3566)).abs() < 1e-9);
        // Monday 21:30 UTC = 23:30 Warsaw: night zone.
        let night = Utc.with_ymd_and_hms(2025, 6, 2, 21, 30, 0).unwrap();
        assert!((t.final_price_pln_kwh(night, 400.0, None) - (0.4 + 0.0892)).abs() < 1e-9);
        // Midday valley 13:30 Warsaw counts as night zone.
        let valley = Utc.with_ymd_and_hms(2025, 6, 2, 11, 30, 0).unwrap();
        assert!((t.final_price_pln_kwh(valley, 400.0, None) - (0.4 + 0.0892)).abs() < 1e-9);
        // Saturday midday: night zone all weekend.
        let weekend = Utc.with_ymd_and_hms(2025, 6, 7, 10, 0, 0).unwrap();
        assert!((t.final_price_pln_kwh(weekend, 400.0, None) - (0.4 + 0.0892)).abs() < 1e-9);
    }

    #[test]
    fn g14_scales_component_by_peak_label() {
        let t = tariff(TariffType::G14dynamic);
        let time = Utc.with_ymd_and_hms(2025, 6, 2, 17, 0, 0).unwrap();
        let normal = t.final_price_pln_kwh(time, 400.0, Some(PeakLabel::Normal));
        let saving = t.final_price_pln_kwh(time, 400.0, Some(PeakLabel::RecommendedSaving));
        let reduction = t.final_price_pln_kwh(time, 400.0, Some(PeakLabel::RequiredReduction));
        let use_more = t.final_price_pln_kwh(time, 400.0, Some(PeakLabel::RecommendedUse));

        assert!((normal - (0.4 + 0.0892)).abs() < 1e-9);
        assert!((saving - (0.4 + 0.1784)).abs() < 1e-9);
        assert!((reduction - (0.4 + 0.3568)).abs() < 1e-9);
        assert!((use_more - (0.4 + 0.0446)).abs() < 1e-9);
    }

    #[test]
    fn g14_missing_label_falls_back_to_normal() {
        let t = tariff(TariffType::G14dynamic);
        let time = Utc.with_ymd_and_hms(2025, 6, 2, 17, 0, 0).unwrap();
        assert_eq!(
            t.final_price_pln_kwh(time, 400.0, None),
            t.final_price_pln_kwh(time, 400.0, Some(PeakLabel::Normal))
        );
    }
}
