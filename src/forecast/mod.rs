pub mod peak_hours;
pub mod prices;
pub mod pv;
pub mod weather;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{PeakLabel, PvForecastPoint};

/// One raw day-ahead market interval, before tariff conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketPricePoint {
    pub time_start: DateTime<Utc>,
    pub price_pln_mwh: f64,
}

/// One hourly operator label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeakLabelPoint {
    pub time: DateTime<Utc>,
    pub label: PeakLabel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherHour {
    pub time: DateTime<Utc>,
    pub cloud_cover_pct: Option<f64>,
    pub ghi_w_m2: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherForecast {
    pub fetched_at: DateTime<Utc>,
    pub hours: Vec<WeatherHour>,
    /// Raw provider payload, persisted for diagnostics.
    pub raw: serde_json::Value,
}

/// Day-ahead market prices. Errors mean "feed unavailable"; the coordinator
/// continues on conservative rules rather than halting.
#[async_trait]
pub trait MarketPriceSource: Send + Sync {
    async fn day_ahead_prices(&self) -> Result<Vec<MarketPricePoint>>;
}

/// Grid operator peak-hour labels (Kompas).
#[async_trait]
pub trait PeakLabelSource: Send + Sync {
    async fn hourly_labels(&self) -> Result<Vec<PeakLabelPoint>>;
}

/// PV production forecast for the next horizon.
#[async_trait]
pub trait PvForecastSource: Send + Sync {
    async fn forecast(&self) -> Result<Vec<PvForecastPoint>>;
}

#[async_trait]
pub trait WeatherSource: Send + Sync {
    async fn forecast(&self) -> Result<WeatherForecast>;
}

/// Label in effect for a given instant, if any.
pub fn label_at(labels: &[PeakLabelPoint], at: DateTime<Utc>) -> Option<PeakLabel> {
    labels
        .iter()
        .filter(|p| p.time <= at && at < p.time + chrono::Duration::hours(1))
        .map(|p| p.label)
        .next_back()
}
