use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{PvForecastSource, WeatherForecast};
use crate::domain::PvForecastPoint;

/// HTTP PV production forecast:
/// `[{time_start, forecasted_power_kw, confidence?}, ...]`.
#[derive(Clone)]
pub struct PvForecastClient {
    base_url: String,
    client: reqwest::Client,
    cache: Arc<RwLock<Option<(DateTime<Utc>, Vec<PvForecastPoint>)>>>,
    ttl: std::time::Duration,
}

#[derive(Debug, Deserialize)]
struct RawPvPoint {
    time_start: DateTime<Utc>,
    forecasted_power_kw: f64,
    confidence: Option<f64>,
}

impl PvForecastClient {
    pub fn with_base_url(base_url: String, ttl: std::time::Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("pv-edge-coordinator/0.3"));
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .default_headers(headers)
            .build()?;
        Ok(Self {
            base_url,
            client,
            cache: Arc::new(RwLock::new(None)),
            ttl,
        })
    }
}

#[async_trait]
impl PvForecastSource for PvForecastClient {
    async fn forecast(&self) -> Result<Vec<PvForecastPoint>> {
        {
            let cache = self.cache.read().await;
            if let Some((fetched_at, points)) = &*cache {
                if (Utc::now() - *fetched_at).num_seconds() < self.ttl.as_secs() as i64 {
                    return Ok(points.clone());
                }
            }
        }

        let url = format!("{}/forecast", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("PV forecast GET failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("PV forecast API error: HTTP {}", resp.status());
        }
        let raw: Vec<RawPvPoint> = resp.json().await.context("PV forecast JSON parse failed")?;

        let mut points: Vec<PvForecastPoint> = raw
            .into_iter()
            .map(|r| PvForecastPoint {
                time_start: r.time_start,
                forecasted_power_kw: r.forecasted_power_kw.max(0.0),
                confidence: r.confidence.unwrap_or(0.7).clamp(0.0, 1.0),
            })
            .collect();
        points.sort_by_key(|p| p.time_start);

        let mut cache = self.cache.write().await;
        *cache = Some((Utc::now(), points.clone()));
        Ok(points)
    }
}

/// Derives a PV forecast from weather data when no dedicated PV feed is
/// configured. Power scales with global horizontal irradiance, derated by
/// cloud cover; confidence is lower than a dedicated forecast.
pub struct WeatherDerivedPvForecaster {
    pub panel_capacity_kw: f64,
}

/// `PvForecastSource` backed by a weather feed.
pub struct WeatherPvSource {
    weather: std::sync::Arc<dyn super::WeatherSource>,
    forecaster: WeatherDerivedPvForecaster,
}

impl WeatherPvSource {
    pub fn new(weather: std::sync::Arc<dyn super::WeatherSource>, panel_capacity_kw: f64) -> Self {
        Self {
            weather,
            forecaster: WeatherDerivedPvForecaster { panel_capacity_kw },
        }
    }
}

#[async_trait]
impl PvForecastSource for WeatherPvSource {
    async fn forecast(&self) -> Result<Vec<PvForecastPoint>> {
        let weather = self.weather.forecast().await?;
        Ok(self.forecaster.derive(&weather))
    }
}

impl WeatherDerivedPvForecaster {
    /// Irradiance of roughly 1000 W/m² yields nameplate output.
    pub fn derive(&self, weather: &WeatherForecast) -> Vec<PvForecastPoint> {
        weather
            .hours
            .iter()
            .map(|hour| {
                let ghi = hour.ghi_w_m2.unwrap_or(0.0).max(0.0);
                let cloud_derate = match hour.cloud_cover_pct {
                    Some(pct) => 1.0 - (pct.clamp(0.0, 100.0) / 100.0) * 0.4,
                    None => 1.0,
                };
                PvForecastPoint {
                    time_start: hour.time,
                    forecasted_power_kw: (ghi / 1000.0 * self.panel_capacity_kw * cloud_derate)
                        .max(0.0),
                    confidence: 0.5,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forecast::WeatherHour;
    use chrono::TimeZone;

    #[tokio::test]
    async fn forecast_parses_and_clamps() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"time_start": "2025-06-01T10:00:00Z", "forecasted_power_kw": 4.2, "confidence": 0.9},
                {"time_start": "2025-06-01T11:00:00Z", "forecasted_power_kw": -1.0}
            ])))
            .mount(&server)
            .await;

        let client = PvForecastClient::with_base_url(
            server.uri(),
            std::time::Duration::from_secs(3600),
        )
        .unwrap();
        let points = client.forecast().await.unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].confidence, 0.9);
        assert_eq!(points[1].forecasted_power_kw, 0.0, "negative power clamped");
        assert_eq!(points[1].confidence, 0.7, "default confidence");
    }

    #[test]
    fn weather_derivation_scales_with_irradiance() {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let weather = WeatherForecast {
            fetched_at: t0,
            hours: vec![
                WeatherHour {
                    time: t0,
                    cloud_cover_pct: Some(0.0),
                    ghi_w_m2: Some(1000.0),
                },
                WeatherHour {
                    time: t0 + chrono::Duration::hours(1),
                    cloud_cover_pct: Some(100.0),
                    ghi_w_m2: Some(500.0),
                },
                WeatherHour {
                    time: t0 + chrono::Duration::hours(2),
                    cloud_cover_pct: None,
                    ghi_w_m2: None,
                },
            ],
            raw: serde_json::Value::Null,
        };
        let forecaster = WeatherDerivedPvForecaster {
            panel_capacity_kw: 10.0,
        };
        let points = forecaster.derive(&weather);
        assert!((points[0].forecasted_power_kw - 10.0).abs() < 1e-9);
        assert!((points[1].forecasted_power_kw - 3.0).abs() < 1e-9);
        assert_eq!(points[2].forecasted_power_kw, 0.0);
    }
}
