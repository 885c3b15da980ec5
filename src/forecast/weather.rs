use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{WeatherForecast, WeatherHour, WeatherSource};

const DEFAULT_BASE_URL: &str = "https://api.open-meteo.com/v1";

/// Open-Meteo hourly forecast client (cloud cover + shortwave radiation).
#[derive(Clone)]
pub struct OpenMeteoClient {
    base_url: String,
    latitude: f64,
    longitude: f64,
    client: reqwest::Client,
    cache: Arc<RwLock<Option<WeatherForecast>>>,
    ttl: std::time::Duration,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoResponse {
    hourly: OpenMeteoHourly,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoHourly {
    time: Vec<String>,
    #[serde(default)]
    cloud_cover: Vec<Option<f64>>,
    #[serde(default)]
    shortwave_radiation: Vec<Option<f64>>,
}

impl OpenMeteoClient {
    pub fn new(latitude: f64, longitude: f64, ttl: std::time::Duration) -> Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL.to_string(), latitude, longitude, ttl)
    }

    pub fn with_base_url(
        base_url: String,
        latitude: f64,
        longitude: f64,
        ttl: std::time::Duration,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("pv-edge-coordinator/0.3"));
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .default_headers(headers)
            .build()?;
        Ok(Self {
            base_url,
            latitude,
            longitude,
            client,
            cache: Arc::new(RwLock::new(None)),
            ttl,
        })
    }

    /// Open-Meteo returns ISO times without a zone suffix; the request pins
    /// `timezone=UTC`.
    fn parse_time(value: &str) -> Result<DateTime<Utc>> {
        let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M")
            .with_context(|| format!("unparseable weather time '{value}'"))?;
        Ok(naive.and_utc())
    }
}

#[async_trait]
impl WeatherSource for OpenMeteoClient {
    async fn forecast(&self) -> Result<WeatherForecast> {
        {
            let cache = self.cache.read().await;
            if let Some(forecast) = &*cache {
                if (Utc::now() - forecast.fetched_at).num_seconds() < self.ttl.as_secs() as i64 {
                    return Ok(forecast.clone());
                }
            }
        }

        let url = format!(
            "{}/forecast?latitude={}&longitude={}&hourly=cloud_cover,shortwave_radiation&forecast_days=2&timezone=UTC",
            self.base_url.trim_end_matches('/'),
            self.latitude,
            self.longitude
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("weather GET failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("weather API error: HTTP {}", resp.status());
        }
        let raw: serde_json::Value = resp.json().await.context("weather JSON parse failed")?;
        let parsed: OpenMeteoResponse =
            serde_json::from_value(raw.clone()).context("unexpected weather payload shape")?;

        let mut hours = Vec::with_capacity(parsed.hourly.time.len());
        for (i, time) in parsed.hourly.time.iter().enumerate() {
            hours.push(WeatherHour {
                time: Self::parse_time(time)?,
                cloud_cover_pct: parsed.hourly.cloud_cover.get(i).copied().flatten(),
                ghi_w_m2: parsed.hourly.shortwave_radiation.get(i).copied().flatten(),
            });
        }

        let forecast = WeatherForecast {
            fetched_at: Utc::now(),
            hours,
            raw,
        };
        let mut cache = self.cache.write().await;
        *cache = Some(forecast.clone());
        Ok(forecast)
    }
}
