use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Europe::Warsaw;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use super::{MarketPricePoint, MarketPriceSource};

const DEFAULT_BASE_URL: &str = "https://api.raporty.pse.pl/api";

/// Day-ahead price client for the PSE reports API (`csdac-pln` dataset).
///
/// Entries arrive as `{dtime: "YYYY-MM-DD HH:MM", csdac_pln: number}` with
/// `dtime` in Warsaw local time, marking the interval end.
#[derive(Clone)]
pub struct PsePriceClient {
    base_url: String,
    client: reqwest::Client,
    cache: Arc<RwLock<Option<(DateTime<Utc>, Vec<MarketPricePoint>)>>>,
    ttl: std::time::Duration,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CsdacResponse {
    Enveloped { value: Vec<CsdacEntry> },
    Bare(Vec<CsdacEntry>),
}

#[derive(Debug, Deserialize)]
struct CsdacEntry {
    dtime: String,
    csdac_pln: f64,
}

impl PsePriceClient {
    pub fn new(ttl: std::time::Duration) -> Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL.to_string(), ttl)
    }

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

    fn url_for(&self, day: chrono::NaiveDate) -> String {
        format!(
            "{}/csdac-pln?$filter=business_date eq '{}'",
            self.base_url.trim_end_matches('/'),
            day.format("%Y-%m-%d")
        )
    }

    /// `"2025-06-01 14:15"` in Warsaw local time, interval end → UTC interval
    /// start (one quarter-hour earlier).
    fn parse_dtime(dtime: &str) -> Result<DateTime<Utc>> {
        let naive = NaiveDateTime::parse_from_str(dtime.trim(), "%Y-%m-%d %H:%M")
            .with_context(|| format!("unparseable dtime '{dtime}'"))?;
        let local = Warsaw
            .from_local_datetime(&naive)
            .earliest()
            .with_context(|| format!("ambiguous local time '{dtime}'"))?;
        Ok(local.with_timezone(&Utc) - Duration::minutes(15))
    }

    async fn fetch_day(&self, day: chrono::NaiveDate) -> Result<Vec<MarketPricePoint>> {
        let url = self.url_for(day);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("price GET failed")?;
        let status = resp.status();
        let body = resp.text().await.context("price body read failed")?;
        if !status.is_success() {
            anyhow::bail!("price API error: HTTP {status}");
        }

        let parsed: CsdacResponse =
            serde_json::from_str(&body).context("price JSON parse failed")?;
        let entries = match parsed {
            CsdacResponse::Enveloped { value } => value,
            CsdacResponse::Bare(entries) => entries,
        };

        let mut points = Vec::with_capacity(entries.len());
        for entry in entries {
            points.push(MarketPricePoint {
                time_start: Self::parse_dtime(&entry.dtime)?,
                price_pln_mwh: entry.csdac_pln,
            });
        }
        points.sort_by_key(|p| p.time_start);
        Ok(points)
    }
}

#[async_trait]
impl MarketPriceSource for PsePriceClient {
    async fn day_ahead_prices(&self) -> Result<Vec<MarketPricePoint>> {
        {
            let cache = self.cache.read().await;
            if let Some((fetched_at, points)) = &*cache {
                if (Utc::now() - *fetched_at).num_seconds() < self.ttl.as_secs() as i64 {
                    return Ok(points.clone());
                }
            }
        }

        let today = Utc::now().with_timezone(&Warsaw).date_naive();
        let mut points = self.fetch_day(today).await?;
        // Tomorrow's curve publishes in the afternoon; its absence is normal.
        match self.fetch_day(today + Duration::days(1)).await {
            Ok(tomorrow) => points.extend(tomorrow),
            Err(e) => debug!(error=%e, "tomorrow's day-ahead prices not yet available"),
        }
        points.sort_by_key(|p| p.time_start);
        points.dedup_by_key(|p| p.time_start);

        let mut cache = self.cache.write().await;
        *cache = Some((Utc::now(), points.clone()));
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtime_parses_as_warsaw_interval_end() {
        // 14:15 CEST = 12:15 UTC; interval start is 12:00 UTC.
        let parsed = PsePriceClient::parse_dtime("2025-06-01 14:15").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn invalid_dtime_is_an_error() {
        assert!(PsePriceClient::parse_dtime("June 1st").is_err());
    }

    #[tokio::test]
    async fn parses_enveloped_payload() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [
                    {"dtime": "2025-06-01 00:15", "csdac_pln": 310.5},
                    {"dtime": "2025-06-01 00:30", "csdac_pln": 295.0}
                ]
            })))
            .mount(&server)
            .await;

        let client = PsePriceClient::with_base_url(
            server.uri(),
            std::time::Duration::from_secs(3600),
        )
        .unwrap();
        let points = client.day_ahead_prices().await.unwrap();
        // Both mock days resolve to the same two entries; dedup leaves two.
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].price_pln_mwh, 310.5);
        assert!(points[0].time_start < points[1].time_start);
    }

    #[tokio::test]
    async fn server_error_surfaces_as_unavailable() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = PsePriceClient::with_base_url(
            server.uri(),
            std::time::Duration::from_secs(3600),
        )
        .unwrap();
        assert!(client.day_ahead_prices().await.is_err());
    }
}
