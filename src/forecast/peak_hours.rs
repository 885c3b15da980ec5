use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

use super::{PeakLabelPoint, PeakLabelSource};
use crate::domain::PeakLabel;

const DEFAULT_BASE_URL: &str = "https://api.raporty.pse.pl/api";

/// Hourly grid-stress labels (Kompas). Wire codes: 0 recommended use,
/// 1 normal, 2 recommended saving, 3 required reduction.
#[derive(Clone)]
pub struct KompasClient {
    base_url: String,
    client: reqwest::Client,
    cache: Arc<RwLock<Option<(DateTime<Utc>, Vec<PeakLabelPoint>)>>>,
    ttl: std::time::Duration,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum KompasResponse {
    Enveloped { value: Vec<KompasEntry> },
    Bare(Vec<KompasEntry>),
}

#[derive(Debug, Deserialize)]
struct KompasEntry {
    time: DateTime<Utc>,
    code: u8,
}

impl KompasClient {
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
}

#[async_trait]
impl PeakLabelSource for KompasClient {
    async fn hourly_labels(&self) -> Result<Vec<PeakLabelPoint>> {
        {
            let cache = self.cache.read().await;
            if let Some((fetched_at, labels)) = &*cache {
                if (Utc::now() - *fetched_at).num_seconds() < self.ttl.as_secs() as i64 {
                    return Ok(labels.clone());
                }
            }
        }

        let url = format!("{}/kompas", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("peak-hours GET failed")?;
        let status = resp.status();
        let body = resp.text().await.context("peak-hours body read failed")?;
        if !status.is_success() {
            anyhow::bail!("peak-hours API error: HTTP {status}");
        }

        let parsed: KompasResponse =
            serde_json::from_str(&body).context("peak-hours JSON parse failed")?;
        let entries = match parsed {
            KompasResponse::Enveloped { value } => value,
            KompasResponse::Bare(entries) => entries,
        };

        let mut labels = Vec::with_capacity(entries.len());
        for entry in entries {
            match PeakLabel::from_code(entry.code) {
                Some(label) => labels.push(PeakLabelPoint {
                    time: entry.time,
                    label,
                }),
                None => warn!(code = entry.code, time = %entry.time, "unknown peak-hour code"),
            }
        }
        labels.sort_by_key(|p| p.time);

        let mut cache = self.cache.write().await;
        *cache = Some((Utc::now(), labels.clone()));
        Ok(labels)
    }
}
