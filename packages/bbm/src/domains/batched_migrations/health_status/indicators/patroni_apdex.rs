//! Stops migrations while the database service apdex is below its SLO.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::domains::batched_migrations::health_status::{HealthContext, HealthIndicator, Signal};

#[derive(Debug, Deserialize)]
struct PrometheusResponse {
    status: String,
    data: Option<PrometheusData>,
}

#[derive(Debug, Deserialize)]
struct PrometheusData {
    result: Vec<PrometheusSample>,
}

#[derive(Debug, Deserialize)]
struct PrometheusSample {
    /// `[unix_timestamp, "value"]`
    value: (f64, String),
}

pub struct PatroniApdex {
    client: reqwest::Client,
    prometheus_url: Option<String>,
    sli_query: String,
    slo: f64,
    enabled: bool,
}

impl PatroniApdex {
    pub const NAME: &'static str = "PatroniApdex";

    pub fn new(prometheus_url: Option<String>, sli_query: String, slo: f64, enabled: bool) -> Self {
        Self {
            client: reqwest::Client::new(),
            prometheus_url,
            sli_query,
            slo,
            enabled,
        }
    }

    async fn fetch_sli(&self, base_url: &str) -> Result<Option<f64>> {
        let url = format!("{}/api/v1/query", base_url.trim_end_matches('/'));
        let response: PrometheusResponse = self
            .client
            .get(&url)
            .query(&[("query", self.sli_query.as_str())])
            .send()
            .await
            .context("failed to query Prometheus")?
            .error_for_status()?
            .json()
            .await
            .context("failed to decode Prometheus response")?;

        Ok(parse_sli(response))
    }
}

fn parse_sli(response: PrometheusResponse) -> Option<f64> {
    if response.status != "success" {
        return None;
    }

    response
        .data?
        .result
        .first()
        .and_then(|sample| sample.value.1.parse().ok())
}

/// Signal for a measured apdex against its SLO
pub fn apdex_signal(sli: Option<f64>, slo: f64) -> Signal {
    match sli {
        None => Signal::unknown(PatroniApdex::NAME, "Patroni service apdex can not be calculated"),
        Some(apdex) if apdex > slo => {
            Signal::normal(PatroniApdex::NAME, "Patroni service apdex is above SLO")
        }
        Some(_) => Signal::stop(PatroniApdex::NAME, "Patroni service apdex is below SLO"),
    }
}

#[async_trait]
impl HealthIndicator for PatroniApdex {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn evaluate(&self, _context: &HealthContext) -> Result<Signal> {
        if !self.enabled {
            return Ok(Signal::not_available(Self::NAME, "indicator disabled"));
        }

        let Some(base_url) = &self.prometheus_url else {
            return Ok(Signal::not_available(Self::NAME, "Prometheus is not configured"));
        };

        let sli = self.fetch_sli(base_url).await?;
        Ok(apdex_signal(sli, self.slo))
    }
}
