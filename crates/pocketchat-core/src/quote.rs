//! Stock price lookups against the Yahoo finance chart endpoint.

use crate::config::QuotesConfig;
use reqwest::header::USER_AGENT;
use serde::Deserialize;
use std::io::{self, ErrorKind};
use url::Url;

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    #[serde(default)]
    result: Option<Vec<ChartResult>>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    meta: ChartMeta,
}

#[derive(Debug, Deserialize)]
struct ChartMeta {
    #[serde(rename = "regularMarketPrice")]
    regular_market_price: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct QuoteClient {
    client: reqwest::Client,
    base_url: String,
    user_agent: String,
}

impl QuoteClient {
    pub fn new(config: &QuotesConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.clone(),
            user_agent: config.user_agent.clone(),
        }
    }

    /// Latest regular market price, formatted for the model.
    ///
    /// Failures are logged and yield `None`.
    pub async fn fetch_price(&self, symbol: &str) -> Option<String> {
        match self.try_fetch_price(symbol).await {
            Ok(price) => Some(format!("Regular Market Price for {}: ${}", symbol, price)),
            Err(e) => {
                log::warn!("Error fetching stock data for {}: {}", symbol, e);
                None
            }
        }
    }

    async fn try_fetch_price(&self, symbol: &str) -> io::Result<f64> {
        let url = self.chart_url(symbol)?;
        let response = self
            .client
            .get(url)
            .header(USER_AGENT, &self.user_agent)
            .send()
            .await
            .map_err(|e| io::Error::other(format!("Failed to send request: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(io::Error::other(format!("API error ({}): {}", status, body)));
        }

        let chart: ChartResponse = response.json().await.map_err(|e| {
            io::Error::new(
                ErrorKind::InvalidData,
                format!("Failed to decode chart: {}", e),
            )
        })?;

        chart
            .chart
            .result
            .and_then(|results| results.into_iter().next())
            .and_then(|result| result.meta.regular_market_price)
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidData, "No regularMarketPrice in chart"))
    }

    fn chart_url(&self, symbol: &str) -> io::Result<Url> {
        if symbol.trim().is_empty() {
            return Err(io::Error::new(ErrorKind::InvalidInput, "Empty stock symbol"));
        }
        let mut url = Url::parse(&self.base_url).map_err(|e| {
            io::Error::new(
                ErrorKind::InvalidInput,
                format!("Invalid quote URL {}: {}", self.base_url, e),
            )
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("Quote URL cannot have a path: {}", self.base_url),
                )
            })?
            .pop_if_empty()
            .extend(["v8", "finance", "chart", symbol]);
        url.query_pairs_mut().append_pair("interval", "1d");
        Ok(url)
    }
}
