use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::ports::market_data::{MarketData, PriceTable};

pub const DEFAULT_ENDPOINT: &str = "https://query1.finance.yahoo.com";

#[derive(Debug, Deserialize)]
struct ChartEnvelope {
    chart: ChartBody,
}

#[derive(Debug, Deserialize)]
struct ChartBody {
    #[serde(default)]
    result: Option<Vec<ChartResult>>,
    #[serde(default)]
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    timestamp: Option<Vec<i64>>,
    indicators: ChartIndicators,
}

#[derive(Debug, Deserialize)]
struct ChartIndicators {
    #[serde(default)]
    quote: Vec<ChartQuote>,
}

#[derive(Debug, Deserialize)]
struct ChartQuote {
    #[serde(default)]
    close: Option<Vec<Option<f64>>>,
}

/// Daily closes from the Yahoo Finance chart API.
#[derive(Debug, Clone)]
pub struct YahooFeed {
    http: reqwest::Client,
    endpoint: String,
}

impl YahooFeed {
    pub fn new(endpoint: &str, timeout_secs: u64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent("Mozilla/5.0 (compatible; pairdesk)")
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_daily(
        &self,
        ticker: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<(NaiveDate, f64)>> {
        let url = format!("{}/v8/finance/chart/{}", self.endpoint, ticker);
        let envelope: ChartEnvelope = self
            .http
            .get(&url)
            .query(&[
                ("period1", start.timestamp().to_string()),
                ("period2", end.timestamp().to_string()),
                ("interval", "1d".to_string()),
            ])
            .send()
            .await
            .with_context(|| format!("chart request for {} failed", ticker))?
            .error_for_status()
            .with_context(|| format!("chart request for {} rejected", ticker))?
            .json()
            .await
            .with_context(|| format!("chart response for {} is not valid JSON", ticker))?;
        parse_chart(envelope).with_context(|| format!("unusable chart for {}", ticker))
    }

    async fn fetch_table(&self, tickers: &[String], lookback_days: u32) -> Result<PriceTable> {
        let end = Utc::now();
        let start = end - ChronoDuration::days(i64::from(lookback_days));
        let mut series = HashMap::with_capacity(tickers.len());
        for ticker in tickers {
            match self.fetch_daily(ticker, start, end).await {
                Ok(points) if !points.is_empty() => {
                    series.insert(ticker.clone(), points);
                }
                Ok(_) => log::warn!("[FEED] {} returned no closes", ticker),
                Err(e) => log::warn!("[FEED] {:#}", e),
            }
        }
        if series.is_empty() {
            return Err(anyhow!(
                "no price data returned for any of {} tickers",
                tickers.len()
            ));
        }
        log::debug!(
            "[FEED] fetched {}/{} tickers over {} days",
            series.len(),
            tickers.len(),
            lookback_days
        );
        Ok(PriceTable::from_series(series).forward_filled())
    }
}

#[async_trait]
impl MarketData for YahooFeed {
    async fn fetch_history(&self, tickers: &[String], lookback_days: u32) -> Result<PriceTable> {
        self.fetch_table(tickers, lookback_days).await
    }

    async fn fetch_latest(&self, tickers: &[String], lookback_days: u32) -> Result<PriceTable> {
        self.fetch_table(tickers, lookback_days).await
    }
}

/// Extracts one close per UTC date. When a date appears twice (the live bar
/// next to the settled one) the later value wins.
fn parse_chart(envelope: ChartEnvelope) -> Result<Vec<(NaiveDate, f64)>> {
    if let Some(err) = envelope.chart.error {
        return Err(anyhow!(
            "{}: {}",
            err.code.unwrap_or_default(),
            err.description.unwrap_or_default()
        ));
    }
    let result = envelope
        .chart
        .result
        .and_then(|r| r.into_iter().next())
        .ok_or_else(|| anyhow!("empty chart result"))?;
    let timestamps = result.timestamp.unwrap_or_default();
    let closes = result
        .indicators
        .quote
        .into_iter()
        .next()
        .and_then(|q| q.close)
        .unwrap_or_default();

    let mut by_date = BTreeMap::new();
    for (ts, close) in timestamps.iter().zip(closes) {
        let (Some(close), Some(dt)) = (close, DateTime::<Utc>::from_timestamp(*ts, 0)) else {
            continue;
        };
        if close.is_finite() {
            by_date.insert(dt.date_naive(), close);
        }
    }
    Ok(by_date.into_iter().collect())
}
