//! Binance public API client for historical klines (no authentication required)

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::fetch::CandleProvider;
use crate::types::{Kline, Timeframe};

pub const DEFAULT_BASE_URL: &str = "https://api.binance.com";
const MAX_KLINES_PER_REQUEST: u32 = 1000;
const PAGE_DELAY: Duration = Duration::from_millis(100);

/// Binance public market data client
#[derive(Clone)]
pub struct BinanceClient {
    client: Client,
    base_url: String,
}

/// Raw kline data from Binance API (array of arrays)
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct RawKline(
    i64,    // 0: Open time
    String, // 1: Open
    String, // 2: High
    String, // 3: Low
    String, // 4: Close
    String, // 5: Volume
    i64,    // 6: Close time
    String, // 7: Quote asset volume
    u64,    // 8: Number of trades
    String, // 9: Taker buy base
    String, // 10: Taker buy quote
    String, // 11: Ignore
);

impl RawKline {
    fn into_kline(self) -> Option<Kline> {
        Some(Kline {
            open_time: self.0,
            open: Decimal::from_str(&self.1).ok()?,
            high: Decimal::from_str(&self.2).ok()?,
            low: Decimal::from_str(&self.3).ok()?,
            close: Decimal::from_str(&self.4).ok()?,
            volume: Decimal::from_str(&self.5).ok()?,
            close_time: self.6,
        })
    }
}

/// Decode a `/api/v3/klines` response body, dropping rows with unparsable prices
fn parse_klines(body: &str) -> Result<Vec<Kline>> {
    let raw: Vec<RawKline> = serde_json::from_str(body).context("Invalid klines payload")?;
    Ok(raw.into_iter().filter_map(RawKline::into_kline).collect())
}

impl BinanceClient {
    /// Create a client against `base_url` with a per-request timeout
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn with_default_url() -> Result<Self> {
        Self::new(DEFAULT_BASE_URL, Duration::from_secs(30))
    }

    /// Fetch klines (candlestick data) for a symbol
    pub async fn get_klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: Option<u32>,
    ) -> Result<Vec<Kline>> {
        let mut url = format!(
            "{}/api/v3/klines?symbol={}&interval={}",
            self.base_url, symbol, timeframe
        );

        if let Some(start) = start_time {
            url.push_str(&format!("&startTime={}", start));
        }
        if let Some(end) = end_time {
            url.push_str(&format!("&endTime={}", end));
        }

        let limit = limit.unwrap_or(500).min(MAX_KLINES_PER_REQUEST);
        url.push_str(&format!("&limit={}", limit));

        debug!(symbol, interval = %timeframe, "Fetching klines from Binance");

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Binance API error {}: {}", status, body);
        }

        let body = response.text().await?;
        let klines = parse_klines(&body)?;

        debug!(count = klines.len(), "Fetched klines");
        Ok(klines)
    }

    /// Fetch klines with automatic pagination for ranges > 1000 bars.
    /// `end_time` is inclusive, as in the Binance API.
    pub async fn get_klines_paginated(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_time: i64,
        end_time: i64,
    ) -> Result<Vec<Kline>> {
        let mut all_klines = Vec::new();
        let mut current_start = start_time;

        loop {
            if current_start > end_time {
                break;
            }

            let klines = self
                .get_klines(
                    symbol,
                    timeframe,
                    Some(current_start),
                    Some(end_time),
                    Some(MAX_KLINES_PER_REQUEST),
                )
                .await?;

            if klines.is_empty() {
                break;
            }

            let page_len = klines.len();
            let last_close_time = klines.last().map(|k| k.close_time).unwrap_or(end_time);
            all_klines.extend(klines);

            if page_len < MAX_KLINES_PER_REQUEST as usize {
                break;
            }

            // Move start to after the last candle
            current_start = last_close_time + 1;

            // Small delay to respect rate limits
            tokio::time::sleep(PAGE_DELAY).await;
        }

        debug!(symbol, total = all_klines.len(), "Paginated kline fetch complete");
        Ok(all_klines)
    }
}

#[async_trait]
impl CandleProvider for BinanceClient {
    async fn fetch_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: i64,
        end: i64,
    ) -> Result<Vec<Kline>> {
        self.get_klines_paginated(symbol, timeframe, start, end - 1)
            .await
    }
}
