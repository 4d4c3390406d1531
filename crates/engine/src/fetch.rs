//! Chunked candle retrieval
//!
//! Large date ranges are split into timeframe-sized chunks and fetched one
//! after another with a fixed pause in between, so no single provider call
//! runs into a timeout or rate limit. A chunk that keeps failing after its
//! retries is skipped and the rest of the range is still fetched.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::types::{Kline, Timeframe};

/// Source of historical candles for a half-open range `[start, end)` in ms
#[async_trait]
pub trait CandleProvider: Send + Sync {
    async fn fetch_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: i64,
        end: i64,
    ) -> anyhow::Result<Vec<Kline>>;
}

/// Tuning for the chunked fetch
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Pause between two consecutive chunk requests
    pub inter_chunk_delay: Duration,
    /// Attempts per chunk, including the first one
    pub max_attempts: u32,
    /// Base wait before a retry, multiplied by the attempt number
    pub retry_delay: Duration,
    /// Upper bound for a single attempt
    pub chunk_timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            inter_chunk_delay: Duration::from_millis(500),
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
            chunk_timeout: Duration::from_secs(30),
        }
    }
}

/// One slice of the requested range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkWindow {
    pub index: usize,
    pub start: i64,
    pub end: i64,
}

/// A chunk that could not be retrieved
#[derive(Debug, Clone, Serialize)]
pub struct ChunkFailure {
    pub index: usize,
    pub start: i64,
    pub end: i64,
    pub attempts: u32,
    pub error: String,
}

/// Non-fatal warning: the series has holes where chunks failed
#[derive(Debug, Clone, Serialize)]
pub struct PartialData {
    pub requested_start: i64,
    pub requested_end: i64,
    pub chunks_planned: usize,
    pub chunks_failed: usize,
    pub cancelled: bool,
    /// Ranges with no data because their chunk failed or was never fetched
    pub missing_ranges: Vec<(i64, i64)>,
}

/// Concatenated candles of a chunked fetch
#[derive(Debug, Clone, Serialize)]
pub struct CandleSeries {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub requested_start: i64,
    pub requested_end: i64,
    pub candles: Vec<Kline>,
    pub chunks_planned: usize,
    pub chunks_used: usize,
    pub failed_chunks: Vec<ChunkFailure>,
    pub cancelled: bool,
}

impl CandleSeries {
    pub fn is_partial(&self) -> bool {
        !self.failed_chunks.is_empty() || self.cancelled
    }

    pub fn partial_data(&self) -> Option<PartialData> {
        if !self.is_partial() {
            return None;
        }

        let mut missing_ranges: Vec<(i64, i64)> =
            self.failed_chunks.iter().map(|f| (f.start, f.end)).collect();
        if self.cancelled {
            // Chunks run in order, so everything past the attempted ones was never fetched
            let plan = plan_chunks(self.timeframe, self.requested_start, self.requested_end);
            missing_ranges.extend(
                plan.iter()
                    .skip(self.chunks_attempted())
                    .map(|c| (c.start, c.end)),
            );
        }

        Some(PartialData {
            requested_start: self.requested_start,
            requested_end: self.requested_end,
            chunks_planned: self.chunks_planned,
            chunks_failed: self.failed_chunks.len(),
            cancelled: self.cancelled,
            missing_ranges,
        })
    }

    fn chunks_attempted(&self) -> usize {
        self.chunks_used + self.failed_chunks.len()
    }

    /// First and last open time actually retrieved
    pub fn retrieved_range(&self) -> Option<(i64, i64)> {
        match (self.candles.first(), self.candles.last()) {
            (Some(first), Some(last)) => Some((first.open_time, last.open_time)),
            _ => None,
        }
    }
}

/// Split `[start, end)` into contiguous windows no longer than the
/// timeframe's maximum chunk span
pub fn plan_chunks(timeframe: Timeframe, start: i64, end: i64) -> Vec<ChunkWindow> {
    let step = timeframe.max_chunk_ms();
    let mut chunks = Vec::new();
    let mut current = start;

    while current < end {
        let chunk_end = current.saturating_add(step).min(end);
        chunks.push(ChunkWindow {
            index: chunks.len(),
            start: current,
            end: chunk_end,
        });
        current = chunk_end;
    }
    chunks
}

/// Sequential, retrying, gap-tolerant fetcher on top of a `CandleProvider`
#[derive(Clone)]
pub struct ChunkedFetcher {
    provider: Arc<dyn CandleProvider>,
    config: FetchConfig,
}

impl ChunkedFetcher {
    pub fn new(provider: Arc<dyn CandleProvider>, config: FetchConfig) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Fetch `[start, end)` chunk by chunk.
    ///
    /// Setting `cancel` abandons the chunk being retried and those not yet started;
    /// whatever was already aggregated is returned and the series is flagged as cancelled.
    pub async fn fetch_candle_series(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: i64,
        end: i64,
        cancel: &AtomicBool,
    ) -> Result<CandleSeries, FetchError> {
        if start >= end {
            return Err(FetchError::InvalidRange { start, end });
        }

        let plan = plan_chunks(timeframe, start, end);
        let chunks_planned = plan.len();

        info!(
            symbol,
            timeframe = %timeframe,
            start,
            end,
            chunks = chunks_planned,
            "Fetching candle series"
        );

        let mut candles: Vec<Kline> = Vec::new();
        let mut failed_chunks = Vec::new();
        let mut chunks_used = 0usize;
        let mut cancelled = false;

        for chunk in &plan {
            if chunk.index > 0 {
                sleep_unless_cancelled(self.config.inter_chunk_delay, cancel).await;
            }
            if cancel.load(Ordering::Relaxed) {
                info!(symbol, chunk = chunk.index, "Candle fetch cancelled");
                cancelled = true;
                break;
            }

            match self.fetch_chunk(symbol, timeframe, chunk, cancel).await {
                Ok(batch) => {
                    debug!(chunk = chunk.index, bars = batch.len(), "Chunk fetched");
                    candles.extend(batch);
                    chunks_used += 1;
                }
                Err(ChunkError::Cancelled) => {
                    info!(symbol, chunk = chunk.index, "Candle fetch cancelled during retries");
                    cancelled = true;
                    break;
                }
                Err(ChunkError::Failed(failure)) => {
                    warn!(
                        symbol,
                        chunk = failure.index,
                        start = failure.start,
                        end = failure.end,
                        attempts = failure.attempts,
                        error = %failure.error,
                        "Chunk failed, skipping"
                    );
                    failed_chunks.push(failure);
                }
            }
        }

        candles.retain(|k| k.open_time >= start && k.open_time < end);
        candles.sort_by_key(|k| k.open_time);
        candles.dedup_by_key(|k| k.open_time);

        if candles.is_empty() {
            return Err(FetchError::DataUnavailable {
                symbol: symbol.to_string(),
                timeframe,
                requested_start: start,
                requested_end: end,
                chunks_planned,
                chunks_failed: failed_chunks.len(),
            });
        }

        let series = CandleSeries {
            symbol: symbol.to_string(),
            timeframe,
            requested_start: start,
            requested_end: end,
            candles,
            chunks_planned,
            chunks_used,
            failed_chunks,
            cancelled,
        };

        if let Some(partial) = series.partial_data() {
            warn!(
                symbol,
                chunks_failed = partial.chunks_failed,
                chunks_planned = partial.chunks_planned,
                cancelled = partial.cancelled,
                "Partial candle data, results may miss events inside the gaps"
            );
        }

        info!(
            symbol,
            bars = series.candles.len(),
            chunks_used = series.chunks_used,
            "Candle series fetch complete"
        );
        Ok(series)
    }

    /// Fetch one chunk with bounded retries and a timeout per attempt.
    /// Cancellation is honoured before every retry and during the backoff.
    async fn fetch_chunk(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        chunk: &ChunkWindow,
        cancel: &AtomicBool,
    ) -> Result<Vec<Kline>, ChunkError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let call = self
                .provider
                .fetch_range(symbol, timeframe, chunk.start, chunk.end);
            let error = match tokio::time::timeout(self.config.chunk_timeout, call).await {
                Ok(Ok(klines)) => return Ok(klines),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {:?}", self.config.chunk_timeout),
            };

            if cancel.load(Ordering::Relaxed) {
                return Err(ChunkError::Cancelled);
            }
            if attempt >= max_attempts {
                return Err(ChunkError::Failed(ChunkFailure {
                    index: chunk.index,
                    start: chunk.start,
                    end: chunk.end,
                    attempts: attempt,
                    error,
                }));
            }

            let wait = self.config.retry_delay * attempt;
            warn!(
                chunk = chunk.index,
                attempt,
                max_attempts,
                error = %error,
                "Chunk attempt failed, retrying in {:?}",
                wait
            );
            if !sleep_unless_cancelled(wait, cancel).await {
                return Err(ChunkError::Cancelled);
            }
            attempt += 1;
        }
    }
}

enum ChunkError {
    Failed(ChunkFailure),
    Cancelled,
}

/// Granularity at which a pending wait notices the cancel flag
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Sleep for `wait`, waking early if `cancel` is set. Returns false when cancelled.
async fn sleep_unless_cancelled(wait: Duration, cancel: &AtomicBool) -> bool {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if cancel.load(Ordering::Relaxed) {
            return false;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return true;
        }
        tokio::time::sleep((deadline - now).min(CANCEL_POLL)).await;
    }
}
