//! Signal Backtest — score trade signals against historical candles
//!
//! Usage:
//!   signal-backtest run --signal signal.json      — Backtest one signal from CLI
//!   signal-backtest batch --signals signals.json  — Backtest many signals in parallel
//!   signal-backtest history --symbol BTCUSDT      — List stored results
//!   signal-backtest prune --days 90               — Delete old stored results
//!   signal-backtest serve --port 3002             — Launch the HTTP API

mod config;
mod pipeline;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use engine::{
    run_batch, summarize, validate_input, BacktestInput, BacktestJob, BacktestResult,
    BatchOutcome, BinanceClient, ChunkedFetcher, FetchError, LevelHit, SimulationError, Timeframe,
};
use persistence::repository::{BacktestRecord, BacktestRepository};
use persistence::SqlitePool;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::pipeline::{PipelineError, ScoredSignal};

const APP_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH"));

const EXIT_INVALID_INPUT: u8 = 1;
const EXIT_DATA_UNAVAILABLE: u8 = 2;

#[derive(Parser)]
#[command(name = "signal-backtest")]
#[command(about = "Backtest trade signals with partial take-profits against Binance candles", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Backtest a single signal read from a JSON file
    Run {
        /// Path to the signal JSON
        #[arg(long)]
        signal: PathBuf,
        /// Candle resolution to replay
        #[arg(long, default_value = "15m")]
        timeframe: Timeframe,
        /// Stop fetching at this timestamp (ms) instead of the expiration deadline
        #[arg(long)]
        end: Option<i64>,
        /// Optional JSON export path
        #[arg(long)]
        export: Option<PathBuf>,
        /// Do not store the result
        #[arg(long)]
        no_save: bool,
    },
    /// Backtest every signal of a JSON array in parallel
    Batch {
        /// Path to a JSON array of signals
        #[arg(long)]
        signals: PathBuf,
        /// Candle resolution to replay
        #[arg(long, default_value = "15m")]
        timeframe: Timeframe,
        /// Optional JSON export path
        #[arg(long)]
        export: Option<PathBuf>,
        /// Do not store the results
        #[arg(long)]
        no_save: bool,
    },
    /// List stored backtest results
    History {
        /// Only show this symbol
        #[arg(long)]
        symbol: Option<String>,
        /// Number of rows to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Delete stored results older than N days
    Prune {
        /// Age in days beyond which results are removed
        #[arg(long, default_value_t = 90)]
        days: i64,
    },
    /// Launch the HTTP API
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 3002)]
        port: u16,
    },
}

#[derive(Clone)]
struct AppState {
    binance: Arc<BinanceClient>,
    fetcher: ChunkedFetcher,
    db: Arc<persistence::Database>,
}

const DEFAULT_LOG_DIRECTIVES: &str = "info,engine=info,signal_backtest=info,sqlx=warn";
const VERBOSE_LOG_DIRECTIVES: &str = "debug,engine=debug,signal_backtest=debug,sqlx=warn";

/// `--verbose` wins, then `RUST_LOG` (which may come from `.env`), then the default
fn log_directives(verbose: bool, rust_log: Option<String>) -> String {
    if verbose {
        return VERBOSE_LOG_DIRECTIVES.to_string();
    }
    rust_log
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_LOG_DIRECTIVES.to_string())
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let directives = log_directives(verbose, std::env::var("RUST_LOG").ok());
    let filter = EnvFilter::try_new(&directives)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVES));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    init_logging(cli.verbose);

    let config = AppConfig::from_env()?;

    match cli.command {
        Commands::Run {
            signal,
            timeframe,
            end,
            export,
            no_save,
        } => cmd_run(&config, &signal, timeframe, end, export, no_save).await,
        Commands::Batch {
            signals,
            timeframe,
            export,
            no_save,
        } => cmd_batch(&config, &signals, timeframe, export, no_save).await,
        Commands::History { symbol, limit } => {
            cmd_history(&config, symbol, limit).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Prune { days } => {
            cmd_prune(&config, days).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Serve { host, port } => {
            cmd_serve(&config, &host, port).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn build_fetcher(config: &AppConfig) -> anyhow::Result<(Arc<BinanceClient>, ChunkedFetcher)> {
    let binance = Arc::new(BinanceClient::new(
        config.binance_base_url.clone(),
        config.http_timeout,
    )?);
    let fetcher = ChunkedFetcher::new(binance.clone(), config.fetch.clone());
    Ok((binance, fetcher))
}

async fn open_db(config: &AppConfig) -> anyhow::Result<persistence::Database> {
    persistence::Database::new(&config.db_path)
        .await
        .map_err(|e| {
            error!("Failed to initialize database: {}", e);
            anyhow::anyhow!("Database initialization failed: {}", e)
        })
}

/// Flag flipped by Ctrl+C; checked by the fetcher between chunks
fn cancel_on_ctrl_c() -> Arc<AtomicBool> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl+C received, requesting cancel...");
        flag.store(true, Ordering::Relaxed);
    });
    cancel
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Cannot read {}: {}", path.display(), e))?;
    serde_json::from_str(&raw).map_err(|e| anyhow::anyhow!("Invalid JSON in {}: {}", path.display(), e))
}

fn write_export<T: serde::Serialize>(path: &Path, data: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(data)?;
    std::fs::write(path, json)?;
    println!("\nResults exported to {}", path.display());
    Ok(())
}

// ============================================================================
// Run command — single signal
// ============================================================================

async fn cmd_run(
    config: &AppConfig,
    signal_path: &Path,
    timeframe: Timeframe,
    end: Option<i64>,
    export: Option<PathBuf>,
    no_save: bool,
) -> anyhow::Result<ExitCode> {
    println!("\n=== Signal Backtest v{} ===", APP_VERSION);

    let input: BacktestInput = read_json(signal_path)?;
    println!(
        "Signal: {} {} @ {} | Timeframe: {} | Expires after {}h",
        input.symbol,
        input.direction,
        input.entry_price,
        timeframe,
        input.timeframe_expiration_hours
    );

    let db = if no_save {
        None
    } else {
        Some(open_db(config).await?)
    };
    let (_, fetcher) = build_fetcher(config)?;
    let cancel = cancel_on_ctrl_c();

    match pipeline::score_signal(&fetcher, input.clone(), timeframe, end, &cancel).await {
        Ok(scored) => {
            if let Some(partial) = &scored.partial {
                println!(
                    "\nWarning: partial data ({}/{} chunks failed{}), events inside the gaps may be missed",
                    partial.chunks_failed,
                    partial.chunks_planned,
                    if partial.cancelled { ", cancelled" } else { "" }
                );
            }
            print_result(&scored.result);

            if let Some(db) = &db {
                pipeline::save_result(
                    db.pool(),
                    &input,
                    timeframe,
                    &scored.result,
                    scored.chunks_used,
                    scored.partial.is_some(),
                )
                .await?;
                println!("\nStored in {}", config.db_path);
            }
            if let Some(path) = export {
                write_export(&path, &scored)?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(PipelineError::Invalid(result)) => {
            println!("\nSignal rejected:");
            println!("{}", serde_json::to_string_pretty(&result)?);
            if let Some(db) = &db {
                pipeline::save_result(db.pool(), &input, timeframe, &result, 0, false).await?;
            }
            Ok(ExitCode::from(EXIT_INVALID_INPUT))
        }
        Err(PipelineError::Join(e)) => Err(e.into()),
        Err(e @ PipelineError::Simulation(SimulationError::ArithmeticOverflow { .. })) => {
            println!("\nSignal rejected: {}", e);
            Ok(ExitCode::from(EXIT_INVALID_INPUT))
        }
        Err(e) => {
            error!(symbol = %input.symbol, error = %e, "Backtest failed");
            println!("\nBacktest failed: {}", e);
            Ok(ExitCode::from(EXIT_DATA_UNAVAILABLE))
        }
    }
}

fn format_ts(ms: Option<i64>) -> String {
    ms.and_then(chrono::DateTime::from_timestamp_millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn print_level(label: &str, level: &LevelHit) {
    println!(
        "  {:<10} {:>5} {:>18} {:>14}",
        label,
        if level.hit { "HIT" } else { "-" },
        format_ts(level.hit_at),
        level
            .hit_price
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string()),
    );
}

fn print_result(result: &BacktestResult) {
    let targets = &result.targets;
    println!("\nResult: {} ({} candles evaluated)", result.status, result.candles_evaluated);
    println!("  {:<10} {:>5} {:>18} {:>14}", "Level", "Hit", "At", "Price");
    println!("  {}", "-".repeat(50));
    print_level("TP1", &targets.tp1);
    print_level("TP2", &targets.tp2);
    print_level("TP3", &targets.tp3);
    print_level("Stop loss", &targets.stop_loss);
    println!(
        "\n  P/L: {:+} USD ({:+}%) | Realized: {:+} | Unrealized: {:+} | Open: {}%",
        result.profit_loss_usd,
        result.profit_loss_percent,
        targets.realized_pnl_usd,
        targets.unrealized_pnl_usd,
        targets.remaining_allocation
    );
    if let Some(price) = result.last_price {
        println!("  Last price: {} | Closed at: {}", price, format_ts(result.closed_at));
    }
}

// ============================================================================
// Batch command — fetch sequentially, simulate in parallel
// ============================================================================

async fn cmd_batch(
    config: &AppConfig,
    signals_path: &Path,
    timeframe: Timeframe,
    export: Option<PathBuf>,
    no_save: bool,
) -> anyhow::Result<ExitCode> {
    println!("\n=== Signal Backtest v{} ===", APP_VERSION);

    let inputs: Vec<BacktestInput> = read_json(signals_path)?;
    println!("Signals: {} | Timeframe: {}", inputs.len(), timeframe);
    println!("Press Ctrl+C to stop fetching\n");

    let db = if no_save {
        None
    } else {
        Some(open_db(config).await?)
    };
    let (_, fetcher) = build_fetcher(config)?;
    let cancel = cancel_on_ctrl_c();

    // Fetch failures fill their slot directly; everything else becomes a job
    let mut slots: Vec<Option<BatchOutcome>> = vec![None; inputs.len()];
    let mut jobs = Vec::new();
    let mut job_meta = Vec::new();

    for (i, input) in inputs.iter().enumerate() {
        if cancel.load(Ordering::Relaxed) {
            slots[i] = Some(BatchOutcome {
                symbol: input.symbol.clone(),
                result: None,
                error: Some("cancelled".to_string()),
            });
            continue;
        }

        if validate_input(input).is_err() {
            jobs.push(BacktestJob {
                input: input.clone(),
                klines: Vec::new(),
            });
            job_meta.push((i, 0, false));
            continue;
        }

        print!("\r  Fetching {}/{}: {}          ", i + 1, inputs.len(), input.symbol);
        match pipeline::fetch_for_signal(&fetcher, input, timeframe, None, &cancel).await {
            Ok(series) => {
                job_meta.push((i, series.chunks_used, series.is_partial()));
                jobs.push(BacktestJob {
                    input: input.clone(),
                    klines: series.candles,
                });
            }
            Err(e) => {
                warn!(symbol = %input.symbol, error = %e, "Skipping signal, no candle data");
                slots[i] = Some(BatchOutcome {
                    symbol: input.symbol.clone(),
                    result: None,
                    error: Some(e.to_string()),
                });
            }
        }
    }
    println!();

    let (jobs, outcomes) = tokio::task::spawn_blocking(move || {
        let outcomes = run_batch(&jobs);
        (jobs, outcomes)
    })
    .await?;

    for ((job, (slot, chunks_used, partial)), outcome) in
        jobs.iter().zip(job_meta).zip(outcomes)
    {
        if let (Some(db), Some(result)) = (&db, &outcome.result) {
            if let Err(e) =
                pipeline::save_result(db.pool(), &job.input, timeframe, result, chunks_used, partial)
                    .await
            {
                error!(symbol = %job.input.symbol, error = %e, "Failed to store result");
            }
        }
        slots[slot] = Some(outcome);
    }

    let outcomes: Vec<BatchOutcome> = slots.into_iter().flatten().collect();
    print_batch(&outcomes);

    if let Some(path) = export {
        write_export(
            &path,
            &serde_json::json!({
                "timeframe": timeframe,
                "summary": summarize(&outcomes),
                "outcomes": outcomes,
            }),
        )?;
    }

    Ok(ExitCode::SUCCESS)
}

fn print_batch(outcomes: &[BatchOutcome]) {
    println!("\nBatch Results:");
    println!(
        "  {:>3}  {:<12} {:<18} {:>14} {:>10} {:>8}",
        "#", "Symbol", "Status", "P/L USD", "P/L %", "Candles"
    );
    println!("  {}", "-".repeat(72));
    for (i, outcome) in outcomes.iter().enumerate() {
        match (&outcome.result, &outcome.error) {
            (Some(r), _) => println!(
                "  {:>3}  {:<12} {:<18} {:>+14} {:>+10} {:>8}",
                i + 1,
                outcome.symbol,
                r.status,
                r.profit_loss_usd,
                r.profit_loss_percent,
                r.candles_evaluated,
            ),
            (None, error) => println!(
                "  {:>3}  {:<12} error: {}",
                i + 1,
                outcome.symbol,
                error.as_deref().unwrap_or("unknown"),
            ),
        }
    }

    let summary = summarize(outcomes);
    println!(
        "\n  Total: {} | Success: {} | Failure: {} | Expired: {} | Invalid: {} | Errors: {}",
        summary.total,
        summary.completed_success,
        summary.completed_failure,
        summary.expired,
        summary.invalid,
        summary.errored
    );
}

// ============================================================================
// History / Prune commands — stored results
// ============================================================================

async fn cmd_history(config: &AppConfig, symbol: Option<String>, limit: i64) -> anyhow::Result<()> {
    let db = open_db(config).await?;
    let repo = BacktestRepository::new(db.pool());

    let records = match &symbol {
        Some(s) => repo.list_by_symbol(s, limit).await?,
        None => repo.list_recent(limit).await?,
    };

    if records.is_empty() {
        println!("\nNo stored results.");
        return Ok(());
    }

    print_history(&records);

    let stats = repo.get_stats().await?;
    println!(
        "\n  Stored: {} | Success: {} | Failure: {} | Expired: {} | Invalid: {} | Partial data: {} | Avg P/L: {}%",
        stats.total_backtests,
        stats.completed_success,
        stats.completed_failure,
        stats.expired,
        stats.invalid,
        stats.partial_data_runs,
        stats.avg_profit_loss_percent
    );
    Ok(())
}

fn print_history(records: &[BacktestRecord]) {
    println!(
        "\n  {:>5}  {:<12} {:<6} {:<4} {:<18} {:>14} {:>10} {:>17}",
        "ID", "Symbol", "Side", "TF", "Status", "P/L USD", "P/L %", "Entry"
    );
    println!("  {}", "-".repeat(95));
    for r in records {
        println!(
            "  {:>5}  {:<12} {:<6} {:<4} {:<18} {:>14} {:>10} {:>17}{}",
            r.id.unwrap_or_default(),
            r.symbol,
            r.direction,
            r.timeframe,
            r.status,
            r.profit_loss_usd,
            r.profit_loss_percent,
            format_ts(Some(r.entry_timestamp)),
            if r.partial_data { "  (partial)" } else { "" },
        );
    }
}

async fn cmd_prune(config: &AppConfig, days: i64) -> anyhow::Result<()> {
    let db = open_db(config).await?;
    // created_at is stored in unix seconds
    let cutoff = chrono::Utc::now().timestamp() - days * 86_400;
    let removed = BacktestRepository::new(db.pool())
        .delete_older_than(cutoff)
        .await?;
    println!("\nRemoved {} results older than {} days", removed, days);
    Ok(())
}

// ============================================================================
// Serve command — Axum web server
// ============================================================================

async fn cmd_serve(config: &AppConfig, host: &str, port: u16) -> anyhow::Result<()> {
    info!("Signal Backtest v{} starting...", APP_VERSION);

    let db = open_db(config).await?;
    info!("Database initialized: {}", config.db_path);

    let (binance, fetcher) = build_fetcher(config)?;
    let state = AppState {
        binance,
        fetcher,
        db: Arc::new(db),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(api_health))
        .route("/backtest", post(api_run_backtest))
        .route("/backtests", get(api_list_backtests))
        .route("/backtests/stats", get(api_backtest_stats))
        .route("/klines", get(api_klines))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(cors);

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    println!("\n=== Signal Backtest v{} ===", APP_VERSION);
    println!("Listening on http://{}", addr);
    println!("\nEndpoints:");
    println!("  GET  /api/health              - Health check");
    println!("  POST /api/backtest            - Backtest one signal");
    println!("  GET  /api/backtests           - Stored results");
    println!("  GET  /api/backtests/stats     - Stored result stats");
    println!("  GET  /api/klines              - Fetch Binance klines (proxy)");
    println!("\n  Database: {}", config.db_path);
    println!("\nPress Ctrl+C to stop\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// API Handlers — Backtests
// ============================================================================

fn default_save() -> bool {
    true
}

#[derive(Deserialize)]
struct BacktestRequest {
    signal: BacktestInput,
    #[serde(default)]
    timeframe: Option<Timeframe>,
    /// Fetch up to this timestamp (ms) instead of the expiration deadline
    #[serde(default)]
    end_time: Option<i64>,
    #[serde(default = "default_save")]
    save: bool,
}

/// GET /api/health
async fn api_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "signal-backtest",
        "version": APP_VERSION,
    }))
}

/// POST /api/backtest — validate, fetch and simulate one signal
async fn api_run_backtest(
    State(state): State<AppState>,
    Json(request): Json<BacktestRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    let timeframe = request.timeframe.unwrap_or(Timeframe::M15);
    let input = request.signal;

    info!(
        symbol = %input.symbol,
        direction = %input.direction,
        timeframe = %timeframe,
        "Backtest requested"
    );

    // HTTP runs are not cancellable once started
    let cancel = AtomicBool::new(false);
    let outcome = pipeline::score_signal(
        &state.fetcher,
        input.clone(),
        timeframe,
        request.end_time,
        &cancel,
    )
    .await;

    backtest_response(state.db.pool(), &input, timeframe, request.save, outcome).await
}

/// Map a pipeline outcome to the HTTP reply, storing simulated and invalid results
async fn backtest_response(
    pool: &SqlitePool,
    input: &BacktestInput,
    timeframe: Timeframe,
    save: bool,
    outcome: Result<ScoredSignal, PipelineError>,
) -> (StatusCode, Json<serde_json::Value>) {
    match outcome {
        Ok(scored) => {
            if save {
                store_result(
                    pool,
                    input,
                    timeframe,
                    &scored.result,
                    scored.chunks_used,
                    scored.partial.is_some(),
                )
                .await;
            }
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "success": true,
                    "data": scored,
                })),
            )
        }
        Err(PipelineError::Invalid(result)) => {
            if save {
                store_result(pool, input, timeframe, &result, 0, false).await;
            }
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!({
                    "success": false,
                    "error": result.validation_error,
                    "data": result,
                })),
            )
        }
        Err(e) => {
            let status = match &e {
                PipelineError::Fetch(FetchError::InvalidRange { .. }) => StatusCode::BAD_REQUEST,
                PipelineError::Simulation(SimulationError::ArithmeticOverflow { .. }) => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                PipelineError::Fetch(_) | PipelineError::Simulation(_) => StatusCode::BAD_GATEWAY,
                PipelineError::Join(_) | PipelineError::Invalid(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            error!(symbol = %input.symbol, error = %e, "Backtest failed");
            (
                status,
                Json(serde_json::json!({
                    "success": false,
                    "error": e.to_string(),
                })),
            )
        }
    }
}

async fn store_result(
    pool: &SqlitePool,
    input: &BacktestInput,
    timeframe: Timeframe,
    result: &BacktestResult,
    chunks_used: usize,
    partial_data: bool,
) {
    if let Err(e) =
        pipeline::save_result(pool, input, timeframe, result, chunks_used, partial_data).await
    {
        error!(symbol = %input.symbol, error = %e, "Failed to store backtest result");
    }
}

/// GET /api/backtests — stored results, optionally filtered by symbol
async fn api_list_backtests(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    let limit: i64 = params
        .get("limit")
        .and_then(|s| s.parse().ok())
        .unwrap_or(50);
    let symbol = params.get("symbol");

    let repo = BacktestRepository::new(state.db.pool());
    let records = match symbol {
        Some(s) => repo.list_by_symbol(s, limit).await,
        None => repo.list_recent(limit).await,
    };

    match records {
        Ok(records) => Json(serde_json::json!({
            "success": true,
            "data": records,
            "total": records.len(),
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Failed to query backtests: {}", e),
            "data": [],
            "total": 0,
        })),
    }
}

/// GET /api/backtests/stats — counts per status and average P/L
async fn api_backtest_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let repo = BacktestRepository::new(state.db.pool());
    match repo.get_stats().await {
        Ok(stats) => Json(serde_json::json!({
            "success": true,
            "stats": stats,
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Failed to get backtest stats: {}", e),
        })),
    }
}

// ============================================================================
// API Handlers — Binance Proxy
// ============================================================================

/// GET /api/klines — Proxy endpoint for Binance klines
async fn api_klines(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    let symbol = params
        .get("symbol")
        .cloned()
        .unwrap_or_else(|| "BTCUSDT".to_string());
    let interval = match params.get("interval").map(|s| s.parse::<Timeframe>()) {
        None => Timeframe::M15,
        Some(Ok(tf)) => tf,
        Some(Err(e)) => {
            return Json(serde_json::json!({
                "success": false,
                "message": e,
            }))
        }
    };
    let start_time: Option<i64> = params.get("start_time").and_then(|s| s.parse().ok());
    let end_time: Option<i64> = params.get("end_time").and_then(|s| s.parse().ok());
    let limit: Option<u32> = params.get("limit").and_then(|s| s.parse().ok());

    let result = if let (Some(start), Some(end)) = (start_time, end_time) {
        state
            .binance
            .get_klines_paginated(&symbol, interval, start, end)
            .await
    } else {
        state
            .binance
            .get_klines(&symbol, interval, start_time, end_time, limit)
            .await
    };

    match result {
        Ok(klines) => Json(serde_json::json!({
            "success": true,
            "symbol": symbol,
            "interval": interval,
            "count": klines.len(),
            "klines": klines,
        })),
        Err(e) => {
            error!("Binance klines error: {}", e);
            Json(serde_json::json!({
                "success": false,
                "message": format!("Failed to fetch klines: {}", e),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::{run_backtest, BacktestStatus, Direction};
    use rust_decimal_macros::dec;

    fn signal() -> BacktestInput {
        BacktestInput {
            symbol: "ETHUSDT".to_string(),
            direction: Direction::Long,
            entry_price: dec!(2000),
            entry_timestamp: 1_700_000_000_000,
            tp1_price: dec!(2100),
            tp1_allocation: dec!(50),
            tp2_price: dec!(2200),
            tp2_allocation: dec!(30),
            tp3_price: dec!(2300),
            tp3_allocation: dec!(20),
            stop_loss_price: dec!(1900),
            timeframe_expiration_hours: 48,
        }
    }

    #[test]
    fn test_log_directives_precedence() {
        assert_eq!(log_directives(false, None), DEFAULT_LOG_DIRECTIVES);
        assert_eq!(log_directives(false, Some("warn".to_string())), "warn");
        assert_eq!(log_directives(false, Some("  ".to_string())), DEFAULT_LOG_DIRECTIVES);
        assert_eq!(log_directives(true, Some("warn".to_string())), VERBOSE_LOG_DIRECTIVES);
    }

    #[tokio::test]
    async fn test_invalid_signal_is_stored_and_rejected() {
        let db = persistence::Database::in_memory().await.unwrap();
        let mut input = signal();
        input.tp3_allocation = dec!(10);
        let invalid = run_backtest(&input, &[]).unwrap();
        assert_eq!(invalid.status, BacktestStatus::Invalid);

        let (status, Json(body)) = backtest_response(
            db.pool(),
            &input,
            Timeframe::H1,
            true,
            Err(PipelineError::Invalid(Box::new(invalid))),
        )
        .await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["success"], false);
        let stats = BacktestRepository::new(db.pool()).get_stats().await.unwrap();
        assert_eq!(stats.total_backtests, 1);
        assert_eq!(stats.invalid, 1);
    }

    #[tokio::test]
    async fn test_unsaved_and_failed_runs_are_not_stored() {
        let db = persistence::Database::in_memory().await.unwrap();
        let input = signal();
        let invalid = run_backtest(
            &BacktestInput {
                symbol: String::new(),
                ..signal()
            },
            &[],
        )
        .unwrap();

        let (status, _) = backtest_response(
            db.pool(),
            &input,
            Timeframe::H1,
            false,
            Err(PipelineError::Invalid(Box::new(invalid))),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let unavailable = FetchError::DataUnavailable {
            symbol: input.symbol.clone(),
            timeframe: Timeframe::H1,
            requested_start: input.entry_timestamp,
            requested_end: input.entry_timestamp + 3_600_000,
            chunks_planned: 1,
            chunks_failed: 1,
        };
        let (status, _) = backtest_response(
            db.pool(),
            &input,
            Timeframe::H1,
            true,
            Err(PipelineError::Fetch(unavailable)),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);

        let stats = BacktestRepository::new(db.pool()).get_stats().await.unwrap();
        assert_eq!(stats.total_backtests, 0);
    }
}
