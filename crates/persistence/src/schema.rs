//! Database schema definitions

/// SQL to create all tables
/// NOTE: All prices/amounts stored as TEXT to preserve rust_decimal::Decimal precision
pub const CREATE_TABLES: &str = r#"
-- One row per scored signal (keyed by signal + timeframe hash)
CREATE TABLE IF NOT EXISTS backtest_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    signal_hash TEXT NOT NULL UNIQUE,
    symbol TEXT NOT NULL,
    direction TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    entry_price TEXT NOT NULL,
    entry_timestamp INTEGER NOT NULL,
    signal_json TEXT NOT NULL,
    status TEXT NOT NULL,
    trade_state TEXT NOT NULL,
    profit_loss_usd TEXT NOT NULL DEFAULT '0',
    profit_loss_percent TEXT NOT NULL DEFAULT '0',
    realized_pnl_usd TEXT NOT NULL DEFAULT '0',
    unrealized_pnl_usd TEXT NOT NULL DEFAULT '0',
    remaining_allocation TEXT NOT NULL DEFAULT '100',
    tp1_hit BOOLEAN NOT NULL DEFAULT 0,
    tp1_hit_at INTEGER,
    tp2_hit BOOLEAN NOT NULL DEFAULT 0,
    tp2_hit_at INTEGER,
    tp3_hit BOOLEAN NOT NULL DEFAULT 0,
    tp3_hit_at INTEGER,
    stop_loss_hit BOOLEAN NOT NULL DEFAULT 0,
    stop_loss_hit_at INTEGER,
    candles_evaluated INTEGER NOT NULL DEFAULT 0,
    chunks_used INTEGER NOT NULL DEFAULT 0,
    partial_data BOOLEAN NOT NULL DEFAULT 0,
    validation_error TEXT,
    result_json TEXT NOT NULL,
    created_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_backtest_symbol ON backtest_results(symbol, entry_timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_backtest_status ON backtest_results(status);
CREATE INDEX IF NOT EXISTS idx_backtest_created ON backtest_results(created_at)
"#;
