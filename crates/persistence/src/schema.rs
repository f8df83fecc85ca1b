//! Database schema definitions

/// SQL to create all tables
/// NOTE: All prices/amounts stored as TEXT to preserve rust_decimal::Decimal precision
pub const CREATE_TABLES: &str = r#"
-- Backtest runs with their full trade ledger
CREATE TABLE IF NOT EXISTS backtest_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    params_hash TEXT NOT NULL UNIQUE,
    symbol TEXT NOT NULL,
    interval TEXT NOT NULL,
    policy TEXT NOT NULL,
    params TEXT NOT NULL,
    start_time INTEGER NOT NULL DEFAULT 0,
    end_time INTEGER NOT NULL DEFAULT 0,
    initial_balance TEXT NOT NULL,
    final_balance TEXT NOT NULL,
    total_profit TEXT NOT NULL DEFAULT '0',
    total_profit_pct TEXT NOT NULL DEFAULT '0',
    total_trades INTEGER NOT NULL DEFAULT 0,
    winning_trades INTEGER NOT NULL DEFAULT 0,
    losing_trades INTEGER NOT NULL DEFAULT 0,
    win_rate TEXT NOT NULL DEFAULT '0',
    profit_factor TEXT NOT NULL DEFAULT '0',
    max_drawdown_pct TEXT NOT NULL DEFAULT '0',
    trades TEXT NOT NULL DEFAULT '[]',
    created_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- Signals emitted by scans and analyses
CREATE TABLE IF NOT EXISTS signals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    price TEXT NOT NULL,
    take_profit_price TEXT NOT NULL,
    stop_loss_price TEXT NOT NULL,
    timeframe TEXT,
    status TEXT NOT NULL DEFAULT 'ACTIVE',
    created_at INTEGER DEFAULT (strftime('%s', 'now')),
    closed_at INTEGER
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_backtest_symbol ON backtest_runs(symbol, interval);
CREATE INDEX IF NOT EXISTS idx_backtest_created ON backtest_runs(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_signals_symbol ON signals(symbol);
CREATE INDEX IF NOT EXISTS idx_signals_status ON signals(status)
"#;
