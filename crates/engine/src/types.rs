//! Types shared by the level analysis and backtesting engines

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{EngineError, EngineResult};

/// A single candlestick (OHLCV)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bucket open time, ms since epoch
    pub timestamp: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    /// A flat candle where every price equals `price`
    pub fn flat(timestamp: i64, price: Decimal) -> Self {
        Self {
            timestamp,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: Decimal::ZERO,
        }
    }
}

/// Reject series with non-monotonic timestamps or non-positive closes.
///
/// Empty and single-candle series are valid; they just produce empty results.
pub fn validate_series(candles: &[Candle]) -> EngineResult<()> {
    for (i, candle) in candles.iter().enumerate() {
        if candle.close <= Decimal::ZERO {
            return Err(EngineError::invalid(format!(
                "candle {} has non-positive close {}",
                i, candle.close
            )));
        }
        if i > 0 && candle.timestamp < candles[i - 1].timestamp {
            return Err(EngineError::invalid(format!(
                "timestamps not monotonic at candle {} ({} < {})",
                i,
                candle.timestamp,
                candles[i - 1].timestamp
            )));
        }
    }
    Ok(())
}

/// Closing prices of a series, in order
pub fn closes(candles: &[Candle]) -> Vec<Decimal> {
    candles.iter().map(|c| c.close).collect()
}

// ============================================================================
// Timeframes
// ============================================================================

/// Analysis timeframe. Declaration order is the iteration order of analyses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1M")]
    Month1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 5] = [
        Timeframe::M15,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
        Timeframe::Month1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
            Timeframe::Month1 => "1M",
        }
    }

    /// Days of history fetched for this timeframe
    pub fn history_days(&self) -> u32 {
        match self {
            Timeframe::M15 => 1,
            Timeframe::H1 => 7,
            Timeframe::H4 => 30,
            Timeframe::D1 => 90,
            Timeframe::Month1 => 365,
        }
    }

    /// Sampling granularity requested from the price history provider
    pub fn sampling(&self) -> &'static str {
        match self {
            Timeframe::D1 | Timeframe::Month1 => "daily",
            _ => "hourly",
        }
    }

    /// Parse a comma separated list ("1h,4h"), skipping unknown entries
    pub fn parse_list(s: &str) -> Vec<Timeframe> {
        s.split(',')
            .filter_map(|part| part.trim().parse().ok())
            .collect()
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "15m" => Ok(Timeframe::M15),
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" => Ok(Timeframe::D1),
            "1M" => Ok(Timeframe::Month1),
            other => Err(EngineError::invalid(format!("unknown timeframe '{}'", other))),
        }
    }
}

/// An entry of the coin universe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinInfo {
    pub id: String,
    pub name: String,
    pub symbol: String,
}

// ============================================================================
// Strategy / backtest configuration
// ============================================================================

/// Which entry rule drives the backtest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalPolicy {
    /// Close-to-close breakout of `breakout_pct`
    Threshold,
    /// RSI extreme + EMA cross + SMA filter
    Indicator,
}

impl fmt::Display for SignalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalPolicy::Threshold => write!(f, "threshold"),
            SignalPolicy::Indicator => write!(f, "indicator"),
        }
    }
}

/// Parameters for signal generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub policy: SignalPolicy,
    /// Take-profit distance from entry, in percent (2.0 = 2%)
    pub take_profit_pct: Decimal,
    /// Stop-loss distance from entry, in percent
    pub stop_loss_pct: Decimal,
    pub rsi_period: usize,
    pub ma_period: usize,
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    /// Close-to-close move that triggers the threshold policy, in percent
    pub breakout_pct: Decimal,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            policy: SignalPolicy::Threshold,
            take_profit_pct: dec!(2.0),
            stop_loss_pct: dec!(1.0),
            rsi_period: 14,
            ma_period: 20,
            ema_fast: 12,
            ema_slow: 26,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            breakout_pct: dec!(3),
        }
    }
}

/// Configuration for a backtest run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub symbol: String,
    pub interval: String,
    pub initial_balance: Decimal,
    pub leverage: Decimal,
    /// Share of the current balance committed per position (0.1 = 10%)
    pub position_fraction: Decimal,
    pub strategy: StrategyConfig,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            interval: "1h".to_string(),
            initial_balance: dec!(1000),
            leverage: dec!(10),
            position_fraction: dec!(0.1),
            strategy: StrategyConfig::default(),
        }
    }
}

// ============================================================================
// Signals, trades and results
// ============================================================================

/// Direction of a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "long"),
            Side::Short => write!(f, "short"),
        }
    }
}

/// An entry event with precomputed exit prices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub timestamp: i64,
    pub side: Side,
    pub price: Decimal,
    pub take_profit_price: Decimal,
    pub stop_loss_price: Decimal,
}

impl Signal {
    /// Build a signal, deriving TP/SL prices from percentage distances.
    pub fn new(timestamp: i64, side: Side, price: Decimal, tp_pct: Decimal, sl_pct: Decimal) -> Self {
        let hundred = dec!(100);
        let (take_profit_price, stop_loss_price) = match side {
            Side::Long => (
                price * (Decimal::ONE + tp_pct / hundred),
                price * (Decimal::ONE - sl_pct / hundred),
            ),
            Side::Short => (
                price * (Decimal::ONE - tp_pct / hundred),
                price * (Decimal::ONE + sl_pct / hundred),
            ),
        };
        Self {
            timestamp,
            side,
            price,
            take_profit_price,
            stop_loss_price,
        }
    }
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    #[serde(rename = "TP Hit")]
    TakeProfit,
    #[serde(rename = "SL Hit")]
    StopLoss,
    #[serde(rename = "End of Period")]
    EndOfPeriod,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::TakeProfit => write!(f, "TP Hit"),
            ExitReason::StopLoss => write!(f, "SL Hit"),
            ExitReason::EndOfPeriod => write!(f, "End of Period"),
        }
    }
}

/// A closed trade in the backtest ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub entry_time: i64,
    pub exit_time: i64,
    pub side: Side,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub size: Decimal,
    pub pnl: Decimal,
    pub balance_after: Decimal,
    pub exit_reason: ExitReason,
    /// Whole hours between entry and exit
    pub duration_hours: i64,
}

/// Summary statistics derived from a ledger
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub initial_balance: Decimal,
    pub final_balance: Decimal,
    pub total_profit: Decimal,
    pub total_profit_pct: Decimal,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    /// Percentage of winning trades (0-100)
    pub win_rate: Decimal,
    pub avg_profit: Decimal,
    pub avg_loss: Decimal,
    pub max_profit: Decimal,
    pub max_loss: Decimal,
    pub profit_factor: Decimal,
    pub max_drawdown_pct: Decimal,
}

/// Result of a backtest run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub symbol: String,
    pub interval: String,
    pub policy: SignalPolicy,
    pub start_time: i64,
    pub end_time: i64,
    #[serde(flatten)]
    pub stats: LedgerStats,
    pub trades: Vec<Trade>,
}

impl BacktestResult {
    /// Recompute the statistics from the ledger alone
    pub fn recompute_stats(&self) -> LedgerStats {
        LedgerStats::from_trades(self.stats.initial_balance, &self.trades)
    }
}
