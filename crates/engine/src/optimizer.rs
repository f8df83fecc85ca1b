//! Grid-search parameter optimization for the indicator strategy
//!
//! Every combination of take-profit, stop-loss, RSI period and moving-average
//! period is backtested with the indicator policy. A combination qualifies
//! with more than 5 trades and a win rate above 60%; the qualifying one with
//! the highest profit wins, the first found on ties. Without any qualifying
//! combination a fixed default parameter set is returned.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    RwLock,
};
use tracing::{info, warn};

use crate::engine::BacktestEngine;
use crate::error::EngineResult;
use crate::types::{validate_series, BacktestConfig, BacktestResult, Candle, SignalPolicy};

/// Minimum trade count (exclusive) for a combination to qualify
pub const MIN_TRADES: u32 = 5;
/// Minimum win rate in percent (exclusive) for a combination to qualify
pub const MIN_WIN_RATE_PCT: u32 = 60;

// ============================================================================
// Types
// ============================================================================

/// Values tried for each optimized parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamRanges {
    pub take_profit_pct: Vec<Decimal>,
    pub stop_loss_pct: Vec<Decimal>,
    pub rsi_period: Vec<usize>,
    pub ma_period: Vec<usize>,
}

impl Default for ParamRanges {
    fn default() -> Self {
        Self {
            take_profit_pct: vec![dec!(1.0), dec!(2.0), dec!(3.0), dec!(4.0), dec!(5.0)],
            stop_loss_pct: vec![dec!(0.5), dec!(1.0), dec!(1.5), dec!(2.0)],
            rsi_period: vec![10, 14, 18, 22],
            ma_period: vec![15, 20, 25, 30],
        }
    }
}

impl ParamRanges {
    pub fn combinations(&self) -> usize {
        self.take_profit_pct.len()
            * self.stop_loss_pct.len()
            * self.rsi_period.len()
            * self.ma_period.len()
    }
}

/// One point of the parameter grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizedParams {
    pub take_profit_pct: Decimal,
    pub stop_loss_pct: Decimal,
    pub rsi_period: usize,
    pub ma_period: usize,
}

impl OptimizedParams {
    /// Returned when no combination qualifies
    pub fn fallback() -> Self {
        Self {
            take_profit_pct: dec!(2.0),
            stop_loss_pct: dec!(1.0),
            rsi_period: 14,
            ma_period: 20,
        }
    }

    /// `base` with these parameters and the indicator policy applied
    pub fn apply(&self, base: &BacktestConfig) -> BacktestConfig {
        let mut config = base.clone();
        config.strategy.policy = SignalPolicy::Indicator;
        config.strategy.take_profit_pct = self.take_profit_pct;
        config.strategy.stop_loss_pct = self.stop_loss_pct;
        config.strategy.rsi_period = self.rsi_period;
        config.strategy.ma_period = self.ma_period;
        config
    }
}

/// Backtest summary of one evaluated combination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub params: OptimizedParams,
    pub profit: Decimal,
    pub win_rate: Decimal,
    pub total_trades: u32,
    pub winning_trades: u32,
}

impl Candidate {
    pub fn from_result(params: OptimizedParams, result: &BacktestResult) -> Self {
        Self {
            params,
            profit: result.stats.final_balance - result.stats.initial_balance,
            win_rate: result.stats.win_rate,
            total_trades: result.stats.total_trades,
            winning_trades: result.stats.winning_trades,
        }
    }

    /// More than 5 trades and a win rate strictly above 60%
    pub fn qualifies(&self) -> bool {
        // Integer form of winning / total > 0.6
        self.total_trades > MIN_TRADES
            && self.winning_trades * 100 > self.total_trades * MIN_WIN_RATE_PCT
    }
}

/// Result of a grid search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizeOutcome {
    /// Best qualifying parameters, or the fallback set
    pub best: OptimizedParams,
    /// Whether `best` came from a qualifying combination
    pub found: bool,
    pub best_candidate: Option<Candidate>,
    pub combinations_tested: u32,
    pub qualifying: u32,
}

impl OptimizeOutcome {
    fn from_best(best: Option<Candidate>, combinations_tested: u32, qualifying: u32) -> Self {
        Self {
            best: best
                .as_ref()
                .map(|c| c.params.clone())
                .unwrap_or_else(OptimizedParams::fallback),
            found: best.is_some(),
            best_candidate: best,
            combinations_tested,
            qualifying,
        }
    }
}

/// Optimization run status
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizeStatus {
    Idle,
    Running,
    Complete,
    Cancelled,
    Error,
}

/// Shared progress tracker between API handler and background task
pub struct OptimizeProgress {
    pub status: RwLock<OptimizeStatus>,
    pub total_combinations: AtomicU32,
    pub completed: AtomicU32,
    pub cancelled: AtomicBool,
    pub outcome: RwLock<Option<OptimizeOutcome>>,
    pub error_message: RwLock<Option<String>>,
    pub symbol: RwLock<Option<String>>,
}

impl OptimizeProgress {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(OptimizeStatus::Idle),
            total_combinations: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
            outcome: RwLock::new(None),
            error_message: RwLock::new(None),
            symbol: RwLock::new(None),
        }
    }

    /// Reset for a new optimization run
    pub fn reset(&self, symbol: &str) {
        *self.status.write().unwrap() = OptimizeStatus::Running;
        self.clear(symbol);
    }

    /// Claim the tracker for a new run under a single status lock.
    /// Returns false if a run is already in progress.
    pub fn try_start(&self, symbol: &str) -> bool {
        let mut status = self.status.write().unwrap();
        if matches!(*status, OptimizeStatus::Running) {
            return false;
        }
        *status = OptimizeStatus::Running;
        self.clear(symbol);
        true
    }

    fn clear(&self, symbol: &str) {
        self.total_combinations.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.cancelled.store(false, Ordering::Relaxed);
        *self.outcome.write().unwrap() = None;
        *self.error_message.write().unwrap() = None;
        *self.symbol.write().unwrap() = Some(symbol.to_string());
    }

    /// Get progress as percentage
    pub fn progress_pct(&self) -> f32 {
        let total = self.total_combinations.load(Ordering::Relaxed);
        let done = self.completed.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            (done as f32 / total as f32) * 100.0
        }
    }

    /// Check if currently running
    pub fn is_running(&self) -> bool {
        matches!(*self.status.read().unwrap(), OptimizeStatus::Running)
    }

    pub fn fail(&self, message: impl Into<String>) {
        *self.error_message.write().unwrap() = Some(message.into());
        *self.status.write().unwrap() = OptimizeStatus::Error;
    }
}

impl Default for OptimizeProgress {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Grid Generation
// ============================================================================

/// Cartesian product of the ranges, take-profit varying slowest
pub fn generate_grid(ranges: &ParamRanges) -> Vec<OptimizedParams> {
    let mut grid = Vec::with_capacity(ranges.combinations());
    for &tp in &ranges.take_profit_pct {
        for &sl in &ranges.stop_loss_pct {
            for &rsi in &ranges.rsi_period {
                for &ma in &ranges.ma_period {
                    grid.push(OptimizedParams {
                        take_profit_pct: tp,
                        stop_loss_pct: sl,
                        rsi_period: rsi,
                        ma_period: ma,
                    });
                }
            }
        }
    }
    grid
}

/// Keep `candidate` only if it qualifies and strictly beats `best`
pub fn consider(best: &mut Option<Candidate>, candidate: Candidate) -> bool {
    if !candidate.qualifies() {
        return false;
    }
    if best.as_ref().map_or(true, |b| candidate.profit > b.profit) {
        *best = Some(candidate);
    }
    true
}

// ============================================================================
// Search
// ============================================================================

/// Run the grid search over `candles`, publishing progress as it goes.
///
/// The caller resets `progress` beforehand; setting `progress.cancelled`
/// stops the search before the next combination and keeps the best so far.
pub fn run_optimization(
    base: &BacktestConfig,
    ranges: &ParamRanges,
    candles: &[Candle],
    progress: &OptimizeProgress,
) -> EngineResult<OptimizeOutcome> {
    if let Err(e) = validate_series(candles) {
        progress.fail(e.to_string());
        return Err(e);
    }

    let grid = generate_grid(ranges);
    progress
        .total_combinations
        .store(grid.len() as u32, Ordering::Relaxed);

    info!(
        symbol = %base.symbol,
        candles = candles.len(),
        combinations = grid.len(),
        "Starting parameter optimization"
    );

    let mut best: Option<Candidate> = None;
    let mut tested = 0u32;
    let mut qualifying = 0u32;
    let mut cancelled = false;

    for params in grid {
        if progress.cancelled.load(Ordering::Relaxed) {
            warn!(tested, "Optimization cancelled");
            cancelled = true;
            break;
        }

        let config = params.apply(base);
        let result = match BacktestEngine::run(&config, candles) {
            Ok(result) => result,
            Err(e) => {
                progress.fail(e.to_string());
                return Err(e);
            }
        };

        if consider(&mut best, Candidate::from_result(params, &result)) {
            qualifying += 1;
        }
        tested += 1;
        progress.completed.store(tested, Ordering::Relaxed);
    }

    let outcome = OptimizeOutcome::from_best(best, tested, qualifying);

    match &outcome.best_candidate {
        Some(c) => info!(
            tp = %c.params.take_profit_pct,
            sl = %c.params.stop_loss_pct,
            rsi = c.params.rsi_period,
            ma = c.params.ma_period,
            profit = %c.profit,
            win_rate = %c.win_rate,
            trades = c.total_trades,
            "Best configuration found"
        ),
        None => info!(tested, "No qualifying configuration, using defaults"),
    }

    *progress.outcome.write().unwrap() = Some(outcome.clone());
    *progress.status.write().unwrap() = if cancelled {
        OptimizeStatus::Cancelled
    } else {
        OptimizeStatus::Complete
    };

    Ok(outcome)
}

/// Grid search without external progress tracking
pub fn optimize(
    base: &BacktestConfig,
    ranges: &ParamRanges,
    candles: &[Candle],
) -> EngineResult<OptimizeOutcome> {
    run_optimization(base, ranges, candles, &OptimizeProgress::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    fn candidate(profit: Decimal, total: u32, wins: u32, rsi: usize) -> Candidate {
        Candidate {
            params: OptimizedParams {
                rsi_period: rsi,
                ..OptimizedParams::fallback()
            },
            profit,
            win_rate: Decimal::ZERO,
            total_trades: total,
            winning_trades: wins,
        }
    }

    fn pick_best(candidates: impl IntoIterator<Item = Candidate>) -> Option<Candidate> {
        let mut best = None;
        for candidate in candidates {
            consider(&mut best, candidate);
        }
        best
    }

    /// A plateau, a sharp drop and a rebound, repeated: each rebound fires a
    /// LONG at 132 that exits on the next close of 140
    fn rebound_cycles(cycles: usize) -> Vec<Candle> {
        let mut closes = vec![dec!(200); 9];
        closes.extend([
            dec!(170),
            dec!(140),
            dec!(110),
            dec!(114),
            dec!(122),
            dec!(132),
            dec!(140),
            dec!(160),
            dec!(180),
        ]);
        closes
            .iter()
            .cycle()
            .take(closes.len() * cycles)
            .enumerate()
            .map(|(i, &close)| Candle::flat(i as i64 * 3_600_000, close))
            .collect()
    }

    fn flat_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| Candle::flat(i as i64 * 3_600_000, dec!(100)))
            .collect()
    }

    #[test]
    fn test_default_grid_generation() {
        let grid = generate_grid(&ParamRanges::default());
        assert_eq!(grid.len(), 5 * 4 * 4 * 4); // 320
        assert_eq!(grid[0].take_profit_pct, dec!(1.0));
        assert_eq!(grid[0].ma_period, 15);
        assert_eq!(grid[1].ma_period, 20);
        assert_eq!(grid[319].take_profit_pct, dec!(5.0));
        assert_eq!(grid[319].stop_loss_pct, dec!(2.0));
    }

    #[test]
    fn test_qualification_thresholds_are_exclusive() {
        // Exactly 5 trades never qualifies
        assert!(!candidate(dec!(10), 5, 5, 14).qualifies());
        // Exactly 60% never qualifies
        assert!(!candidate(dec!(10), 10, 6, 14).qualifies());
        assert!(candidate(dec!(10), 10, 7, 14).qualifies());
        assert!(candidate(dec!(10), 6, 4, 14).qualifies());
    }

    #[test]
    fn test_pick_best_first_found_wins_ties() {
        let best = pick_best(vec![
            candidate(dec!(50), 10, 2, 10), // low win rate
            candidate(dec!(30), 10, 8, 14),
            candidate(dec!(40), 10, 8, 18),
            candidate(dec!(40), 10, 9, 22), // equal profit, later
            candidate(dec!(99), 3, 3, 99),  // too few trades
        ])
        .unwrap();
        assert_eq!(best.params.rsi_period, 18);
        assert_eq!(best.profit, dec!(40));

        assert!(pick_best(vec![candidate(dec!(5), 2, 2, 14)]).is_none());
    }

    #[test]
    fn test_no_qualifying_combination_returns_fallback() {
        let outcome = optimize(
            &BacktestConfig::default(),
            &ParamRanges::default(),
            &flat_candles(60),
        )
        .unwrap();
        assert!(!outcome.found);
        assert_eq!(outcome.best, OptimizedParams::fallback());
        assert_eq!(outcome.best.take_profit_pct, dec!(2.0));
        assert_eq!(outcome.best.stop_loss_pct, dec!(1.0));
        assert_eq!(outcome.best.rsi_period, 14);
        assert_eq!(outcome.best.ma_period, 20);
        assert_eq!(outcome.combinations_tested, 320);
        assert_eq!(outcome.qualifying, 0);
    }

    #[test]
    fn test_empty_ranges_use_fallback() {
        let ranges = ParamRanges {
            rsi_period: vec![],
            ..Default::default()
        };
        let outcome = optimize(&BacktestConfig::default(), &ranges, &flat_candles(10)).unwrap();
        assert_eq!(outcome.combinations_tested, 0);
        assert_eq!(outcome.best, OptimizedParams::fallback());
    }

    #[test]
    fn test_cancelled_run_stops_and_reports() {
        let progress = OptimizeProgress::new();
        progress.reset("BTCUSDT");
        assert!(progress.is_running());
        progress.cancelled.store(true, Ordering::Relaxed);

        let outcome = run_optimization(
            &BacktestConfig::default(),
            &ParamRanges::default(),
            &flat_candles(60),
            &progress,
        )
        .unwrap();
        assert_eq!(outcome.combinations_tested, 0);
        assert_eq!(outcome.best, OptimizedParams::fallback());
        assert!(matches!(
            *progress.status.read().unwrap(),
            OptimizeStatus::Cancelled
        ));
        assert_eq!(progress.total_combinations.load(Ordering::Relaxed), 320);
    }

    #[test]
    fn test_zero_period_marks_progress_failed() {
        let progress = OptimizeProgress::new();
        progress.reset("BTCUSDT");
        let ranges = ParamRanges {
            ma_period: vec![0],
            ..Default::default()
        };
        let err = run_optimization(&BacktestConfig::default(), &ranges, &flat_candles(5), &progress)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
        assert!(matches!(
            *progress.status.read().unwrap(),
            OptimizeStatus::Error
        ));
        assert!(progress.error_message.read().unwrap().is_some());
    }

    #[test]
    fn test_rebound_series_finds_qualifying_params() {
        let mut base = BacktestConfig::default();
        base.strategy.ema_fast = 2;
        base.strategy.ema_slow = 3;
        let ranges = ParamRanges {
            take_profit_pct: vec![dec!(2)],
            stop_loss_pct: vec![dec!(1)],
            rsi_period: vec![8],
            ma_period: vec![2],
        };

        let progress = OptimizeProgress::new();
        assert!(progress.try_start("BTCUSDT"));
        let outcome = run_optimization(&base, &ranges, &rebound_cycles(6), &progress).unwrap();

        assert!(outcome.found);
        assert_eq!(outcome.combinations_tested, 1);
        assert_eq!(outcome.qualifying, 1);
        assert_eq!(outcome.best.rsi_period, 8);
        assert_eq!(outcome.best.ma_period, 2);

        let best = outcome.best_candidate.unwrap();
        assert_eq!(best.total_trades, 6);
        assert_eq!(best.winning_trades, 6);
        assert!(best.profit > Decimal::ZERO);
        assert!(matches!(
            *progress.status.read().unwrap(),
            OptimizeStatus::Complete
        ));

        // Five cycles give five winners, one short of qualifying
        let outcome = optimize(&base, &ranges, &rebound_cycles(5)).unwrap();
        assert!(!outcome.found);
        assert_eq!(outcome.best, OptimizedParams::fallback());
    }

    #[test]
    fn test_try_start_refuses_second_optimization() {
        let progress = OptimizeProgress::new();
        assert!(progress.try_start("BTCUSDT"));
        assert!(progress.is_running());
        assert!(!progress.try_start("ETHUSDT"));
        assert_eq!(progress.symbol.read().unwrap().as_deref(), Some("BTCUSDT"));

        progress.fail("boom");
        assert!(progress.try_start("ETHUSDT"));
        assert_eq!(progress.symbol.read().unwrap().as_deref(), Some("ETHUSDT"));
        assert!(progress.error_message.read().unwrap().is_none());
    }

    #[test]
    fn test_apply_forces_indicator_policy() {
        let base = BacktestConfig::default();
        let params = OptimizedParams {
            take_profit_pct: dec!(3),
            stop_loss_pct: dec!(1.5),
            rsi_period: 10,
            ma_period: 30,
        };
        let config = params.apply(&base);
        assert_eq!(config.strategy.policy, SignalPolicy::Indicator);
        assert_eq!(config.strategy.rsi_period, 10);
        assert_eq!(config.strategy.ma_period, 30);
        assert_eq!(config.strategy.ema_fast, 12);
        assert_eq!(config.initial_balance, base.initial_balance);
    }
}
