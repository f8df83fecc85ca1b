//! Bar-by-bar backtesting engine

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::indicators::build_signal_generator;
use crate::types::*;

const MS_PER_HOUR: i64 = 3_600_000;

/// Position state during simulation
struct OpenPosition {
    side: Side,
    entry_time: i64,
    entry_price: Decimal,
    size: Decimal,
    take_profit_price: Decimal,
    stop_loss_price: Decimal,
}

impl OpenPosition {
    fn pnl_at(&self, price: Decimal) -> Decimal {
        match self.side {
            Side::Long => (price - self.entry_price) * self.size,
            Side::Short => (self.entry_price - price) * self.size,
        }
    }

    /// Exit triggered by `price`, take-profit checked first
    fn exit_reason(&self, price: Decimal) -> Option<ExitReason> {
        let (tp_hit, sl_hit) = match self.side {
            Side::Long => (price >= self.take_profit_price, price <= self.stop_loss_price),
            Side::Short => (price <= self.take_profit_price, price >= self.stop_loss_price),
        };
        if tp_hit {
            Some(ExitReason::TakeProfit)
        } else if sl_hit {
            Some(ExitReason::StopLoss)
        } else {
            None
        }
    }

    fn close(self, candle: &Candle, reason: ExitReason, balance: &mut Decimal) -> Trade {
        let pnl = self.pnl_at(candle.close);
        *balance += pnl;

        debug!(
            side = %self.side,
            entry = %self.entry_price,
            exit = %candle.close,
            pnl = %pnl,
            reason = %reason,
            "Closed position"
        );

        Trade {
            entry_time: self.entry_time,
            exit_time: candle.timestamp,
            side: self.side,
            entry_price: self.entry_price,
            exit_price: candle.close,
            size: self.size,
            pnl,
            balance_after: *balance,
            exit_reason: reason,
            duration_hours: (candle.timestamp - self.entry_time) / MS_PER_HOUR,
        }
    }
}

/// Backtesting engine that simulates bar-by-bar execution
pub struct BacktestEngine;

impl BacktestEngine {
    /// Run a backtest on the given candles with the specified config.
    ///
    /// Series shorter than two candles yield an empty ledger.
    pub fn run(config: &BacktestConfig, candles: &[Candle]) -> EngineResult<BacktestResult> {
        validate_series(candles)?;
        if config.initial_balance <= Decimal::ZERO
            || config.leverage <= Decimal::ZERO
            || config.position_fraction <= Decimal::ZERO
        {
            return Err(EngineError::invalid(
                "balance, leverage and position fraction must be positive",
            ));
        }
        let mut generator = build_signal_generator(&config.strategy)?;

        info!(
            symbol = %config.symbol,
            bars = candles.len(),
            balance = %config.initial_balance,
            leverage = %config.leverage,
            policy = %config.strategy.policy,
            "Starting backtest"
        );

        let mut balance = config.initial_balance;
        let mut trades: Vec<Trade> = Vec::new();
        let mut position: Option<OpenPosition> = None;

        if candles.len() >= 2 {
            // The first candle only seeds the generator
            generator.on_bar(&candles[0]);

            for candle in &candles[1..] {
                let signal = generator.on_bar(candle);

                if let Some(reason) = position.as_ref().and_then(|p| p.exit_reason(candle.close)) {
                    if let Some(pos) = position.take() {
                        trades.push(pos.close(candle, reason, &mut balance));
                    }
                }

                if position.is_some() || balance <= Decimal::ZERO {
                    continue;
                }
                if let Some(signal) = signal {
                    let size = balance * config.leverage * config.position_fraction / signal.price;

                    debug!(
                        side = %signal.side,
                        price = %signal.price,
                        size = %size,
                        time = signal.timestamp,
                        "Opened position"
                    );

                    position = Some(OpenPosition {
                        side: signal.side,
                        entry_time: signal.timestamp,
                        entry_price: signal.price,
                        size,
                        take_profit_price: signal.take_profit_price,
                        stop_loss_price: signal.stop_loss_price,
                    });
                }
            }

            // Close any remaining open position at last bar
            if let (Some(pos), Some(last)) = (position.take(), candles.last()) {
                trades.push(pos.close(last, ExitReason::EndOfPeriod, &mut balance));
            }
        }

        let stats = LedgerStats::from_trades(config.initial_balance, &trades);

        info!(
            total_trades = stats.total_trades,
            winning_trades = stats.winning_trades,
            win_rate = %stats.win_rate,
            total_profit = %stats.total_profit,
            max_drawdown_pct = %stats.max_drawdown_pct,
            "Backtest complete"
        );

        Ok(BacktestResult {
            symbol: config.symbol.clone(),
            interval: config.interval.clone(),
            policy: config.strategy.policy,
            start_time: candles.first().map(|c| c.timestamp).unwrap_or(0),
            end_time: candles.last().map(|c| c.timestamp).unwrap_or(0),
            stats,
            trades,
        })
    }
}

impl LedgerStats {
    /// Summary statistics as a pure function of the ledger
    pub fn from_trades(initial_balance: Decimal, trades: &[Trade]) -> Self {
        let hundred = dec!(100);
        let final_balance = trades.iter().fold(initial_balance, |bal, t| bal + t.pnl);

        let winners: Vec<Decimal> = trades
            .iter()
            .filter(|t| t.pnl > Decimal::ZERO)
            .map(|t| t.pnl)
            .collect();
        let losers: Vec<Decimal> = trades
            .iter()
            .filter(|t| t.pnl <= Decimal::ZERO)
            .map(|t| t.pnl)
            .collect();

        let total_trades = trades.len() as u32;
        let win_rate = if total_trades > 0 {
            (Decimal::from(winners.len() as u32) / Decimal::from(total_trades) * hundred)
                .round_dp(2)
        } else {
            Decimal::ZERO
        };

        let total_profit = final_balance - initial_balance;
        let total_profit_pct = if initial_balance > Decimal::ZERO {
            (total_profit / initial_balance * hundred).round_dp(2)
        } else {
            Decimal::ZERO
        };

        // Profit factor = gross profits / gross losses
        let gross_profits: Decimal = winners.iter().sum();
        let gross_losses: Decimal = losers.iter().map(|p| p.abs()).sum();
        let profit_factor = if gross_losses > Decimal::ZERO {
            (gross_profits / gross_losses).round_dp(2)
        } else if gross_profits > Decimal::ZERO {
            dec!(999.99) // Infinite profit factor capped
        } else {
            Decimal::ZERO
        };

        Self {
            initial_balance,
            final_balance,
            total_profit,
            total_profit_pct,
            total_trades,
            winning_trades: winners.len() as u32,
            losing_trades: losers.len() as u32,
            win_rate,
            avg_profit: mean(&winners),
            avg_loss: mean(&losers),
            max_profit: trades.iter().map(|t| t.pnl).max().unwrap_or(Decimal::ZERO),
            max_loss: trades.iter().map(|t| t.pnl).min().unwrap_or(Decimal::ZERO),
            profit_factor,
            max_drawdown_pct: max_drawdown_pct(initial_balance, trades),
        }
    }
}

fn mean(values: &[Decimal]) -> Decimal {
    if values.is_empty() {
        return Decimal::ZERO;
    }
    values.iter().sum::<Decimal>() / Decimal::from(values.len() as u32)
}

/// Largest peak-to-trough fall of the balance-after sequence, in percent
fn max_drawdown_pct(initial_balance: Decimal, trades: &[Trade]) -> Decimal {
    let mut peak = initial_balance;
    let mut worst = Decimal::ZERO;
    for balance in trades.iter().map(|t| t.balance_after) {
        if balance > peak {
            peak = balance;
        } else if peak > Decimal::ZERO {
            worst = worst.max((peak - balance) / peak * dec!(100));
        }
    }
    worst.round_dp(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn make_candles(prices: &[f64]) -> Vec<Candle> {
        prices
            .iter()
            .enumerate()
            .map(|(i, &p)| {
                let price = Decimal::from_str_exact(&format!("{:.2}", p)).unwrap();
                Candle {
                    timestamp: (i as i64) * MS_PER_HOUR,
                    open: price,
                    high: price + dec!(1),
                    low: price - dec!(1),
                    close: price,
                    volume: dec!(100),
                }
            })
            .collect()
    }

    fn trade(pnl: Decimal, balance_after: Decimal) -> Trade {
        Trade {
            entry_time: 0,
            exit_time: 0,
            side: Side::Long,
            entry_price: dec!(100),
            exit_price: dec!(100),
            size: dec!(1),
            pnl,
            balance_after,
            exit_reason: ExitReason::TakeProfit,
            duration_hours: 0,
        }
    }

    #[test]
    fn test_empty_and_single_candle() {
        let config = BacktestConfig::default();
        for candles in [vec![], make_candles(&[100.0])] {
            let result = BacktestEngine::run(&config, &candles).unwrap();
            assert!(result.trades.is_empty());
            assert_eq!(result.stats.final_balance, dec!(1000));
            assert_eq!(result.stats.total_trades, 0);
            assert_eq!(result.stats.win_rate, Decimal::ZERO);
        }
    }

    #[test]
    fn test_take_profit_then_end_of_period() {
        let candles = make_candles(&[100.0, 104.0, 108.0]);
        let result = BacktestEngine::run(&BacktestConfig::default(), &candles).unwrap();

        assert_eq!(result.trades.len(), 2);
        let first = &result.trades[0];
        assert_eq!(first.side, Side::Long);
        assert_eq!(first.entry_price, dec!(104));
        assert_eq!(first.exit_price, dec!(108));
        assert_eq!(first.exit_reason, ExitReason::TakeProfit);
        assert_eq!(first.duration_hours, 1);
        // size = 1000 * 10 * 0.1 / 104
        assert_eq!(first.pnl.round_dp(4), dec!(38.4615));

        // 108 is itself a breakout, so a new long opens and is force-closed flat
        let second = &result.trades[1];
        assert_eq!(second.entry_price, dec!(108));
        assert_eq!(second.exit_reason, ExitReason::EndOfPeriod);
        assert_eq!(second.pnl, Decimal::ZERO);
        assert_eq!(second.duration_hours, 0);

        assert_eq!(result.stats.winning_trades, 1);
        assert_eq!(result.stats.losing_trades, 1);
        assert_eq!(result.stats.win_rate, dec!(50));
        assert_eq!(result.stats.final_balance, dec!(1000) + first.pnl);
        assert_eq!(result.stats.profit_factor, dec!(999.99));
    }

    #[test]
    fn test_long_stop_loss() {
        let candles = make_candles(&[100.0, 104.0, 102.0]);
        let result = BacktestEngine::run(&BacktestConfig::default(), &candles).unwrap();

        assert_eq!(result.trades.len(), 1);
        let t = &result.trades[0];
        assert_eq!(t.exit_reason, ExitReason::StopLoss);
        assert_eq!(t.pnl.round_dp(4), dec!(-19.2308));
        assert_eq!(result.stats.max_loss, t.pnl);
        assert_eq!(result.stats.avg_profit, Decimal::ZERO);
        assert_eq!(result.stats.max_drawdown_pct, dec!(1.92));
    }

    #[test]
    fn test_short_take_profit() {
        let candles = make_candles(&[100.0, 96.0, 94.0]);
        let result = BacktestEngine::run(&BacktestConfig::default(), &candles).unwrap();

        assert_eq!(result.trades.len(), 1);
        let t = &result.trades[0];
        assert_eq!(t.side, Side::Short);
        assert_eq!(t.exit_reason, ExitReason::TakeProfit);
        assert_eq!(t.pnl.round_dp(4), dec!(20.8333));
    }

    #[test]
    fn test_invalid_inputs_are_rejected() {
        let mut candles = make_candles(&[100.0, 104.0, 108.0]);
        candles[2].timestamp = 0;
        assert!(matches!(
            BacktestEngine::run(&BacktestConfig::default(), &candles),
            Err(EngineError::InvalidInput(_))
        ));

        let config = BacktestConfig {
            leverage: dec!(0),
            ..Default::default()
        };
        assert!(BacktestEngine::run(&config, &make_candles(&[1.0, 2.0])).is_err());
    }

    #[test]
    fn test_stats_from_ledger() {
        let trades = vec![
            trade(dec!(10), dec!(1010)),
            trade(dec!(-5), dec!(1005)),
            trade(dec!(20), dec!(1025)),
            trade(dec!(0), dec!(1025)),
        ];
        let stats = LedgerStats::from_trades(dec!(1000), &trades);

        assert_eq!(stats.final_balance, dec!(1025));
        assert_eq!(stats.total_profit, dec!(25));
        assert_eq!(stats.total_profit_pct, dec!(2.5));
        assert_eq!(stats.winning_trades, 2);
        assert_eq!(stats.losing_trades, 2);
        assert_eq!(stats.win_rate, dec!(50));
        assert_eq!(stats.avg_profit, dec!(15));
        assert_eq!(stats.avg_loss, dec!(-2.5));
        assert_eq!(stats.max_profit, dec!(20));
        assert_eq!(stats.max_loss, dec!(-5));
        assert_eq!(stats.profit_factor, dec!(6));
        // 5 / 1010
        assert_eq!(stats.max_drawdown_pct, dec!(0.50));
    }

    #[test]
    fn test_empty_ledger_stats_are_zero() {
        let stats = LedgerStats::from_trades(dec!(500), &[]);
        assert_eq!(stats.final_balance, dec!(500));
        assert_eq!(stats.win_rate, Decimal::ZERO);
        assert_eq!(stats.avg_profit, Decimal::ZERO);
        assert_eq!(stats.avg_loss, Decimal::ZERO);
        assert_eq!(stats.max_profit, Decimal::ZERO);
        assert_eq!(stats.max_loss, Decimal::ZERO);
        assert_eq!(stats.profit_factor, Decimal::ZERO);
    }

    #[test]
    fn test_ledger_replays_exactly_on_random_walks() {
        let mut rng = StdRng::seed_from_u64(42);
        for round in 0..30 {
            let mut price = 100.0_f64;
            let prices: Vec<f64> = (0..300)
                .map(|_| {
                    price = (price * (1.0 + rng.gen_range(-0.05..0.05))).max(1.0);
                    price
                })
                .collect();
            let candles = make_candles(&prices);

            let policy = if round % 2 == 0 {
                SignalPolicy::Threshold
            } else {
                SignalPolicy::Indicator
            };
            let config = BacktestConfig {
                strategy: StrategyConfig {
                    policy,
                    ..Default::default()
                },
                ..Default::default()
            };
            let result = BacktestEngine::run(&config, &candles).unwrap();

            let mut balance = config.initial_balance;
            for t in &result.trades {
                balance += t.pnl;
                assert_eq!(t.balance_after, balance);
                assert!(t.exit_time >= t.entry_time);
            }
            assert_eq!(result.stats.final_balance, balance);
            for pair in result.trades.windows(2) {
                assert!(pair[1].entry_time >= pair[0].exit_time);
            }
            assert_eq!(result.recompute_stats(), result.stats);
        }
    }
}
