//! Entry signal generators for the backtester
//!
//! Provides a `SignalGenerator` trait with two policies: a close-to-close
//! breakout rule and an RSI / EMA-cross / SMA-filter rule. Generators are fed
//! every candle in order and emit at most one `Signal` per candle.
//!
//! The indicator policy stays silent until it has seen more candles than the
//! longest of its periods, the EMA spans included. Both EMAs are recursive
//! with `k = 2 / (span + 1)` and are seeded with the first close rather than
//! an SMA of the first `span` closes (the `adjust=False` convention), so early
//! values lean on that first close until the warm-up has passed.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use ta::indicators::{ExponentialMovingAverage, SimpleMovingAverage};
use ta::{Next, Reset};

use crate::error::{EngineError, EngineResult};
use crate::types::{Candle, Side, Signal, SignalPolicy, StrategyConfig};

// ============================================================================
// Core trait
// ============================================================================

/// Trait for bar-by-bar signal generation
pub trait SignalGenerator: Send {
    fn name(&self) -> &str;
    fn on_bar(&mut self, candle: &Candle) -> Option<Signal>;
    fn reset(&mut self);
}

fn close_f64(candle: &Candle) -> f64 {
    candle.close.to_f64().unwrap_or(0.0)
}

fn sma(period: usize, what: &str) -> EngineResult<SimpleMovingAverage> {
    SimpleMovingAverage::new(period)
        .map_err(|_| EngineError::invalid(format!("{} period must be positive", what)))
}

fn ema(period: usize, what: &str) -> EngineResult<ExponentialMovingAverage> {
    ExponentialMovingAverage::new(period)
        .map_err(|_| EngineError::invalid(format!("{} span must be positive", what)))
}

// ============================================================================
// 1. Threshold (breakout) generator
// ============================================================================

pub struct ThresholdSignalGenerator {
    breakout: Decimal,
    take_profit_pct: Decimal,
    stop_loss_pct: Decimal,
    prev_close: Option<Decimal>,
}

impl ThresholdSignalGenerator {
    pub fn new(breakout_pct: Decimal, take_profit_pct: Decimal, stop_loss_pct: Decimal) -> Self {
        Self {
            breakout: breakout_pct / dec!(100),
            take_profit_pct,
            stop_loss_pct,
            prev_close: None,
        }
    }
}

impl SignalGenerator for ThresholdSignalGenerator {
    fn name(&self) -> &str {
        "Threshold"
    }

    fn on_bar(&mut self, candle: &Candle) -> Option<Signal> {
        let prev = self.prev_close.replace(candle.close)?;

        let side = if candle.close > prev * (Decimal::ONE + self.breakout) {
            Side::Long
        } else if candle.close < prev * (Decimal::ONE - self.breakout) {
            Side::Short
        } else {
            return None;
        };

        Some(Signal::new(
            candle.timestamp,
            side,
            candle.close,
            self.take_profit_pct,
            self.stop_loss_pct,
        ))
    }

    fn reset(&mut self) {
        self.prev_close = None;
    }
}

// ============================================================================
// 2. Indicator generator (RSI + EMA cross + SMA filter)
// ============================================================================

/// RSI as the ratio of the simple averages of gains and losses over
/// `period` deltas.
struct SmaRsi {
    gains: SimpleMovingAverage,
    losses: SimpleMovingAverage,
    prev_close: Option<f64>,
}

impl SmaRsi {
    fn new(period: usize) -> EngineResult<Self> {
        Ok(Self {
            gains: sma(period, "RSI")?,
            losses: sma(period, "RSI")?,
            prev_close: None,
        })
    }

    /// `None` on the first bar and while the window holds no movement at all
    fn next(&mut self, close: f64) -> Option<f64> {
        let prev = self.prev_close.replace(close)?;
        let delta = close - prev;
        let avg_gain = self.gains.next(delta.max(0.0));
        let avg_loss = self.losses.next((-delta).max(0.0));

        if avg_loss == 0.0 {
            return if avg_gain == 0.0 { None } else { Some(100.0) };
        }
        Some(100.0 - 100.0 / (1.0 + avg_gain / avg_loss))
    }

    fn reset(&mut self) {
        self.gains.reset();
        self.losses.reset();
        self.prev_close = None;
    }
}

pub struct IndicatorSignalGenerator {
    rsi: SmaRsi,
    sma: SimpleMovingAverage,
    ema_fast: ExponentialMovingAverage,
    ema_slow: ExponentialMovingAverage,
    oversold: f64,
    overbought: f64,
    take_profit_pct: Decimal,
    stop_loss_pct: Decimal,
    /// Candles needed before the current one may signal
    warmup: usize,
    bars_seen: usize,
    prev_fast: Option<f64>,
    prev_slow: Option<f64>,
}

impl IndicatorSignalGenerator {
    pub fn new(config: &StrategyConfig) -> EngineResult<Self> {
        Ok(Self {
            rsi: SmaRsi::new(config.rsi_period)?,
            sma: sma(config.ma_period, "Moving average")?,
            ema_fast: ema(config.ema_fast, "Fast EMA")?,
            ema_slow: ema(config.ema_slow, "Slow EMA")?,
            oversold: config.rsi_oversold,
            overbought: config.rsi_overbought,
            take_profit_pct: config.take_profit_pct,
            stop_loss_pct: config.stop_loss_pct,
            warmup: config
                .rsi_period
                .max(config.ma_period)
                .max(config.ema_fast)
                .max(config.ema_slow),
            bars_seen: 0,
            prev_fast: None,
            prev_slow: None,
        })
    }
}

impl SignalGenerator for IndicatorSignalGenerator {
    fn name(&self) -> &str {
        "RSI_EMA_MA"
    }

    fn on_bar(&mut self, candle: &Candle) -> Option<Signal> {
        let close = close_f64(candle);
        self.bars_seen += 1;

        let rsi = self.rsi.next(close);
        let ma = self.sma.next(close);
        let fast = self.ema_fast.next(close);
        let slow = self.ema_slow.next(close);

        let prev_fast = self.prev_fast.replace(fast);
        let prev_slow = self.prev_slow.replace(slow);

        if self.bars_seen <= self.warmup {
            return None;
        }
        let (rsi, prev_fast, prev_slow) = (rsi?, prev_fast?, prev_slow?);

        let side = if rsi < self.oversold && prev_fast <= prev_slow && fast > slow && close > ma {
            Side::Long
        } else if rsi > self.overbought && prev_fast >= prev_slow && fast < slow && close < ma {
            Side::Short
        } else {
            return None;
        };

        Some(Signal::new(
            candle.timestamp,
            side,
            candle.close,
            self.take_profit_pct,
            self.stop_loss_pct,
        ))
    }

    fn reset(&mut self) {
        self.rsi.reset();
        self.sma.reset();
        self.ema_fast.reset();
        self.ema_slow.reset();
        self.bars_seen = 0;
        self.prev_fast = None;
        self.prev_slow = None;
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Build the generator for a strategy configuration.
pub fn build_signal_generator(config: &StrategyConfig) -> EngineResult<Box<dyn SignalGenerator>> {
    if config.take_profit_pct <= Decimal::ZERO || config.stop_loss_pct <= Decimal::ZERO {
        return Err(EngineError::invalid(
            "take-profit and stop-loss percentages must be positive",
        ));
    }

    match config.policy {
        SignalPolicy::Threshold => Ok(Box::new(ThresholdSignalGenerator::new(
            config.breakout_pct,
            config.take_profit_pct,
            config.stop_loss_pct,
        ))),
        SignalPolicy::Indicator => Ok(Box::new(IndicatorSignalGenerator::new(config)?)),
    }
}

/// Run a fresh generator over a whole series and collect every signal.
pub fn generate_signals(config: &StrategyConfig, candles: &[Candle]) -> EngineResult<Vec<Signal>> {
    let mut gen = build_signal_generator(config)?;
    Ok(candles.iter().filter_map(|c| gen.on_bar(c)).collect())
}
