//! Trade recommendations from support / resistance proximity
//!
//! For each timeframe the nearest support strictly below and the nearest
//! resistance strictly above the current price are located, their distance
//! is expressed in percent, and BUY / SELL suggestions fire when the price
//! sits within the configured threshold of a level.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::levels::LevelSet;
use crate::types::Timeframe;

/// Decimal places for prices in analysis output
pub const PRICE_DP: u32 = 4;
/// Decimal places for percentages and ratios
pub const PCT_DP: u32 = 2;

/// Thresholds and offsets for recommendation rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommendationConfig {
    /// BUY fires when support distance is at or below this percent
    pub support_threshold_pct: Decimal,
    /// SELL fires when resistance distance is at or below this percent
    pub resistance_threshold_pct: Decimal,
    /// Entry placed this percent inside the level
    pub entry_offset_pct: Decimal,
    /// Stop placed this percent beyond the level
    pub stop_offset_pct: Decimal,
    /// Target distance from the current price
    pub take_profit_pct: Decimal,
}

impl Default for RecommendationConfig {
    fn default() -> Self {
        Self {
            support_threshold_pct: dec!(8),
            resistance_threshold_pct: dec!(6),
            entry_offset_pct: dec!(0.5),
            stop_offset_pct: dec!(1),
            take_profit_pct: dec!(5),
        }
    }
}

impl RecommendationConfig {
    /// Tighter 3% / 2% proximity thresholds
    pub fn strict() -> Self {
        Self {
            support_threshold_pct: dec!(3),
            resistance_threshold_pct: dec!(2),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecommendationType {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Confidence {
    High,
    Medium,
}

/// A suggested trade around a level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    #[serde(rename = "type")]
    pub kind: RecommendationType,
    pub timeframe: Timeframe,
    pub reason: String,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub risk_reward: Decimal,
    pub confidence: Confidence,
}

/// Levels of one timeframe plus nearest-level distances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeframeLevels {
    pub supports: Vec<Decimal>,
    pub resistances: Vec<Decimal>,
    pub nearest_support: Option<Decimal>,
    pub nearest_resistance: Option<Decimal>,
    pub support_distance_pct: Option<Decimal>,
    pub resistance_distance_pct: Option<Decimal>,
}

/// Output of one analysis call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelAnalysis {
    pub current_price: Decimal,
    pub timeframes: BTreeMap<Timeframe, TimeframeLevels>,
    pub recommendations: Vec<Recommendation>,
}

pub struct RecommendationEngine;

impl RecommendationEngine {
    /// Analyze every timeframe's level set against the current price.
    ///
    /// Recommendations are ordered by timeframe, BUY before SELL.
    pub fn analyze(
        current_price: Decimal,
        levels: &BTreeMap<Timeframe, LevelSet>,
        config: &RecommendationConfig,
    ) -> EngineResult<LevelAnalysis> {
        ensure_positive(current_price)?;

        let mut timeframes = BTreeMap::new();
        let mut recommendations = Vec::new();

        for (&tf, set) in levels {
            let data = Self::timeframe_levels(current_price, set)?;
            recommendations.extend(Self::recommend(current_price, tf, &data, config));
            timeframes.insert(tf, data);
        }

        debug!(
            price = %current_price,
            timeframes = timeframes.len(),
            recommendations = recommendations.len(),
            "Level analysis complete"
        );

        Ok(LevelAnalysis {
            current_price,
            timeframes,
            recommendations,
        })
    }

    /// Nearest levels and their distance from `current_price`
    pub fn timeframe_levels(current_price: Decimal, set: &LevelSet) -> EngineResult<TimeframeLevels> {
        ensure_positive(current_price)?;
        let hundred = dec!(100);

        let nearest_support = set
            .supports
            .iter()
            .copied()
            .filter(|s| *s < current_price)
            .max();
        let nearest_resistance = set
            .resistances
            .iter()
            .copied()
            .filter(|r| *r > current_price)
            .min();

        let support_distance_pct = nearest_support
            .map(|s| ((current_price - s) / current_price * hundred).round_dp(PCT_DP));
        let resistance_distance_pct = nearest_resistance
            .map(|r| ((r - current_price) / current_price * hundred).round_dp(PCT_DP));

        Ok(TimeframeLevels {
            supports: set.supports.clone(),
            resistances: set.resistances.clone(),
            nearest_support,
            nearest_resistance,
            support_distance_pct,
            resistance_distance_pct,
        })
    }

    /// BUY near support and / or SELL near resistance for one timeframe
    pub fn recommend(
        current_price: Decimal,
        timeframe: Timeframe,
        data: &TimeframeLevels,
        config: &RecommendationConfig,
    ) -> Vec<Recommendation> {
        let hundred = dec!(100);
        let entry_offset = config.entry_offset_pct / hundred;
        let stop_offset = config.stop_offset_pct / hundred;
        let target = config.take_profit_pct / hundred;
        let mut out = Vec::new();

        if let (Some(support), Some(distance)) = (data.nearest_support, data.support_distance_pct) {
            if distance <= config.support_threshold_pct {
                let entry = support * (Decimal::ONE + entry_offset);
                let stop = support * (Decimal::ONE - stop_offset);
                let take_profit = current_price * (Decimal::ONE + target);
                out.push(Recommendation {
                    kind: RecommendationType::Buy,
                    timeframe,
                    reason: format!("Price near support level at ${}", support),
                    entry_price: entry.round_dp(PRICE_DP),
                    stop_loss: stop.round_dp(PRICE_DP),
                    take_profit: take_profit.round_dp(PRICE_DP),
                    risk_reward: risk_reward(take_profit - entry, entry - stop),
                    confidence: confidence(distance, config.support_threshold_pct),
                });
            }
        }

        if let (Some(resistance), Some(distance)) =
            (data.nearest_resistance, data.resistance_distance_pct)
        {
            if distance <= config.resistance_threshold_pct {
                let entry = resistance * (Decimal::ONE - entry_offset);
                let stop = resistance * (Decimal::ONE + stop_offset);
                let take_profit = current_price * (Decimal::ONE - target);
                out.push(Recommendation {
                    kind: RecommendationType::Sell,
                    timeframe,
                    reason: format!("Price near resistance level at ${}", resistance),
                    entry_price: entry.round_dp(PRICE_DP),
                    stop_loss: stop.round_dp(PRICE_DP),
                    take_profit: take_profit.round_dp(PRICE_DP),
                    risk_reward: risk_reward(entry - take_profit, stop - entry),
                    confidence: confidence(distance, config.resistance_threshold_pct),
                });
            }
        }

        out
    }
}

fn ensure_positive(price: Decimal) -> EngineResult<()> {
    if price <= Decimal::ZERO {
        return Err(EngineError::invalid(format!(
            "current price must be positive, got {}",
            price
        )));
    }
    Ok(())
}

fn confidence(distance: Decimal, threshold: Decimal) -> Confidence {
    if distance <= threshold / dec!(2) {
        Confidence::High
    } else {
        Confidence::Medium
    }
}

fn risk_reward(reward: Decimal, risk: Decimal) -> Decimal {
    reward
        .checked_div(risk)
        .unwrap_or(Decimal::ZERO)
        .round_dp(PCT_DP)
}
