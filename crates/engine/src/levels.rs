//! Support / resistance level detection
//!
//! Levels come from two sources: local extrema of the price series inside a
//! symmetric window of `strength` bars, and round-number anchors stepped
//! around the latest price. The merged set is rounded, deduplicated and
//! capped to the levels closest to the latest price.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

use crate::error::EngineResult;
use crate::types::{closes, validate_series, Candle};

/// Tuning for level detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelConfig {
    /// Bars on each side an extremum must dominate
    pub strength: usize,
    /// Spacing of round-number anchors
    pub anchor_step: Decimal,
    /// Anchors generated on each side of the rounded base
    pub anchor_count: i64,
    /// Cap on supports and on resistances
    pub max_levels: usize,
    /// Decimal places levels are rounded to
    pub precision: u32,
}

impl Default for LevelConfig {
    fn default() -> Self {
        Self {
            strength: 2,
            anchor_step: dec!(100),
            anchor_count: 5,
            max_levels: 8,
            precision: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LevelKind {
    Support,
    Resistance,
}

/// A single price level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    pub price: Decimal,
    pub kind: LevelKind,
}

/// Supports ascending, resistances descending, both deduplicated and capped
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LevelSet {
    pub supports: Vec<Decimal>,
    pub resistances: Vec<Decimal>,
}

impl LevelSet {
    pub fn is_empty(&self) -> bool {
        self.supports.is_empty() && self.resistances.is_empty()
    }

    /// All levels tagged with their kind, supports first
    pub fn levels(&self) -> Vec<Level> {
        self.supports
            .iter()
            .map(|&price| Level {
                price,
                kind: LevelKind::Support,
            })
            .chain(self.resistances.iter().map(|&price| Level {
                price,
                kind: LevelKind::Resistance,
            }))
            .collect()
    }
}

pub struct LevelDetector;

impl LevelDetector {
    /// Detect levels from the closing prices of a candle series.
    ///
    /// Series with timestamps going backwards or non-positive closes are
    /// rejected before any level is computed.
    pub fn detect_candles(config: &LevelConfig, candles: &[Candle]) -> EngineResult<LevelSet> {
        validate_series(candles)?;
        Ok(Self::detect(config, &closes(candles)))
    }

    /// Detect levels from an ordered price sequence. The last price is the
    /// anchor price; an empty sequence yields an empty set.
    pub fn detect(config: &LevelConfig, prices: &[Decimal]) -> LevelSet {
        let Some(&current) = prices.last() else {
            return LevelSet::default();
        };

        let (mut supports, mut resistances) = find_extrema(prices, config.strength);
        let extrema = (supports.len(), resistances.len());

        for anchor in round_number_anchors(current, config.anchor_step, config.anchor_count) {
            if anchor < current {
                supports.push(anchor);
            } else if anchor > current {
                resistances.push(anchor);
            }
        }

        let supports = normalize(supports, config.precision);
        let resistances = normalize(resistances, config.precision);

        // Ascending: the highest supports sit at the tail
        let skip = supports.len().saturating_sub(config.max_levels);
        let supports: Vec<Decimal> = supports.into_iter().skip(skip).collect();
        // Lowest resistances first, then flipped to descending
        let mut resistances: Vec<Decimal> =
            resistances.into_iter().take(config.max_levels).collect();
        resistances.reverse();

        debug!(
            prices = prices.len(),
            extrema_supports = extrema.0,
            extrema_resistances = extrema.1,
            supports = supports.len(),
            resistances = resistances.len(),
            "Levels detected"
        );

        LevelSet {
            supports,
            resistances,
        }
    }
}

/// Local minima and maxima over a window of `strength` bars on each side.
///
/// Ties satisfy the comparison, so plateau edges qualify. A window where every
/// price is equal is neither a support nor a resistance.
pub fn find_extrema(prices: &[Decimal], strength: usize) -> (Vec<Decimal>, Vec<Decimal>) {
    let mut supports = Vec::new();
    let mut resistances = Vec::new();

    if strength == 0 || prices.len() < 2 * strength + 1 {
        return (supports, resistances);
    }

    for i in strength..prices.len() - strength {
        let price = prices[i];
        let window = &prices[i - strength..=i + strength];
        let is_support = window.iter().all(|&p| price <= p);
        let is_resistance = window.iter().all(|&p| price >= p);

        match (is_support, is_resistance) {
            (true, false) => supports.push(price),
            (false, true) => resistances.push(price),
            _ => {}
        }
    }

    (supports, resistances)
}

/// Multiples of `step` around `current`: the base is `current` floored to a
/// multiple of `step`, then `count` steps either side. Non-positive levels
/// are dropped.
pub fn round_number_anchors(current: Decimal, step: Decimal, count: i64) -> Vec<Decimal> {
    if current <= Decimal::ZERO || step <= Decimal::ZERO {
        return Vec::new();
    }
    let base = (current / step).floor() * step;
    (-count..=count)
        .map(|i| base + Decimal::from(i) * step)
        .filter(|level| *level > Decimal::ZERO)
        .collect()
}

/// Round, drop non-positive values, dedupe and sort ascending
fn normalize(levels: Vec<Decimal>, precision: u32) -> Vec<Decimal> {
    levels
        .into_iter()
        .map(|l| l.round_dp(precision).normalize())
        .filter(|l| *l > Decimal::ZERO)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn d(values: &[f64]) -> Vec<Decimal> {
        values
            .iter()
            .map(|v| Decimal::try_from(*v).unwrap())
            .collect()
    }

    #[test]
    fn test_empty_series_has_no_levels() {
        let set = LevelDetector::detect(&LevelConfig::default(), &[]);
        assert!(set.is_empty());
    }

    #[test]
    fn test_short_series_only_gets_anchors() {
        // 4 prices cannot host a strength-2 extremum
        let prices = d(&[100.0, 100.0, 100.0, 100.0]);
        let (s, r) = find_extrema(&prices, 2);
        assert!(s.is_empty() && r.is_empty());

        let set = LevelDetector::detect(&LevelConfig::default(), &prices);
        // 100 is the current price itself, so it is neither side
        assert!(set.supports.is_empty());
        assert_eq!(
            set.resistances,
            vec![dec!(600), dec!(500), dec!(400), dec!(300), dec!(200)]
        );
    }

    #[test]
    fn test_anchors_split_around_price() {
        let prices = d(&[140.0, 160.0, 150.0]);
        let set = LevelDetector::detect(&LevelConfig::default(), &prices);
        assert_eq!(set.supports, vec![dec!(100)]);
        assert_eq!(
            set.resistances,
            vec![dec!(600), dec!(500), dec!(400), dec!(300), dec!(200)]
        );
    }

    #[test]
    fn test_extrema_detection() {
        let prices = d(&[5.0, 3.0, 1.0, 3.0, 5.0, 7.0, 5.0, 3.0]);
        let (supports, resistances) = find_extrema(&prices, 2);
        assert_eq!(supports, vec![dec!(1)]);
        assert_eq!(resistances, vec![dec!(7)]);

        let set = LevelDetector::detect(&LevelConfig::default(), &prices);
        assert_eq!(set.supports, vec![dec!(1)]);
        assert_eq!(
            set.resistances,
            vec![dec!(500), dec!(400), dec!(300), dec!(200), dec!(100), dec!(7)]
        );
    }

    #[test]
    fn test_plateau_edges_count_but_flat_window_does_not() {
        let prices = d(&[1.0, 3.0, 3.0, 3.0, 1.0]);
        let (supports, resistances) = find_extrema(&prices, 1);
        assert!(supports.is_empty());
        assert_eq!(resistances, vec![dec!(3), dec!(3)]);

        let flat = d(&[2.0; 7]);
        let (supports, resistances) = find_extrema(&flat, 2);
        assert!(supports.is_empty());
        assert!(resistances.is_empty());
    }

    #[test]
    fn test_duplicates_collapse_after_rounding() {
        let prices = d(&[1.0, 3.00001, 3.0, 3.00002, 1.0]);
        let config = LevelConfig {
            strength: 1,
            ..Default::default()
        };
        let set = LevelDetector::detect(&config, &prices);
        let threes: Vec<_> = set
            .resistances
            .iter()
            .filter(|r| **r == dec!(3))
            .collect();
        assert_eq!(threes.len(), 1);
    }

    #[test]
    fn test_caps_keep_levels_closest_to_price() {
        // Zig-zag with a trough every 4 bars at 1000, 1010, 1020, ...
        let mut prices = Vec::new();
        for k in 0..15 {
            let base = 1000.0 + (k as f64) * 10.0;
            prices.extend_from_slice(&[base + 30.0, base + 15.0, base, base + 15.0]);
        }
        prices.push(2000.0);
        let prices = d(&prices);
        let set = LevelDetector::detect(&LevelConfig::default(), &prices);

        assert_eq!(set.supports.len(), 8);
        // Highest supports retained: anchors below 2000 plus the top troughs
        assert_eq!(set.supports.last(), Some(&dec!(1900)));
        assert!(set.supports.windows(2).all(|w| w[0] < w[1]));
        // Resistances keep the lowest eight, here the older swing highs
        assert_eq!(set.resistances.len(), 8);
        assert_eq!(set.resistances.first(), Some(&dec!(1110)));
        assert_eq!(set.resistances.last(), Some(&dec!(1040)));
    }

    #[test]
    fn test_level_sets_are_sorted_unique_and_capped() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let mut price = 250.0_f64;
            let mut prices = Vec::new();
            for _ in 0..rng.gen_range(0..200) {
                price = (price * (1.0 + rng.gen_range(-0.03..0.03))).max(1.0);
                prices.push(Decimal::try_from(price).unwrap().round_dp(6));
            }
            let set = LevelDetector::detect(&LevelConfig::default(), &prices);

            assert!(set.supports.len() <= 8);
            assert!(set.resistances.len() <= 8);
            assert!(set.supports.windows(2).all(|w| w[0] < w[1]));
            assert!(set.resistances.windows(2).all(|w| w[0] > w[1]));
            assert!(set.levels().iter().all(|l| l.price > Decimal::ZERO));
        }
    }

    #[test]
    fn test_detect_candles_rejects_backwards_timestamps() {
        let candles: Vec<Candle> = [100, 200, 300, 400, 500]
            .iter()
            .enumerate()
            .map(|(i, p)| Candle::flat(5000 - i as i64 * 1000, Decimal::from(*p)))
            .collect();
        let err = LevelDetector::detect_candles(&LevelConfig::default(), &candles).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));

        let mut ordered = candles;
        ordered.reverse();
        let set = LevelDetector::detect_candles(&LevelConfig::default(), &ordered).unwrap();
        assert!(!set.is_empty());
    }

    #[test]
    fn test_round_number_anchors() {
        let anchors = round_number_anchors(dec!(1234.5), dec!(100), 5);
        assert_eq!(anchors.len(), 11);
        assert_eq!(anchors[0], dec!(700));
        assert_eq!(anchors[10], dec!(1700));

        assert!(round_number_anchors(dec!(0), dec!(100), 5).is_empty());
        // Everything at or below zero is discarded
        assert_eq!(round_number_anchors(dec!(0.5), dec!(100), 5).len(), 5);
    }
}
