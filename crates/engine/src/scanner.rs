//! Coin universe scanner
//!
//! Walks the coin universe in order, runs level detection and the
//! recommendation engine on each coin and records the coins whose price sits
//! close to a support or resistance level. Cancellation is cooperative: the
//! shared flag is polled before each coin and a cancelled scan keeps the
//! opportunities found so far.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    RwLock,
};
use tracing::{debug, info, warn};

use crate::analysis::{
    Recommendation, RecommendationConfig, RecommendationEngine, RecommendationType,
    TimeframeLevels,
};
use crate::api::MarketDataSource;
use crate::error::EngineResult;
use crate::levels::{LevelConfig, LevelDetector, LevelKind};
use crate::types::{CoinInfo, Timeframe};

// ============================================================================
// Types
// ============================================================================

/// Full level analysis of one coin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoinAnalysis {
    pub coin_id: String,
    pub name: String,
    pub symbol: String,
    pub current_price: Decimal,
    pub timeframes: BTreeMap<Timeframe, TimeframeLevels>,
    pub recommendations: Vec<Recommendation>,
}

/// A level the price is close to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityLevel {
    #[serde(rename = "type")]
    pub kind: LevelKind,
    pub timeframe: Timeframe,
    pub level: Decimal,
    pub distance_pct: Decimal,
    /// BUY near support, SELL near resistance
    pub signal: RecommendationType,
}

/// A coin with at least one nearby level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub coin: CoinAnalysis,
    pub opportunities: Vec<OpportunityLevel>,
}

/// Parameters of a scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanRequest {
    /// Number of top coins to scan
    pub limit: usize,
    pub max_support_distance_pct: Decimal,
    pub max_resistance_distance_pct: Decimal,
    pub timeframes: Vec<Timeframe>,
    pub levels: LevelConfig,
    pub recommendations: RecommendationConfig,
}

impl Default for ScanRequest {
    fn default() -> Self {
        Self {
            limit: 20,
            max_support_distance_pct: dec!(10),
            max_resistance_distance_pct: dec!(8),
            timeframes: Timeframe::ALL.to_vec(),
            levels: LevelConfig::default(),
            recommendations: RecommendationConfig::default(),
        }
    }
}

/// Scan run status
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Idle,
    Running,
    Complete,
    Cancelled,
}

/// Shared progress tracker between API handler and background scan
pub struct ScanProgress {
    pub status: RwLock<ScanStatus>,
    pub total_coins: AtomicU32,
    pub completed: AtomicU32,
    pub cancelled: AtomicBool,
    pub current_coin: RwLock<String>,
    pub opportunities: RwLock<Vec<Opportunity>>,
}

impl ScanProgress {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(ScanStatus::Idle),
            total_coins: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
            current_coin: RwLock::new(String::new()),
            opportunities: RwLock::new(Vec::new()),
        }
    }

    /// Reset for a new scan
    pub fn reset(&self) {
        *self.status.write().unwrap() = ScanStatus::Running;
        self.clear();
    }

    /// Claim the tracker for a new scan under a single status lock.
    /// Returns false, leaving the running scan untouched, if one is in flight.
    pub fn try_start(&self) -> bool {
        let mut status = self.status.write().unwrap();
        if matches!(*status, ScanStatus::Running) {
            return false;
        }
        *status = ScanStatus::Running;
        self.clear();
        true
    }

    fn clear(&self) {
        self.total_coins.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.cancelled.store(false, Ordering::Relaxed);
        *self.current_coin.write().unwrap() = String::new();
        *self.opportunities.write().unwrap() = Vec::new();
    }

    /// Ask a running scan to stop before its next coin
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn progress_pct(&self) -> f32 {
        let total = self.total_coins.load(Ordering::Relaxed);
        let done = self.completed.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            (done as f32 / total as f32) * 100.0
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.status.read().unwrap(), ScanStatus::Running)
    }
}

impl Default for ScanProgress {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Analysis
// ============================================================================

/// Analyze one coin across `timeframes`.
///
/// Returns `Ok(None)` when the spot price is unavailable. Timeframes whose
/// series comes back empty are left out of the analysis; a malformed series
/// rejects the whole coin.
pub async fn analyze_coin(
    source: &dyn MarketDataSource,
    coin: &CoinInfo,
    timeframes: &[Timeframe],
    level_config: &LevelConfig,
    rec_config: &RecommendationConfig,
) -> EngineResult<Option<CoinAnalysis>> {
    let Some(current_price) = source.fetch_price(&coin.id).await else {
        debug!(coin = %coin.id, "No price, skipping analysis");
        return Ok(None);
    };

    let mut levels = BTreeMap::new();
    for &tf in timeframes {
        if levels.contains_key(&tf) {
            continue;
        }
        let series = source.fetch_series(&coin.id, tf).await;
        if series.is_empty() {
            debug!(coin = %coin.id, timeframe = %tf, "Empty series, timeframe omitted");
            continue;
        }
        levels.insert(tf, LevelDetector::detect_candles(level_config, &series)?);
    }

    let analysis = RecommendationEngine::analyze(current_price, &levels, rec_config)?;

    Ok(Some(CoinAnalysis {
        coin_id: coin.id.clone(),
        name: coin.name.clone(),
        symbol: coin.symbol.clone(),
        current_price,
        timeframes: analysis.timeframes,
        recommendations: analysis.recommendations,
    }))
}

/// Levels of `analysis` within the distance thresholds, in timeframe order
/// with the support before the resistance.
pub fn find_opportunities(
    analysis: &CoinAnalysis,
    max_support_distance_pct: Decimal,
    max_resistance_distance_pct: Decimal,
) -> Vec<OpportunityLevel> {
    let mut found = Vec::new();
    for (&timeframe, data) in &analysis.timeframes {
        if let (Some(level), Some(distance)) = (data.nearest_support, data.support_distance_pct) {
            if distance <= max_support_distance_pct {
                found.push(OpportunityLevel {
                    kind: LevelKind::Support,
                    timeframe,
                    level,
                    distance_pct: distance,
                    signal: RecommendationType::Buy,
                });
            }
        }
        if let (Some(level), Some(distance)) =
            (data.nearest_resistance, data.resistance_distance_pct)
        {
            if distance <= max_resistance_distance_pct {
                found.push(OpportunityLevel {
                    kind: LevelKind::Resistance,
                    timeframe,
                    level,
                    distance_pct: distance,
                    signal: RecommendationType::Sell,
                });
            }
        }
    }
    found
}

// ============================================================================
// Scan
// ============================================================================

/// Scan the top `request.limit` coins.
///
/// The caller resets `progress` beforehand. A cancelled scan returns the
/// opportunities found before cancellation was observed.
pub async fn run_scan(
    source: &dyn MarketDataSource,
    request: &ScanRequest,
    progress: &ScanProgress,
) -> Vec<Opportunity> {
    let mut coins = source.list_universe(request.limit).await;
    coins.truncate(request.limit);
    progress
        .total_coins
        .store(coins.len() as u32, Ordering::Relaxed);

    info!(
        coins = coins.len(),
        timeframes = request.timeframes.len(),
        max_support_pct = %request.max_support_distance_pct,
        max_resistance_pct = %request.max_resistance_distance_pct,
        "Starting scan"
    );

    let mut opportunities = Vec::new();
    let mut cancelled = false;

    for (i, coin) in coins.iter().enumerate() {
        if progress.cancelled.load(Ordering::Relaxed) {
            warn!(scanned = i, "Scan cancelled");
            cancelled = true;
            break;
        }
        *progress.current_coin.write().unwrap() = coin.name.clone();
        debug!(coin = %coin.id, index = i + 1, total = coins.len(), "Analyzing coin");

        match analyze_coin(
            source,
            coin,
            &request.timeframes,
            &request.levels,
            &request.recommendations,
        )
        .await
        {
            Ok(Some(analysis)) => {
                let levels = find_opportunities(
                    &analysis,
                    request.max_support_distance_pct,
                    request.max_resistance_distance_pct,
                );
                if !levels.is_empty() {
                    info!(coin = %coin.name, found = levels.len(), "Opportunities found");
                    let opportunity = Opportunity {
                        coin: analysis,
                        opportunities: levels,
                    };
                    progress
                        .opportunities
                        .write()
                        .unwrap()
                        .push(opportunity.clone());
                    opportunities.push(opportunity);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(coin = %coin.id, error = %e, "Analysis rejected, skipping coin"),
        }

        progress.completed.store((i + 1) as u32, Ordering::Relaxed);
    }

    *progress.status.write().unwrap() = if cancelled {
        ScanStatus::Cancelled
    } else {
        ScanStatus::Complete
    };

    info!(coins_with_opportunities = opportunities.len(), "Scan complete");
    opportunities
}
