//! Crypto S/R Engine: support/resistance analysis and backtesting
//!
//! Provides:
//! - Support / resistance level detection with round-number anchors
//! - Proximity-based BUY / SELL recommendations per timeframe
//! - Threshold and RSI/EMA/SMA entry signals with a single-position backtester
//! - Grid-search parameter optimizer
//! - Cancellable coin-universe scanner over a pluggable market data source
//! - CoinGecko and Binance public API clients

pub mod analysis;
pub mod api;
pub mod engine;
pub mod error;
pub mod indicators;
pub mod levels;
pub mod optimizer;
pub mod scanner;
pub mod types;

// Re-exports for convenience
pub use analysis::{
    Confidence, LevelAnalysis, Recommendation, RecommendationConfig, RecommendationEngine,
    RecommendationType, TimeframeLevels,
};
pub use api::{BinanceClient, CoinGeckoClient, MarketDataSource};
pub use engine::BacktestEngine;
pub use error::{EngineError, EngineResult};
pub use indicators::{build_signal_generator, generate_signals, SignalGenerator};
pub use levels::{Level, LevelConfig, LevelDetector, LevelKind, LevelSet};
pub use optimizer::{
    optimize, run_optimization, OptimizeOutcome, OptimizeProgress, OptimizeStatus,
    OptimizedParams, ParamRanges,
};
pub use scanner::{
    analyze_coin, find_opportunities, run_scan, CoinAnalysis, Opportunity, OpportunityLevel,
    ScanProgress, ScanRequest, ScanStatus,
};
pub use types::*;
