//! Conversions from engine results to database records

use engine::{BacktestConfig, BacktestResult, CoinAnalysis, Recommendation, RecommendationType};
use persistence::repository::{compute_params_hash, BacktestRunRecord, SignalRecord, STATUS_ACTIVE};

/// Record of a finished backtest; the hash covers the full config and range
pub fn backtest_record(
    config: &BacktestConfig,
    result: &BacktestResult,
) -> Result<BacktestRunRecord, serde_json::Error> {
    let params = serde_json::to_string(config)?;
    let stats = &result.stats;

    Ok(BacktestRunRecord {
        id: None,
        params_hash: compute_params_hash(
            &result.symbol,
            &result.interval,
            &params,
            result.start_time,
            result.end_time,
        ),
        symbol: result.symbol.clone(),
        interval: result.interval.clone(),
        policy: result.policy.to_string(),
        params,
        start_time: result.start_time,
        end_time: result.end_time,
        initial_balance: stats.initial_balance.to_string(),
        final_balance: stats.final_balance.to_string(),
        total_profit: stats.total_profit.to_string(),
        total_profit_pct: stats.total_profit_pct.to_string(),
        total_trades: stats.total_trades as i64,
        winning_trades: stats.winning_trades as i64,
        losing_trades: stats.losing_trades as i64,
        win_rate: stats.win_rate.to_string(),
        profit_factor: stats.profit_factor.to_string(),
        max_drawdown_pct: stats.max_drawdown_pct.to_string(),
        trades: serde_json::to_string(&result.trades)?,
        created_at: None,
    })
}

fn side_label(kind: RecommendationType) -> &'static str {
    match kind {
        RecommendationType::Buy => "BUY",
        RecommendationType::Sell => "SELL",
    }
}

pub fn signal_record(symbol: &str, rec: &Recommendation) -> SignalRecord {
    SignalRecord {
        id: None,
        symbol: symbol.to_string(),
        side: side_label(rec.kind).to_string(),
        price: rec.entry_price.to_string(),
        take_profit_price: rec.take_profit.to_string(),
        stop_loss_price: rec.stop_loss.to_string(),
        timeframe: Some(rec.timeframe.to_string()),
        status: STATUS_ACTIVE.to_string(),
        created_at: None,
        closed_at: None,
    }
}

/// One signal per recommendation of the analysis
pub fn analysis_signals(analysis: &CoinAnalysis) -> Vec<SignalRecord> {
    analysis
        .recommendations
        .iter()
        .map(|rec| signal_record(&analysis.symbol, rec))
        .collect()
}
