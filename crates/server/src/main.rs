//! Crypto S/R: support/resistance scanner and strategy backtester
//!
//! Usage:
//!   crypto-sr serve --port 3001              Launch the HTTP API
//!   crypto-sr analyze bitcoin                Levels and recommendations for one coin
//!   crypto-sr scan --limit 20                Scan the top coins (Ctrl+C cancels)
//!   crypto-sr backtest --symbol BTCUSDT      Backtest on Binance history
//!   crypto-sr optimize --symbol BTCUSDT      Grid-search indicator parameters

mod records;

use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use engine::{
    analyze_coin, run_optimization, run_scan, BacktestConfig, BacktestEngine, BacktestResult,
    BinanceClient, Candle, CoinAnalysis, CoinGeckoClient, CoinInfo, LevelConfig,
    MarketDataSource, Opportunity, OptimizeOutcome, OptimizeProgress, OptimizeStatus,
    ParamRanges, RecommendationConfig, ScanProgress, ScanRequest, ScanStatus, SignalPolicy,
    Timeframe,
};
use persistence::repository::{BacktestRepository, SignalRepository};
use persistence::Database;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

const APP_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH"));

const DEFAULT_DB_PATH: &str = "data/crypto_sr.db";
const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Parser)]
#[command(name = "crypto-sr")]
#[command(about = "Crypto support/resistance scanner and strategy backtester", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the HTTP API server
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 3001)]
        port: u16,
    },
    /// Support/resistance levels and recommendations for one coin
    Analyze {
        /// CoinGecko coin id (e.g. bitcoin)
        coin: String,
        /// Timeframes to analyze (comma-separated)
        #[arg(long, default_value = "15m,1h,4h,1d,1M")]
        timeframes: String,
        /// Use the tighter 3% / 2% recommendation thresholds
        #[arg(long)]
        strict: bool,
    },
    /// Scan the top coins for prices close to a level (Ctrl+C cancels)
    Scan {
        /// Number of top coins by market cap
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Max distance to a support, in percent
        #[arg(long, default_value = "10")]
        max_support: Decimal,
        /// Max distance to a resistance, in percent
        #[arg(long, default_value = "8")]
        max_resistance: Decimal,
        /// Timeframes to analyze (comma-separated)
        #[arg(long, default_value = "15m,1h,4h,1d,1M")]
        timeframes: String,
    },
    /// Backtest a strategy on Binance history
    Backtest {
        #[arg(long, default_value = "BTCUSDT")]
        symbol: String,
        /// Kline interval (1m, 15m, 1h, 4h, 1d, ...)
        #[arg(long, default_value = "1h")]
        interval: String,
        /// Number of days of history
        #[arg(long, default_value_t = 30)]
        days: u32,
        /// Entry policy
        #[arg(long, value_enum, default_value = "threshold")]
        policy: PolicyArg,
        #[arg(long, default_value = "1000")]
        balance: Decimal,
        #[arg(long, default_value = "10")]
        leverage: Decimal,
        /// Take-profit percent (default 2)
        #[arg(long)]
        tp: Option<Decimal>,
        /// Stop-loss percent (default 1)
        #[arg(long)]
        sl: Option<Decimal>,
    },
    /// Grid-search indicator parameters on Binance history (Ctrl+C cancels)
    Optimize {
        #[arg(long, default_value = "BTCUSDT")]
        symbol: String,
        #[arg(long, default_value = "1h")]
        interval: String,
        #[arg(long, default_value_t = 30)]
        days: u32,
    },
}

/// Runtime settings read from the environment (`.env` honoured)
struct Settings {
    db_path: String,
    coingecko_base_url: Option<String>,
    binance_base_url: Option<String>,
}

impl Settings {
    fn from_env() -> Self {
        Self {
            db_path: std::env::var("CRYPTO_SR_DB_PATH")
                .unwrap_or_else(|_| DEFAULT_DB_PATH.to_string()),
            coingecko_base_url: std::env::var("COINGECKO_BASE_URL").ok(),
            binance_base_url: std::env::var("BINANCE_BASE_URL").ok(),
        }
    }

    fn coingecko(&self) -> CoinGeckoClient {
        match &self.coingecko_base_url {
            Some(url) => CoinGeckoClient::with_base_url(url.as_str()),
            None => CoinGeckoClient::new(),
        }
    }

    fn binance(&self) -> BinanceClient {
        match &self.binance_base_url {
            Some(url) => BinanceClient::with_base_url(url.as_str()),
            None => BinanceClient::new(),
        }
    }

    async fn open_db(&self) -> anyhow::Result<Database> {
        Database::new(&self.db_path).await.map_err(|e| {
            error!("Failed to initialize database: {}", e);
            anyhow::anyhow!("Database initialization failed: {}", e)
        })
    }
}

#[derive(Clone)]
struct AppState {
    coingecko: Arc<CoinGeckoClient>,
    binance: Arc<BinanceClient>,
    db: Arc<Database>,
    scan_progress: Arc<ScanProgress>,
    optimize_progress: Arc<OptimizeProgress>,
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,persistence=debug,crypto_sr=debug")
    } else {
        EnvFilter::new("info,engine=info,persistence=info,crypto_sr=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum PolicyArg {
    /// Close-to-close breakout
    Threshold,
    /// RSI extreme with EMA cross and SMA filter
    Indicator,
}

impl From<PolicyArg> for SignalPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Threshold => SignalPolicy::Threshold,
            PolicyArg::Indicator => SignalPolicy::Indicator,
        }
    }
}

fn parse_timeframes(s: &str) -> anyhow::Result<Vec<Timeframe>> {
    let timeframes = Timeframe::parse_list(s);
    if timeframes.is_empty() {
        anyhow::bail!("No valid timeframe in '{}' (expected 15m, 1h, 4h, 1d, 1M)", s);
    }
    Ok(timeframes)
}

/// Millisecond range covering the last `days` days
fn history_range(days: u32) -> (i64, i64) {
    let end_time = Utc::now().timestamp_millis();
    (end_time - days as i64 * DAY_MS, end_time)
}

/// Minimal coin entry when only an id is known
fn coin_from_id(coin_id: &str) -> CoinInfo {
    CoinInfo {
        id: coin_id.to_string(),
        name: coin_id.to_string(),
        symbol: coin_id.to_uppercase(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();
    let settings = Settings::from_env();

    match cli.command {
        Commands::Serve { host, port } => {
            cmd_serve(&settings, &host, port).await?;
        }
        Commands::Analyze {
            coin,
            timeframes,
            strict,
        } => {
            cmd_analyze(&settings, &coin, &timeframes, strict).await?;
        }
        Commands::Scan {
            limit,
            max_support,
            max_resistance,
            timeframes,
        } => {
            let request = ScanRequest {
                limit,
                max_support_distance_pct: max_support,
                max_resistance_distance_pct: max_resistance,
                timeframes: parse_timeframes(&timeframes)?,
                ..ScanRequest::default()
            };
            cmd_scan(&settings, request).await?;
        }
        Commands::Backtest {
            symbol,
            interval,
            days,
            policy,
            balance,
            leverage,
            tp,
            sl,
        } => {
            let mut config = BacktestConfig {
                symbol,
                interval,
                initial_balance: balance,
                leverage,
                ..BacktestConfig::default()
            };
            config.strategy.policy = policy.into();
            if let Some(tp) = tp {
                config.strategy.take_profit_pct = tp;
            }
            if let Some(sl) = sl {
                config.strategy.stop_loss_pct = sl;
            }
            cmd_backtest(&settings, config, days).await?;
        }
        Commands::Optimize {
            symbol,
            interval,
            days,
        } => {
            let config = BacktestConfig {
                symbol,
                interval,
                ..BacktestConfig::default()
            };
            cmd_optimize(&settings, config, days).await?;
        }
    }

    Ok(())
}

// ============================================================================
// Shared helpers
// ============================================================================

async fn fetch_history(
    binance: &BinanceClient,
    config: &BacktestConfig,
    days: u32,
) -> anyhow::Result<Vec<Candle>> {
    let (start_time, end_time) = history_range(days);
    binance
        .get_klines_paginated(&config.symbol, &config.interval, start_time, end_time)
        .await
}

/// Store one ACTIVE signal per recommendation of each scanned coin
async fn save_scan_signals(db: &Database, opportunities: &[Opportunity]) -> usize {
    let repo = SignalRepository::new(db.pool());
    let mut saved = 0;
    for opportunity in opportunities {
        for record in records::analysis_signals(&opportunity.coin) {
            match repo.save(&record).await {
                Ok(_) => saved += 1,
                Err(e) => warn!(symbol = %record.symbol, error = %e, "Failed to save signal"),
            }
        }
    }
    saved
}

/// Persist a backtest run; returns whether it was new
async fn save_backtest(
    db: &Database,
    config: &BacktestConfig,
    result: &BacktestResult,
) -> anyhow::Result<bool> {
    let record = records::backtest_record(config, result)?;
    Ok(BacktestRepository::new(db.pool()).save(&record).await?)
}

fn progress_bar(pct: f32) -> String {
    let bar_len = 30;
    let filled = ((pct as usize) * bar_len / 100).min(bar_len);
    "=".repeat(filled) + &" ".repeat(bar_len - filled)
}

// ============================================================================
// Serve command: Axum web server
// ============================================================================

async fn cmd_serve(settings: &Settings, host: &str, port: u16) -> anyhow::Result<()> {
    info!("Crypto S/R v{} starting...", APP_VERSION);

    let db = settings.open_db().await?;
    info!("Database initialized: {}", settings.db_path);

    let state = AppState {
        coingecko: Arc::new(settings.coingecko()),
        binance: Arc::new(settings.binance()),
        db: Arc::new(db),
        scan_progress: Arc::new(ScanProgress::new()),
        optimize_progress: Arc::new(OptimizeProgress::new()),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(api_health))
        .route("/coins", get(api_coins))
        .route("/analyze/:coin_id", get(api_analyze))
        .route("/scan", post(api_start_scan))
        .route("/scan/status", get(api_scan_status))
        .route("/scan/cancel", post(api_cancel_scan))
        .route("/backtest", post(api_backtest))
        .route("/backtests", get(api_backtests))
        .route("/optimize", post(api_start_optimization))
        .route("/optimize/status", get(api_optimize_status))
        .route("/signals", get(api_signals))
        .route("/signals/:id/close", post(api_close_signal))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(cors);

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    println!("\n=== Crypto S/R v{} ===", APP_VERSION);
    println!("Listening on http://{}", addr);
    println!("\nEndpoints:");
    println!("  GET  /api/health              - Health check");
    println!("  GET  /api/coins               - Top coins by market cap");
    println!("  GET  /api/analyze/:coin_id    - Levels and recommendations");
    println!("  POST /api/scan                - Start a coin scan");
    println!("  GET  /api/scan/status         - Poll scan progress");
    println!("  POST /api/scan/cancel         - Cancel running scan");
    println!("  POST /api/backtest            - Run and store a backtest");
    println!("  GET  /api/backtests           - Stored backtest runs");
    println!("  POST /api/optimize            - Start parameter optimization");
    println!("  GET  /api/optimize/status     - Poll optimization progress");
    println!("  GET  /api/signals             - Stored signals");
    println!("  POST /api/signals/:id/close   - Close an active signal");
    println!("\n  Database: {}", settings.db_path);
    println!("\nPress Ctrl+C to stop\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Analyze command
// ============================================================================

async fn cmd_analyze(
    settings: &Settings,
    coin_id: &str,
    timeframes: &str,
    strict: bool,
) -> anyhow::Result<()> {
    let timeframes = parse_timeframes(timeframes)?;
    let rec_config = if strict {
        RecommendationConfig::strict()
    } else {
        RecommendationConfig::default()
    };

    let coingecko = settings.coingecko();
    let analysis = analyze_coin(
        &coingecko,
        &coin_from_id(coin_id),
        &timeframes,
        &LevelConfig::default(),
        &rec_config,
    )
    .await?;

    match analysis {
        Some(analysis) => print_analysis(&analysis),
        None => println!("\nPrice unavailable for '{}', nothing to analyze.", coin_id),
    }

    Ok(())
}

fn fmt_opt(value: Option<Decimal>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

fn print_analysis(analysis: &CoinAnalysis) {
    println!(
        "\n{} ({}) @ ${}",
        analysis.name, analysis.symbol, analysis.current_price
    );
    println!(
        "  {:<5} {:>14} {:>8} {:>14} {:>8}",
        "TF", "Support", "Dist%", "Resistance", "Dist%"
    );
    println!("  {}", "-".repeat(53));
    for (tf, levels) in &analysis.timeframes {
        println!(
            "  {:<5} {:>14} {:>8} {:>14} {:>8}",
            tf.as_str(),
            fmt_opt(levels.nearest_support),
            fmt_opt(levels.support_distance_pct),
            fmt_opt(levels.nearest_resistance),
            fmt_opt(levels.resistance_distance_pct),
        );
    }

    if analysis.recommendations.is_empty() {
        println!("\nNo recommendations.");
        return;
    }
    println!("\nRecommendations:");
    for rec in &analysis.recommendations {
        println!(
            "  {:?} [{}] {:?}: entry {} | SL {} | TP {} | R:R {} ({})",
            rec.kind,
            rec.timeframe,
            rec.confidence,
            rec.entry_price,
            rec.stop_loss,
            rec.take_profit,
            rec.risk_reward,
            rec.reason,
        );
    }
}

// ============================================================================
// Scan command
// ============================================================================

async fn cmd_scan(settings: &Settings, request: ScanRequest) -> anyhow::Result<()> {
    println!("\n=== Crypto S/R v{} ===", APP_VERSION);
    println!(
        "Scanning top {} coins | support <= {}% | resistance <= {}%",
        request.limit, request.max_support_distance_pct, request.max_resistance_distance_pct
    );
    println!("Press Ctrl+C to stop\n");

    let db = settings.open_db().await?;
    let source = Arc::new(settings.coingecko());
    let progress = Arc::new(ScanProgress::new());
    progress.reset();

    let progress_for_ctrlc = progress.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl+C received, requesting cancel...");
        progress_for_ctrlc.cancel();
    });

    let progress_clone = progress.clone();
    let scan_handle =
        tokio::spawn(async move { run_scan(source.as_ref(), &request, &progress_clone).await });

    // Progress display loop
    loop {
        tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
        let status = progress.status.read().unwrap().clone();
        let completed = progress.completed.load(Ordering::Relaxed);
        let total = progress.total_coins.load(Ordering::Relaxed);

        match status {
            ScanStatus::Running => {
                let coin = progress.current_coin.read().unwrap().clone();
                print!(
                    "\r  [{}] {:.0}% ({}/{}) {:<24}",
                    progress_bar(progress.progress_pct()),
                    progress.progress_pct(),
                    completed,
                    total,
                    coin
                );
                std::io::stdout().flush().ok();
            }
            ScanStatus::Complete => {
                println!("\r  Complete! {} coins scanned{:<40}", completed, "");
                break;
            }
            ScanStatus::Cancelled => {
                println!("\r  Cancelled after {}/{} coins{:<40}", completed, total, "");
                break;
            }
            ScanStatus::Idle => {}
        }
    }

    let opportunities = scan_handle.await?;
    if opportunities.is_empty() {
        println!("\nNo opportunities found.");
        return Ok(());
    }

    print_opportunities(&opportunities);
    let saved = save_scan_signals(&db, &opportunities).await;
    println!("\n{} signals saved to {}", saved, settings.db_path);

    Ok(())
}

fn print_opportunities(opportunities: &[Opportunity]) {
    println!("\n{} coins near a level:", opportunities.len());
    println!(
        "  {:<10} {:<5} {:<11} {:>14} {:>8} {:<5}",
        "Symbol", "TF", "Level", "Price", "Dist%", "Signal"
    );
    println!("  {}", "-".repeat(60));
    for opportunity in opportunities {
        for level in &opportunity.opportunities {
            println!(
                "  {:<10} {:<5} {:<11} {:>14} {:>8} {:?}",
                opportunity.coin.symbol,
                level.timeframe.as_str(),
                format!("{:?}", level.kind),
                level.level,
                level.distance_pct,
                level.signal,
            );
        }
    }
}

// ============================================================================
// Backtest command
// ============================================================================

async fn cmd_backtest(settings: &Settings, config: BacktestConfig, days: u32) -> anyhow::Result<()> {
    println!("\n=== Crypto S/R v{} ===", APP_VERSION);
    println!(
        "Backtest {} {} | {} days | policy {} | TP {}% SL {}%",
        config.symbol,
        config.interval,
        days,
        config.strategy.policy,
        config.strategy.take_profit_pct,
        config.strategy.stop_loss_pct
    );

    let db = settings.open_db().await?;
    let candles = fetch_history(&settings.binance(), &config, days).await?;
    println!("Fetched {} candles\n", candles.len());

    let result = BacktestEngine::run(&config, &candles)?;
    print_backtest(&result);

    if save_backtest(&db, &config, &result).await? {
        println!("\nRun saved to {}", settings.db_path);
    } else {
        println!("\nIdentical run already stored, not saved again");
    }

    Ok(())
}

fn print_backtest(result: &BacktestResult) {
    let stats = &result.stats;
    println!(
        "  Balance:       {} -> {}",
        stats.initial_balance,
        stats.final_balance.round_dp(2)
    );
    println!(
        "  Profit:        {} ({}%)",
        stats.total_profit.round_dp(2),
        stats.total_profit_pct
    );
    println!(
        "  Trades:        {} ({} won, {} lost)",
        stats.total_trades, stats.winning_trades, stats.losing_trades
    );
    println!("  Win rate:      {}%", stats.win_rate);
    println!("  Profit factor: {}", stats.profit_factor);
    println!("  Max drawdown:  {}%", stats.max_drawdown_pct);
}

// ============================================================================
// Optimize command
// ============================================================================

async fn cmd_optimize(settings: &Settings, base: BacktestConfig, days: u32) -> anyhow::Result<()> {
    println!("\n=== Crypto S/R v{} ===", APP_VERSION);
    let ranges = ParamRanges::default();
    println!(
        "Optimizing {} {} over {} days ({} combinations)",
        base.symbol,
        base.interval,
        days,
        ranges.combinations()
    );
    println!("Press Ctrl+C to stop\n");

    let candles = fetch_history(&settings.binance(), &base, days).await?;
    println!("Fetched {} candles", candles.len());

    let progress = Arc::new(OptimizeProgress::new());
    progress.reset(&base.symbol);

    let progress_for_ctrlc = progress.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl+C received, requesting cancel...");
        progress_for_ctrlc.cancelled.store(true, Ordering::Relaxed);
    });

    let progress_clone = progress.clone();
    let handle = tokio::task::spawn_blocking(move || {
        run_optimization(&base, &ranges, &candles, &progress_clone)
    });

    // Progress display loop
    loop {
        tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
        let status = progress.status.read().unwrap().clone();
        let completed = progress.completed.load(Ordering::Relaxed);
        let total = progress.total_combinations.load(Ordering::Relaxed);

        match status {
            OptimizeStatus::Running => {
                print!(
                    "\r  [{}] {:.0}% ({}/{})   ",
                    progress_bar(progress.progress_pct()),
                    progress.progress_pct(),
                    completed,
                    total
                );
                std::io::stdout().flush().ok();
            }
            OptimizeStatus::Complete => {
                println!("\r  Complete! {} combinations tested{:<30}", completed, "");
                break;
            }
            OptimizeStatus::Cancelled => {
                println!("\r  Cancelled after {}/{} combinations{:<30}", completed, total, "");
                break;
            }
            OptimizeStatus::Error => {
                let err = progress.error_message.read().unwrap().clone();
                println!("\r  Error: {}{:<30}", err.unwrap_or_default(), "");
                break;
            }
            OptimizeStatus::Idle => {}
        }
    }

    let outcome = handle.await??;
    print_outcome(&outcome);

    Ok(())
}

fn print_outcome(outcome: &OptimizeOutcome) {
    let p = &outcome.best;
    println!(
        "\n{} ({} of {} combinations qualified)",
        if outcome.found {
            "Best configuration"
        } else {
            "No qualifying configuration, defaults"
        },
        outcome.qualifying,
        outcome.combinations_tested
    );
    println!(
        "  TP {}% | SL {}% | RSI {} | MA {}",
        p.take_profit_pct, p.stop_loss_pct, p.rsi_period, p.ma_period
    );
    if let Some(c) = &outcome.best_candidate {
        println!(
            "  Profit {} | Win rate {}% | Trades {}",
            c.profit.round_dp(2),
            c.win_rate,
            c.total_trades
        );
    }
}

// ============================================================================
// API Handlers: market data and analysis
// ============================================================================

/// GET /api/health
async fn api_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "crypto-sr",
        "version": APP_VERSION,
    }))
}

/// GET /api/coins: top coins by market cap
async fn api_coins(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    let limit: usize = params
        .get("limit")
        .and_then(|s| s.parse().ok())
        .unwrap_or(20);

    let coins = state.coingecko.list_universe(limit).await;
    Json(serde_json::json!({
        "success": !coins.is_empty(),
        "data": coins,
        "total": coins.len(),
    }))
}

/// GET /api/analyze/:coin_id: levels and recommendations for one coin
async fn api_analyze(
    State(state): State<AppState>,
    Path(coin_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    let timeframes = params
        .get("timeframes")
        .map(|s| Timeframe::parse_list(s))
        .filter(|tfs| !tfs.is_empty())
        .unwrap_or_else(|| Timeframe::ALL.to_vec());
    let rec_config = if params.get("strict").is_some_and(|s| s == "true") {
        RecommendationConfig::strict()
    } else {
        RecommendationConfig::default()
    };

    let coin = CoinInfo {
        name: params.get("name").cloned().unwrap_or_else(|| coin_id.clone()),
        symbol: params
            .get("symbol")
            .cloned()
            .unwrap_or_else(|| coin_id.to_uppercase()),
        id: coin_id,
    };

    match analyze_coin(
        state.coingecko.as_ref(),
        &coin,
        &timeframes,
        &LevelConfig::default(),
        &rec_config,
    )
    .await
    {
        Ok(Some(analysis)) => Json(serde_json::json!({
            "success": true,
            "data": analysis,
        })),
        Ok(None) => Json(serde_json::json!({
            "success": false,
            "message": format!("Price unavailable for '{}'", coin.id),
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "message": format!("Analysis failed: {}", e),
        })),
    }
}

// ============================================================================
// API Handlers: scanner
// ============================================================================

/// POST /api/scan: start a scan in the background
async fn api_start_scan(
    State(state): State<AppState>,
    Json(request): Json<ScanRequest>,
) -> Json<serde_json::Value> {
    if !state.scan_progress.try_start() {
        let pct = state.scan_progress.progress_pct();
        return Json(serde_json::json!({
            "success": false,
            "message": format!("Scan already running ({:.0}% complete)", pct),
        }));
    }

    info!(limit = request.limit, "Starting scan");

    let source = state.coingecko.clone();
    let progress = state.scan_progress.clone();
    let db = state.db.clone();
    tokio::spawn(async move {
        let found = run_scan(source.as_ref(), &request, &progress).await;
        let saved = save_scan_signals(&db, &found).await;
        info!(saved, "Scan signals stored");
    });

    Json(serde_json::json!({
        "success": true,
        "message": "Scan started",
    }))
}

/// POST /api/scan/cancel
async fn api_cancel_scan(State(state): State<AppState>) -> Json<serde_json::Value> {
    if !state.scan_progress.is_running() {
        return Json(serde_json::json!({
            "success": false,
            "message": "No scan running",
        }));
    }

    state.scan_progress.cancel();
    info!("Scan cancel requested via API");

    Json(serde_json::json!({
        "success": true,
        "message": "Cancel requested",
    }))
}

/// GET /api/scan/status: poll scan progress
async fn api_scan_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let progress = &state.scan_progress;
    let status = progress.status.read().unwrap().clone();
    let current_coin = progress.current_coin.read().unwrap().clone();
    let opportunities = progress.opportunities.read().unwrap().clone();

    Json(serde_json::json!({
        "status": status,
        "progress_pct": progress.progress_pct(),
        "completed": progress.completed.load(Ordering::Relaxed),
        "total": progress.total_coins.load(Ordering::Relaxed),
        "current_coin": current_coin,
        "opportunities": opportunities,
    }))
}

// ============================================================================
// API Handlers: backtests
// ============================================================================

fn default_days() -> u32 {
    30
}

#[derive(Deserialize)]
struct BacktestRequest {
    #[serde(default)]
    config: BacktestConfig,
    #[serde(default = "default_days")]
    days: u32,
}

/// POST /api/backtest: fetch Binance history, run and store a backtest
async fn api_backtest(
    State(state): State<AppState>,
    Json(request): Json<BacktestRequest>,
) -> Json<serde_json::Value> {
    let config = request.config;

    let candles = match fetch_history(&state.binance, &config, request.days).await {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to fetch klines for backtest: {}", e);
            return Json(serde_json::json!({
                "success": false,
                "message": format!("Failed to fetch market data: {}", e),
            }));
        }
    };

    let result = match BacktestEngine::run(&config, &candles) {
        Ok(r) => r,
        Err(e) => {
            return Json(serde_json::json!({
                "success": false,
                "message": format!("Backtest rejected: {}", e),
            }))
        }
    };

    let saved = match save_backtest(&state.db, &config, &result).await {
        Ok(saved) => saved,
        Err(e) => {
            warn!(error = %e, "Failed to store backtest run");
            false
        }
    };

    Json(serde_json::json!({
        "success": true,
        "saved": saved,
        "result": result,
    }))
}

/// GET /api/backtests: stored runs, newest first
async fn api_backtests(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    let limit: i64 = params
        .get("limit")
        .and_then(|s| s.parse().ok())
        .unwrap_or(20);
    let symbol = params.get("symbol").map(|s| s.as_str());

    let repo = BacktestRepository::new(state.db.pool());
    match repo.recent(limit, symbol).await {
        Ok(records) => Json(serde_json::json!({
            "success": true,
            "total": records.len(),
            "data": records,
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Failed to query backtests: {}", e),
            "data": [],
            "total": 0,
        })),
    }
}

// ============================================================================
// API Handlers: optimizer
// ============================================================================

#[derive(Deserialize)]
struct OptimizeRequest {
    #[serde(default)]
    config: BacktestConfig,
    #[serde(default)]
    ranges: ParamRanges,
    #[serde(default = "default_days")]
    days: u32,
}

/// POST /api/optimize: start parameter optimization in the background
async fn api_start_optimization(
    State(state): State<AppState>,
    Json(request): Json<OptimizeRequest>,
) -> Json<serde_json::Value> {
    if !state.optimize_progress.try_start(&request.config.symbol) {
        let pct = state.optimize_progress.progress_pct();
        return Json(serde_json::json!({
            "success": false,
            "message": format!("Optimization already in progress ({:.0}% complete)", pct),
        }));
    }

    info!(
        symbol = %request.config.symbol,
        interval = %request.config.interval,
        days = request.days,
        "Starting parameter optimization"
    );

    let candles = match fetch_history(&state.binance, &request.config, request.days).await {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to fetch klines for optimization: {}", e);
            state
                .optimize_progress
                .fail(format!("Failed to fetch klines: {}", e));
            return Json(serde_json::json!({
                "success": false,
                "message": format!("Failed to fetch market data: {}", e),
            }));
        }
    };

    info!(candles = candles.len(), "Klines fetched, spawning optimization task");

    let total = request.ranges.combinations();
    let progress = state.optimize_progress.clone();
    tokio::task::spawn_blocking(move || {
        if let Err(e) = run_optimization(&request.config, &request.ranges, &candles, &progress) {
            warn!(error = %e, "Optimization failed");
        }
    });

    Json(serde_json::json!({
        "success": true,
        "message": format!("Optimization started ({} combinations)", total),
        "total_combinations": total,
    }))
}

/// GET /api/optimize/status: poll optimization progress
async fn api_optimize_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let progress = &state.optimize_progress;
    let status = progress.status.read().unwrap().clone();
    let outcome = progress.outcome.read().unwrap().clone();
    let error = progress.error_message.read().unwrap().clone();
    let symbol = progress.symbol.read().unwrap().clone();

    Json(serde_json::json!({
        "status": status,
        "symbol": symbol,
        "progress_pct": progress.progress_pct(),
        "completed": progress.completed.load(Ordering::Relaxed),
        "total": progress.total_combinations.load(Ordering::Relaxed),
        "outcome": outcome,
        "error": error,
    }))
}

// ============================================================================
// API Handlers: signals
// ============================================================================

/// GET /api/signals: stored signals, newest first
async fn api_signals(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    let limit: i64 = params
        .get("limit")
        .and_then(|s| s.parse().ok())
        .unwrap_or(50);
    let status = params.get("status").map(|s| s.as_str());

    let repo = SignalRepository::new(state.db.pool());
    match repo.recent(limit, status).await {
        Ok(records) => Json(serde_json::json!({
            "success": true,
            "total": records.len(),
            "data": records,
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Failed to query signals: {}", e),
            "data": [],
            "total": 0,
        })),
    }
}

/// POST /api/signals/:id/close: move a signal out of ACTIVE (`?status=`, default CLOSED)
async fn api_close_signal(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    let status = params
        .get("status")
        .map(|s| s.to_uppercase())
        .unwrap_or_else(|| "CLOSED".to_string());

    let repo = SignalRepository::new(state.db.pool());
    match repo.close(id, &status).await {
        Ok(true) => Json(serde_json::json!({
            "success": true,
            "id": id,
            "status": status,
        })),
        Ok(false) => Json(serde_json::json!({
            "success": false,
            "message": format!("Signal {} not found", id),
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Failed to close signal: {}", e),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_state() -> AppState {
        AppState {
            coingecko: Arc::new(CoinGeckoClient::new()),
            binance: Arc::new(BinanceClient::new()),
            db: Arc::new(Database::in_memory().await.unwrap()),
            scan_progress: Arc::new(ScanProgress::new()),
            optimize_progress: Arc::new(OptimizeProgress::new()),
        }
    }

    fn backtest_policy(args: &[&str]) -> Result<PolicyArg, clap::Error> {
        let cli = Cli::try_parse_from(["crypto-sr", "backtest"].iter().chain(args.iter()).copied())?;
        match cli.command {
            Commands::Backtest { policy, .. } => Ok(policy),
            _ => unreachable!("backtest subcommand"),
        }
    }

    #[test]
    fn test_policy_argument() {
        assert_eq!(backtest_policy(&[]).unwrap(), PolicyArg::Threshold);
        assert_eq!(
            backtest_policy(&["--policy", "indicator"]).unwrap(),
            PolicyArg::Indicator
        );
        assert_eq!(
            SignalPolicy::from(PolicyArg::Indicator),
            SignalPolicy::Indicator
        );
        // Typos are rejected instead of falling back to threshold
        assert!(backtest_policy(&["--policy", "indicatr"]).is_err());
    }

    #[test]
    fn test_parse_timeframes() {
        assert_eq!(
            parse_timeframes("1h, 4h,bogus").unwrap(),
            vec![Timeframe::H1, Timeframe::H4]
        );
        assert!(parse_timeframes("bogus").is_err());
    }

    #[test]
    fn test_history_range_spans_days() {
        let (start, end) = history_range(2);
        assert_eq!(end - start, 2 * DAY_MS);
    }

    #[test]
    fn test_progress_bar_is_fixed_width() {
        assert_eq!(progress_bar(0.0), " ".repeat(30));
        assert_eq!(progress_bar(100.0), "=".repeat(30));
        assert_eq!(progress_bar(50.0).trim_end().len(), 15);
    }

    #[test]
    fn test_backtest_request_defaults() {
        let request: BacktestRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(request.days, 30);
        assert_eq!(request.config, BacktestConfig::default());

        let request: BacktestRequest = serde_json::from_str(
            r#"{"days": 7, "config": {"symbol": "ETHUSDT", "strategy": {"policy": "indicator"}}}"#,
        )
        .unwrap();
        assert_eq!(request.days, 7);
        assert_eq!(request.config.symbol, "ETHUSDT");
        assert_eq!(request.config.strategy.policy, SignalPolicy::Indicator);
        assert_eq!(request.config.interval, "1h");
    }

    #[test]
    fn test_optimize_request_defaults() {
        let request: OptimizeRequest =
            serde_json::from_str(r#"{"ranges": {"rsi_period": [14]}}"#).unwrap();
        assert_eq!(request.ranges.rsi_period, vec![14]);
        assert_eq!(request.ranges.take_profit_pct.len(), 5);
        assert_eq!(request.ranges.combinations(), 80);
    }

    #[tokio::test]
    async fn test_save_scan_signals() {
        let db = Database::in_memory().await.unwrap();
        let source = StubSource;
        let coin = coin_from_id("alpha");
        let timeframes = [Timeframe::H4];
        let analysis = analyze_coin(
            &source,
            &coin,
            &timeframes,
            &LevelConfig::default(),
            &RecommendationConfig::default(),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(!analysis.recommendations.is_empty());

        let opportunities = vec![Opportunity {
            opportunities: engine::find_opportunities(&analysis, Decimal::from(10), Decimal::from(8)),
            coin: analysis,
        }];
        let saved = save_scan_signals(&db, &opportunities).await;
        assert_eq!(saved, opportunities[0].coin.recommendations.len());

        let stored = SignalRepository::new(db.pool()).recent(10, None).await.unwrap();
        assert_eq!(stored.len(), saved);
        assert!(stored.iter().all(|s| s.symbol == "ALPHA"));
    }

    /// Fixed price and series for any coin
    struct StubSource;

    #[async_trait::async_trait]
    impl MarketDataSource for StubSource {
        async fn fetch_price(&self, _coin_id: &str) -> Option<Decimal> {
            Some(Decimal::from(95))
        }

        async fn fetch_series(&self, _coin_id: &str, _timeframe: Timeframe) -> Vec<Candle> {
            [100, 95, 91, 96, 100, 98, 95]
                .iter()
                .enumerate()
                .map(|(i, p)| Candle::flat(i as i64 * 3_600_000, Decimal::from(*p)))
                .collect()
        }

        async fn list_universe(&self, _limit: usize) -> Vec<CoinInfo> {
            vec![coin_from_id("alpha")]
        }
    }

    #[tokio::test]
    async fn test_close_signal_endpoint() {
        let state = test_state().await;
        let repo = SignalRepository::new(state.db.pool());
        let record = persistence::repository::SignalRecord {
            id: None,
            symbol: "BTC".to_string(),
            side: "BUY".to_string(),
            price: "91.455".to_string(),
            take_profit_price: "99.75".to_string(),
            stop_loss_price: "90.09".to_string(),
            timeframe: Some("4h".to_string()),
            status: "ACTIVE".to_string(),
            created_at: None,
            closed_at: None,
        };
        let id = repo.save(&record).await.unwrap();

        let Json(body) = api_close_signal(
            State(state.clone()),
            Path(id),
            Query(HashMap::from([("status".to_string(), "hit".to_string())])),
        )
        .await;
        assert_eq!(body["success"], true);
        assert_eq!(body["status"], "HIT");

        let stored = repo.recent(10, Some("HIT")).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].closed_at.is_some());

        let Json(body) =
            api_close_signal(State(state.clone()), Path(id + 100), Query(HashMap::new())).await;
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_second_scan_start_is_refused() {
        let state = test_state().await;
        // Claimed by a scan already in flight
        assert!(state.scan_progress.try_start());

        let Json(body) = api_start_scan(State(state.clone()), Json(ScanRequest::default())).await;
        assert_eq!(body["success"], false);
        assert!(state.scan_progress.is_running());
    }
}
