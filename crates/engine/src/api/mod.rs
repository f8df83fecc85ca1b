//! Market data collaborators
//!
//! The analysis core never talks to the network itself. It pulls prices,
//! series and the coin universe through `MarketDataSource`, where a failed
//! fetch is reported as an absent value rather than an error.

pub mod binance;
pub mod coingecko;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::types::{Candle, CoinInfo, Timeframe};

pub use binance::BinanceClient;
pub use coingecko::CoinGeckoClient;

#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Spot price in USD, `None` when unavailable
    async fn fetch_price(&self, coin_id: &str) -> Option<Decimal>;

    /// Historical series for a timeframe, empty when unavailable
    async fn fetch_series(&self, coin_id: &str, timeframe: Timeframe) -> Vec<Candle>;

    /// Coin catalog ordered by market cap, empty when unavailable
    async fn list_universe(&self, limit: usize) -> Vec<CoinInfo>;
}
