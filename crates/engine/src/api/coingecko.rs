//! CoinGecko public API client (no API key required)

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, warn};

use super::MarketDataSource;
use crate::types::{Candle, CoinInfo, Timeframe};

const DEFAULT_BASE_URL: &str = "https://api.coingecko.com/api/v3";
const VS_CURRENCY: &str = "usd";

/// CoinGecko market data client
#[derive(Clone)]
pub struct CoinGeckoClient {
    client: Client,
    base_url: String,
}

/// `/coins/{id}/market_chart` response; points are `[timestamp_ms, value]`
#[derive(Debug, Deserialize)]
struct MarketChart {
    prices: Vec<(f64, f64)>,
    #[serde(default)]
    total_volumes: Vec<(f64, f64)>,
}

/// `/coins/markets` entry
#[derive(Debug, Deserialize)]
struct MarketEntry {
    id: String,
    symbol: String,
    name: String,
}

impl Default for CoinGeckoClient {
    fn default() -> Self {
        Self::new()
    }
}

impl CoinGeckoClient {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.get(&url).query(query).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("CoinGecko API error {}: {}", status, body);
        }

        Ok(response.json().await?)
    }

    /// Current USD price of a coin
    pub async fn get_price(&self, coin_id: &str) -> Result<Decimal> {
        let data: HashMap<String, HashMap<String, f64>> = self
            .get_json(
                "/simple/price",
                &[
                    ("ids", coin_id.to_string()),
                    ("vs_currencies", VS_CURRENCY.to_string()),
                ],
            )
            .await?;

        let price = data
            .get(coin_id)
            .and_then(|quotes| quotes.get(VS_CURRENCY))
            .copied()
            .ok_or_else(|| anyhow::anyhow!("No {} quote for {}", VS_CURRENCY, coin_id))?;

        Decimal::from_f64(price).ok_or_else(|| anyhow::anyhow!("Unrepresentable price {}", price))
    }

    /// Price history for a timeframe as flat candles (open = high = low = close)
    pub async fn get_market_chart(&self, coin_id: &str, timeframe: Timeframe) -> Result<Vec<Candle>> {
        debug!(coin_id, timeframe = %timeframe, "Fetching market chart from CoinGecko");

        let chart: MarketChart = self
            .get_json(
                &format!("/coins/{}/market_chart", coin_id),
                &[
                    ("vs_currency", VS_CURRENCY.to_string()),
                    ("days", timeframe.history_days().to_string()),
                    ("interval", timeframe.sampling().to_string()),
                ],
            )
            .await?;

        Ok(chart_to_candles(&chart))
    }

    /// Top coins by market cap
    pub async fn get_top_coins(&self, limit: usize) -> Result<Vec<CoinInfo>> {
        let entries: Vec<MarketEntry> = self
            .get_json(
                "/coins/markets",
                &[
                    ("vs_currency", VS_CURRENCY.to_string()),
                    ("order", "market_cap_desc".to_string()),
                    ("per_page", limit.to_string()),
                    ("page", "1".to_string()),
                ],
            )
            .await?;

        Ok(entries
            .into_iter()
            .map(|e| CoinInfo {
                id: e.id,
                name: e.name,
                symbol: e.symbol.to_uppercase(),
            })
            .collect())
    }
}

fn chart_to_candles(chart: &MarketChart) -> Vec<Candle> {
    chart
        .prices
        .iter()
        .enumerate()
        .filter_map(|(i, &(ts, price))| {
            let mut candle = Candle::flat(ts as i64, Decimal::from_f64(price)?);
            if let Some(volume) = chart
                .total_volumes
                .get(i)
                .and_then(|&(_, v)| Decimal::from_f64(v))
            {
                candle.volume = volume;
            }
            Some(candle)
        })
        .filter(|c| c.close > Decimal::ZERO)
        .collect()
}

#[async_trait]
impl MarketDataSource for CoinGeckoClient {
    async fn fetch_price(&self, coin_id: &str) -> Option<Decimal> {
        match self.get_price(coin_id).await {
            Ok(price) => Some(price),
            Err(e) => {
                warn!(coin_id, error = %e, "Price unavailable");
                None
            }
        }
    }

    async fn fetch_series(&self, coin_id: &str, timeframe: Timeframe) -> Vec<Candle> {
        self.get_market_chart(coin_id, timeframe)
            .await
            .unwrap_or_else(|e| {
                warn!(coin_id, timeframe = %timeframe, error = %e, "Series unavailable");
                Vec::new()
            })
    }

    async fn list_universe(&self, limit: usize) -> Vec<CoinInfo> {
        self.get_top_coins(limit).await.unwrap_or_else(|e| {
            warn!(error = %e, "Coin universe unavailable");
            Vec::new()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_market_chart_parses_into_flat_candles() {
        let json = r#"{
            "prices": [[1700000000000, 100.5], [1700003600000, 101.25], [1700007200000, 0]],
            "market_caps": [[1700000000000, 1.0]],
            "total_volumes": [[1700000000000, 5000.0], [1700003600000, 6000.0]]
        }"#;
        let chart: MarketChart = serde_json::from_str(json).unwrap();
        let candles = chart_to_candles(&chart);

        // Zero prices are dropped
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].timestamp, 1_700_000_000_000);
        assert_eq!(candles[0].close, dec!(100.5));
        assert_eq!(candles[0].high, candles[0].low);
        assert_eq!(candles[1].volume, dec!(6000));
    }

    #[test]
    fn test_market_chart_without_volumes() {
        let chart: MarketChart = serde_json::from_str(r#"{"prices": [[1, 2.0]]}"#).unwrap();
        let candles = chart_to_candles(&chart);
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].volume, Decimal::ZERO);
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = CoinGeckoClient::with_base_url("http://localhost:9000/api/v3/");
        assert_eq!(client.base_url, "http://localhost:9000/api/v3");
    }
}
