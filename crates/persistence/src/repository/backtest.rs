//! Backtest runs repository

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{FromRow, SqlitePool};

/// A stored backtest run. Decimal values are kept as TEXT, the parameter set
/// and the trade ledger as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct BacktestRunRecord {
    pub id: Option<i64>,
    pub params_hash: String,
    pub symbol: String,
    pub interval: String,
    pub policy: String,
    pub params: String,
    pub start_time: i64,
    pub end_time: i64,
    pub initial_balance: String,
    pub final_balance: String,
    pub total_profit: String,
    pub total_profit_pct: String,
    pub total_trades: i64,
    pub winning_trades: i64,
    pub losing_trades: i64,
    pub win_rate: String,
    pub profit_factor: String,
    pub max_drawdown_pct: String,
    pub trades: String,
    pub created_at: Option<i64>,
}

/// Deterministic dedup key for a run: sha256 over its identifying parts
pub fn compute_params_hash(
    symbol: &str,
    interval: &str,
    params_json: &str,
    start_time: i64,
    end_time: i64,
) -> String {
    let input = format!(
        "{}:{}:{}:{}:{}",
        symbol, interval, params_json, start_time, end_time
    );
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

/// Repository for backtest runs
pub struct BacktestRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> BacktestRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Save a run (INSERT OR IGNORE, skips if params_hash already exists).
    /// Returns whether a new row was written.
    pub async fn save(&self, record: &BacktestRunRecord) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO backtest_runs (
                params_hash, symbol, interval, policy, params,
                start_time, end_time,
                initial_balance, final_balance, total_profit, total_profit_pct,
                total_trades, winning_trades, losing_trades,
                win_rate, profit_factor, max_drawdown_pct, trades
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.params_hash)
        .bind(&record.symbol)
        .bind(&record.interval)
        .bind(&record.policy)
        .bind(&record.params)
        .bind(record.start_time)
        .bind(record.end_time)
        .bind(&record.initial_balance)
        .bind(&record.final_balance)
        .bind(&record.total_profit)
        .bind(&record.total_profit_pct)
        .bind(record.total_trades)
        .bind(record.winning_trades)
        .bind(record.losing_trades)
        .bind(&record.win_rate)
        .bind(&record.profit_factor)
        .bind(&record.max_drawdown_pct)
        .bind(&record.trades)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Get a run by its params_hash
    pub async fn get_by_hash(&self, hash: &str) -> DbResult<Option<BacktestRunRecord>> {
        let record = sqlx::query_as::<_, BacktestRunRecord>(
            "SELECT * FROM backtest_runs WHERE params_hash = ?",
        )
        .bind(hash)
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }

    /// Most recent runs first, optionally for one symbol
    pub async fn recent(&self, limit: i64, symbol: Option<&str>) -> DbResult<Vec<BacktestRunRecord>> {
        let records = match symbol {
            Some(sym) => {
                sqlx::query_as::<_, BacktestRunRecord>(
                    "SELECT * FROM backtest_runs WHERE symbol = ? ORDER BY id DESC LIMIT ?",
                )
                .bind(sym)
                .bind(limit)
                .fetch_all(self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, BacktestRunRecord>(
                    "SELECT * FROM backtest_runs ORDER BY id DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(self.pool)
                .await?
            }
        };

        Ok(records)
    }

    pub async fn count(&self) -> DbResult<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM backtest_runs")
            .fetch_one(self.pool)
            .await?;
        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn record(symbol: &str, params: &str) -> BacktestRunRecord {
        BacktestRunRecord {
            id: None,
            params_hash: compute_params_hash(symbol, "1h", params, 0, 3_600_000),
            symbol: symbol.to_string(),
            interval: "1h".to_string(),
            policy: "threshold".to_string(),
            params: params.to_string(),
            start_time: 0,
            end_time: 3_600_000,
            initial_balance: "1000".to_string(),
            final_balance: "1038.4615384615384615384615385".to_string(),
            total_profit: "38.4615384615384615384615385".to_string(),
            total_profit_pct: "3.85".to_string(),
            total_trades: 2,
            winning_trades: 1,
            losing_trades: 1,
            win_rate: "50".to_string(),
            profit_factor: "999.99".to_string(),
            max_drawdown_pct: "0".to_string(),
            trades: "[]".to_string(),
            created_at: None,
        }
    }

    #[test]
    fn test_params_hash_is_deterministic() {
        let a = compute_params_hash("BTCUSDT", "1h", "{}", 1, 2);
        let b = compute_params_hash("BTCUSDT", "1h", "{}", 1, 2);
        let c = compute_params_hash("ETHUSDT", "1h", "{}", 1, 2);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_save_dedups_by_hash() {
        let db = Database::in_memory().await.unwrap();
        let repo = BacktestRepository::new(db.pool());

        let run = record("BTCUSDT", r#"{"tp":2}"#);
        assert!(repo.save(&run).await.unwrap());
        assert!(!repo.save(&run).await.unwrap());
        assert_eq!(repo.count().await.unwrap(), 1);

        let stored = repo.get_by_hash(&run.params_hash).await.unwrap().unwrap();
        assert!(stored.id.is_some());
        assert!(stored.created_at.is_some());
        // Decimal text survives untouched
        assert_eq!(stored.final_balance, run.final_balance);

        assert!(repo.get_by_hash("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recent_orders_newest_first_and_filters() {
        let db = Database::in_memory().await.unwrap();
        let repo = BacktestRepository::new(db.pool());

        repo.save(&record("BTCUSDT", "1")).await.unwrap();
        repo.save(&record("ETHUSDT", "2")).await.unwrap();
        repo.save(&record("BTCUSDT", "3")).await.unwrap();

        let all = repo.recent(10, None).await.unwrap();
        let params: Vec<&str> = all.iter().map(|r| r.params.as_str()).collect();
        assert_eq!(params, vec!["3", "2", "1"]);

        let btc = repo.recent(1, Some("BTCUSDT")).await.unwrap();
        assert_eq!(btc.len(), 1);
        assert_eq!(btc[0].params, "3");
    }
}
