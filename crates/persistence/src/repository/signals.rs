//! Signals repository

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

pub const STATUS_ACTIVE: &str = "ACTIVE";

/// A stored trade signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SignalRecord {
    pub id: Option<i64>,
    pub symbol: String,
    /// BUY / SELL
    pub side: String,
    pub price: String,
    pub take_profit_price: String,
    pub stop_loss_price: String,
    pub timeframe: Option<String>,
    pub status: String,
    pub created_at: Option<i64>,
    pub closed_at: Option<i64>,
}

pub struct SignalRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> SignalRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a signal and return its row id
    pub async fn save(&self, record: &SignalRecord) -> DbResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO signals (
                symbol, side, price, take_profit_price, stop_loss_price, timeframe, status
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.symbol)
        .bind(&record.side)
        .bind(&record.price)
        .bind(&record.take_profit_price)
        .bind(&record.stop_loss_price)
        .bind(&record.timeframe)
        .bind(&record.status)
        .execute(self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Most recent signals first, optionally only those with `status`
    pub async fn recent(&self, limit: i64, status: Option<&str>) -> DbResult<Vec<SignalRecord>> {
        let records = match status {
            Some(status) => {
                sqlx::query_as::<_, SignalRecord>(
                    "SELECT * FROM signals WHERE status = ? ORDER BY id DESC LIMIT ?",
                )
                .bind(status)
                .bind(limit)
                .fetch_all(self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, SignalRecord>("SELECT * FROM signals ORDER BY id DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(self.pool)
                    .await?
            }
        };

        Ok(records)
    }

    /// Move a signal out of ACTIVE, stamping the close time
    pub async fn close(&self, id: i64, status: &str) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE signals SET status = ?, closed_at = strftime('%s', 'now') WHERE id = ?",
        )
        .bind(status)
        .bind(id)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn signal(symbol: &str, side: &str) -> SignalRecord {
        SignalRecord {
            id: None,
            symbol: symbol.to_string(),
            side: side.to_string(),
            price: "95".to_string(),
            take_profit_price: "99.75".to_string(),
            stop_loss_price: "90.09".to_string(),
            timeframe: Some("4h".to_string()),
            status: STATUS_ACTIVE.to_string(),
            created_at: None,
            closed_at: None,
        }
    }

    #[tokio::test]
    async fn test_save_and_list_signals() {
        let db = Database::in_memory().await.unwrap();
        let repo = SignalRepository::new(db.pool());

        let first = repo.save(&signal("BTC", "BUY")).await.unwrap();
        let second = repo.save(&signal("ETH", "SELL")).await.unwrap();
        assert!(second > first);

        let all = repo.recent(10, None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].symbol, "ETH");
        assert_eq!(all[1].take_profit_price, "99.75");
        assert!(all[0].closed_at.is_none());
    }

    #[tokio::test]
    async fn test_close_removes_from_active() {
        let db = Database::in_memory().await.unwrap();
        let repo = SignalRepository::new(db.pool());

        let id = repo.save(&signal("BTC", "BUY")).await.unwrap();
        repo.save(&signal("SOL", "BUY")).await.unwrap();
        assert!(repo.close(id, "CLOSED").await.unwrap());
        assert!(!repo.close(9999, "CLOSED").await.unwrap());

        let active = repo.recent(10, Some(STATUS_ACTIVE)).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].symbol, "SOL");

        let closed = repo.recent(10, Some("CLOSED")).await.unwrap();
        assert!(closed[0].closed_at.is_some());
    }
}
