//! Database module for PostgreSQL operations using SQLx
//! Uses runtime query checking (no compile-time DATABASE_URL needed)

mod models;

pub use models::*;

use crate::store::{InventoryStore, InventoryTx, StoreError};
use crate::types::{CardId, InstanceId, TradeId, UserId};
use async_trait::async_trait;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// SQLSTATEs that mean "another transaction got there first"
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migrate(#[from] MigrateError),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let Some(db_err) = err.as_database_error() {
            let retryable = db_err
                .code()
                .map(|code| matches!(code.as_ref(), SERIALIZATION_FAILURE | DEADLOCK_DETECTED | UNIQUE_VIOLATION))
                .unwrap_or(false);
            if retryable {
                return StoreError::Conflict(db_err.message().to_string());
            }
        }

        match err {
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => StoreError::InvalidData(err.to_string()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// Database connection wrapper
#[derive(Clone)]
pub struct Database {
    pool: Arc<PgPool>,
}

impl Database {
    /// Create a new database connection pool
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Database pool created with max {} connections", max_connections);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending migrations from `dir`
    pub async fn run_migrations(&self, dir: &Path) -> Result<(), DbError> {
        let migrator = Migrator::new(dir).await?;
        migrator.run(self.pool()).await?;
        info!("Migrations applied from {}", dir.display());
        Ok(())
    }
}

// ==========================================
// Shared queries
// ==========================================

const INSTANCE_COLUMNS: &str = "instance_id, owner_id, card_id, is_affixed, created_at, updated_at";
const TRADE_COLUMNS: &str = "trade_id, sender_id, receiver_id, status, idempotency_key, created_at";

async fn fetch_trade_lines(conn: &mut PgConnection, trade_id: TradeId) -> Result<Vec<TradeLine>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT line_id, trade_id, owner_before, card_id, instance_id, quantity, transferred
        FROM trade_lines
        WHERE trade_id = $1
        ORDER BY line_id
        "#
    )
    .bind(trade_id)
    .fetch_all(conn)
    .await?;

    let mut lines = Vec::with_capacity(rows.len());
    for row in rows {
        lines.push(TradeLine::from_row(&row)?);
    }
    Ok(lines)
}

// ==========================================
// Unit of work
// ==========================================

/// One `SERIALIZABLE` PostgreSQL transaction
pub struct PgInventoryTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl InventoryTx for PgInventoryTx {
    async fn get_instance(&mut self, instance_id: InstanceId) -> Result<Option<CardInstance>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM card_instances WHERE instance_id = $1 FOR UPDATE",
            INSTANCE_COLUMNS
        ))
        .bind(instance_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        match row {
            Some(row) => Ok(Some(CardInstance::from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn update_instance_owner(
        &mut self,
        instance_id: InstanceId,
        expected_owner: UserId,
        new_owner: UserId,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE card_instances
            SET
                owner_id = $3,
                updated_at = CURRENT_TIMESTAMP
            WHERE instance_id = $1
                AND owner_id = $2
                AND is_affixed = FALSE
            "#
        )
        .bind(instance_id)
        .bind(expected_owner)
        .bind(new_owner)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn insert_trade(&mut self, trade: &NewTrade) -> Result<Trade, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO trades (sender_id, receiver_id, status, idempotency_key, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            RETURNING {}
            "#,
            TRADE_COLUMNS
        ))
        .bind(trade.sender_id)
        .bind(trade.receiver_id)
        .bind(trade.status.as_str())
        .bind(&trade.idempotency_key)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(Trade::from_row(&row)?)
    }

    async fn insert_trade_lines(&mut self, lines: &[NewTradeLine]) -> Result<(), StoreError> {
        let trade_ids: Vec<TradeId> = lines.iter().map(|l| l.trade_id).collect();
        let owners: Vec<UserId> = lines.iter().map(|l| l.owner_before).collect();
        let cards: Vec<CardId> = lines.iter().map(|l| l.card_id).collect();
        let instances: Vec<InstanceId> = lines.iter().map(|l| l.instance_id).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO trade_lines (trade_id, owner_before, card_id, instance_id, quantity)
            SELECT l.trade_id, l.owner_before, l.card_id, l.instance_id, 1
            FROM UNNEST($1::bigint[], $2::uuid[], $3::bigint[], $4::bigint[])
                AS l(trade_id, owner_before, card_id, instance_id)
            "#
        )
        .bind(&trade_ids)
        .bind(&owners)
        .bind(&cards)
        .bind(&instances)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() != lines.len() as u64 {
            return Err(StoreError::Backend(format!(
                "inserted {} of {} trade lines",
                result.rows_affected(),
                lines.len()
            )));
        }
        Ok(())
    }

    async fn mark_lines_untransferred(
        &mut self,
        trade_id: TradeId,
        instance_ids: &[InstanceId],
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE trade_lines
            SET transferred = FALSE
            WHERE trade_id = $1
                AND instance_id = ANY($2)
            "#
        )
        .bind(trade_id)
        .bind(instance_ids)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() != instance_ids.len() as u64 {
            return Err(StoreError::Backend(format!(
                "flagged {} of {} trade lines of trade {}",
                result.rows_affected(),
                instance_ids.len(),
                trade_id
            )));
        }
        Ok(())
    }

    async fn find_trade_by_idempotency_key(&mut self, key: &str) -> Result<Option<TradeRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM trades WHERE idempotency_key = $1",
            TRADE_COLUMNS
        ))
        .bind(key)
        .fetch_optional(&mut *self.tx)
        .await?;

        let trade = match row {
            Some(row) => Trade::from_row(&row)?,
            None => return Ok(None),
        };
        let lines = fetch_trade_lines(&mut *self.tx, trade.trade_id).await?;
        Ok(Some(TradeRecord { trade, lines }))
    }

    async fn has_affixed_copy(&mut self, owner: UserId, card_id: CardId) -> Result<bool, StoreError> {
        let row: (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM card_instances
                WHERE owner_id = $1 AND card_id = $2 AND is_affixed = TRUE
            )
            "#
        )
        .bind(owner)
        .bind(card_id)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(row.0)
    }

    async fn mark_affixed(&mut self, instance_id: InstanceId, owner: UserId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE card_instances
            SET
                is_affixed = TRUE,
                updated_at = CURRENT_TIMESTAMP
            WHERE instance_id = $1
                AND owner_id = $2
                AND is_affixed = FALSE
            "#
        )
        .bind(instance_id)
        .bind(owner)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

// ==========================================
// Store operations
// ==========================================

#[async_trait]
impl InventoryStore for Database {
    type Tx = PgInventoryTx;

    async fn begin(&self) -> Result<PgInventoryTx, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        debug!("Opened serializable transaction");
        Ok(PgInventoryTx { tx })
    }

    async fn list_instances_by_owner(&self, owner: UserId) -> Result<Vec<CardInstance>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM card_instances WHERE owner_id = $1 ORDER BY card_id, instance_id",
            INSTANCE_COLUMNS
        ))
        .bind(owner)
        .fetch_all(self.pool())
        .await?;

        let mut instances = Vec::with_capacity(rows.len());
        for row in rows {
            instances.push(CardInstance::from_row(&row)?);
        }
        Ok(instances)
    }

    async fn get_trade(&self, trade_id: TradeId) -> Result<Option<TradeRecord>, StoreError> {
        let mut conn = self.pool.acquire().await?;

        let row = sqlx::query(&format!("SELECT {} FROM trades WHERE trade_id = $1", TRADE_COLUMNS))
            .bind(trade_id)
            .fetch_optional(&mut *conn)
            .await?;

        let trade = match row {
            Some(row) => Trade::from_row(&row)?,
            None => return Ok(None),
        };
        let lines = fetch_trade_lines(&mut *conn, trade_id).await?;
        Ok(Some(TradeRecord { trade, lines }))
    }

    async fn list_trades_for_user(
        &self,
        user: UserId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Trade>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM trades
            WHERE sender_id = $1 OR receiver_id = $1
            ORDER BY trade_id DESC
            LIMIT $2 OFFSET $3
            "#,
            TRADE_COLUMNS
        ))
        .bind(user)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await?;

        let mut trades = Vec::with_capacity(rows.len());
        for row in rows {
            trades.push(Trade::from_row(&row)?);
        }
        Ok(trades)
    }

    async fn count_trades_for_user(&self, user: UserId) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM trades
            WHERE sender_id = $1 OR receiver_id = $1
            "#
        )
        .bind(user)
        .fetch_one(self.pool())
        .await?;

        Ok(row.0)
    }
}
