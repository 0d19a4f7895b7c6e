//! Inventory store seam
//!
//! The settlement engine only talks to persistence through these two traits.
//! `InventoryStore` hands out units of work (`InventoryTx`); everything the
//! engine reads or writes for one proposal goes through a single unit of work
//! so that validation and mutation observe the same snapshot.
//!
//! Implementations:
//! - [`crate::db::Database`] - PostgreSQL, one `SERIALIZABLE` transaction per unit of work
//! - [`memory::MemoryStore`] - in-process, units of work serialized behind an async mutex

pub mod memory;

use crate::db::{CardInstance, NewTrade, NewTradeLine, Trade, TradeRecord};
use crate::types::{CardId, InstanceId, TradeId, UserId};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Serialization failure, deadlock or unique-key race. Retrying the
    /// whole unit of work on a fresh snapshot may succeed.
    #[error("Concurrent update conflict: {0}")]
    Conflict(String),
    #[error("Store backend error: {0}")]
    Backend(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// One unit of work against the inventory.
///
/// Nothing written through a unit of work is visible to other callers until
/// `commit` succeeds. Dropping it without committing discards its writes.
#[async_trait]
pub trait InventoryTx: Send {
    /// Fetch an instance by identity, locking it for the rest of the unit of work
    async fn get_instance(&mut self, instance_id: InstanceId) -> Result<Option<CardInstance>, StoreError>;

    /// Reassign ownership only if the instance still belongs to `expected_owner`.
    /// Returns false when zero rows matched.
    async fn update_instance_owner(
        &mut self,
        instance_id: InstanceId,
        expected_owner: UserId,
        new_owner: UserId,
    ) -> Result<bool, StoreError>;

    async fn insert_trade(&mut self, trade: &NewTrade) -> Result<Trade, StoreError>;

    async fn insert_trade_lines(&mut self, lines: &[NewTradeLine]) -> Result<(), StoreError>;

    /// Flag the audit lines of instances a settlement could not move
    async fn mark_lines_untransferred(
        &mut self,
        trade_id: TradeId,
        instance_ids: &[InstanceId],
    ) -> Result<(), StoreError>;

    async fn find_trade_by_idempotency_key(&mut self, key: &str) -> Result<Option<TradeRecord>, StoreError>;

    /// Whether `owner` already has an affixed copy of `card_id`
    async fn has_affixed_copy(&mut self, owner: UserId, card_id: CardId) -> Result<bool, StoreError>;

    /// Mark an unaffixed instance owned by `owner` as affixed. Returns false
    /// when zero rows matched.
    async fn mark_affixed(&mut self, instance_id: InstanceId, owner: UserId) -> Result<bool, StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait InventoryStore: Send + Sync + 'static {
    type Tx: InventoryTx;

    /// Open a new unit of work
    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    async fn list_instances_by_owner(&self, owner: UserId) -> Result<Vec<CardInstance>, StoreError>;

    async fn get_trade(&self, trade_id: TradeId) -> Result<Option<TradeRecord>, StoreError>;

    /// Trades the user sent or received, newest first
    async fn list_trades_for_user(
        &self,
        user: UserId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Trade>, StoreError>;

    async fn count_trades_for_user(&self, user: UserId) -> Result<i64, StoreError>;
}
