//! In-process inventory store
//!
//! Units of work hold an owned lock on the whole inventory for their lifetime
//! and stage writes on a private copy, which replaces the shared state only on
//! commit. That makes every unit of work serializable and all-or-nothing.
//!
//! Failures can be injected with [`MemoryStore::inject`] to exercise the
//! engine's persistence error paths. As in PostgreSQL, a failed statement
//! aborts its unit of work: every later call fails, and committing an
//! aborted unit of work publishes nothing.

use super::{InventoryStore, InventoryTx, StoreError};
use crate::db::{CardInstance, NewTrade, NewTradeLine, Trade, TradeLine, TradeRecord};
use crate::types::{CardId, InstanceId, TradeId, UserId};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Failure to inject into subsequent units of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailPoint {
    InsertTrade,
    InsertTradeLines,
    /// Backend error when reassigning this instance
    OwnerUpdate(InstanceId),
    /// Reassigning this instance matches zero rows, as if a concurrent
    /// trade had already moved it
    OwnerMoved(InstanceId),
    /// Conflict on the next attempt to reassign this instance
    OwnerConflict(InstanceId),
    /// Report a conflict on the next `n` calls to `begin`
    BeginConflicts(u32),
}

#[derive(Debug, Default)]
struct Faults {
    insert_trade: bool,
    insert_trade_lines: bool,
    owner_updates: HashSet<InstanceId>,
    owners_moved: HashSet<InstanceId>,
    owner_conflicts: HashSet<InstanceId>,
    begin_conflicts: u32,
}

#[derive(Debug, Clone, Default)]
struct Inventory {
    instances: BTreeMap<InstanceId, CardInstance>,
    trades: BTreeMap<TradeId, Trade>,
    lines: Vec<TradeLine>,
    next_instance_id: InstanceId,
    next_trade_id: TradeId,
    next_line_id: i64,
}

impl Inventory {
    fn lines_for(&self, trade_id: TradeId) -> Vec<TradeLine> {
        self.lines.iter().filter(|l| l.trade_id == trade_id).cloned().collect()
    }

    fn record(&self, trade: &Trade) -> TradeRecord {
        TradeRecord {
            trade: trade.clone(),
            lines: self.lines_for(trade.trade_id),
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inventory: Arc<AsyncMutex<Inventory>>,
    faults: Arc<Mutex<Faults>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit a new instance to `owner`, as pack opening does
    pub async fn add_instance(&self, owner: UserId, card_id: CardId, is_affixed: bool) -> InstanceId {
        let mut inventory = self.inventory.lock().await;
        inventory.next_instance_id += 1;
        let instance_id = inventory.next_instance_id;
        let now = Utc::now();
        inventory.instances.insert(
            instance_id,
            CardInstance {
                instance_id,
                owner_id: owner,
                card_id,
                is_affixed,
                created_at: Some(now),
                updated_at: Some(now),
            },
        );
        instance_id
    }

    pub async fn instance(&self, instance_id: InstanceId) -> Option<CardInstance> {
        self.inventory.lock().await.instances.get(&instance_id).cloned()
    }

    pub async fn trade_count(&self) -> usize {
        self.inventory.lock().await.trades.len()
    }

    pub async fn trade_line_count(&self) -> usize {
        self.inventory.lock().await.lines.len()
    }

    pub fn inject(&self, point: FailPoint) {
        let mut faults = self.faults.lock();
        match point {
            FailPoint::InsertTrade => faults.insert_trade = true,
            FailPoint::InsertTradeLines => faults.insert_trade_lines = true,
            FailPoint::OwnerUpdate(instance_id) => {
                faults.owner_updates.insert(instance_id);
            }
            FailPoint::OwnerMoved(instance_id) => {
                faults.owners_moved.insert(instance_id);
            }
            FailPoint::OwnerConflict(instance_id) => {
                faults.owner_conflicts.insert(instance_id);
            }
            FailPoint::BeginConflicts(n) => faults.begin_conflicts = n,
        }
    }
}

/// Unit of work over a [`MemoryStore`]
pub struct MemoryTx {
    guard: OwnedMutexGuard<Inventory>,
    staged: Inventory,
    faults: Arc<Mutex<Faults>>,
    aborted: bool,
}

impl MemoryTx {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.aborted {
            return Err(StoreError::Backend(
                "current transaction is aborted, commands ignored until end of transaction block".to_string(),
            ));
        }
        Ok(())
    }

    fn abort(&mut self, err: StoreError) -> StoreError {
        self.aborted = true;
        err
    }
}

#[async_trait]
impl InventoryTx for MemoryTx {
    async fn get_instance(&mut self, instance_id: InstanceId) -> Result<Option<CardInstance>, StoreError> {
        self.ensure_open()?;
        Ok(self.staged.instances.get(&instance_id).cloned())
    }

    async fn update_instance_owner(
        &mut self,
        instance_id: InstanceId,
        expected_owner: UserId,
        new_owner: UserId,
    ) -> Result<bool, StoreError> {
        self.ensure_open()?;
        {
            let mut faults = self.faults.lock();
            if faults.owner_updates.contains(&instance_id) {
                drop(faults);
                let err = StoreError::Backend(format!("injected owner update failure for {}", instance_id));
                return Err(self.abort(err));
            }
            if faults.owner_conflicts.remove(&instance_id) {
                drop(faults);
                let err = StoreError::Conflict(format!("injected conflict on instance {}", instance_id));
                return Err(self.abort(err));
            }
            if faults.owners_moved.contains(&instance_id) {
                return Ok(false);
            }
        }

        match self.staged.instances.get_mut(&instance_id) {
            Some(instance) if instance.owner_id == expected_owner && !instance.is_affixed => {
                instance.owner_id = new_owner;
                instance.updated_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_trade(&mut self, trade: &NewTrade) -> Result<Trade, StoreError> {
        self.ensure_open()?;
        if self.faults.lock().insert_trade {
            return Err(self.abort(StoreError::Backend("injected insert_trade failure".to_string())));
        }

        if let Some(key) = &trade.idempotency_key {
            if self.staged.trades.values().any(|t| t.idempotency_key.as_ref() == Some(key)) {
                let err = StoreError::Conflict(format!("duplicate idempotency key {}", key));
                return Err(self.abort(err));
            }
        }

        self.staged.next_trade_id += 1;
        let row = Trade {
            trade_id: self.staged.next_trade_id,
            sender_id: trade.sender_id,
            receiver_id: trade.receiver_id,
            status: trade.status,
            idempotency_key: trade.idempotency_key.clone(),
            created_at: Utc::now(),
        };
        self.staged.trades.insert(row.trade_id, row.clone());
        Ok(row)
    }

    async fn insert_trade_lines(&mut self, lines: &[NewTradeLine]) -> Result<(), StoreError> {
        self.ensure_open()?;
        if self.faults.lock().insert_trade_lines {
            return Err(self.abort(StoreError::Backend("injected insert_trade_lines failure".to_string())));
        }

        for line in lines {
            if !self.staged.trades.contains_key(&line.trade_id) {
                let err = StoreError::Backend(format!("trade {} does not exist", line.trade_id));
                return Err(self.abort(err));
            }
            self.staged.next_line_id += 1;
            let line_id = self.staged.next_line_id;
            self.staged.lines.push(TradeLine {
                line_id,
                trade_id: line.trade_id,
                owner_before: line.owner_before,
                card_id: line.card_id,
                instance_id: line.instance_id,
                quantity: 1,
                transferred: true,
            });
        }
        Ok(())
    }

    async fn mark_lines_untransferred(
        &mut self,
        trade_id: TradeId,
        instance_ids: &[InstanceId],
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        let mut flagged = 0;
        for line in self.staged.lines.iter_mut() {
            if line.trade_id == trade_id && instance_ids.contains(&line.instance_id) {
                line.transferred = false;
                flagged += 1;
            }
        }

        if flagged != instance_ids.len() {
            let err = StoreError::Backend(format!(
                "flagged {} of {} trade lines of trade {}",
                flagged,
                instance_ids.len(),
                trade_id
            ));
            return Err(self.abort(err));
        }
        Ok(())
    }

    async fn find_trade_by_idempotency_key(&mut self, key: &str) -> Result<Option<TradeRecord>, StoreError> {
        self.ensure_open()?;
        Ok(self
            .staged
            .trades
            .values()
            .find(|t| t.idempotency_key.as_deref() == Some(key))
            .map(|t| self.staged.record(t)))
    }

    async fn has_affixed_copy(&mut self, owner: UserId, card_id: CardId) -> Result<bool, StoreError> {
        self.ensure_open()?;
        Ok(self
            .staged
            .instances
            .values()
            .any(|i| i.owner_id == owner && i.card_id == card_id && i.is_affixed))
    }

    async fn mark_affixed(&mut self, instance_id: InstanceId, owner: UserId) -> Result<bool, StoreError> {
        self.ensure_open()?;
        match self.staged.instances.get_mut(&instance_id) {
            Some(instance) if instance.owner_id == owner && !instance.is_affixed => {
                instance.is_affixed = true;
                instance.updated_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        // PostgreSQL answers COMMIT of an aborted transaction with ROLLBACK
        if !self.aborted {
            *self.guard = self.staged;
        }
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl InventoryStore for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, StoreError> {
        {
            let mut faults = self.faults.lock();
            if faults.begin_conflicts > 0 {
                faults.begin_conflicts -= 1;
                return Err(StoreError::Conflict("injected serialization failure".to_string()));
            }
        }

        let guard = self.inventory.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(MemoryTx {
            guard,
            staged,
            faults: self.faults.clone(),
            aborted: false,
        })
    }

    async fn list_instances_by_owner(&self, owner: UserId) -> Result<Vec<CardInstance>, StoreError> {
        let inventory = self.inventory.lock().await;
        Ok(inventory
            .instances
            .values()
            .filter(|i| i.owner_id == owner)
            .cloned()
            .collect())
    }

    async fn get_trade(&self, trade_id: TradeId) -> Result<Option<TradeRecord>, StoreError> {
        let inventory = self.inventory.lock().await;
        Ok(inventory.trades.get(&trade_id).map(|t| inventory.record(t)))
    }

    async fn list_trades_for_user(
        &self,
        user: UserId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Trade>, StoreError> {
        let inventory = self.inventory.lock().await;
        Ok(inventory
            .trades
            .values()
            .rev()
            .filter(|t| t.sender_id == user || t.receiver_id == user)
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn count_trades_for_user(&self, user: UserId) -> Result<i64, StoreError> {
        let inventory = self.inventory.lock().await;
        Ok(inventory
            .trades
            .values()
            .filter(|t| t.sender_id == user || t.receiver_id == user)
            .count() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::TradeStatus;

    #[tokio::test]
    async fn test_uncommitted_writes_are_discarded() {
        let store = MemoryStore::new();
        let alice = UserId::new_v4();
        let bob = UserId::new_v4();
        let id = store.add_instance(alice, 1, false).await;

        let mut tx = store.begin().await.unwrap();
        assert!(tx.update_instance_owner(id, alice, bob).await.unwrap());
        tx.rollback().await.unwrap();

        assert_eq!(store.instance(id).await.unwrap().owner_id, alice);
    }

    #[tokio::test]
    async fn test_commit_publishes_staged_writes() {
        let store = MemoryStore::new();
        let alice = UserId::new_v4();
        let bob = UserId::new_v4();
        let id = store.add_instance(alice, 1, false).await;

        let mut tx = store.begin().await.unwrap();
        let trade = tx
            .insert_trade(&NewTrade {
                sender_id: alice,
                receiver_id: bob,
                status: TradeStatus::Completed,
                idempotency_key: None,
            })
            .await
            .unwrap();
        assert!(tx.update_instance_owner(id, alice, bob).await.unwrap());
        tx.commit().await.unwrap();

        assert_eq!(store.instance(id).await.unwrap().owner_id, bob);
        assert!(store.get_trade(trade.trade_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_conditional_owner_update_checks_expected_owner() {
        let store = MemoryStore::new();
        let alice = UserId::new_v4();
        let bob = UserId::new_v4();
        let id = store.add_instance(alice, 1, false).await;

        let mut tx = store.begin().await.unwrap();
        assert!(!tx.update_instance_owner(id, bob, alice).await.unwrap());
        assert!(!tx.update_instance_owner(999, alice, bob).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_statement_aborts_unit_of_work() {
        let store = MemoryStore::new();
        let alice = UserId::new_v4();
        let bob = UserId::new_v4();
        let broken = store.add_instance(alice, 1, false).await;
        let healthy = store.add_instance(alice, 2, false).await;
        store.inject(FailPoint::OwnerUpdate(broken));

        let mut tx = store.begin().await.unwrap();
        assert!(tx.update_instance_owner(broken, alice, bob).await.is_err());
        assert!(tx.update_instance_owner(healthy, alice, bob).await.is_err());
        assert!(tx.get_instance(healthy).await.is_err());
        tx.commit().await.unwrap();

        assert_eq!(store.instance(healthy).await.unwrap().owner_id, alice);
    }

    #[tokio::test]
    async fn test_moved_instance_matches_zero_rows() {
        let store = MemoryStore::new();
        let alice = UserId::new_v4();
        let bob = UserId::new_v4();
        let moved = store.add_instance(alice, 1, false).await;
        let other = store.add_instance(alice, 2, false).await;
        store.inject(FailPoint::OwnerMoved(moved));

        let mut tx = store.begin().await.unwrap();
        assert!(!tx.update_instance_owner(moved, alice, bob).await.unwrap());
        assert!(tx.update_instance_owner(other, alice, bob).await.unwrap());
        tx.commit().await.unwrap();

        assert_eq!(store.instance(moved).await.unwrap().owner_id, alice);
        assert_eq!(store.instance(other).await.unwrap().owner_id, bob);
    }

    #[tokio::test]
    async fn test_injected_begin_conflicts_are_consumed() {
        let store = MemoryStore::new();
        store.inject(FailPoint::BeginConflicts(1));

        assert!(matches!(store.begin().await, Err(StoreError::Conflict(_))));
        assert!(store.begin().await.is_ok());
    }
}
