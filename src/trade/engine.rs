//! Trade Settlement Engine
//!
//! Settlement order inside one unit of work:
//! 1. validate both offers (rows read here stay locked until commit)
//! 2. insert the trade header
//! 3. insert one audit line per instance
//! 4. reassign ownership, sender's instances first
//!
//! Ownership is the value-bearing write, so it only runs once everything
//! before it succeeded. A store conflict restarts the whole unit of work.

use super::validation::validate_offer;
use super::{check_offer, OfferSide, Settlement, SettlementConfig, SettlementMode, TradeError, TradeProposal};
use crate::db::{CardInstance, NewTrade, NewTradeLine, TradeRecord, TradeStatus};
use crate::store::{InventoryStore, InventoryTx};
use crate::types::{InstanceId, UserId};
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct SettlementEngine<S: InventoryStore> {
    store: Arc<S>,
    config: SettlementConfig,
}

impl<S: InventoryStore> SettlementEngine<S> {
    pub fn new(store: Arc<S>, config: SettlementConfig) -> Self {
        info!(
            "SettlementEngine initialized: mode={:?}, max_offer_size={}, max_conflict_retries={}",
            config.mode, config.max_offer_size, config.max_conflict_retries
        );
        Self { store, config }
    }

    /// Dry-run validation of one user's offer. Nothing is written.
    pub async fn validate_offer(
        &self,
        side: OfferSide,
        user_id: UserId,
        instance_ids: &[InstanceId],
    ) -> Result<Vec<CardInstance>, TradeError> {
        check_offer(side, instance_ids, self.config.max_offer_size)?;

        let mut tx = self.store.begin().await?;
        let result = validate_offer(&mut tx, side, user_id, instance_ids).await;
        if let Err(e) = tx.rollback().await {
            warn!("Rollback after dry-run validation failed: {}", e);
        }
        result
    }

    /// Validate and settle a proposal as one unit of work
    pub async fn settle(&self, proposal: &TradeProposal) -> Result<Settlement, TradeError> {
        if let Err(e) = proposal.check_shape(self.config.max_offer_size) {
            warn!("Trade proposal {} -> {} rejected: {}", proposal.sender_id, proposal.receiver_id, e);
            return Err(e);
        }

        let mut attempt: u32 = 0;
        loop {
            match self.settle_once(proposal).await {
                Err(TradeError::Persistence(e)) if e.is_retryable() && attempt < self.config.max_conflict_retries => {
                    attempt += 1;
                    warn!(
                        "Settlement conflict for {} -> {} (attempt {}/{}): {}",
                        proposal.sender_id,
                        proposal.receiver_id,
                        attempt,
                        self.config.max_conflict_retries,
                        e
                    );
                }
                Err(e @ TradeError::Persistence(_)) => {
                    error!("Trade {} -> {} failed to persist: {:?}", proposal.sender_id, proposal.receiver_id, e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("Trade {} -> {} rejected: {}", proposal.sender_id, proposal.receiver_id, e);
                    return Err(e);
                }
                Ok(settlement) => return Ok(settlement),
            }
        }
    }

    async fn settle_once(&self, proposal: &TradeProposal) -> Result<Settlement, TradeError> {
        let mut tx = self.store.begin().await?;

        match self.apply(&mut tx, proposal).await {
            Ok(settlement) => {
                tx.commit().await?;
                if settlement.replayed {
                    info!("Trade {} replayed for idempotency key", settlement.trade_id);
                } else if settlement.is_partial() {
                    warn!(
                        "Trade {} settled partially: {}/{} instances transferred, failed: {:?}",
                        settlement.trade_id,
                        settlement.instances_transferred_count,
                        proposal.total_instances(),
                        settlement.failed_instance_ids
                    );
                } else {
                    info!(
                        "Trade {} settled: {} -> {}, {} instances transferred",
                        settlement.trade_id,
                        proposal.sender_id,
                        proposal.receiver_id,
                        settlement.instances_transferred_count
                    );
                }
                Ok(settlement)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!("Rollback failed: {}", rb);
                }
                Err(e)
            }
        }
    }

    async fn apply(&self, tx: &mut S::Tx, proposal: &TradeProposal) -> Result<Settlement, TradeError> {
        if let Some(key) = &proposal.idempotency_key {
            if let Some(record) = tx.find_trade_by_idempotency_key(key).await? {
                return replay(record, proposal);
            }
        }

        let sender_offer = validate_offer(tx, OfferSide::Sender, proposal.sender_id, &proposal.offer_from_sender).await?;
        let receiver_offer =
            validate_offer(tx, OfferSide::Receiver, proposal.receiver_id, &proposal.offer_from_receiver).await?;

        let trade = tx
            .insert_trade(&NewTrade {
                sender_id: proposal.sender_id,
                receiver_id: proposal.receiver_id,
                status: TradeStatus::Completed,
                idempotency_key: proposal.idempotency_key.clone(),
            })
            .await?;

        let lines: Vec<NewTradeLine> = sender_offer
            .iter()
            .chain(receiver_offer.iter())
            .map(|instance| NewTradeLine::for_instance(trade.trade_id, instance))
            .collect();
        tx.insert_trade_lines(&lines).await?;

        let mut transferred = 0;
        let mut failed = Vec::new();
        let transfers = sender_offer
            .iter()
            .map(|i| (i.instance_id, proposal.sender_id, proposal.receiver_id))
            .chain(
                receiver_offer
                    .iter()
                    .map(|i| (i.instance_id, proposal.receiver_id, proposal.sender_id)),
            );

        // A store error aborts the unit of work in either mode; only a
        // zero-row conditional update can be skipped.
        for (instance_id, from, to) in transfers {
            if tx.update_instance_owner(instance_id, from, to).await? {
                transferred += 1;
                continue;
            }
            match self.config.mode {
                SettlementMode::Transactional => return Err(TradeError::TransferFailed { instance_id }),
                SettlementMode::BestEffort => {
                    error!(
                        "Trade {}: instance {} no longer owned by {}, not transferred",
                        trade.trade_id, instance_id, from
                    );
                    failed.push(instance_id);
                }
            }
        }

        if !failed.is_empty() {
            tx.mark_lines_untransferred(trade.trade_id, &failed).await?;
        }

        Ok(Settlement {
            trade_id: trade.trade_id,
            instances_transferred_count: transferred,
            failed_instance_ids: failed,
            replayed: false,
        })
    }
}

fn replay(record: TradeRecord, proposal: &TradeProposal) -> Result<Settlement, TradeError> {
    let trade = &record.trade;
    if trade.sender_id != proposal.sender_id || trade.receiver_id != proposal.receiver_id {
        return Err(TradeError::IdempotencyConflict);
    }

    let given_by = |owner: UserId| {
        let mut ids: Vec<InstanceId> = record
            .lines
            .iter()
            .filter(|l| l.owner_before == owner)
            .map(|l| l.instance_id)
            .collect();
        ids.sort_unstable();
        ids
    };
    let sorted = |ids: &[InstanceId]| {
        let mut ids = ids.to_vec();
        ids.sort_unstable();
        ids
    };
    if given_by(trade.sender_id) != sorted(&proposal.offer_from_sender)
        || given_by(trade.receiver_id) != sorted(&proposal.offer_from_receiver)
    {
        return Err(TradeError::IdempotencyConflict);
    }

    Ok(Settlement {
        trade_id: trade.trade_id,
        instances_transferred_count: record.lines.iter().filter(|l| l.transferred).count(),
        failed_instance_ids: record
            .lines
            .iter()
            .filter(|l| !l.transferred)
            .map(|l| l.instance_id)
            .collect(),
        replayed: true,
    })
}
