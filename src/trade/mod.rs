//! Direct trade settlement
//!
//! A proposal names two users and the exact card instances each one gives
//! up. Settlement validates both offers and moves ownership of every listed
//! instance inside one unit of work, writing a trade header and one audit
//! line per instance.

mod engine;
mod validation;

pub use engine::SettlementEngine;
pub use validation::{check_instance, validate_offer};

use crate::store::StoreError;
use crate::types::{InstanceId, TradeId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_MAX_OFFER_SIZE: usize = 5;
pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 3;
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfferSide {
    Sender,
    Receiver,
}

impl fmt::Display for OfferSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OfferSide::Sender => f.write_str("sender"),
            OfferSide::Receiver => f.write_str("receiver"),
        }
    }
}

/// Why a single offered instance was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    NotFound,
    NotOwned,
    Affixed,
    ListedTwice,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RejectReason::NotFound => "not found",
            RejectReason::NotOwned => "not owned by offering user",
            RejectReason::Affixed => "already affixed",
            RejectReason::ListedTwice => "listed twice",
        };
        f.write_str(text)
    }
}

#[derive(Error, Debug)]
pub enum TradeError {
    #[error("{side} offer is empty")]
    EmptyOffer { side: OfferSide },
    #[error("{side} offer rejected: instance {instance_id} {reason}")]
    InvalidOffer {
        side: OfferSide,
        instance_id: InstanceId,
        reason: RejectReason,
    },
    #[error("sender and receiver must be different users")]
    SelfTrade,
    #[error("{side} offer has {count} instances, at most {max} allowed")]
    OfferTooLarge { side: OfferSide, count: usize, max: usize },
    #[error("idempotency key must be 1-{max} characters")]
    InvalidIdempotencyKey { max: usize },
    #[error("idempotency key already used for a different trade")]
    IdempotencyConflict,
    #[error("ownership transfer failed for instance {instance_id}")]
    TransferFailed { instance_id: InstanceId },
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),
}

impl TradeError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            TradeError::EmptyOffer { .. } => "EMPTY_OFFER",
            TradeError::InvalidOffer { .. } => "INVALID_OFFER",
            TradeError::SelfTrade => "SELF_TRADE",
            TradeError::OfferTooLarge { .. } => "OFFER_TOO_LARGE",
            TradeError::InvalidIdempotencyKey { .. } => "MALFORMED_REQUEST",
            TradeError::IdempotencyConflict => "IDEMPOTENCY_CONFLICT",
            TradeError::TransferFailed { .. } => "TRANSFER_FAILED",
            TradeError::Persistence(_) => "PERSISTENCE_ERROR",
        }
    }
}

/// How ownership updates that fail after validation are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementMode {
    /// Any failed update aborts and rolls back the whole trade
    #[default]
    Transactional,
    /// Failed updates are logged and skipped; the trade still commits
    BestEffort,
}

#[derive(Debug, Error)]
#[error("unknown settlement mode '{0}' (expected transactional or best_effort)")]
pub struct UnknownSettlementMode(String);

impl FromStr for SettlementMode {
    type Err = UnknownSettlementMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "transactional" => Ok(SettlementMode::Transactional),
            "best_effort" => Ok(SettlementMode::BestEffort),
            _ => Err(UnknownSettlementMode(s.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub mode: SettlementMode,
    /// Upper bound on instances per side
    pub max_offer_size: usize,
    /// Extra attempts after a store conflict
    pub max_conflict_retries: u32,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            mode: SettlementMode::Transactional,
            max_offer_size: DEFAULT_MAX_OFFER_SIZE,
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
        }
    }
}

/// Proposed direct exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TradeProposal {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub offer_from_sender: Vec<InstanceId>,
    pub offer_from_receiver: Vec<InstanceId>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl TradeProposal {
    /// Checks that need no store access
    pub fn check_shape(&self, max_offer_size: usize) -> Result<(), TradeError> {
        if self.offer_from_sender.is_empty() {
            return Err(TradeError::EmptyOffer { side: OfferSide::Sender });
        }
        if self.offer_from_receiver.is_empty() {
            return Err(TradeError::EmptyOffer { side: OfferSide::Receiver });
        }
        if self.sender_id == self.receiver_id {
            return Err(TradeError::SelfTrade);
        }

        for (side, offer) in self.sides() {
            check_offer(side, offer, max_offer_size)?;
        }

        if let Some(key) = &self.idempotency_key {
            if key.trim().is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
                return Err(TradeError::InvalidIdempotencyKey { max: MAX_IDEMPOTENCY_KEY_LEN });
            }
        }

        // The same copy may not appear on both sides
        let mut seen = HashSet::new();
        for (side, offer) in self.sides() {
            for &instance_id in offer {
                if !seen.insert(instance_id) {
                    return Err(TradeError::InvalidOffer {
                        side,
                        instance_id,
                        reason: RejectReason::ListedTwice,
                    });
                }
            }
        }

        Ok(())
    }

    pub fn total_instances(&self) -> usize {
        self.offer_from_sender.len() + self.offer_from_receiver.len()
    }

    fn sides(&self) -> [(OfferSide, &[InstanceId]); 2] {
        [
            (OfferSide::Sender, self.offer_from_sender.as_slice()),
            (OfferSide::Receiver, self.offer_from_receiver.as_slice()),
        ]
    }
}

/// Checks on one side's offer that need no store access
pub fn check_offer(side: OfferSide, offer: &[InstanceId], max_offer_size: usize) -> Result<(), TradeError> {
    if offer.is_empty() {
        return Err(TradeError::EmptyOffer { side });
    }
    if offer.len() > max_offer_size {
        return Err(TradeError::OfferTooLarge {
            side,
            count: offer.len(),
            max: max_offer_size,
        });
    }

    let mut seen = HashSet::new();
    for &instance_id in offer {
        if !seen.insert(instance_id) {
            return Err(TradeError::InvalidOffer {
                side,
                instance_id,
                reason: RejectReason::ListedTwice,
            });
        }
    }
    Ok(())
}

/// Outcome of a settled trade
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Settlement {
    pub trade_id: TradeId,
    pub instances_transferred_count: usize,
    /// Instances whose ownership update failed (best-effort mode only)
    pub failed_instance_ids: Vec<InstanceId>,
    /// Returned from an earlier settlement with the same idempotency key
    pub replayed: bool,
}

impl Settlement {
    pub fn is_partial(&self) -> bool {
        !self.failed_instance_ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal(sender: Vec<InstanceId>, receiver: Vec<InstanceId>) -> TradeProposal {
        TradeProposal {
            sender_id: UserId::new_v4(),
            receiver_id: UserId::new_v4(),
            offer_from_sender: sender,
            offer_from_receiver: receiver,
            idempotency_key: None,
        }
    }

    #[test]
    fn test_empty_sender_offer_is_rejected() {
        let err = proposal(vec![], vec![5]).check_shape(5).unwrap_err();
        assert!(matches!(err, TradeError::EmptyOffer { side: OfferSide::Sender }));
        assert_eq!(err.code(), "EMPTY_OFFER");
    }

    #[test]
    fn test_empty_receiver_offer_is_rejected() {
        let err = proposal(vec![1], vec![]).check_shape(5).unwrap_err();
        assert!(matches!(err, TradeError::EmptyOffer { side: OfferSide::Receiver }));
    }

    #[test]
    fn test_self_trade_is_rejected() {
        let mut p = proposal(vec![1], vec![2]);
        p.receiver_id = p.sender_id;
        assert!(matches!(p.check_shape(5), Err(TradeError::SelfTrade)));
    }

    #[test]
    fn test_offer_size_cap() {
        let p = proposal(vec![1, 2, 3], vec![4]);
        assert!(p.check_shape(3).is_ok());
        let err = p.check_shape(2).unwrap_err();
        assert!(matches!(
            err,
            TradeError::OfferTooLarge { side: OfferSide::Sender, count: 3, max: 2 }
        ));
    }

    #[test]
    fn test_instance_listed_twice_across_sides() {
        let err = proposal(vec![1, 2], vec![2]).check_shape(5).unwrap_err();
        assert!(matches!(
            err,
            TradeError::InvalidOffer {
                side: OfferSide::Receiver,
                instance_id: 2,
                reason: RejectReason::ListedTwice
            }
        ));
    }

    #[test]
    fn test_instance_listed_twice_within_one_side() {
        let err = check_offer(OfferSide::Sender, &[4, 9, 4], 5).unwrap_err();
        assert!(matches!(
            err,
            TradeError::InvalidOffer {
                side: OfferSide::Sender,
                instance_id: 4,
                reason: RejectReason::ListedTwice
            }
        ));
    }

    #[test]
    fn test_blank_idempotency_key_is_malformed() {
        let mut p = proposal(vec![1], vec![2]);
        p.idempotency_key = Some("  ".to_string());
        let err = p.check_shape(5).unwrap_err();
        assert_eq!(err.code(), "MALFORMED_REQUEST");
    }

    #[test]
    fn test_settlement_mode_parsing() {
        assert_eq!("transactional".parse::<SettlementMode>().unwrap(), SettlementMode::Transactional);
        assert_eq!("best-effort".parse::<SettlementMode>().unwrap(), SettlementMode::BestEffort);
        assert_eq!("BEST_EFFORT".parse::<SettlementMode>().unwrap(), SettlementMode::BestEffort);
        assert!("eventual".parse::<SettlementMode>().is_err());
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let body = serde_json::json!({
            "sender_id": UserId::new_v4(),
            "receiver_id": UserId::new_v4(),
            "offer_from_sender": [1],
            "offer_from_receiver": [2],
            "cantidad": 3
        });
        assert!(serde_json::from_value::<TradeProposal>(body).is_err());
    }
}
