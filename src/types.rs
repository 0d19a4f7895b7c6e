//! Shared identifier types

use uuid::Uuid;

/// Hosted-backend user identity
pub type UserId = Uuid;

/// One physical copy of a card (inventory row key)
pub type InstanceId = i64;

/// Card design within a collection
pub type CardId = i64;

pub type TradeId = i64;
