//! Database models matching the PostgreSQL schema in `migrations/`

use crate::types::{CardId, InstanceId, TradeId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// One owned copy of a card
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardInstance {
    pub instance_id: InstanceId,
    pub owner_id: UserId,
    pub card_id: CardId,
    /// Placed in the owner's album. Affixed copies are never tradeable.
    pub is_affixed: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for CardInstance {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            instance_id: row.try_get("instance_id")?,
            owner_id: row.try_get("owner_id")?,
            card_id: row.try_get("card_id")?,
            is_affixed: row.try_get("is_affixed")?,
            created_at: row.try_get("created_at").ok(),
            updated_at: row.try_get("updated_at").ok(),
        })
    }
}

/// Terminal trade status. Nothing partial is ever persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Completed,
    Accepted,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Completed => "completed",
            TradeStatus::Accepted => "accepted",
        }
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown trade status: {0}")]
pub struct UnknownTradeStatus(pub String);

impl FromStr for TradeStatus {
    type Err = UnknownTradeStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(TradeStatus::Completed),
            "accepted" => Ok(TradeStatus::Accepted),
            other => Err(UnknownTradeStatus(other.to_string())),
        }
    }
}

/// Settled trade header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: TradeId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub status: TradeStatus,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for Trade {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let status: TradeStatus = status.parse().map_err(|e: UnknownTradeStatus| sqlx::Error::ColumnDecode {
            index: "status".to_string(),
            source: Box::new(e),
        })?;

        Ok(Self {
            trade_id: row.try_get("trade_id")?,
            sender_id: row.try_get("sender_id")?,
            receiver_id: row.try_get("receiver_id")?,
            status,
            idempotency_key: row.try_get::<Option<String>, _>("idempotency_key")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Audit line, one per transferred instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeLine {
    pub line_id: i64,
    pub trade_id: TradeId,
    /// Who gave the instance up
    pub owner_before: UserId,
    pub card_id: CardId,
    pub instance_id: InstanceId,
    pub quantity: i32,
    /// False when a best-effort settlement could not move this instance
    pub transferred: bool,
}

impl<'r> FromRow<'r, PgRow> for TradeLine {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            line_id: row.try_get("line_id")?,
            trade_id: row.try_get("trade_id")?,
            owner_before: row.try_get("owner_before")?,
            card_id: row.try_get("card_id")?,
            instance_id: row.try_get("instance_id")?,
            quantity: row.try_get("quantity").unwrap_or(1),
            transferred: row.try_get("transferred")?,
        })
    }
}

/// New trade to insert
#[derive(Debug, Clone)]
pub struct NewTrade {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub status: TradeStatus,
    pub idempotency_key: Option<String>,
}

/// New trade line to insert. Quantity is always 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTradeLine {
    pub trade_id: TradeId,
    pub owner_before: UserId,
    pub card_id: CardId,
    pub instance_id: InstanceId,
}

impl NewTradeLine {
    pub fn for_instance(trade_id: TradeId, instance: &CardInstance) -> Self {
        Self {
            trade_id,
            owner_before: instance.owner_id,
            card_id: instance.card_id,
            instance_id: instance.instance_id,
        }
    }
}

/// Trade header with its audit lines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeRecord {
    #[serde(flatten)]
    pub trade: Trade,
    pub lines: Vec<TradeLine>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trade_status_round_trips_through_text() {
        assert_eq!("completed".parse::<TradeStatus>().unwrap(), TradeStatus::Completed);
        assert_eq!("accepted".parse::<TradeStatus>().unwrap(), TradeStatus::Accepted);
        assert_eq!(TradeStatus::Completed.to_string(), "completed");
    }

    #[test]
    fn test_unknown_trade_status_is_rejected() {
        let err = "pending".parse::<TradeStatus>().unwrap_err();
        assert_eq!(err.to_string(), "unknown trade status: pending");
    }

    #[test]
    fn test_trade_line_copies_previous_owner() {
        let owner = UserId::new_v4();
        let instance = CardInstance {
            instance_id: 9,
            owner_id: owner,
            card_id: 7,
            is_affixed: false,
            created_at: None,
            updated_at: None,
        };
        let line = NewTradeLine::for_instance(3, &instance);
        assert_eq!(line.trade_id, 3);
        assert_eq!(line.owner_before, owner);
        assert_eq!(line.card_id, 7);
        assert_eq!(line.instance_id, 9);
    }
}
