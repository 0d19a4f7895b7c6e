//! Offer validation
//!
//! An offer is valid only if every listed instance exists, belongs to the
//! offering user and is not affixed. One bad entry fails the whole offer.

use super::{OfferSide, RejectReason, TradeError};
use crate::db::CardInstance;
use crate::store::InventoryTx;
use crate::types::{InstanceId, UserId};
use tracing::debug;

/// Check one fetched row against the offering user
pub fn check_instance(instance: Option<&CardInstance>, user_id: UserId) -> Result<&CardInstance, RejectReason> {
    let instance = instance.ok_or(RejectReason::NotFound)?;
    if instance.owner_id != user_id {
        return Err(RejectReason::NotOwned);
    }
    if instance.is_affixed {
        return Err(RejectReason::Affixed);
    }
    Ok(instance)
}

/// Fetch and check every instance `user_id` offers, inside `tx`.
///
/// Returns the rows in offer order so the caller can stamp audit lines from
/// the same snapshot it validated.
pub async fn validate_offer<T: InventoryTx>(
    tx: &mut T,
    side: OfferSide,
    user_id: UserId,
    instance_ids: &[InstanceId],
) -> Result<Vec<CardInstance>, TradeError> {
    let mut instances = Vec::with_capacity(instance_ids.len());

    for &instance_id in instance_ids {
        let row = tx.get_instance(instance_id).await?;
        match check_instance(row.as_ref(), user_id) {
            Ok(instance) => instances.push(instance.clone()),
            Err(reason) => {
                return Err(TradeError::InvalidOffer {
                    side,
                    instance_id,
                    reason,
                })
            }
        }
    }

    debug!("{} offer of {} instance(s) from {} is valid", side, instances.len(), user_id);
    Ok(instances)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::InventoryStore;

    fn instance(owner: UserId, is_affixed: bool) -> CardInstance {
        CardInstance {
            instance_id: 1,
            owner_id: owner,
            card_id: 7,
            is_affixed,
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn test_check_instance_rules() {
        let owner = UserId::new_v4();
        let other = UserId::new_v4();

        assert_eq!(check_instance(None, owner), Err(RejectReason::NotFound));
        assert_eq!(check_instance(Some(&instance(other, false)), owner), Err(RejectReason::NotOwned));
        assert_eq!(check_instance(Some(&instance(owner, true)), owner), Err(RejectReason::Affixed));
        assert!(check_instance(Some(&instance(owner, false)), owner).is_ok());
    }

    #[test]
    fn test_foreign_affixed_copy_reports_not_owned() {
        let owner = UserId::new_v4();
        let other = UserId::new_v4();
        assert_eq!(check_instance(Some(&instance(other, true)), owner), Err(RejectReason::NotOwned));
    }

    #[tokio::test]
    async fn test_validate_offer_returns_rows_in_order() {
        let store = MemoryStore::new();
        let owner = UserId::new_v4();
        let a = store.add_instance(owner, 3, false).await;
        let b = store.add_instance(owner, 4, false).await;

        let mut tx = store.begin().await.unwrap();
        let rows = validate_offer(&mut tx, OfferSide::Sender, owner, &[b, a]).await.unwrap();
        let ids: Vec<InstanceId> = rows.iter().map(|r| r.instance_id).collect();
        assert_eq!(ids, vec![b, a]);
    }

    #[tokio::test]
    async fn test_single_bad_entry_fails_whole_offer() {
        let store = MemoryStore::new();
        let owner = UserId::new_v4();
        let stranger = UserId::new_v4();
        let good = store.add_instance(owner, 3, false).await;
        let foreign = store.add_instance(stranger, 3, false).await;

        let mut tx = store.begin().await.unwrap();
        let err = validate_offer(&mut tx, OfferSide::Receiver, owner, &[good, foreign])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TradeError::InvalidOffer {
                side: OfferSide::Receiver,
                reason: RejectReason::NotOwned,
                ..
            }
        ));
    }
}
