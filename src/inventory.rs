//! Album and duplicate bookkeeping
//!
//! A card's duplicates are the owner's unaffixed copies of a card that
//! already has an affixed copy in the owner's album.

use crate::db::CardInstance;
use crate::store::{InventoryStore, InventoryTx, StoreError};
use crate::types::{CardId, InstanceId, UserId};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateGroup {
    pub card_id: CardId,
    pub count: usize,
    /// Tradeable copies
    pub spare_instance_ids: Vec<InstanceId>,
}

/// Group `instances` by card and keep the groups that have spares
pub fn find_duplicates(instances: &[CardInstance]) -> Vec<DuplicateGroup> {
    let mut by_card: BTreeMap<CardId, (bool, Vec<InstanceId>)> = BTreeMap::new();
    for instance in instances {
        let entry = by_card.entry(instance.card_id).or_default();
        if instance.is_affixed {
            entry.0 = true;
        } else {
            entry.1.push(instance.instance_id);
        }
    }

    by_card
        .into_iter()
        .filter(|(_, (has_affixed, spares))| *has_affixed && !spares.is_empty())
        .map(|(card_id, (_, mut spares))| {
            spares.sort_unstable();
            DuplicateGroup {
                card_id,
                count: spares.len(),
                spare_instance_ids: spares,
            }
        })
        .collect()
}

#[derive(Error, Debug)]
pub enum AffixError {
    #[error("Instance {0} not found")]
    NotFound(InstanceId),
    #[error("Instance {0} is not owned by the requesting user")]
    NotOwned(InstanceId),
    #[error("Instance {0} is already affixed")]
    AlreadyAffixed(InstanceId),
    #[error("Card {card_id} is already in the album")]
    AlreadyInAlbum { card_id: CardId },
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),
}

impl AffixError {
    pub fn code(&self) -> &'static str {
        match self {
            AffixError::NotFound(_) => "NOT_FOUND",
            AffixError::NotOwned(_) => "NOT_OWNED",
            AffixError::AlreadyAffixed(_) => "ALREADY_AFFIXED",
            AffixError::AlreadyInAlbum { .. } => "ALREADY_IN_ALBUM",
            AffixError::Persistence(_) => "PERSISTENCE_ERROR",
        }
    }
}

/// Place one of `owner`'s copies into their album
pub async fn affix_instance<S: InventoryStore>(
    store: &S,
    owner: UserId,
    instance_id: InstanceId,
) -> Result<CardInstance, AffixError> {
    let mut tx = store.begin().await?;

    match affix_in(&mut tx, owner, instance_id).await {
        Ok(instance) => {
            tx.commit().await?;
            info!("Instance {} (card {}) affixed by {}", instance_id, instance.card_id, owner);
            Ok(instance)
        }
        Err(e) => {
            if let Err(rb) = tx.rollback().await {
                warn!("Rollback failed: {}", rb);
            }
            Err(e)
        }
    }
}

async fn affix_in<T: InventoryTx>(tx: &mut T, owner: UserId, instance_id: InstanceId) -> Result<CardInstance, AffixError> {
    let mut instance = tx.get_instance(instance_id).await?.ok_or(AffixError::NotFound(instance_id))?;
    if instance.owner_id != owner {
        return Err(AffixError::NotOwned(instance_id));
    }
    if instance.is_affixed {
        return Err(AffixError::AlreadyAffixed(instance_id));
    }
    if tx.has_affixed_copy(owner, instance.card_id).await? {
        return Err(AffixError::AlreadyInAlbum { card_id: instance.card_id });
    }
    if !tx.mark_affixed(instance_id, owner).await? {
        return Err(AffixError::AlreadyAffixed(instance_id));
    }

    instance.is_affixed = true;
    Ok(instance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use pretty_assertions::assert_eq;

    fn row(instance_id: InstanceId, card_id: CardId, is_affixed: bool) -> CardInstance {
        CardInstance {
            instance_id,
            owner_id: UserId::nil(),
            card_id,
            is_affixed,
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn test_find_duplicates_requires_an_affixed_copy() {
        let instances = vec![
            row(1, 7, true),
            row(2, 7, false),
            row(3, 7, false),
            // not in the album yet, so not a duplicate
            row(4, 3, false),
            row(5, 3, false),
            // album only
            row(6, 9, true),
        ];

        assert_eq!(
            find_duplicates(&instances),
            vec![DuplicateGroup {
                card_id: 7,
                count: 2,
                spare_instance_ids: vec![2, 3],
            }]
        );
    }

    #[test]
    fn test_find_duplicates_orders_by_card() {
        let instances = vec![row(10, 5, false), row(11, 2, true), row(12, 5, true), row(13, 2, false)];
        let cards: Vec<CardId> = find_duplicates(&instances).iter().map(|g| g.card_id).collect();
        assert_eq!(cards, vec![2, 5]);
    }

    #[test]
    fn test_find_duplicates_empty_inventory() {
        assert!(find_duplicates(&[]).is_empty());
    }

    #[tokio::test]
    async fn test_affix_first_copy() {
        let store = MemoryStore::new();
        let owner = UserId::new_v4();
        let id = store.add_instance(owner, 7, false).await;

        let affixed = affix_instance(&store, owner, id).await.unwrap();

        assert!(affixed.is_affixed);
        assert!(store.instance(id).await.unwrap().is_affixed);
    }

    #[tokio::test]
    async fn test_affix_rejects_second_copy_of_same_card() {
        let store = MemoryStore::new();
        let owner = UserId::new_v4();
        store.add_instance(owner, 7, true).await;
        let spare = store.add_instance(owner, 7, false).await;

        let err = affix_instance(&store, owner, spare).await.unwrap_err();

        assert!(matches!(err, AffixError::AlreadyInAlbum { card_id: 7 }));
        assert!(!store.instance(spare).await.unwrap().is_affixed);
    }

    #[tokio::test]
    async fn test_affix_rejects_foreign_and_missing_instances() {
        let store = MemoryStore::new();
        let owner = UserId::new_v4();
        let id = store.add_instance(owner, 7, false).await;

        let err = affix_instance(&store, UserId::new_v4(), id).await.unwrap_err();
        assert_eq!(err.code(), "NOT_OWNED");

        let err = affix_instance(&store, owner, 404).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
