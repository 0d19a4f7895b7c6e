//! Cromos direct trade backend
//!
//! Users own individual card instances. A direct trade swaps explicit sets
//! of instances between two users, all-or-nothing, and leaves an audit trail
//! of one trade header plus one line per moved instance.

pub mod api;
pub mod config;
pub mod db;
pub mod inventory;
pub mod store;
pub mod trade;
pub mod types;

use crate::store::InventoryStore;
use crate::trade::SettlementEngine;
use std::sync::Arc;

/// Application state shared across all handlers
pub struct AppState<S: InventoryStore> {
    pub store: Arc<S>,
    pub engine: SettlementEngine<S>,
}

impl<S: InventoryStore> AppState<S> {
    pub fn new(store: Arc<S>, settlement: trade::SettlementConfig) -> Self {
        let engine = SettlementEngine::new(store.clone(), settlement);
        Self { store, engine }
    }
}
