//! API request handlers
//!
//! Every failure carries a stable `code` next to the human-readable `error`,
//! and never comes back with a 200 status.

use crate::inventory::{self, AffixError};
use crate::store::{InventoryStore, StoreError};
use crate::trade::{OfferSide, TradeError, TradeProposal};
use crate::types::{InstanceId, TradeId, UserId};
use crate::AppState;
use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::error;

const MAX_PAGE_SIZE: i64 = 100;

// ==========================================
// Response Helpers
// ==========================================

fn failure(status: StatusCode, code: &str, error: &str) -> Response {
    (
        status,
        Json(serde_json::json!({
            "ok": false,
            "code": code,
            "error": error
        })),
    )
        .into_response()
}

pub fn bad_request(code: &str, error: &str) -> Response {
    failure(StatusCode::BAD_REQUEST, code, error)
}

fn malformed(error: &str) -> Response {
    bad_request("MALFORMED_REQUEST", error)
}

/// 500 with a generic message; the full error only goes to the log
pub fn persistence_error(err: &StoreError) -> Response {
    error!("Store failure: {:?}", err);

    let detail = match err {
        StoreError::Conflict(_) => "concurrent update conflict, query history before retrying",
        StoreError::Backend(_) => "inventory store rejected the operation",
        StoreError::InvalidData(_) => "stored data could not be read",
    };

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({
            "ok": false,
            "code": "PERSISTENCE_ERROR",
            "error": "Persistence error",
            "detail": detail
        })),
    )
        .into_response()
}

fn trade_error_response(err: &TradeError) -> Response {
    match err {
        TradeError::Persistence(e) => persistence_error(e),
        TradeError::InvalidOffer {
            side,
            instance_id,
            reason,
        } => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "ok": false,
                "code": err.code(),
                "error": err.to_string(),
                "side": side,
                "instance_id": instance_id,
                "reason": reason
            })),
        )
            .into_response(),
        TradeError::IdempotencyConflict | TradeError::TransferFailed { .. } => {
            failure(StatusCode::CONFLICT, err.code(), &err.to_string())
        }
        _ => bad_request(err.code(), &err.to_string()),
    }
}

// ==========================================
// Request Types
// ==========================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidateOfferRequest {
    pub user_id: UserId,
    pub instance_ids: Vec<InstanceId>,
    #[serde(default = "default_side")]
    pub side: OfferSide,
}

fn default_side() -> OfferSide {
    OfferSide::Sender
}

#[derive(Debug, Deserialize)]
pub struct TradesQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    20
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AffixRequest {
    pub user_id: UserId,
}

// ==========================================
// Health
// ==========================================

pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "cromos_trade",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

// ==========================================
// Trade Handlers
// ==========================================

pub async fn settle_trade<S: InventoryStore>(
    State(state): State<Arc<AppState<S>>>,
    payload: Result<Json<TradeProposal>, JsonRejection>,
) -> Response {
    let Json(proposal) = match payload {
        Ok(p) => p,
        Err(rejection) => return malformed(&rejection.body_text()),
    };

    match state.engine.settle(&proposal).await {
        Ok(settlement) => Json(serde_json::json!({
            "ok": true,
            "trade_id": settlement.trade_id,
            "instances_transferred_count": settlement.instances_transferred_count,
            "partial": settlement.is_partial(),
            "failed_instance_ids": settlement.failed_instance_ids,
            "replayed": settlement.replayed
        }))
        .into_response(),
        Err(e) => trade_error_response(&e),
    }
}

pub async fn validate_offer<S: InventoryStore>(
    State(state): State<Arc<AppState<S>>>,
    payload: Result<Json<ValidateOfferRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(p) => p,
        Err(rejection) => return malformed(&rejection.body_text()),
    };

    match state
        .engine
        .validate_offer(request.side, request.user_id, &request.instance_ids)
        .await
    {
        Ok(instances) => Json(serde_json::json!({
            "ok": true,
            "valid": true,
            "instances": instances
        }))
        .into_response(),
        Err(e) => trade_error_response(&e),
    }
}

pub async fn get_trade<S: InventoryStore>(
    State(state): State<Arc<AppState<S>>>,
    trade_id: Result<Path<TradeId>, PathRejection>,
) -> Response {
    let Path(trade_id) = match trade_id {
        Ok(p) => p,
        Err(rejection) => return malformed(&rejection.body_text()),
    };

    match state.store.get_trade(trade_id).await {
        Ok(Some(record)) => Json(serde_json::json!({
            "ok": true,
            "data": record
        }))
        .into_response(),
        Ok(None) => failure(StatusCode::NOT_FOUND, "NOT_FOUND", "Trade not found"),
        Err(e) => persistence_error(&e),
    }
}

pub async fn get_user_trades<S: InventoryStore>(
    State(state): State<Arc<AppState<S>>>,
    user_id: Result<Path<UserId>, PathRejection>,
    params: Result<Query<TradesQuery>, QueryRejection>,
) -> Response {
    let Path(user_id) = match user_id {
        Ok(p) => p,
        Err(rejection) => return malformed(&rejection.body_text()),
    };
    let Query(params) = match params {
        Ok(q) => q,
        Err(rejection) => return malformed(&rejection.body_text()),
    };
    let limit = params.limit.clamp(1, MAX_PAGE_SIZE);
    let offset = params.offset.max(0);

    let total_count = match state.store.count_trades_for_user(user_id).await {
        Ok(count) => count,
        Err(e) => return persistence_error(&e),
    };

    match state.store.list_trades_for_user(user_id, limit, offset).await {
        Ok(trades) => Json(serde_json::json!({
            "ok": true,
            "pagination": {
                "total": total_count,
                "limit": limit,
                "offset": offset,
                "has_more": offset + (trades.len() as i64) < total_count
            },
            "trades": trades
        }))
        .into_response(),
        Err(e) => persistence_error(&e),
    }
}

// ==========================================
// Inventory Handlers
// ==========================================

pub async fn get_duplicates<S: InventoryStore>(
    State(state): State<Arc<AppState<S>>>,
    user_id: Result<Path<UserId>, PathRejection>,
) -> Response {
    let Path(user_id) = match user_id {
        Ok(p) => p,
        Err(rejection) => return malformed(&rejection.body_text()),
    };

    match state.store.list_instances_by_owner(user_id).await {
        Ok(instances) => Json(serde_json::json!({
            "ok": true,
            "user_id": user_id,
            "duplicates": inventory::find_duplicates(&instances)
        }))
        .into_response(),
        Err(e) => persistence_error(&e),
    }
}

pub async fn affix_instance<S: InventoryStore>(
    State(state): State<Arc<AppState<S>>>,
    instance_id: Result<Path<InstanceId>, PathRejection>,
    payload: Result<Json<AffixRequest>, JsonRejection>,
) -> Response {
    let Path(instance_id) = match instance_id {
        Ok(p) => p,
        Err(rejection) => return malformed(&rejection.body_text()),
    };
    let Json(request) = match payload {
        Ok(p) => p,
        Err(rejection) => return malformed(&rejection.body_text()),
    };

    match inventory::affix_instance(state.store.as_ref(), request.user_id, instance_id).await {
        Ok(instance) => Json(serde_json::json!({
            "ok": true,
            "instance": instance
        }))
        .into_response(),
        Err(AffixError::Persistence(e)) => persistence_error(&e),
        Err(e) => {
            let status = match e {
                AffixError::NotFound(_) => StatusCode::NOT_FOUND,
                AffixError::NotOwned(_) => StatusCode::FORBIDDEN,
                _ => StatusCode::CONFLICT,
            };
            failure(status, e.code(), &e.to_string())
        }
    }
}
