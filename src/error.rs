//! The engine's closed error taxonomy.
//!
//! Every synchronous kernel path returns `Result<_, EngineError>`. Each
//! variant carries a stable wire label (used in the gateway's `ERROR` frame)
//! and, where the error surfaces over REST, maps to an HTTP status code.

use crate::ids::{AccountId, OrderId, PositionId};
use axum::http::StatusCode;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Error, Serialize)]
#[serde(tag = "kind", content = "details", rename_all = "snake_case")]
pub enum EngineError {
    #[error("price unavailable for {symbol}")]
    PriceUnavailable { symbol: String },

    #[error("price for {symbol} is stale ({age_ms}ms old)")]
    PriceStale { symbol: String, age_ms: i64 },

    #[error("account {account_id} is busy, please retry")]
    AccountBusy { account_id: AccountId },

    #[error("account {account_id} not found")]
    AccountNotFound { account_id: AccountId },

    #[error("account {account_id} is not active (status: {status})")]
    AccountInactive { account_id: AccountId, status: String },

    #[error("owner is not authorized for account {account_id}")]
    Unauthorized { account_id: AccountId },

    #[error("insufficient margin: required {required}, available {available}")]
    InsufficientMargin { required: f64, available: f64 },

    #[error("limit price not yet met for order {order_id}")]
    LimitPriceNotMet { order_id: OrderId },

    #[error("duplicate client order id {client_order_id} on account {account_id}")]
    DuplicateClientOrderId {
        account_id: AccountId,
        client_order_id: String,
    },

    #[error("position {position_id} not found")]
    PositionNotFound { position_id: PositionId },

    #[error("order {order_id} not found")]
    OrderNotFound { order_id: OrderId },

    #[error("persistence task dropped: {reason}")]
    PersistDrop { reason: String },

    #[error("persistence retries exhausted: {reason}")]
    PersistRetryExhausted { reason: String },

    #[error("durable store unavailable")]
    DbUnavailable,

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    /// The stable label sent in the gateway's `ERROR{kind, ...}` frame.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::PriceUnavailable { .. } => "price_unavailable",
            EngineError::PriceStale { .. } => "price_stale",
            EngineError::AccountBusy { .. } => "account_busy",
            EngineError::AccountNotFound { .. } => "account_not_found",
            EngineError::AccountInactive { .. } => "account_inactive",
            EngineError::Unauthorized { .. } => "unauthorized",
            EngineError::InsufficientMargin { .. } => "insufficient_margin",
            EngineError::LimitPriceNotMet { .. } => "limit_price_not_met",
            EngineError::DuplicateClientOrderId { .. } => "duplicate_client_order_id",
            EngineError::PositionNotFound { .. } => "position_not_found",
            EngineError::OrderNotFound { .. } => "order_not_found",
            EngineError::PersistDrop { .. } => "persist_drop",
            EngineError::PersistRetryExhausted { .. } => "persist_retry_exhausted",
            EngineError::DbUnavailable => "db_unavailable",
            EngineError::Internal { .. } => "internal",
        }
    }

    /// HTTP status for the (rare) errors that surface over REST rather than
    /// the gateway's `ERROR` frame.
    pub fn status_code(&self) -> StatusCode {
        match self {
            EngineError::AccountNotFound { .. }
            | EngineError::PositionNotFound { .. }
            | EngineError::OrderNotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::AccountBusy { .. } | EngineError::DuplicateClientOrderId { .. } => {
                StatusCode::CONFLICT
            }
            EngineError::Unauthorized { .. } => StatusCode::FORBIDDEN,
            EngineError::PriceUnavailable { .. }
            | EngineError::PriceStale { .. }
            | EngineError::AccountInactive { .. }
            | EngineError::InsufficientMargin { .. }
            | EngineError::LimitPriceNotMet { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::DbUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::PersistDrop { .. } | EngineError::PersistRetryExhausted { .. } => {
                StatusCode::OK // never client-visible; logged CRITICAL instead
            }
            EngineError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        EngineError::Internal {
            message: message.into(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
