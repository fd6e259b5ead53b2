//! Error types for the faucet service

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use quota_common::{Amount, TypeError};
use serde_json::json;
use thiserror::Error;

/// Faucet service errors
#[derive(Error, Debug)]
pub enum FaucetError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid account: {0}")]
    InvalidAccount(String),

    #[error("Request limit exceeded: requested {requested}, per-request limit {limit}")]
    RequestLimitExceeded { requested: Amount, limit: Amount },

    #[error("Account limit exceeded: requested {requested}, remaining {remaining} of {limit}")]
    AccountLimitExceeded {
        requested: Amount,
        remaining: Amount,
        limit: Amount,
    },

    #[error("Return of {returned} exceeds outstanding spend {spent}")]
    OverReturn { returned: Amount, spent: Amount },

    #[error("Account limit {limit} is below current spend {spent}")]
    LimitBelowSpent { limit: Amount, spent: Amount },

    #[error("Unauthorized: no capability for {0}")]
    Unauthorized(String),

    #[error("Ledger transfer failed: {0}")]
    LedgerTransferFailed(String),

    #[error("Rate limit exceeded: try again in {0} seconds")]
    RateLimitExceeded(u64),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("RPC error: {0}")]
    RpcError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl FaucetError {
    /// Stable machine-readable code, also used as the metrics outcome label.
    pub fn code(&self) -> &'static str {
        match self {
            FaucetError::InvalidAmount(_) => "INVALID_AMOUNT",
            FaucetError::InvalidAccount(_) => "INVALID_ACCOUNT",
            FaucetError::RequestLimitExceeded { .. } => "REQUEST_LIMIT_EXCEEDED",
            FaucetError::AccountLimitExceeded { .. } => "ACCOUNT_LIMIT_EXCEEDED",
            FaucetError::OverReturn { .. } => "OVER_RETURN",
            FaucetError::LimitBelowSpent { .. } => "LIMIT_BELOW_SPENT",
            FaucetError::Unauthorized(_) => "UNAUTHORIZED",
            FaucetError::LedgerTransferFailed(_) => "LEDGER_TRANSFER_FAILED",
            FaucetError::RateLimitExceeded(_) => "RATE_LIMIT_EXCEEDED",
            FaucetError::DatabaseError(_) => "DATABASE_ERROR",
            FaucetError::RpcError(_) => "RPC_ERROR",
            FaucetError::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            FaucetError::InvalidAmount(_) | FaucetError::InvalidAccount(_) => StatusCode::BAD_REQUEST,
            FaucetError::RequestLimitExceeded { .. }
            | FaucetError::AccountLimitExceeded { .. }
            | FaucetError::OverReturn { .. }
            | FaucetError::LimitBelowSpent { .. } => StatusCode::CONFLICT,
            FaucetError::Unauthorized(_) => StatusCode::FORBIDDEN,
            FaucetError::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            FaucetError::LedgerTransferFailed(_) | FaucetError::RpcError(_) => StatusCode::BAD_GATEWAY,
            FaucetError::DatabaseError(_) | FaucetError::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<TypeError> for FaucetError {
    fn from(err: TypeError) -> Self {
        match err {
            TypeError::InvalidAccount(msg) => FaucetError::InvalidAccount(msg),
            TypeError::InvalidAmount(msg) => FaucetError::InvalidAmount(msg),
            TypeError::InvalidKeySet(msg) => FaucetError::InvalidAccount(format!("guard: {}", msg)),
        }
    }
}

impl From<bincode::Error> for FaucetError {
    fn from(err: bincode::Error) -> Self {
        FaucetError::InternalError(format!("Record encoding: {}", err))
    }
}

impl IntoResponse for FaucetError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = Json(json!({
            "error": self.code(),
            "message": self.to_string(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        }));

        (status, body).into_response()
    }
}

pub type FaucetResult<T> = Result<T, FaucetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_violations_map_to_conflict() {
        let err = FaucetError::RequestLimitExceeded {
            requested: Amount(80),
            limit: Amount(20),
        };
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.code(), "REQUEST_LIMIT_EXCEEDED");
        assert!(err.to_string().contains("requested 80"));
    }

    #[test]
    fn test_type_errors_convert() {
        let err: FaucetError = TypeError::InvalidAccount("x".to_string()).into();
        assert!(matches!(err, FaucetError::InvalidAccount(_)));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_ledger_failure_is_bad_gateway() {
        let err = FaucetError::LedgerTransferFailed("insufficient balance".to_string());
        assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);
    }
}
