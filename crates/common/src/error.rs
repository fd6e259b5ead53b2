use thiserror::Error;

/// Errors raised while constructing the shared value types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("Invalid account name: {0}")]
    InvalidAccount(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid key set: {0}")]
    InvalidKeySet(String),
}
