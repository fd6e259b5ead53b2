//! Faucet-wide limit policy

use quota_common::Amount;
use serde::{Deserialize, Serialize};

/// Defaults applied to every account without its own override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalPolicy {
    /// Maximum amount paid out by a single request
    pub default_request_limit: Amount,
    /// Maximum net amount an account may hold against the faucet
    pub default_account_limit: Amount,
}

impl GlobalPolicy {
    pub fn new(default_request_limit: Amount, default_account_limit: Amount) -> Self {
        Self {
            default_request_limit,
            default_account_limit,
        }
    }
}

impl Default for GlobalPolicy {
    fn default() -> Self {
        Self::new(Amount(20), Amount(100))
    }
}

/// What `return` does when the returned amount exceeds the outstanding spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReturnPolicy {
    /// Accept the full transfer and floor `spent` at zero.
    #[default]
    Floor,
    /// Refuse the return; no funds move.
    Reject,
}
