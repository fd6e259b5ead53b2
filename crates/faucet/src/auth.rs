//! Capability-scoped authorization.
//!
//! Every mutating operation names the exact capability it needs, bounded by
//! the accounts and amount involved. A caller is authorized when one of the
//! grants it presents covers that capability. Signature verification happens
//! upstream; by the time a [`Caller`] reaches the engine its `signers` are
//! trusted.

use crate::error::{FaucetError, FaucetResult};
use async_trait::async_trait;
use quota_common::{AccountId, Amount, KeySet};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Name of the elevated capability gating limit changes.
pub const ADMIN_LIMIT: &str = "ADMIN_LIMIT";

/// A scoped permission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "capability", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    /// Move at most `max_amount` out of the faucet into `recipient`.
    Disburse {
        faucet: AccountId,
        recipient: AccountId,
        max_amount: Amount,
    },
    /// Move at most `max_amount` from `from` to `to`.
    Transfer {
        from: AccountId,
        to: AccountId,
        max_amount: Amount,
    },
    /// Change request or account limits.
    AdminLimit,
}

impl Capability {
    /// Check if this (granted) capability covers the `required` one.
    ///
    /// Accounts must match exactly; the granted amount bound must be at
    /// least the required one.
    pub fn covers(&self, required: &Capability) -> bool {
        match (self, required) {
            (
                Capability::Disburse { faucet: f1, recipient: r1, max_amount: granted },
                Capability::Disburse { faucet: f2, recipient: r2, max_amount: needed },
            ) => f1 == f2 && r1 == r2 && granted >= needed,
            (
                Capability::Transfer { from: a1, to: b1, max_amount: granted },
                Capability::Transfer { from: a2, to: b2, max_amount: needed },
            ) => a1 == a2 && b1 == b2 && granted >= needed,
            // A disbursement is a transfer out of the faucet
            (
                Capability::Disburse { faucet, recipient, max_amount: granted },
                Capability::Transfer { from, to, max_amount: needed },
            ) => faucet == from && recipient == to && granted >= needed,
            (Capability::AdminLimit, Capability::AdminLimit) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Disburse { faucet, recipient, max_amount } => {
                write!(f, "DISBURSE({}, {}, {})", faucet, recipient, max_amount)
            }
            Capability::Transfer { from, to, max_amount } => {
                write!(f, "TRANSFER({}, {}, {})", from, to, max_amount)
            }
            Capability::AdminLimit => f.write_str(ADMIN_LIMIT),
        }
    }
}

/// Proof presented with a call: who signed it and which grants they attached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    #[serde(default)]
    pub signers: Vec<String>,
    #[serde(default)]
    pub grants: Vec<Capability>,
}

impl Caller {
    pub fn new(signers: Vec<String>, grants: Vec<Capability>) -> Self {
        Self { signers, grants }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }
}

/// Authorization collaborator.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Fails with [`FaucetError::Unauthorized`] unless `caller` holds a grant
    /// covering `required`.
    async fn require_capability(&self, caller: &Caller, required: &Capability) -> FaucetResult<()>;
}

/// Grant matching plus an admin key set for [`Capability::AdminLimit`].
pub struct GrantAuthorizer {
    admin_keyset: KeySet,
}

impl GrantAuthorizer {
    pub fn new(admin_keyset: KeySet) -> Self {
        Self { admin_keyset }
    }
}

#[async_trait]
impl Authorizer for GrantAuthorizer {
    async fn require_capability(&self, caller: &Caller, required: &Capability) -> FaucetResult<()> {
        let granted = caller.grants.iter().any(|grant| grant.covers(required));

        let authorized = match required {
            // The grant alone is not enough: it must be signed by the faucet's admins.
            Capability::AdminLimit => granted && self.admin_keyset.is_satisfied_by(&caller.signers),
            _ => granted,
        };

        if !authorized {
            warn!("Capability {} not held by signers {:?}", required, caller.signers);
            return Err(FaucetError::Unauthorized(required.to_string()));
        }

        Ok(())
    }
}
