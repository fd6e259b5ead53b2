//! Faucet configuration

use crate::error::FaucetResult;
use crate::policy::{GlobalPolicy, ReturnPolicy};
use quota_common::utils::config::load_layered;
use quota_common::utils::logging::LoggingConfig;
use quota_common::{AccountId, Amount, KeyPredicate, KeySet};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable prefix, e.g. `FAUCET_SERVER_ADDR`
pub const ENV_PREFIX: &str = "FAUCET";

/// Faucet service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaucetConfig {
    /// Server address
    pub server_addr: String,

    /// Limit ledger database path
    pub db_path: String,

    /// Custodial account funds are dispensed from
    pub faucet_account: String,

    /// Per-request cap for accounts without an override (smallest unit)
    pub default_request_limit: Amount,

    /// Cumulative cap for accounts without an override (smallest unit)
    pub default_account_limit: Amount,

    /// Handling of returns larger than the outstanding spend
    pub return_policy: ReturnPolicy,

    /// Keys allowed to exercise ADMIN_LIMIT
    pub admin_keys: Vec<String>,

    /// Threshold over `admin_keys`
    pub admin_pred: KeyPredicate,

    /// Remote ledger JSON-RPC endpoint; the in-memory ledger is used when unset
    pub ledger_rpc_url: Option<String>,

    /// Opening balance of the faucet account on the in-memory ledger
    pub initial_faucet_balance: Amount,

    /// Rate limit on `POST /api/request`, across all callers
    pub max_requests_per_minute: u32,

    /// Enable metrics endpoint
    pub metrics_enabled: bool,

    /// Enable CORS
    pub cors_enabled: bool,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for FaucetConfig {
    fn default() -> Self {
        Self {
            server_addr: "0.0.0.0:3000".to_string(),
            db_path: "./faucet_data".to_string(),
            faucet_account: "faucet".to_string(),
            default_request_limit: Amount(20),
            default_account_limit: Amount(100),
            return_policy: ReturnPolicy::Floor,
            admin_keys: Vec::new(),
            admin_pred: KeyPredicate::KeysAll,
            ledger_rpc_url: None,
            initial_faucet_balance: Amount(1_000_000),
            max_requests_per_minute: 60,
            metrics_enabled: true,
            cors_enabled: true,
            logging: LoggingConfig::default(),
        }
    }
}

impl FaucetConfig {
    /// Defaults, overlaid by the optional config file, overlaid by `FAUCET_*`
    /// environment variables.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> anyhow::Result<Self> {
        load_layered(&Self::default(), path, ENV_PREFIX)
    }

    pub fn faucet_account(&self) -> FaucetResult<AccountId> {
        Ok(AccountId::new(self.faucet_account.as_str())?)
    }

    pub fn admin_keyset(&self) -> FaucetResult<KeySet> {
        Ok(KeySet::new(self.admin_keys.clone(), self.admin_pred)?)
    }

    pub fn global_policy(&self) -> GlobalPolicy {
        GlobalPolicy::new(self.default_request_limit, self.default_account_limit)
    }

    /// Reject configurations the service cannot start with.
    pub fn validate(&self) -> FaucetResult<()> {
        self.faucet_account()?;
        self.admin_keyset()?;
        if self.default_request_limit.is_zero() || self.default_account_limit.is_zero() {
            return Err(crate::error::FaucetError::InvalidAmount(
                "default limits must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
