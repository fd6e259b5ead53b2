//! Quota-governed faucet
//!
//! A custodial account hands out bounded amounts of a fungible asset:
//! - Per-request and cumulative per-account caps
//! - Returns that free up an account's cumulative cap
//! - Capability-scoped authorization, with an elevated capability for limit changes
//! - Persistent limit ledger with an audit trail
//! - HTTP interface and metrics

pub mod api;
pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod limits;
pub mod metrics;
pub mod policy;

pub use auth::{Authorizer, Caller, Capability, GrantAuthorizer, ADMIN_LIMIT};
pub use config::FaucetConfig;
pub use engine::{FaucetStatus, LimitsView, QuotaEngine};
pub use error::{FaucetError, FaucetResult};
pub use ledger::{InMemoryLedger, Ledger, RpcLedger, TransferInstruction, TransferReceipt};
pub use limits::{AccountQuota, AuditEvent, EventKind, FaucetStatistics, LimitLedger};
pub use metrics::FaucetMetrics;
pub use policy::{GlobalPolicy, ReturnPolicy};
