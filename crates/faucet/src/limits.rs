//! Limit ledger: per-account quota records and the audit trail

use crate::error::{FaucetError, FaucetResult};
use crate::policy::GlobalPolicy;
use chrono::Utc;
use quota_common::{AccountId, Amount};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionResult};
use sled::{Db, Transactional, Tree};
use std::path::Path;
use std::sync::RwLock;
use tracing::{debug, info};

const POLICY_KEY: &[u8] = b"global_policy";

/// Quota record as persisted: limits are stored only when overridden.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredQuota {
    account_limit: Option<Amount>,
    request_limit: Option<Amount>,
    spent: Amount,
}

/// An account's quota, with limits resolved against the global policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountQuota {
    account_limit: Amount,
    request_limit: Amount,
    spent: Amount,
    account_limit_overridden: bool,
    request_limit_overridden: bool,
}

impl AccountQuota {
    fn resolve(stored: StoredQuota, policy: &GlobalPolicy) -> Self {
        Self {
            account_limit: stored.account_limit.unwrap_or(policy.default_account_limit),
            request_limit: stored.request_limit.unwrap_or(policy.default_request_limit),
            spent: stored.spent,
            account_limit_overridden: stored.account_limit.is_some(),
            request_limit_overridden: stored.request_limit.is_some(),
        }
    }

    fn to_stored(&self) -> StoredQuota {
        StoredQuota {
            account_limit: self.account_limit_overridden.then_some(self.account_limit),
            request_limit: self.request_limit_overridden.then_some(self.request_limit),
            spent: self.spent,
        }
    }

    pub fn account_limit(&self) -> Amount {
        self.account_limit
    }

    pub fn request_limit(&self) -> Amount {
        self.request_limit
    }

    pub fn spent(&self) -> Amount {
        self.spent
    }

    /// `account_limit - spent`, never negative.
    pub fn remaining(&self) -> Amount {
        self.account_limit.saturating_sub(self.spent)
    }

    pub fn set_account_limit(&mut self, limit: Amount) {
        self.account_limit = limit;
        self.account_limit_overridden = true;
    }

    pub fn set_request_limit(&mut self, limit: Amount) {
        self.request_limit = limit;
        self.request_limit_overridden = true;
    }

    pub fn set_spent(&mut self, spent: Amount) {
        self.spent = spent;
    }
}

/// Kind of a committed quota operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Request,
    Return,
    SetRequestLimit,
    SetAccountLimit,
    SetDefaultRequestLimit,
    SetDefaultAccountLimit,
}

/// Audit record of a committed operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub kind: EventKind,
    /// `None` for faucet-wide policy changes
    pub account: Option<AccountId>,
    /// Transferred amount, or the new limit for limit changes
    pub amount: Amount,
    /// Ledger transaction, for transfers
    pub tx_id: Option<String>,
    pub timestamp: i64,
}

impl AuditEvent {
    pub fn new(kind: EventKind, account: Option<AccountId>, amount: Amount, tx_id: Option<String>) -> Self {
        Self {
            kind,
            account,
            amount,
            tx_id,
            timestamp: Utc::now().timestamp(),
        }
    }
}

/// Aggregates over the audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaucetStatistics {
    pub accounts: usize,
    pub total_events: usize,
    pub total_disbursed: Amount,
    pub total_returned: Amount,
}

/// Keyed store of quota records with default-on-miss reads.
///
/// Holds no locks across `get`/`put`; callers serialize per account.
pub struct LimitLedger {
    db: Db,
    /// AccountId -> StoredQuota
    quotas: Tree,
    /// Global policy singleton
    policies: Tree,
    /// Append-only, keyed by monotonically increasing id
    events: Tree,
    policy: RwLock<GlobalPolicy>,
}

impl LimitLedger {
    /// Open the ledger at `path`. `seed` becomes the global policy only
    /// when none has been persisted yet.
    pub fn open<P: AsRef<Path>>(path: P, seed: GlobalPolicy) -> FaucetResult<Self> {
        info!("Opening limit ledger at: {}", path.as_ref().display());

        let db = sled::Config::default()
            .path(path)
            .cache_capacity(64 * 1024 * 1024)
            .open()?;

        Self::from_db(db, seed)
    }

    /// Ledger backed by a throwaway database, removed on drop.
    pub fn temporary(seed: GlobalPolicy) -> FaucetResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, seed)
    }

    fn from_db(db: Db, seed: GlobalPolicy) -> FaucetResult<Self> {
        let quotas = db.open_tree("quotas")?;
        let policies = db.open_tree("policy")?;
        let events = db.open_tree("events")?;

        let policy = match policies.get(POLICY_KEY)? {
            Some(bytes) => {
                let stored: GlobalPolicy = bincode::deserialize(&bytes)?;
                info!(
                    "Loaded persisted policy: request limit {}, account limit {}",
                    stored.default_request_limit, stored.default_account_limit
                );
                stored
            }
            None => {
                policies.insert(POLICY_KEY, bincode::serialize(&seed)?)?;
                seed
            }
        };

        Ok(Self {
            db,
            quotas,
            policies,
            events,
            policy: RwLock::new(policy),
        })
    }

    pub fn policy(&self) -> GlobalPolicy {
        match self.policy.read() {
            Ok(policy) => *policy,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Replace the global policy and append `events` in one transaction.
    pub fn commit_policy(&self, policy: GlobalPolicy, events: &[AuditEvent]) -> FaucetResult<()> {
        let value = bincode::serialize(&policy)?;
        let records = self.encode_events(events)?;

        let result: TransactionResult<()> = (&self.policies, &self.events).transaction(|(policies, log)| {
            policies.insert(POLICY_KEY, value.as_slice())?;
            for (key, record) in &records {
                log.insert(&key[..], record.as_slice())?;
            }
            Ok::<_, ConflictableTransactionError<()>>(())
        });
        result.map_err(transaction_error)?;

        let mut current = self
            .policy
            .write()
            .map_err(|_| FaucetError::InternalError("Policy lock poisoned".to_string()))?;
        *current = policy;
        Ok(())
    }

    /// Record for `account`, or one initialized from the global policy.
    /// A miss does not write.
    pub fn get(&self, account: &AccountId) -> FaucetResult<AccountQuota> {
        let stored = match self.quotas.get(account.as_bytes())? {
            Some(bytes) => bincode::deserialize(&bytes)?,
            None => StoredQuota::default(),
        };
        Ok(AccountQuota::resolve(stored, &self.policy()))
    }

    /// Replace the stored record for `account`.
    pub fn put(&self, account: &AccountId, quota: &AccountQuota) -> FaucetResult<()> {
        let value = bincode::serialize(&quota.to_stored())?;
        self.quotas.insert(account.as_bytes(), value)?;
        debug!("Stored quota for {}: spent {}", account, quota.spent);
        Ok(())
    }

    pub fn contains(&self, account: &AccountId) -> FaucetResult<bool> {
        Ok(self.quotas.contains_key(account.as_bytes())?)
    }

    /// Replace the record for `account` and append `event` in one
    /// transaction: either both land or neither does.
    pub fn commit(&self, account: &AccountId, quota: &AccountQuota, event: &AuditEvent) -> FaucetResult<()> {
        let value = bincode::serialize(&quota.to_stored())?;
        let records = self.encode_events(std::slice::from_ref(event))?;

        let result: TransactionResult<()> = (&self.quotas, &self.events).transaction(|(quotas, log)| {
            quotas.insert(account.as_bytes(), value.as_slice())?;
            for (key, record) in &records {
                log.insert(&key[..], record.as_slice())?;
            }
            Ok::<_, ConflictableTransactionError<()>>(())
        });
        result.map_err(transaction_error)?;

        debug!("Committed {:?} for {}: spent {}", event.kind, account, quota.spent);
        Ok(())
    }

    /// Event log keys come from the database's monotonic id generator.
    fn encode_events(&self, events: &[AuditEvent]) -> FaucetResult<Vec<([u8; 8], Vec<u8>)>> {
        events
            .iter()
            .map(|event| -> FaucetResult<([u8; 8], Vec<u8>)> {
                Ok((self.db.generate_id()?.to_be_bytes(), bincode::serialize(event)?))
            })
            .collect()
    }

    /// Events touching `account`, oldest first.
    pub fn events_for(&self, account: &AccountId) -> FaucetResult<Vec<AuditEvent>> {
        let mut records = Vec::new();

        for item in self.events.iter() {
            let (_, value) = item?;
            let event: AuditEvent = bincode::deserialize(&value)?;
            if event.account.as_ref() == Some(account) {
                records.push(event);
            }
        }

        Ok(records)
    }

    /// Most recent events, newest first.
    pub fn recent_events(&self, limit: usize) -> FaucetResult<Vec<AuditEvent>> {
        let mut records = Vec::new();

        for item in self.events.iter().rev().take(limit) {
            let (_, value) = item?;
            records.push(bincode::deserialize(&value)?);
        }

        Ok(records)
    }

    pub fn statistics(&self) -> FaucetResult<FaucetStatistics> {
        let mut total_disbursed = Amount::ZERO;
        let mut total_returned = Amount::ZERO;

        for item in self.events.iter() {
            let (_, value) = item?;
            let event: AuditEvent = bincode::deserialize(&value)?;
            match event.kind {
                EventKind::Request => {
                    total_disbursed = total_disbursed.checked_add(event.amount).unwrap_or(Amount(u128::MAX));
                }
                EventKind::Return => {
                    total_returned = total_returned.checked_add(event.amount).unwrap_or(Amount(u128::MAX));
                }
                _ => {}
            }
        }

        Ok(FaucetStatistics {
            accounts: self.quotas.len(),
            total_events: self.events.len(),
            total_disbursed,
            total_returned,
        })
    }

    pub async fn flush(&self) -> FaucetResult<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

fn transaction_error(err: TransactionError<()>) -> FaucetError {
    match err {
        TransactionError::Storage(err) => FaucetError::DatabaseError(err),
        TransactionError::Abort(()) => FaucetError::InternalError("Limit ledger transaction aborted".to_string()),
    }
}
