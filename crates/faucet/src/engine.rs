//! Quota engine: admission, disbursement and limit administration

use crate::auth::{Authorizer, Caller, Capability};
use crate::error::{FaucetError, FaucetResult};
use crate::ledger::{Ledger, TransferInstruction, TransferReceipt};
use crate::limits::{AccountQuota, AuditEvent, EventKind, FaucetStatistics, LimitLedger};
use crate::metrics::FaucetMetrics;
use crate::policy::{GlobalPolicy, ReturnPolicy};
use quota_common::{AccountId, Amount, KeySet};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedMutexGuard;
use tracing::{error, info, warn};

/// Events included in [`FaucetStatus`]
const STATUS_RECENT_EVENTS: usize = 20;

/// Public view of an account's limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsView {
    pub account_limit: Amount,
    pub request_limit: Amount,
    pub account_limit_remaining: Amount,
}

/// Faucet status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaucetStatus {
    pub faucet_account: AccountId,
    pub balance: Amount,
    pub policy: GlobalPolicy,
    pub return_policy: ReturnPolicy,
    pub statistics: FaucetStatistics,
    /// Newest first
    pub recent_events: Vec<AuditEvent>,
}

type AccountLock = Arc<tokio::sync::Mutex<()>>;
type LockTable = Mutex<HashMap<AccountId, AccountLock>>;

#[derive(Debug, Clone, Copy)]
enum LimitField {
    Request,
    Account,
}

/// A held account lock. Dropping it releases the lock and removes the
/// table entry once no other task holds or awaits it.
struct AccountGuard<'a> {
    table: &'a LockTable,
    account: AccountId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for AccountGuard<'_> {
    fn drop(&mut self) {
        let mut locks = lock_table(self.table);
        drop(self.guard.take());
        if locks
            .get(&self.account)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.account);
        }
    }
}

fn lock_table(table: &LockTable) -> MutexGuard<'_, HashMap<AccountId, AccountLock>> {
    match table.lock() {
        Ok(locks) => locks,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Quota engine.
///
/// Every mutating operation on an account runs under that account's lock.
/// The quota record is written only after the ledger transfer succeeds, so
/// readers never observe a spend the ledger has not committed.
pub struct QuotaEngine {
    faucet: AccountId,
    limits: Arc<LimitLedger>,
    ledger: Arc<dyn Ledger>,
    authorizer: Arc<dyn Authorizer>,
    return_policy: ReturnPolicy,
    metrics: Arc<FaucetMetrics>,
    account_locks: LockTable,
    policy_lock: tokio::sync::Mutex<()>,
}

impl QuotaEngine {
    pub fn new(
        faucet: AccountId,
        limits: Arc<LimitLedger>,
        ledger: Arc<dyn Ledger>,
        authorizer: Arc<dyn Authorizer>,
        return_policy: ReturnPolicy,
        metrics: Arc<FaucetMetrics>,
    ) -> Self {
        info!("Quota engine for faucet account {} (return policy {:?})", faucet, return_policy);
        Self {
            faucet,
            limits,
            ledger,
            authorizer,
            return_policy,
            metrics,
            account_locks: Mutex::new(HashMap::new()),
            policy_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn faucet_account(&self) -> &AccountId {
        &self.faucet
    }

    pub fn metrics(&self) -> &Arc<FaucetMetrics> {
        &self.metrics
    }

    /// Pay `amount` from the faucet to `account`, creating the account on
    /// the ledger with `guard` if needed.
    pub async fn request(
        &self,
        caller: &Caller,
        account: &AccountId,
        guard: &KeySet,
        amount: Amount,
    ) -> FaucetResult<TransferReceipt> {
        let result = self.try_request(caller, account, guard, amount).await;
        if let Ok(receipt) = &result {
            self.metrics.record_amount("disbursed", receipt.amount);
        }
        self.observe("request", result)
    }

    async fn try_request(
        &self,
        caller: &Caller,
        account: &AccountId,
        guard: &KeySet,
        amount: Amount,
    ) -> FaucetResult<TransferReceipt> {
        ensure_positive(amount)?;
        self.ensure_not_faucet(account)?;
        guard.validate()?;

        // The scope is built from the operation's own bounds, never taken from the caller.
        let scope = Capability::Disburse {
            faucet: self.faucet.clone(),
            recipient: account.clone(),
            max_amount: amount,
        };
        self.authorizer.require_capability(caller, &scope).await?;

        let _lock = self.lock_account(account).await;

        let quota = self.limits.get(account)?;

        if amount > quota.request_limit() {
            warn!("Request of {} by {} above request limit {}", amount, account, quota.request_limit());
            return Err(FaucetError::RequestLimitExceeded {
                requested: amount,
                limit: quota.request_limit(),
            });
        }

        let new_spent = quota
            .spent()
            .checked_add(amount)
            .ok_or_else(|| FaucetError::InvalidAmount("Spend overflow".to_string()))?;
        if new_spent > quota.account_limit() {
            warn!(
                "Request of {} by {} above account limit {} (spent {})",
                amount,
                account,
                quota.account_limit(),
                quota.spent()
            );
            return Err(FaucetError::AccountLimitExceeded {
                requested: amount,
                remaining: quota.remaining(),
                limit: quota.account_limit(),
            });
        }

        self.ledger.create_or_get_account(account, guard).await?;

        let receipt = self
            .ledger
            .transfer(TransferInstruction {
                from: self.faucet.clone(),
                to: account.clone(),
                amount,
                scope,
            })
            .await?;

        let mut updated = quota;
        updated.set_spent(new_spent);
        self.settle(EventKind::Request, account, &updated, &receipt);

        info!(
            "Disbursed {} to {} (spent {} of {}), tx: {}",
            amount,
            account,
            new_spent,
            updated.account_limit(),
            receipt.tx_id
        );
        Ok(receipt)
    }

    /// Move `amount` from `account` back to the faucet, reducing its spend.
    pub async fn return_funds(
        &self,
        caller: &Caller,
        account: &AccountId,
        amount: Amount,
    ) -> FaucetResult<TransferReceipt> {
        let result = self.try_return(caller, account, amount).await;
        if let Ok(receipt) = &result {
            self.metrics.record_amount("returned", receipt.amount);
        }
        self.observe("return", result)
    }

    async fn try_return(&self, caller: &Caller, account: &AccountId, amount: Amount) -> FaucetResult<TransferReceipt> {
        ensure_positive(amount)?;
        self.ensure_not_faucet(account)?;

        let scope = Capability::Transfer {
            from: account.clone(),
            to: self.faucet.clone(),
            max_amount: amount,
        };
        self.authorizer.require_capability(caller, &scope).await?;

        // The transfer grant only counts when signed by the account's own guard.
        match self.ledger.get_guard(account).await? {
            Some(guard) if guard.is_satisfied_by(&caller.signers) => {}
            Some(_) => {
                warn!("Return from {} not signed by its guard", account);
                return Err(FaucetError::Unauthorized(scope.to_string()));
            }
            None => {
                return Err(FaucetError::LedgerTransferFailed(format!(
                    "Account {} does not exist",
                    account
                )))
            }
        }

        let _lock = self.lock_account(account).await;

        let quota = self.limits.get(account)?;

        let new_spent = match quota.spent().checked_sub(amount) {
            Some(spent) => spent,
            None => match self.return_policy {
                ReturnPolicy::Floor => Amount::ZERO,
                ReturnPolicy::Reject => {
                    warn!("Return of {} by {} exceeds spend {}", amount, account, quota.spent());
                    return Err(FaucetError::OverReturn {
                        returned: amount,
                        spent: quota.spent(),
                    });
                }
            },
        };

        let receipt = self
            .ledger
            .transfer(TransferInstruction {
                from: account.clone(),
                to: self.faucet.clone(),
                amount,
                scope,
            })
            .await?;

        let mut updated = quota;
        updated.set_spent(new_spent);
        self.settle(EventKind::Return, account, &updated, &receipt);

        info!("Returned {} from {} (spent now {}), tx: {}", amount, account, new_spent, receipt.tx_id);
        Ok(receipt)
    }

    /// Overwrite `account`'s per-request cap.
    pub async fn set_request_limit(&self, caller: &Caller, account: &AccountId, limit: Amount) -> FaucetResult<()> {
        let result = self.try_set_limit(caller, account, limit, LimitField::Request).await;
        self.observe("set_request_limit", result)
    }

    /// Overwrite `account`'s cumulative cap. It may not drop below the
    /// account's current spend.
    pub async fn set_account_limit(&self, caller: &Caller, account: &AccountId, limit: Amount) -> FaucetResult<()> {
        let result = self.try_set_limit(caller, account, limit, LimitField::Account).await;
        self.observe("set_account_limit", result)
    }

    async fn try_set_limit(
        &self,
        caller: &Caller,
        account: &AccountId,
        limit: Amount,
        field: LimitField,
    ) -> FaucetResult<()> {
        ensure_positive(limit)?;
        self.authorizer.require_capability(caller, &Capability::AdminLimit).await?;

        let _lock = self.lock_account(account).await;

        let mut quota = self.limits.get(account)?;
        let kind = match field {
            LimitField::Request => {
                quota.set_request_limit(limit);
                EventKind::SetRequestLimit
            }
            LimitField::Account => {
                if limit < quota.spent() {
                    return Err(FaucetError::LimitBelowSpent {
                        limit,
                        spent: quota.spent(),
                    });
                }
                quota.set_account_limit(limit);
                EventKind::SetAccountLimit
            }
        };

        self.limits
            .commit(account, &quota, &AuditEvent::new(kind, Some(account.clone()), limit, None))?;

        info!("{:?} for {} set to {}", kind, account, limit);
        Ok(())
    }

    /// Change the faucet-wide defaults. Absent values are left alone; the
    /// cumulative default may only grow, since accounts without an override
    /// follow it. Both values are checked before either is applied.
    pub async fn set_defaults(
        &self,
        caller: &Caller,
        request_limit: Option<Amount>,
        account_limit: Option<Amount>,
    ) -> FaucetResult<GlobalPolicy> {
        let result = self.try_set_defaults(caller, request_limit, account_limit).await;
        self.observe("set_defaults", result)
    }

    async fn try_set_defaults(
        &self,
        caller: &Caller,
        request_limit: Option<Amount>,
        account_limit: Option<Amount>,
    ) -> FaucetResult<GlobalPolicy> {
        if request_limit.is_none() && account_limit.is_none() {
            return Err(FaucetError::InvalidAmount("no limit given".to_string()));
        }
        for limit in request_limit.iter().chain(account_limit.iter()) {
            ensure_positive(*limit)?;
        }
        self.authorizer.require_capability(caller, &Capability::AdminLimit).await?;

        let _guard = self.policy_lock.lock().await;
        let mut policy = self.limits.policy();
        let mut events = Vec::new();

        if let Some(limit) = account_limit {
            if limit < policy.default_account_limit {
                return Err(FaucetError::InvalidAmount(format!(
                    "default account limit can only be raised (current {})",
                    policy.default_account_limit
                )));
            }
            policy.default_account_limit = limit;
            events.push(AuditEvent::new(EventKind::SetDefaultAccountLimit, None, limit, None));
        }
        if let Some(limit) = request_limit {
            policy.default_request_limit = limit;
            events.push(AuditEvent::new(EventKind::SetDefaultRequestLimit, None, limit, None));
        }

        self.limits.commit_policy(policy, &events)?;

        info!(
            "Default limits set: request {}, account {}",
            policy.default_request_limit, policy.default_account_limit
        );
        Ok(policy)
    }

    /// Limits of `account`; public, read-only.
    pub fn get_limits(&self, account: &AccountId) -> FaucetResult<LimitsView> {
        let quota = self.limits.get(account)?;
        Ok(view(&quota))
    }

    pub fn events(&self, account: &AccountId) -> FaucetResult<Vec<AuditEvent>> {
        self.limits.events_for(account)
    }

    pub async fn status(&self) -> FaucetResult<FaucetStatus> {
        let balance = self.ledger.get_balance(&self.faucet).await?;
        Ok(FaucetStatus {
            faucet_account: self.faucet.clone(),
            balance,
            policy: self.limits.policy(),
            return_policy: self.return_policy,
            statistics: self.limits.statistics()?,
            recent_events: self.limits.recent_events(STATUS_RECENT_EVENTS)?,
        })
    }

    /// Record the quota and audit entry for a transfer the ledger already
    /// committed. The transfer cannot be undone from here, so a failed write
    /// is logged with the transaction id for reconciliation and the caller
    /// still gets its receipt.
    fn settle(&self, kind: EventKind, account: &AccountId, quota: &AccountQuota, receipt: &TransferReceipt) {
        let event = AuditEvent::new(kind, Some(account.clone()), receipt.amount, Some(receipt.tx_id.clone()));
        if let Err(err) = self.limits.commit(account, quota, &event) {
            error!(
                "{:?} {} for {} committed on the ledger but not recorded (spent should be {}): {}",
                kind,
                receipt.tx_id,
                account,
                quota.spent(),
                err
            );
            self.metrics.record_operation("settle", err.code());
        }
    }

    fn ensure_not_faucet(&self, account: &AccountId) -> FaucetResult<()> {
        if *account == self.faucet {
            return Err(FaucetError::InvalidAccount(
                "The faucet account cannot request or return funds".to_string(),
            ));
        }
        Ok(())
    }

    async fn lock_account(&self, account: &AccountId) -> AccountGuard<'_> {
        let lock = lock_table(&self.account_locks)
            .entry(account.clone())
            .or_default()
            .clone();
        AccountGuard {
            table: &self.account_locks,
            account: account.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }

    fn observe<T>(&self, operation: &str, result: FaucetResult<T>) -> FaucetResult<T> {
        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => err.code(),
        };
        self.metrics.record_operation(operation, outcome);
        result
    }
}

fn ensure_positive(amount: Amount) -> FaucetResult<()> {
    if amount.is_zero() {
        return Err(FaucetError::InvalidAmount("amount must be positive".to_string()));
    }
    Ok(())
}

fn view(quota: &AccountQuota) -> LimitsView {
    LimitsView {
        account_limit: quota.account_limit(),
        request_limit: quota.request_limit(),
        account_limit_remaining: quota.remaining(),
    }
}
