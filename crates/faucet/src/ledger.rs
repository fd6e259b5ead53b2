//! External value-transfer ledger

use crate::auth::Capability;
use crate::error::{FaucetError, FaucetResult};
use async_trait::async_trait;
use chrono::Utc;
use quota_common::{AccountId, Amount, KeySet};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A transfer together with the capability bounding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferInstruction {
    pub from: AccountId,
    pub to: AccountId,
    pub amount: Amount,
    pub scope: Capability,
}

impl TransferInstruction {
    /// The capability this transfer needs from its scope.
    pub fn required_capability(&self) -> Capability {
        Capability::Transfer {
            from: self.from.clone(),
            to: self.to.clone(),
            max_amount: self.amount,
        }
    }
}

/// Proof of a committed transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub tx_id: String,
    pub from: AccountId,
    pub to: AccountId,
    pub amount: Amount,
    pub timestamp: i64,
}

/// Value-transfer ledger consumed by the quota engine.
///
/// Implementations serialize transfers and reject any transfer whose scope
/// does not cover `(from, to, amount)`.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Create `id` guarded by `guard`, or leave an existing account untouched.
    async fn create_or_get_account(&self, id: &AccountId, guard: &KeySet) -> FaucetResult<()>;

    async fn transfer(&self, instruction: TransferInstruction) -> FaucetResult<TransferReceipt>;

    async fn get_balance(&self, id: &AccountId) -> FaucetResult<Amount>;

    /// Guard of an existing account, `None` when the account is unknown.
    async fn get_guard(&self, id: &AccountId) -> FaucetResult<Option<KeySet>>;
}

#[derive(Debug, Clone)]
struct LedgerAccount {
    balance: Amount,
    guard: KeySet,
}

/// Process-local ledger for standalone deployments and tests.
pub struct InMemoryLedger {
    accounts: RwLock<HashMap<AccountId, LedgerAccount>>,
    next_tx: AtomicU64,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            next_tx: AtomicU64::new(1),
        }
    }

    /// Ledger holding a single funded account.
    pub fn with_account(id: AccountId, guard: KeySet, balance: Amount) -> Self {
        let mut accounts = HashMap::new();
        accounts.insert(id, LedgerAccount { balance, guard });
        Self {
            accounts: RwLock::new(accounts),
            next_tx: AtomicU64::new(1),
        }
    }

    /// Credit `amount` to an existing account.
    pub async fn fund(&self, id: &AccountId, amount: Amount) -> FaucetResult<()> {
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .get_mut(id)
            .ok_or_else(|| FaucetError::LedgerTransferFailed(format!("Account {} does not exist", id)))?;
        account.balance = account
            .balance
            .checked_add(amount)
            .ok_or_else(|| FaucetError::InvalidAmount("Balance overflow".to_string()))?;
        Ok(())
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn create_or_get_account(&self, id: &AccountId, guard: &KeySet) -> FaucetResult<()> {
        let mut accounts = self.accounts.write().await;
        if !accounts.contains_key(id) {
            accounts.insert(
                id.clone(),
                LedgerAccount {
                    balance: Amount::ZERO,
                    guard: guard.clone(),
                },
            );
            info!("Created ledger account {}", id);
        }
        Ok(())
    }

    async fn transfer(&self, instruction: TransferInstruction) -> FaucetResult<TransferReceipt> {
        if !instruction.scope.covers(&instruction.required_capability()) {
            return Err(FaucetError::LedgerTransferFailed(format!(
                "Scope {} does not cover transfer of {} from {} to {}",
                instruction.scope, instruction.amount, instruction.from, instruction.to
            )));
        }
        if instruction.from == instruction.to {
            return Err(FaucetError::LedgerTransferFailed(
                "Sender and receiver must differ".to_string(),
            ));
        }

        let mut accounts = self.accounts.write().await;

        let sender_balance = accounts
            .get(&instruction.from)
            .map(|a| a.balance)
            .ok_or_else(|| {
                FaucetError::LedgerTransferFailed(format!("Account {} does not exist", instruction.from))
            })?;
        let receiver_balance = accounts
            .get(&instruction.to)
            .map(|a| a.balance)
            .ok_or_else(|| {
                FaucetError::LedgerTransferFailed(format!("Account {} does not exist", instruction.to))
            })?;

        let new_sender = sender_balance.checked_sub(instruction.amount).ok_or_else(|| {
            FaucetError::LedgerTransferFailed(format!(
                "Insufficient balance in {}: {} < {}",
                instruction.from, sender_balance, instruction.amount
            ))
        })?;
        let new_receiver = receiver_balance
            .checked_add(instruction.amount)
            .ok_or_else(|| FaucetError::LedgerTransferFailed("Balance overflow".to_string()))?;

        if let Some(sender) = accounts.get_mut(&instruction.from) {
            sender.balance = new_sender;
        }
        if let Some(receiver) = accounts.get_mut(&instruction.to) {
            receiver.balance = new_receiver;
        }

        let tx_id = format!("tx-{}", self.next_tx.fetch_add(1, Ordering::SeqCst));
        debug!("Ledger {}: {} -> {} ({})", tx_id, instruction.from, instruction.to, instruction.amount);

        Ok(TransferReceipt {
            tx_id,
            from: instruction.from,
            to: instruction.to,
            amount: instruction.amount,
            timestamp: Utc::now().timestamp(),
        })
    }

    async fn get_balance(&self, id: &AccountId) -> FaucetResult<Amount> {
        let accounts = self.accounts.read().await;
        Ok(accounts.get(id).map(|a| a.balance).unwrap_or_default())
    }

    async fn get_guard(&self, id: &AccountId) -> FaucetResult<Option<KeySet>> {
        let accounts = self.accounts.read().await;
        Ok(accounts.get(id).map(|a| a.guard.clone()))
    }
}

/// JSON-RPC client for a remote ledger node
pub struct RpcLedger {
    rpc_url: String,
    client: reqwest::Client,
}

impl RpcLedger {
    pub fn new(rpc_url: String) -> Self {
        Self {
            rpc_url,
            client: reqwest::Client::new(),
        }
    }

    async fn call(&self, method: &str, params: serde_json::Value) -> FaucetResult<serde_json::Value> {
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let response = self
            .client
            .post(&self.rpc_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| FaucetError::RpcError(format!("Request failed: {}", e)))?;

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| FaucetError::RpcError(format!("Invalid response: {}", e)))?;

        if let Some(error) = json.get("error") {
            return Err(FaucetError::RpcError(error.to_string()));
        }

        Ok(json
            .get("result")
            .cloned()
            .unwrap_or(serde_json::Value::Null))
    }
}

#[async_trait]
impl Ledger for RpcLedger {
    async fn create_or_get_account(&self, id: &AccountId, guard: &KeySet) -> FaucetResult<()> {
        self.call("ledger_createOrGetAccount", serde_json::json!([id, guard]))
            .await
            .map_err(|e| FaucetError::LedgerTransferFailed(e.to_string()))?;
        Ok(())
    }

    async fn transfer(&self, instruction: TransferInstruction) -> FaucetResult<TransferReceipt> {
        let result = self
            .call("ledger_transfer", serde_json::json!([instruction]))
            .await
            .map_err(|e| FaucetError::LedgerTransferFailed(e.to_string()))?;

        serde_json::from_value(result)
            .map_err(|e| FaucetError::LedgerTransferFailed(format!("Malformed receipt: {}", e)))
    }

    async fn get_balance(&self, id: &AccountId) -> FaucetResult<Amount> {
        let result = self.call("ledger_getBalance", serde_json::json!([id])).await?;
        debug!("Balance of {}: {}", id, result);
        if result.is_null() {
            return Ok(Amount::ZERO);
        }
        serde_json::from_value(result).map_err(|e| FaucetError::RpcError(format!("Malformed balance: {}", e)))
    }

    async fn get_guard(&self, id: &AccountId) -> FaucetResult<Option<KeySet>> {
        let result = self.call("ledger_getGuard", serde_json::json!([id])).await?;
        serde_json::from_value(result).map_err(|e| FaucetError::RpcError(format!("Malformed guard: {}", e)))
    }
}
