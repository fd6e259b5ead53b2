//! End-to-end quota scenarios against the in-memory ledger

use quota_common::utils::logging::init_test_logging;
use quota_common::{AccountId, Amount, KeyPredicate, KeySet};
use quota_faucet::{
    Caller, Capability, FaucetError, FaucetMetrics, GlobalPolicy, GrantAuthorizer, InMemoryLedger,
    Ledger, LimitLedger, LimitsView, QuotaEngine, ReturnPolicy,
};
use std::sync::Arc;
use tempfile::TempDir;

const ADMIN_KEY: &str = "faucet-admin";

struct Harness {
    engine: QuotaEngine,
    ledger: Arc<InMemoryLedger>,
    _dir: TempDir,
}

fn account(name: &str) -> AccountId {
    AccountId::new(name).unwrap()
}

fn guard_of(name: &str) -> KeySet {
    KeySet::new(vec![format!("{}-key", name)], KeyPredicate::KeysAll).unwrap()
}

fn harness(return_policy: ReturnPolicy) -> Harness {
    init_test_logging();

    let dir = TempDir::new().unwrap();
    let limits = LimitLedger::open(dir.path(), GlobalPolicy::new(Amount(20), Amount(100))).unwrap();
    let admin = KeySet::new(vec![ADMIN_KEY.to_string()], KeyPredicate::KeysAll).unwrap();
    let ledger = Arc::new(InMemoryLedger::with_account(account("faucet"), admin.clone(), Amount(10_000)));

    let engine = QuotaEngine::new(
        account("faucet"),
        Arc::new(limits),
        ledger.clone(),
        Arc::new(GrantAuthorizer::new(admin)),
        return_policy,
        Arc::new(FaucetMetrics::new().unwrap()),
    );

    Harness { engine, ledger, _dir: dir }
}

impl Harness {
    async fn request(&self, who: &str, amount: u128) -> Result<(), FaucetError> {
        let caller = Caller::new(
            vec![format!("{}-key", who)],
            vec![Capability::Disburse {
                faucet: account("faucet"),
                recipient: account(who),
                max_amount: Amount(amount),
            }],
        );
        self.engine
            .request(&caller, &account(who), &guard_of(who), Amount(amount))
            .await
            .map(|_| ())
    }

    async fn give_back(&self, who: &str, amount: u128) -> Result<(), FaucetError> {
        let caller = Caller::new(
            vec![format!("{}-key", who)],
            vec![Capability::Transfer {
                from: account(who),
                to: account("faucet"),
                max_amount: Amount(amount),
            }],
        );
        self.engine
            .return_funds(&caller, &account(who), Amount(amount))
            .await
            .map(|_| ())
    }

    fn admin(&self) -> Caller {
        Caller::new(vec![ADMIN_KEY.to_string()], vec![Capability::AdminLimit])
    }

    fn limits(&self, who: &str) -> LimitsView {
        self.engine.get_limits(&account(who)).unwrap()
    }
}

/// Walks scenarios A through D on one account.
#[tokio::test]
async fn test_request_raise_and_return_lifecycle() {
    let h = harness(ReturnPolicy::Floor);
    let alice = account("alice");

    // A: fresh account under default caps
    h.request("alice", 20).await.unwrap();
    assert_eq!(h.ledger.get_balance(&alice).await.unwrap(), Amount(20));
    assert_eq!(
        h.limits("alice"),
        LimitsView {
            account_limit: Amount(100),
            request_limit: Amount(20),
            account_limit_remaining: Amount(80),
        }
    );

    // B: above the per-request cap until it is raised
    let err = h.request("alice", 80).await.unwrap_err();
    assert!(matches!(err, FaucetError::RequestLimitExceeded { .. }));
    assert_eq!(h.limits("alice").account_limit_remaining, Amount(80));

    h.engine.set_request_limit(&h.admin(), &alice, Amount(200)).await.unwrap();
    h.request("alice", 80).await.unwrap();
    assert_eq!(h.ledger.get_balance(&alice).await.unwrap(), Amount(100));
    assert_eq!(h.limits("alice").account_limit_remaining, Amount::ZERO);

    // C: cumulative cap reached until it is raised
    let err = h.request("alice", 1).await.unwrap_err();
    assert!(matches!(err, FaucetError::AccountLimitExceeded { .. }));

    h.engine.set_account_limit(&h.admin(), &alice, Amount(200)).await.unwrap();
    h.request("alice", 100).await.unwrap();
    assert_eq!(h.ledger.get_balance(&alice).await.unwrap(), Amount(200));
    assert_eq!(h.limits("alice").account_limit_remaining, Amount::ZERO);

    // D: returning frees exactly the returned amount
    let before = h.limits("alice").account_limit_remaining;
    h.give_back("alice", 50).await.unwrap();
    let after = h.limits("alice").account_limit_remaining;
    assert_eq!(after, before.checked_add(Amount(50)).unwrap());
    assert_eq!(h.ledger.get_balance(&alice).await.unwrap(), Amount(150));

    let history = h.engine.events(&alice).unwrap();
    assert_eq!(history.len(), 6);
}

#[tokio::test]
async fn test_get_limits_is_stable_without_mutation() {
    let h = harness(ReturnPolicy::Floor);
    h.request("alice", 7).await.unwrap();

    let first = h.limits("alice");
    let second = h.limits("alice");
    assert_eq!(first, second);

    // Reading an unknown account does not create it
    assert_eq!(h.limits("nobody").account_limit_remaining, Amount(100));
    assert_eq!(h.engine.status().await.unwrap().statistics.accounts, 1);
}

#[tokio::test]
async fn test_over_return_boundary_floor() {
    let h = harness(ReturnPolicy::Floor);
    h.request("alice", 10).await.unwrap();
    h.ledger.fund(&account("alice"), Amount(5)).await.unwrap();

    // Exactly the outstanding spend
    h.give_back("alice", 10).await.unwrap();
    assert_eq!(h.limits("alice").account_limit_remaining, Amount(100));

    // Beyond it: accepted, spend stays at zero
    h.give_back("alice", 5).await.unwrap();
    assert_eq!(h.limits("alice").account_limit_remaining, Amount(100));
    assert_eq!(h.ledger.get_balance(&account("alice")).await.unwrap(), Amount::ZERO);
}

#[tokio::test]
async fn test_over_return_boundary_reject() {
    let h = harness(ReturnPolicy::Reject);
    h.request("alice", 10).await.unwrap();
    h.ledger.fund(&account("alice"), Amount(5)).await.unwrap();

    let err = h.give_back("alice", 11).await.unwrap_err();
    assert!(matches!(err, FaucetError::OverReturn { .. }));
    assert_eq!(h.ledger.get_balance(&account("alice")).await.unwrap(), Amount(15));
    assert_eq!(h.limits("alice").account_limit_remaining, Amount(90));

    h.give_back("alice", 10).await.unwrap();
    assert_eq!(h.limits("alice").account_limit_remaining, Amount(100));
}

#[tokio::test]
async fn test_spend_invariant_over_mixed_sequence() {
    let h = harness(ReturnPolicy::Floor);
    let steps: [(bool, u128); 10] = [
        (true, 20),
        (true, 20),
        (false, 15),
        (true, 20),
        (true, 20),
        (true, 20),
        (true, 20),
        (false, 60),
        (true, 20),
        (true, 5),
    ];

    for (is_request, amount) in steps {
        let spent_before = {
            let view = h.limits("alice");
            view.account_limit.checked_sub(view.account_limit_remaining).unwrap()
        };

        let result = if is_request {
            h.request("alice", amount).await
        } else {
            h.give_back("alice", amount).await
        };

        let view = h.limits("alice");
        let spent_after = view.account_limit.checked_sub(view.account_limit_remaining).unwrap();
        assert!(spent_after <= view.account_limit);

        match (is_request, result) {
            (true, Ok(())) => assert_eq!(spent_after, spent_before.checked_add(Amount(amount)).unwrap()),
            (true, Err(_)) => assert_eq!(spent_after, spent_before),
            (false, Ok(())) => assert_eq!(spent_after, spent_before.saturating_sub(Amount(amount))),
            (false, Err(_)) => assert_eq!(spent_after, spent_before),
        }
    }
}
