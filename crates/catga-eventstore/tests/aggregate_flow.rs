//! Aggregate lifecycle tests over the in-memory stores: command
//! execution with optimistic concurrency, snapshot-accelerated rebuild
//! and time-travel reconstruction.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use catga_core::CatgaError;
use catga_eventstore::{
    Aggregate, AggregateRepository, DomainEvent, InMemoryEventStore, InMemorySnapshotStore,
    SnapshotStore, TimeTravel,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
enum AccountEvent {
    Opened { initial_balance: i64 },
    Deposited { amount: i64 },
    Withdrawn { amount: i64 },
    Closed,
}

impl DomainEvent for AccountEvent {
    fn event_type(&self) -> &'static str {
        match self {
            AccountEvent::Opened { .. } => "AccountOpened",
            AccountEvent::Deposited { .. } => "Deposited",
            AccountEvent::Withdrawn { .. } => "Withdrawn",
            AccountEvent::Closed => "AccountClosed",
        }
    }
}

enum AccountCommand {
    Open { initial_balance: i64 },
    Deposit { amount: i64 },
    Withdraw { amount: i64 },
    Close,
}

#[derive(Debug, thiserror::Error)]
enum AccountError {
    #[error("account is closed")]
    Closed,
    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: i64, requested: i64 },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Account {
    balance: i64,
    is_open: bool,
    is_closed: bool,
}

impl Aggregate for Account {
    const TYPE: &'static str = "account";

    type Command = AccountCommand;
    type Event = AccountEvent;
    type Error = AccountError;

    fn execute(&self, command: AccountCommand) -> Result<Vec<AccountEvent>, AccountError> {
        if self.is_closed {
            return Err(AccountError::Closed);
        }
        match command {
            AccountCommand::Open { initial_balance } => {
                Ok(vec![AccountEvent::Opened { initial_balance }])
            }
            AccountCommand::Deposit { amount } => Ok(vec![AccountEvent::Deposited { amount }]),
            AccountCommand::Withdraw { amount } => {
                if amount > self.balance {
                    Err(AccountError::InsufficientFunds { balance: self.balance, requested: amount })
                } else {
                    Ok(vec![AccountEvent::Withdrawn { amount }])
                }
            }
            AccountCommand::Close => Ok(vec![AccountEvent::Closed]),
        }
    }

    fn apply(&mut self, event: &AccountEvent) {
        match event {
            AccountEvent::Opened { initial_balance } => {
                self.balance = *initial_balance;
                self.is_open = true;
            }
            AccountEvent::Deposited { amount } => self.balance += amount,
            AccountEvent::Withdrawn { amount } => self.balance -= amount,
            AccountEvent::Closed => self.is_closed = true,
        }
    }
}

async fn seed_account(repo: &AggregateRepository<Account>) {
    repo.execute("a-1", AccountCommand::Open { initial_balance: 1000 }).await.unwrap();
    repo.execute("a-1", AccountCommand::Deposit { amount: 500 }).await.unwrap();
    repo.execute("a-1", AccountCommand::Withdraw { amount: 200 }).await.unwrap();
    repo.execute("a-1", AccountCommand::Deposit { amount: 300 }).await.unwrap();
    repo.execute("a-1", AccountCommand::Close).await.unwrap();
}

#[tokio::test]
async fn execute_appends_and_load_rebuilds() {
    let events = Arc::new(InMemoryEventStore::new());
    let repo = AggregateRepository::<Account>::new(events.clone());

    seed_account(&repo).await;

    let (account, version) = repo.load("a-1").await.unwrap();
    assert_eq!(version, 4);
    assert_eq!(account.balance, 1600);
    assert!(account.is_closed);

    // Commands against a closed account are business failures.
    let err = repo.execute("a-1", AccountCommand::Deposit { amount: 1 }).await.unwrap_err();
    assert!(matches!(err, CatgaError::Handler { .. }));
}

#[tokio::test]
async fn missing_aggregate_loads_as_default_at_version_minus_one() {
    let events = Arc::new(InMemoryEventStore::new());
    let repo = AggregateRepository::<Account>::new(events);

    let (account, version) = repo.load("ghost").await.unwrap();
    assert_eq!(version, -1);
    assert!(!account.is_open);
}

#[tokio::test]
async fn snapshot_is_a_valid_fold_prefix() {
    let events = Arc::new(InMemoryEventStore::new());
    let snapshots = Arc::new(InMemorySnapshotStore::new());
    // Snapshot every 2 events so the seed takes several.
    let repo = AggregateRepository::<Account>::new(events.clone())
        .with_snapshots(snapshots.clone(), 2);

    seed_account(&repo).await;

    let snapshot = snapshots
        .load(&AggregateRepository::<Account>::stream_id("a-1"))
        .await
        .unwrap()
        .expect("snapshot should exist");
    assert!(snapshot.version >= 0);

    // Rebuilding through the snapshot equals rebuilding from scratch.
    let (with_snapshot, v1) = repo.load("a-1").await.unwrap();
    let bare_repo = AggregateRepository::<Account>::new(events);
    let (from_scratch, v2) = bare_repo.load("a-1").await.unwrap();

    assert_eq!(v1, v2);
    assert_eq!(with_snapshot.balance, from_scratch.balance);
    assert_eq!(with_snapshot.is_closed, from_scratch.is_closed);
}

#[tokio::test]
async fn time_travel_reconstructs_prior_states() {
    let events = Arc::new(InMemoryEventStore::new());
    let repo = AggregateRepository::<Account>::new(events.clone());
    seed_account(&repo).await;

    let travel = TimeTravel::<Account>::new(events);

    let at_2 = travel.state_at_version("a-1", 2).await.unwrap().unwrap();
    assert_eq!(at_2.balance, 1300);
    assert!(!at_2.is_closed);

    let at_4 = travel.state_at_version("a-1", 4).await.unwrap().unwrap();
    assert!(at_4.is_closed);
    assert_eq!(at_4.balance, 1600);

    assert!(travel.state_at_version("missing", 3).await.unwrap().is_none());

    let history = travel.version_history("a-1").await.unwrap();
    assert_eq!(history.len(), 5);
    assert_eq!(history[0].event_type, "AccountOpened");
    assert_eq!(history[4].event_type, "AccountClosed");
    assert_eq!(history.last().unwrap().version, 4);
}

#[tokio::test]
async fn time_travel_by_timestamp() {
    let events = Arc::new(InMemoryEventStore::new());
    let repo = AggregateRepository::<Account>::new(events.clone());
    seed_account(&repo).await;

    let travel = TimeTravel::<Account>::new(events);

    // Everything was appended before now.
    let latest = travel
        .state_at_timestamp("a-1", chrono::Utc::now())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.balance, 1600);
    assert!(latest.is_closed);

    // Nothing existed a day ago.
    let long_ago = chrono::Utc::now() - chrono::Duration::days(1);
    assert!(travel.state_at_timestamp("a-1", long_ago).await.unwrap().is_none());
}

#[tokio::test]
async fn compare_versions_reports_both_states_and_delta() {
    let events = Arc::new(InMemoryEventStore::new());
    let repo = AggregateRepository::<Account>::new(events.clone());
    seed_account(&repo).await;

    let travel = TimeTravel::<Account>::new(events);
    let comparison = travel.compare_versions("a-1", 1, 3).await.unwrap();

    assert_eq!(comparison.from_state.unwrap().balance, 1500);
    assert_eq!(comparison.to_state.unwrap().balance, 1600);
    let types: Vec<&str> =
        comparison.events_between.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, vec!["Withdrawn", "Deposited"]);
}

#[tokio::test]
async fn concurrent_time_travel_queries_do_not_interfere() {
    let events = Arc::new(InMemoryEventStore::new());
    let repo = AggregateRepository::<Account>::new(events.clone());
    seed_account(&repo).await;

    let travel = Arc::new(TimeTravel::<Account>::new(events));
    let tasks: Vec<_> = (0..4u64)
        .map(|v| {
            let travel = travel.clone();
            tokio::spawn(async move {
                travel.state_at_version("a-1", v).await.unwrap().unwrap().balance
            })
        })
        .collect();

    let mut balances = Vec::new();
    for task in tasks {
        balances.push(task.await.unwrap());
    }
    assert_eq!(balances, vec![1000, 1500, 1300, 1600]);
}
