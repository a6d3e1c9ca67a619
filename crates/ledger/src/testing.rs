//! Fixtures shared by the unit tests.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use hikopo_storage::models::{Account, AccountId, ReasonCode};
use hikopo_storage::{MemoryStore, Store, StoreTx};

use crate::clock::Clock;
use crate::context::Context;
use crate::ledger::{EntryDraft, apply_entries};
use crate::pin::PinHasher;
use crate::runner::TxPolicy;

pub(crate) fn test_context(store: MemoryStore) -> Arc<Context<MemoryStore>> {
    Arc::new(base(store))
}

pub(crate) fn test_context_with_clock(
    store: MemoryStore,
    clock: Arc<dyn Clock>,
) -> Arc<Context<MemoryStore>> {
    Arc::new(base(store).with_clock(clock))
}

fn base(store: MemoryStore) -> Context<MemoryStore> {
    Context::new(Arc::new(store))
        .with_policy(TxPolicy {
            deadline: Duration::from_secs(10),
            max_attempts: 3,
            backoff: Duration::from_millis(1),
        })
        .with_pin_hasher(PinHasher::low_cost())
}

pub(crate) async fn open(ctx: &Context<MemoryStore>, code: &str) -> AccountId {
    open_with(ctx, code, None).await
}

pub(crate) async fn open_with(
    ctx: &Context<MemoryStore>,
    code: &str,
    affiliation: Option<&str>,
) -> AccountId {
    let mut account = Account::new(Uuid::new_v4(), code, Utc::now());
    account.affiliation = affiliation.map(str::to_string);
    let mut tx = ctx.store.begin().await.unwrap();
    tx.insert_account(&account).await.unwrap();
    tx.commit().await.unwrap();
    account.id
}

/// Credit points through the ledger so the balance stays backed by entries.
pub(crate) async fn fund(ctx: &Context<MemoryStore>, account: AccountId, amount: i64) {
    let mut tx = ctx.store.begin().await.unwrap();
    apply_entries(
        &mut tx,
        &[EntryDraft::credit(account, amount, ReasonCode::MissionReward)],
        Uuid::new_v4(),
        None,
        Utc::now(),
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();
}

pub(crate) async fn deactivate(ctx: &Context<MemoryStore>, account: AccountId) {
    let mut tx = ctx.store.begin().await.unwrap();
    tx.set_account_active(account, false, Utc::now()).await.unwrap();
    tx.commit().await.unwrap();
}
