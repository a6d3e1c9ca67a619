//! Append-only balance ledger.
//!
//! [`apply_entries`] is the only code path that changes a balance. It locks
//! every touched account, refuses deactivated ones, checks that no balance
//! would go negative, and only then writes the entries and the new balances. The caller's transaction
//! decides when all of that becomes visible.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use hikopo_storage::models::{AccountId, LedgerEntry, ReasonCode};
use hikopo_storage::{Store, StoreTx};

use crate::context::Context;
use crate::error::{LedgerError, LedgerResult};
use crate::principal::Principal;
use crate::runner::run_bounded;

/// A balance movement not yet written.
#[derive(Debug, Clone, Copy)]
pub struct EntryDraft {
    pub account_id: AccountId,
    pub delta: i64,
    pub reason: ReasonCode,
}

impl EntryDraft {
    pub fn credit(account_id: AccountId, amount: i64, reason: ReasonCode) -> Self {
        Self {
            account_id,
            delta: amount,
            reason,
        }
    }

    pub fn debit(account_id: AccountId, amount: i64, reason: ReasonCode) -> Self {
        Self {
            account_id,
            delta: -amount,
            reason,
        }
    }
}

/// Apply a set of entries sharing `correlation_id` inside `tx`.
///
/// Returns the resulting balance of every touched account. Fails before
/// writing anything with `AccountInactive` if a touched account is
/// deactivated, or `InsufficientFunds` if any balance would drop below zero.
pub async fn apply_entries<X: StoreTx>(
    tx: &mut X,
    drafts: &[EntryDraft],
    correlation_id: Uuid,
    idempotency_key: Option<&str>,
    now: DateTime<Utc>,
) -> LedgerResult<HashMap<AccountId, i64>> {
    if drafts.is_empty() {
        return Ok(HashMap::new());
    }
    if let Some(zero) = drafts.iter().find(|d| d.delta == 0) {
        return Err(LedgerError::InvalidAmount(zero.delta));
    }

    let mut ids: Vec<AccountId> = drafts.iter().map(|d| d.account_id).collect();
    ids.sort();
    ids.dedup();

    let locked = tx.lock_accounts(&ids).await?;
    let before: HashMap<AccountId, i64> = locked.iter().map(|a| (a.id, a.balance)).collect();
    if let Some(missing) = ids.iter().find(|id| !before.contains_key(id)) {
        return Err(LedgerError::AccountNotFound(*missing));
    }
    if let Some(inactive) = locked.iter().find(|a| !a.active) {
        return Err(LedgerError::AccountInactive(inactive.id));
    }

    let mut after = before.clone();
    for draft in drafts {
        let balance = after
            .get_mut(&draft.account_id)
            .ok_or(LedgerError::AccountNotFound(draft.account_id))?;
        *balance = balance
            .checked_add(draft.delta)
            .ok_or(LedgerError::InvalidAmount(draft.delta))?;
    }

    for id in &ids {
        let (was, now_balance) = (before[id], after[id]);
        if now_balance < 0 {
            return Err(LedgerError::InsufficientFunds {
                account: *id,
                available: was,
                required: was - now_balance,
            });
        }
    }

    let entries: Vec<LedgerEntry> = drafts
        .iter()
        .map(|d| LedgerEntry {
            id: Uuid::new_v4(),
            account_id: d.account_id,
            delta: d.delta,
            reason_code: d.reason,
            correlation_id,
            idempotency_key: idempotency_key.map(str::to_string),
            created_at: now,
        })
        .collect();
    tx.insert_ledger_entries(&entries).await?;

    for id in &ids {
        tx.update_balance(*id, after[id], now).await?;
    }

    Ok(after)
}

/// Proof that an account's balance equals the sum of its entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub account_id: AccountId,
    pub balance: i64,
    pub ledger_sum: i64,
    pub entry_count: i64,
    pub consistent: bool,
}

/// Read side of the ledger plus an admin-only entry point for adjustments.
pub struct LedgerStore<S: Store> {
    ctx: Arc<Context<S>>,
}

impl<S: Store> LedgerStore<S> {
    pub fn new(ctx: Arc<Context<S>>) -> Self {
        Self { ctx }
    }

    /// Apply `drafts` atomically in a transaction of their own. Admin only.
    pub async fn apply(
        &self,
        principal: &Principal,
        drafts: &[EntryDraft],
        correlation_id: Uuid,
    ) -> LedgerResult<HashMap<AccountId, i64>> {
        principal.require_admin()?;
        run_bounded(&self.ctx.policy, "apply_entries", move || async move {
            let mut tx = self.ctx.store.begin().await?;
            let balances =
                apply_entries(&mut tx, drafts, correlation_id, None, self.ctx.now()).await?;
            tx.commit().await?;
            Ok(balances)
        })
        .await
    }

    /// Committed balance. A failed read is an error, never zero.
    pub async fn balance(&self, principal: &Principal, account: AccountId) -> LedgerResult<i64> {
        principal.require_read(account)?;
        run_bounded(&self.ctx.policy, "balance", move || async move {
            let mut tx = self.ctx.store.begin().await?;
            let found = tx
                .get_account(account)
                .await?
                .ok_or(LedgerError::AccountNotFound(account))?;
            Ok(found.balance)
        })
        .await
    }

    pub async fn history(
        &self,
        principal: &Principal,
        account: AccountId,
        limit: i64,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        principal.require_read(account)?;
        let limit = limit.clamp(1, 500);
        run_bounded(&self.ctx.policy, "history", move || async move {
            let mut tx = self.ctx.store.begin().await?;
            if tx.get_account(account).await?.is_none() {
                return Err(LedgerError::AccountNotFound(account));
            }
            Ok(tx.ledger_entries(account, limit).await?)
        })
        .await
    }

    pub async fn reconcile(
        &self,
        principal: &Principal,
        account: AccountId,
    ) -> LedgerResult<Reconciliation> {
        principal.require_read(account)?;
        run_bounded(&self.ctx.policy, "reconcile", move || async move {
            let mut tx = self.ctx.store.begin().await?;
            let found = tx
                .lock_accounts(&[account])
                .await?
                .pop()
                .ok_or(LedgerError::AccountNotFound(account))?;
            let summary = tx.ledger_summary(account).await?;
            let report = Reconciliation {
                account_id: account,
                balance: found.balance,
                ledger_sum: summary.total,
                entry_count: summary.entry_count,
                consistent: found.balance == summary.total,
            };
            if !report.consistent {
                tracing::error!(
                    account = %account,
                    balance = report.balance,
                    ledger_sum = report.ledger_sum,
                    "Balance does not match ledger"
                );
            }
            Ok(report)
        })
        .await
    }
}
