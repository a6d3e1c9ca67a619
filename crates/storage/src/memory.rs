//! In-memory [`Store`] for tests and local development.
//!
//! A transaction holds the store's single async mutex for its whole life and
//! works on a staged copy of the state; `commit` swaps the copy in. This makes
//! every transaction serializable, which is what the Postgres backend
//! achieves with row locks. Named fail points let tests inject a storage
//! failure in the middle of a unit of work.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::{StorageError, StorageResult};
use crate::models::*;
use crate::store::{Store, StoreTx};

/// A write that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    InsertLedgerEntries,
    UpdateBalance,
    InsertSubmission,
    ReviewSubmission,
    InsertStamp,
    InsertVote,
    MarkVerified,
    InsertRedemption,
    InsertPayout,
    TransitionPayout,
    Commit,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    accounts: BTreeMap<AccountId, Account>,
    ledger: Vec<LedgerEntry>,
    idempotency: HashMap<String, Option<serde_json::Value>>,
    redemptions: HashMap<AccountId, ReferralRedemption>,
    missions: HashMap<Uuid, Mission>,
    submissions: BTreeMap<Uuid, MissionSubmission>,
    shops: HashMap<Uuid, Shop>,
    stamps: Vec<StampGrant>,
    votes: Vec<VerificationVote>,
    payouts: BTreeMap<Uuid, PayoutRequest>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    fail_points: Arc<std::sync::Mutex<HashSet<FailPoint>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next write at `point` fail with a backend error.
    pub fn fail_at(&self, point: FailPoint) {
        self.fail_points
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(point);
    }

    /// Committed view of an account.
    pub async fn account(&self, id: AccountId) -> Option<Account> {
        self.state.lock().await.accounts.get(&id).cloned()
    }

    /// Committed ledger entries for an account, oldest first.
    pub async fn entries_for(&self, id: AccountId) -> Vec<LedgerEntry> {
        self.state
            .lock()
            .await
            .ledger
            .iter()
            .filter(|e| e.account_id == id)
            .cloned()
            .collect()
    }

    /// Every committed ledger entry, oldest first.
    pub async fn all_entries(&self) -> Vec<LedgerEntry> {
        self.state.lock().await.ledger.clone()
    }

    pub async fn submission(&self, id: Uuid) -> Option<MissionSubmission> {
        self.state.lock().await.submissions.get(&id).cloned()
    }

    pub async fn stamp_count(&self) -> usize {
        self.state.lock().await.stamps.len()
    }

    pub async fn vote_count(&self) -> usize {
        self.state.lock().await.votes.len()
    }

    pub async fn payout(&self, id: Uuid) -> Option<PayoutRequest> {
        self.state.lock().await.payouts.get(&id).cloned()
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    staged: MemoryState,
    fail_points: Arc<std::sync::Mutex<HashSet<FailPoint>>>,
}

impl MemoryTx {
    fn trip(&self, point: FailPoint) -> StorageResult<()> {
        let tripped = self
            .fail_points
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&point);
        if tripped {
            return Err(StorageError::Backend(format!("injected failure at {point:?}")));
        }
        Ok(())
    }

    fn account_mut(&mut self, id: AccountId) -> StorageResult<&mut Account> {
        self.staged
            .accounts
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("account {id}")))
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> StorageResult<MemoryTx> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(MemoryTx {
            guard,
            staged,
            fail_points: self.fail_points.clone(),
        })
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn insert_account(&mut self, account: &Account) -> StorageResult<()> {
        let taken = self
            .staged
            .accounts
            .values()
            .any(|a| a.id == account.id || a.referral_code == account.referral_code);
        if taken {
            return Err(StorageError::Duplicate("accounts_referral_code_key".into()));
        }
        self.staged.accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn get_account(&mut self, id: AccountId) -> StorageResult<Option<Account>> {
        Ok(self.staged.accounts.get(&id).cloned())
    }

    async fn lock_accounts(&mut self, ids: &[AccountId]) -> StorageResult<Vec<Account>> {
        // BTreeMap iteration is already in id order.
        Ok(self
            .staged
            .accounts
            .values()
            .filter(|a| ids.contains(&a.id))
            .cloned()
            .collect())
    }

    async fn find_account_by_code(&mut self, code: &str) -> StorageResult<Option<Account>> {
        Ok(self
            .staged
            .accounts
            .values()
            .find(|a| a.active && a.referral_code == code)
            .cloned())
    }

    async fn update_balance(
        &mut self,
        id: AccountId,
        balance: i64,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.trip(FailPoint::UpdateBalance)?;
        if balance < 0 {
            return Err(StorageError::Backend(
                "accounts_balance_check: balance must be >= 0".into(),
            ));
        }
        let account = self.account_mut(id)?;
        account.balance = balance;
        account.updated_at = at;
        Ok(())
    }

    async fn mark_verified(&mut self, id: AccountId, at: DateTime<Utc>) -> StorageResult<()> {
        self.trip(FailPoint::MarkVerified)?;
        let account = self.account_mut(id)?;
        if !account.verified {
            account.verified = true;
            account.updated_at = at;
        }
        Ok(())
    }

    async fn set_payout_pin_hash(
        &mut self,
        id: AccountId,
        hash: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let account = self.account_mut(id)?;
        account.payout_pin_hash = Some(hash.to_string());
        account.updated_at = at;
        Ok(())
    }

    async fn set_bank_details(
        &mut self,
        id: AccountId,
        details: &BankDetails,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let account = self.account_mut(id)?;
        account.bank_details = Some(Json(details.clone()));
        account.updated_at = at;
        Ok(())
    }

    async fn set_account_active(
        &mut self,
        id: AccountId,
        active: bool,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let account = self.account_mut(id)?;
        account.active = active;
        account.updated_at = at;
        Ok(())
    }

    async fn insert_ledger_entries(&mut self, entries: &[LedgerEntry]) -> StorageResult<()> {
        self.trip(FailPoint::InsertLedgerEntries)?;
        if let Some(orphan) = entries
            .iter()
            .find(|e| !self.staged.accounts.contains_key(&e.account_id))
        {
            return Err(StorageError::Backend(format!(
                "ledger_entries_account_id_fkey: {}",
                orphan.account_id
            )));
        }
        self.staged.ledger.extend_from_slice(entries);
        Ok(())
    }

    async fn ledger_summary(&mut self, account: AccountId) -> StorageResult<LedgerSummary> {
        let (total, entry_count) = self
            .staged
            .ledger
            .iter()
            .filter(|e| e.account_id == account)
            .fold((0i64, 0i64), |(sum, n), e| (sum + e.delta, n + 1));
        Ok(LedgerSummary { total, entry_count })
    }

    async fn ledger_entries(
        &mut self,
        account: AccountId,
        limit: i64,
    ) -> StorageResult<Vec<LedgerEntry>> {
        Ok(self
            .staged
            .ledger
            .iter()
            .rev()
            .filter(|e| e.account_id == account)
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn reserve_idempotency_key(
        &mut self,
        key: &str,
    ) -> StorageResult<Option<serde_json::Value>> {
        match self.staged.idempotency.get(key) {
            Some(stored) => Ok(stored.clone()),
            None => {
                self.staged.idempotency.insert(key.to_string(), None);
                Ok(None)
            }
        }
    }

    async fn store_idempotent_result(
        &mut self,
        key: &str,
        result: &serde_json::Value,
    ) -> StorageResult<()> {
        self.staged
            .idempotency
            .insert(key.to_string(), Some(result.clone()));
        Ok(())
    }

    async fn get_redemption(
        &mut self,
        referee: AccountId,
    ) -> StorageResult<Option<ReferralRedemption>> {
        Ok(self.staged.redemptions.get(&referee).cloned())
    }

    async fn insert_redemption(&mut self, redemption: &ReferralRedemption) -> StorageResult<()> {
        self.trip(FailPoint::InsertRedemption)?;
        if self.staged.redemptions.contains_key(&redemption.referee_id) {
            return Err(StorageError::Duplicate("referral_redemptions_pkey".into()));
        }
        self.staged
            .redemptions
            .insert(redemption.referee_id, redemption.clone());
        Ok(())
    }

    async fn insert_mission(&mut self, mission: &Mission) -> StorageResult<()> {
        self.staged.missions.insert(mission.id, mission.clone());
        Ok(())
    }

    async fn get_mission(&mut self, id: Uuid) -> StorageResult<Option<Mission>> {
        Ok(self.staged.missions.get(&id).cloned())
    }

    async fn find_submission(
        &mut self,
        user: AccountId,
        mission: Uuid,
    ) -> StorageResult<Option<MissionSubmission>> {
        Ok(self
            .staged
            .submissions
            .values()
            .find(|s| s.user_id == user && s.mission_id == mission)
            .cloned())
    }

    async fn lock_submission(&mut self, id: Uuid) -> StorageResult<Option<MissionSubmission>> {
        Ok(self.staged.submissions.get(&id).cloned())
    }

    async fn insert_submission(&mut self, submission: &MissionSubmission) -> StorageResult<()> {
        self.trip(FailPoint::InsertSubmission)?;
        let duplicate = self
            .staged
            .submissions
            .values()
            .any(|s| s.user_id == submission.user_id && s.mission_id == submission.mission_id);
        if duplicate {
            return Err(StorageError::Duplicate("one_submission_per_mission".into()));
        }
        self.staged
            .submissions
            .insert(submission.id, submission.clone());
        Ok(())
    }

    async fn review_submission(
        &mut self,
        id: Uuid,
        review: &SubmissionReview,
    ) -> StorageResult<()> {
        self.trip(FailPoint::ReviewSubmission)?;
        let submission = self
            .staged
            .submissions
            .get_mut(&id)
            .filter(|s| s.status == MissionStatus::Pending)
            .ok_or_else(|| StorageError::NotFound(format!("pending submission {id}")))?;
        submission.status = review.status;
        submission.reviewer_id = Some(review.reviewer_id);
        submission.reviewer_comment = review.reviewer_comment.clone();
        submission.reviewed_at = Some(review.reviewed_at);
        Ok(())
    }

    async fn pending_submissions(&mut self, limit: i64) -> StorageResult<Vec<MissionSubmission>> {
        let mut pending: Vec<_> = self
            .staged
            .submissions
            .values()
            .filter(|s| s.status == MissionStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|s| s.created_at);
        pending.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(pending)
    }

    async fn insert_shop(&mut self, shop: &Shop) -> StorageResult<()> {
        self.staged.shops.insert(shop.id, shop.clone());
        Ok(())
    }

    async fn get_shop(&mut self, id: Uuid) -> StorageResult<Option<Shop>> {
        Ok(self.staged.shops.get(&id).cloned())
    }

    async fn latest_stamp(
        &mut self,
        user: AccountId,
        shop: Uuid,
    ) -> StorageResult<Option<StampGrant>> {
        Ok(self
            .staged
            .stamps
            .iter()
            .filter(|s| s.user_id == user && s.shop_id == shop)
            .max_by_key(|s| s.granted_at)
            .cloned())
    }

    async fn insert_stamp(&mut self, stamp: &StampGrant) -> StorageResult<()> {
        self.trip(FailPoint::InsertStamp)?;
        self.staged.stamps.push(stamp.clone());
        Ok(())
    }

    async fn count_stamps(&mut self, user: AccountId, shop: Uuid) -> StorageResult<i64> {
        let count = self
            .staged
            .stamps
            .iter()
            .filter(|s| s.user_id == user && s.shop_id == shop)
            .count();
        Ok(count as i64)
    }

    async fn has_vote(&mut self, validator: AccountId, target: AccountId) -> StorageResult<bool> {
        Ok(self
            .staged
            .votes
            .iter()
            .any(|v| v.validator_id == validator && v.target_id == target))
    }

    async fn insert_vote(&mut self, vote: &VerificationVote) -> StorageResult<()> {
        self.trip(FailPoint::InsertVote)?;
        if self.has_vote(vote.validator_id, vote.target_id).await? {
            return Err(StorageError::Duplicate("verification_votes_pkey".into()));
        }
        self.staged.votes.push(vote.clone());
        Ok(())
    }

    async fn count_votes(&mut self, target: AccountId) -> StorageResult<i64> {
        let count = self
            .staged
            .votes
            .iter()
            .filter(|v| v.target_id == target)
            .count();
        Ok(count as i64)
    }

    async fn locked_payout_total(&mut self, account: AccountId) -> StorageResult<i64> {
        Ok(self
            .staged
            .payouts
            .values()
            .filter(|p| p.account_id == account && p.status.locks_funds())
            .map(|p| p.amount)
            .sum())
    }

    async fn insert_payout(&mut self, request: &PayoutRequest) -> StorageResult<()> {
        self.trip(FailPoint::InsertPayout)?;
        self.staged.payouts.insert(request.id, request.clone());
        Ok(())
    }

    async fn lock_payout(&mut self, id: Uuid) -> StorageResult<Option<PayoutRequest>> {
        Ok(self.staged.payouts.get(&id).cloned())
    }

    async fn transition_payout(
        &mut self,
        id: Uuid,
        transition: &PayoutTransition,
    ) -> StorageResult<()> {
        self.trip(FailPoint::TransitionPayout)?;
        let request = self
            .staged
            .payouts
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("payout {id}")))?;
        request.status = transition.status;
        request.processed_by = Some(transition.processed_by);
        request.processed_at = Some(transition.processed_at);
        request.reject_reason = transition.reject_reason.clone();
        Ok(())
    }

    async fn payouts_for_account(
        &mut self,
        account: AccountId,
    ) -> StorageResult<Vec<PayoutRequest>> {
        let mut requests: Vec<_> = self
            .staged
            .payouts
            .values()
            .filter(|p| p.account_id == account)
            .cloned()
            .collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(requests)
    }

    async fn commit(mut self) -> StorageResult<()> {
        self.trip(FailPoint::Commit)?;
        *self.guard = std::mem::take(&mut self.staged);
        Ok(())
    }
}
