//! Unit-of-work traits every backend implements.
//!
//! A [`StoreTx`] is one atomic transaction. Everything written through it
//! becomes visible on [`StoreTx::commit`]; dropping it without committing
//! discards every write. The workflow services never issue two transactions
//! for one business event.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StorageResult;
use crate::models::*;

/// Entry point to a transactional datastore.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    type Tx: StoreTx + 'static;

    /// Open a new unit of work.
    async fn begin(&self) -> StorageResult<Self::Tx>;
}

/// Operations available inside one transaction.
#[async_trait]
pub trait StoreTx: Send {
    // ── Accounts ──

    async fn insert_account(&mut self, account: &Account) -> StorageResult<()>;

    async fn get_account(&mut self, id: AccountId) -> StorageResult<Option<Account>>;

    /// Lock the given accounts for the rest of the transaction, in ascending
    /// id order. Unknown ids are simply absent from the result.
    async fn lock_accounts(&mut self, ids: &[AccountId]) -> StorageResult<Vec<Account>>;

    /// Resolve an active account by its referral code.
    async fn find_account_by_code(&mut self, code: &str) -> StorageResult<Option<Account>>;

    async fn update_balance(
        &mut self,
        id: AccountId,
        balance: i64,
        at: DateTime<Utc>,
    ) -> StorageResult<()>;

    async fn mark_verified(&mut self, id: AccountId, at: DateTime<Utc>) -> StorageResult<()>;

    async fn set_payout_pin_hash(
        &mut self,
        id: AccountId,
        hash: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<()>;

    async fn set_bank_details(
        &mut self,
        id: AccountId,
        details: &BankDetails,
        at: DateTime<Utc>,
    ) -> StorageResult<()>;

    async fn set_account_active(
        &mut self,
        id: AccountId,
        active: bool,
        at: DateTime<Utc>,
    ) -> StorageResult<()>;

    // ── Ledger ──

    async fn insert_ledger_entries(&mut self, entries: &[LedgerEntry]) -> StorageResult<()>;

    async fn ledger_summary(&mut self, account: AccountId) -> StorageResult<LedgerSummary>;

    /// Most recent entries first.
    async fn ledger_entries(
        &mut self,
        account: AccountId,
        limit: i64,
    ) -> StorageResult<Vec<LedgerEntry>>;

    // ── Idempotency ──

    /// Claim `key`. Returns `None` when the key is new, or the stored result
    /// of the transaction that claimed it first.
    async fn reserve_idempotency_key(
        &mut self,
        key: &str,
    ) -> StorageResult<Option<serde_json::Value>>;

    async fn store_idempotent_result(
        &mut self,
        key: &str,
        result: &serde_json::Value,
    ) -> StorageResult<()>;

    // ── Referral ──

    async fn get_redemption(
        &mut self,
        referee: AccountId,
    ) -> StorageResult<Option<ReferralRedemption>>;

    async fn insert_redemption(&mut self, redemption: &ReferralRedemption) -> StorageResult<()>;

    // ── Missions ──

    async fn insert_mission(&mut self, mission: &Mission) -> StorageResult<()>;

    async fn get_mission(&mut self, id: Uuid) -> StorageResult<Option<Mission>>;

    async fn find_submission(
        &mut self,
        user: AccountId,
        mission: Uuid,
    ) -> StorageResult<Option<MissionSubmission>>;

    /// Fetch a submission and lock it against concurrent review.
    async fn lock_submission(&mut self, id: Uuid) -> StorageResult<Option<MissionSubmission>>;

    async fn insert_submission(&mut self, submission: &MissionSubmission) -> StorageResult<()>;

    async fn review_submission(&mut self, id: Uuid, review: &SubmissionReview)
    -> StorageResult<()>;

    /// Oldest pending submissions first.
    async fn pending_submissions(&mut self, limit: i64) -> StorageResult<Vec<MissionSubmission>>;

    // ── Shops & stamps ──

    async fn insert_shop(&mut self, shop: &Shop) -> StorageResult<()>;

    async fn get_shop(&mut self, id: Uuid) -> StorageResult<Option<Shop>>;

    async fn latest_stamp(
        &mut self,
        user: AccountId,
        shop: Uuid,
    ) -> StorageResult<Option<StampGrant>>;

    async fn insert_stamp(&mut self, stamp: &StampGrant) -> StorageResult<()>;

    async fn count_stamps(&mut self, user: AccountId, shop: Uuid) -> StorageResult<i64>;

    // ── Verification ──

    async fn has_vote(&mut self, validator: AccountId, target: AccountId) -> StorageResult<bool>;

    async fn insert_vote(&mut self, vote: &VerificationVote) -> StorageResult<()>;

    async fn count_votes(&mut self, target: AccountId) -> StorageResult<i64>;

    // ── Payouts ──

    /// Sum of amounts in `pending` or `approved` requests for `account`.
    async fn locked_payout_total(&mut self, account: AccountId) -> StorageResult<i64>;

    async fn insert_payout(&mut self, request: &PayoutRequest) -> StorageResult<()>;

    async fn lock_payout(&mut self, id: Uuid) -> StorageResult<Option<PayoutRequest>>;

    async fn transition_payout(
        &mut self,
        id: Uuid,
        transition: &PayoutTransition,
    ) -> StorageResult<()>;

    async fn payouts_for_account(&mut self, account: AccountId)
    -> StorageResult<Vec<PayoutRequest>>;

    // ── Lifecycle ──

    async fn commit(self) -> StorageResult<()>;
}
