//! Postgres-backed [`Store`]: one `sqlx::Transaction` per unit of work.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::error::StorageResult;
use crate::models::*;
use crate::repos;
use crate::store::{Store, StoreTx};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Open transaction. Dropping it without `commit` rolls back.
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl Store for PgStore {
    type Tx = PgTx;

    async fn begin(&self) -> StorageResult<PgTx> {
        let tx = self.pool.begin().await?;
        Ok(PgTx { tx })
    }
}

#[async_trait]
impl StoreTx for PgTx {
    async fn insert_account(&mut self, account: &Account) -> StorageResult<()> {
        Ok(repos::insert_account(&mut *self.tx, account).await?)
    }

    async fn get_account(&mut self, id: AccountId) -> StorageResult<Option<Account>> {
        Ok(repos::get_account(&mut *self.tx, id).await?)
    }

    async fn lock_accounts(&mut self, ids: &[AccountId]) -> StorageResult<Vec<Account>> {
        Ok(repos::lock_accounts(&mut *self.tx, ids).await?)
    }

    async fn find_account_by_code(&mut self, code: &str) -> StorageResult<Option<Account>> {
        Ok(repos::find_account_by_code(&mut *self.tx, code).await?)
    }

    async fn update_balance(
        &mut self,
        id: AccountId,
        balance: i64,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        Ok(repos::update_balance(&mut *self.tx, id, balance, at).await?)
    }

    async fn mark_verified(&mut self, id: AccountId, at: DateTime<Utc>) -> StorageResult<()> {
        Ok(repos::mark_verified(&mut *self.tx, id, at).await?)
    }

    async fn set_payout_pin_hash(
        &mut self,
        id: AccountId,
        hash: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        Ok(repos::set_payout_pin_hash(&mut *self.tx, id, hash, at).await?)
    }

    async fn set_bank_details(
        &mut self,
        id: AccountId,
        details: &BankDetails,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        Ok(repos::set_bank_details(&mut *self.tx, id, details, at).await?)
    }

    async fn set_account_active(
        &mut self,
        id: AccountId,
        active: bool,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        Ok(repos::set_account_active(&mut *self.tx, id, active, at).await?)
    }

    async fn insert_ledger_entries(&mut self, entries: &[LedgerEntry]) -> StorageResult<()> {
        Ok(repos::insert_ledger_entries(&mut *self.tx, entries).await?)
    }

    async fn ledger_summary(&mut self, account: AccountId) -> StorageResult<LedgerSummary> {
        Ok(repos::get_ledger_summary(&mut *self.tx, account).await?)
    }

    async fn ledger_entries(
        &mut self,
        account: AccountId,
        limit: i64,
    ) -> StorageResult<Vec<LedgerEntry>> {
        Ok(repos::get_account_entries(&mut *self.tx, account, limit).await?)
    }

    async fn reserve_idempotency_key(
        &mut self,
        key: &str,
    ) -> StorageResult<Option<serde_json::Value>> {
        if repos::reserve_idempotency_key(&mut *self.tx, key).await? {
            return Ok(None);
        }
        Ok(repos::get_idempotent_result(&mut *self.tx, key).await?)
    }

    async fn store_idempotent_result(
        &mut self,
        key: &str,
        result: &serde_json::Value,
    ) -> StorageResult<()> {
        Ok(repos::store_idempotent_result(&mut *self.tx, key, result).await?)
    }

    async fn get_redemption(
        &mut self,
        referee: AccountId,
    ) -> StorageResult<Option<ReferralRedemption>> {
        Ok(repos::get_redemption(&mut *self.tx, referee).await?)
    }

    async fn insert_redemption(&mut self, redemption: &ReferralRedemption) -> StorageResult<()> {
        Ok(repos::insert_redemption(&mut *self.tx, redemption).await?)
    }

    async fn insert_mission(&mut self, mission: &Mission) -> StorageResult<()> {
        Ok(repos::insert_mission(&mut *self.tx, mission).await?)
    }

    async fn get_mission(&mut self, id: Uuid) -> StorageResult<Option<Mission>> {
        Ok(repos::get_mission(&mut *self.tx, id).await?)
    }

    async fn find_submission(
        &mut self,
        user: AccountId,
        mission: Uuid,
    ) -> StorageResult<Option<MissionSubmission>> {
        Ok(repos::find_submission(&mut *self.tx, user, mission).await?)
    }

    async fn lock_submission(&mut self, id: Uuid) -> StorageResult<Option<MissionSubmission>> {
        Ok(repos::lock_submission(&mut *self.tx, id).await?)
    }

    async fn insert_submission(&mut self, submission: &MissionSubmission) -> StorageResult<()> {
        Ok(repos::insert_submission(&mut *self.tx, submission).await?)
    }

    async fn review_submission(
        &mut self,
        id: Uuid,
        review: &SubmissionReview,
    ) -> StorageResult<()> {
        Ok(repos::review_submission(&mut *self.tx, id, review).await?)
    }

    async fn pending_submissions(&mut self, limit: i64) -> StorageResult<Vec<MissionSubmission>> {
        Ok(repos::get_pending_submissions(&mut *self.tx, limit).await?)
    }

    async fn insert_shop(&mut self, shop: &Shop) -> StorageResult<()> {
        Ok(repos::insert_shop(&mut *self.tx, shop).await?)
    }

    async fn get_shop(&mut self, id: Uuid) -> StorageResult<Option<Shop>> {
        Ok(repos::get_shop(&mut *self.tx, id).await?)
    }

    async fn latest_stamp(
        &mut self,
        user: AccountId,
        shop: Uuid,
    ) -> StorageResult<Option<StampGrant>> {
        Ok(repos::get_latest_stamp(&mut *self.tx, user, shop).await?)
    }

    async fn insert_stamp(&mut self, stamp: &StampGrant) -> StorageResult<()> {
        Ok(repos::insert_stamp(&mut *self.tx, stamp).await?)
    }

    async fn count_stamps(&mut self, user: AccountId, shop: Uuid) -> StorageResult<i64> {
        Ok(repos::count_stamps(&mut *self.tx, user, shop).await?)
    }

    async fn has_vote(&mut self, validator: AccountId, target: AccountId) -> StorageResult<bool> {
        Ok(repos::vote_exists(&mut *self.tx, validator, target).await?)
    }

    async fn insert_vote(&mut self, vote: &VerificationVote) -> StorageResult<()> {
        Ok(repos::insert_vote(&mut *self.tx, vote).await?)
    }

    async fn count_votes(&mut self, target: AccountId) -> StorageResult<i64> {
        Ok(repos::count_votes(&mut *self.tx, target).await?)
    }

    async fn locked_payout_total(&mut self, account: AccountId) -> StorageResult<i64> {
        Ok(repos::get_locked_payout_total(&mut *self.tx, account).await?)
    }

    async fn insert_payout(&mut self, request: &PayoutRequest) -> StorageResult<()> {
        Ok(repos::insert_payout(&mut *self.tx, request).await?)
    }

    async fn lock_payout(&mut self, id: Uuid) -> StorageResult<Option<PayoutRequest>> {
        Ok(repos::lock_payout(&mut *self.tx, id).await?)
    }

    async fn transition_payout(
        &mut self,
        id: Uuid,
        transition: &PayoutTransition,
    ) -> StorageResult<()> {
        Ok(repos::transition_payout(&mut *self.tx, id, transition).await?)
    }

    async fn payouts_for_account(
        &mut self,
        account: AccountId,
    ) -> StorageResult<Vec<PayoutRequest>> {
        Ok(repos::get_payouts_for_account(&mut *self.tx, account).await?)
    }

    async fn commit(self) -> StorageResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
