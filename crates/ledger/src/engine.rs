//! Single entry point over every workflow service.

use std::sync::Arc;

use hikopo_storage::models::{
    Account, AccountId, BankDetails, LedgerEntry, Mission, MissionSubmission, PayoutRequest, Shop,
};
use hikopo_storage::Store;

use crate::context::Context;
use crate::error::LedgerResult;
use crate::ledger::{LedgerStore, Reconciliation};
use crate::mission::{MissionWorkflow, ReviewMission, SubmissionOutcome, SubmitMission};
use crate::payout::{ApprovePayout, PayoutReceipt, PayoutWorkflow, RejectPayout, RequestPayout};
use crate::photo::PhotoHeuristicValidator;
use crate::principal::Principal;
use crate::quorum::{CastVote, VerificationQuorum, VoteReceipt};
use crate::referral::{ReferralReceipt, ReferralService};
use crate::registry::{NewMission, NewShop, OpenAccount, Registry};
use crate::stamp::{GrantStamp, StampGrantService, StampReceipt};
use crate::transfer::{TransferReceipt, TransferRequest, TransferService};

/// Owns one instance of each service over a shared [`Context`].
pub struct Engine<S: Store> {
    ctx: Arc<Context<S>>,
    ledger: LedgerStore<S>,
    transfers: TransferService<S>,
    referrals: ReferralService<S>,
    missions: MissionWorkflow<S>,
    stamps: StampGrantService<S>,
    quorum: VerificationQuorum<S>,
    payouts: PayoutWorkflow<S>,
    registry: Registry<S>,
}

impl<S: Store> Engine<S> {
    pub fn new(ctx: Context<S>, validator: Arc<dyn PhotoHeuristicValidator>) -> Self {
        let ctx = Arc::new(ctx);
        Self {
            ledger: LedgerStore::new(ctx.clone()),
            transfers: TransferService::new(ctx.clone()),
            referrals: ReferralService::new(ctx.clone()),
            missions: MissionWorkflow::new(ctx.clone(), validator),
            stamps: StampGrantService::new(ctx.clone()),
            quorum: VerificationQuorum::new(ctx.clone()),
            payouts: PayoutWorkflow::new(ctx.clone()),
            registry: Registry::new(ctx.clone()),
            ctx,
        }
    }

    pub fn context(&self) -> &Context<S> {
        &self.ctx
    }

    pub fn ledger(&self) -> &LedgerStore<S> {
        &self.ledger
    }

    // ── Value-moving operations ──

    pub async fn transfer(
        &self,
        principal: &Principal,
        req: &TransferRequest,
    ) -> LedgerResult<TransferReceipt> {
        self.transfers.transfer(principal, req).await
    }

    pub async fn apply_referral(
        &self,
        principal: &Principal,
        code: &str,
    ) -> LedgerResult<ReferralReceipt> {
        self.referrals.apply_code(principal, code).await
    }

    pub async fn submit_mission(
        &self,
        principal: &Principal,
        req: &SubmitMission,
    ) -> LedgerResult<SubmissionOutcome> {
        self.missions.submit(principal, req).await
    }

    pub async fn review_mission(
        &self,
        principal: &Principal,
        req: &ReviewMission,
    ) -> LedgerResult<SubmissionOutcome> {
        self.missions.review(principal, req).await
    }

    pub async fn pending_reviews(
        &self,
        principal: &Principal,
        limit: i64,
    ) -> LedgerResult<Vec<MissionSubmission>> {
        self.missions.pending_reviews(principal, limit).await
    }

    pub async fn grant_stamp(
        &self,
        principal: &Principal,
        req: &GrantStamp,
    ) -> LedgerResult<StampReceipt> {
        self.stamps.grant(principal, req).await
    }

    pub async fn vote_verification(
        &self,
        principal: &Principal,
        req: &CastVote,
    ) -> LedgerResult<VoteReceipt> {
        self.quorum.vote(principal, req).await
    }

    pub async fn request_payout(
        &self,
        principal: &Principal,
        req: &RequestPayout,
    ) -> LedgerResult<PayoutReceipt> {
        self.payouts.request(principal, req).await
    }

    pub async fn approve_payout(
        &self,
        principal: &Principal,
        req: &ApprovePayout,
    ) -> LedgerResult<PayoutReceipt> {
        self.payouts.approve(principal, req).await
    }

    pub async fn reject_payout(
        &self,
        principal: &Principal,
        req: &RejectPayout,
    ) -> LedgerResult<PayoutReceipt> {
        self.payouts.reject(principal, req).await
    }

    pub async fn payouts(
        &self,
        principal: &Principal,
        account: AccountId,
    ) -> LedgerResult<Vec<PayoutRequest>> {
        self.payouts.list(principal, account).await
    }

    // ── Reads ──

    pub async fn balance(&self, principal: &Principal, account: AccountId) -> LedgerResult<i64> {
        self.ledger.balance(principal, account).await
    }

    pub async fn history(
        &self,
        principal: &Principal,
        account: AccountId,
        limit: i64,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        self.ledger.history(principal, account, limit).await
    }

    pub async fn reconcile(
        &self,
        principal: &Principal,
        account: AccountId,
    ) -> LedgerResult<Reconciliation> {
        self.ledger.reconcile(principal, account).await
    }

    // ── Registry ──

    pub async fn open_account(
        &self,
        principal: &Principal,
        req: &OpenAccount,
    ) -> LedgerResult<Account> {
        self.registry.open_account(principal, req).await
    }

    pub async fn account(&self, principal: &Principal, id: AccountId) -> LedgerResult<Account> {
        self.registry.account(principal, id).await
    }

    pub async fn deactivate_account(
        &self,
        principal: &Principal,
        id: AccountId,
    ) -> LedgerResult<Account> {
        self.registry.deactivate_account(principal, id).await
    }

    pub async fn create_mission(
        &self,
        principal: &Principal,
        req: &NewMission,
    ) -> LedgerResult<Mission> {
        self.registry.create_mission(principal, req).await
    }

    pub async fn register_shop(&self, principal: &Principal, req: &NewShop) -> LedgerResult<Shop> {
        self.registry.register_shop(principal, req).await
    }

    pub async fn set_payout_pin(&self, principal: &Principal, pin: &str) -> LedgerResult<()> {
        self.registry.set_payout_pin(principal, pin).await
    }

    pub async fn set_bank_details(
        &self,
        principal: &Principal,
        details: &BankDetails,
    ) -> LedgerResult<()> {
        self.registry.set_bank_details(principal, details).await
    }
}
