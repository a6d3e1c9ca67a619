//! Shop-owner payouts: request, admin approval and rejection.
//!
//! Pending and approved requests hold funds: a new request can only draw on
//! `balance - locked`. Approval writes the debit and the `completed` status in
//! one transaction.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use hikopo_storage::Json;
use uuid::Uuid;

use hikopo_storage::models::{AccountId, PayoutRequest, PayoutStatus, PayoutTransition, ReasonCode};
use hikopo_storage::{Store, StoreTx};

use crate::context::Context;
use crate::error::{LedgerError, LedgerResult};
use crate::idempotency::{IdempotencyGuard, IdempotencyKey, Reservation};
use crate::ledger::{EntryDraft, apply_entries};
use crate::principal::Principal;
use crate::runner::run_bounded;

const MAX_REASON_LEN: usize = 500;

#[derive(Clone, Deserialize)]
pub struct RequestPayout {
    pub amount: i64,
    pub pin: String,
    #[serde(default)]
    pub idempotency_key: Option<IdempotencyKey>,
}

impl fmt::Debug for RequestPayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestPayout")
            .field("amount", &self.amount)
            .field("pin", &"<redacted>")
            .field("idempotency_key", &self.idempotency_key)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovePayout {
    pub request_id: Uuid,
    #[serde(default)]
    pub idempotency_key: Option<IdempotencyKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectPayout {
    pub request_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutReceipt {
    pub request: PayoutRequest,
    /// Account balance after this call.
    pub balance: i64,
    /// Balance minus funds held by pending and approved requests.
    pub available: i64,
    /// Approval found the request already completed and changed nothing.
    #[serde(default)]
    pub already_completed: bool,
    #[serde(default)]
    pub replayed: bool,
}

pub struct PayoutWorkflow<S: Store> {
    ctx: Arc<Context<S>>,
}

impl<S: Store> PayoutWorkflow<S> {
    pub fn new(ctx: Arc<Context<S>>) -> Self {
        Self { ctx }
    }

    pub async fn request(
        &self,
        principal: &Principal,
        req: &RequestPayout,
    ) -> LedgerResult<PayoutReceipt> {
        principal.require_shop_owner()?;
        if req.amount <= 0 {
            return Err(LedgerError::InvalidAmount(req.amount));
        }

        let guard = IdempotencyGuard::new(
            "request_payout",
            principal.account_id,
            req.idempotency_key.as_ref(),
            &req.amount,
        )?;
        let guard = &guard;

        run_bounded(&self.ctx.policy, "request_payout", move || async move {
            self.attempt_request(principal.account_id, req, guard).await
        })
        .await
    }

    async fn attempt_request(
        &self,
        account_id: AccountId,
        req: &RequestPayout,
        guard: &IdempotencyGuard,
    ) -> LedgerResult<PayoutReceipt> {
        let mut tx = self.ctx.store.begin().await?;

        if let Reservation::Replay(mut prior) =
            guard.check_and_reserve::<PayoutReceipt, _>(&mut tx).await?
        {
            prior.replayed = true;
            return Ok(prior);
        }

        let account = tx
            .lock_accounts(&[account_id])
            .await?
            .into_iter()
            .next()
            .ok_or(LedgerError::AccountNotFound(account_id))?;
        if !account.active {
            return Err(LedgerError::AccountInactive(account_id));
        }

        let pin_hash = account
            .payout_pin_hash
            .as_deref()
            .ok_or(LedgerError::PinNotSet)?;
        if !self.ctx.pins.verify(&req.pin, pin_hash)? {
            tracing::debug!(account = %account_id, "Payout PIN mismatch");
            return Err(LedgerError::InvalidPin);
        }

        let locked = tx.locked_payout_total(account_id).await?;
        let available = account.balance - locked;
        if req.amount > available {
            return Err(LedgerError::InsufficientAvailable {
                requested: req.amount,
                available,
            });
        }

        let bank = account
            .bank_details
            .as_ref()
            .filter(|d| d.is_complete())
            .ok_or(LedgerError::BankDetailsMissing)?;

        let now = self.ctx.now();
        let request = PayoutRequest {
            id: Uuid::new_v4(),
            account_id,
            amount: req.amount,
            status: PayoutStatus::Pending,
            bank_snapshot: Json(bank.0.clone()),
            reject_reason: None,
            processed_by: None,
            created_at: now,
            processed_at: None,
        };
        tx.insert_payout(&request).await?;

        let receipt = PayoutReceipt {
            request,
            balance: account.balance,
            available: available - req.amount,
            already_completed: false,
            replayed: false,
        };
        guard.record(&mut tx, &receipt).await?;
        tx.commit().await?;

        tracing::info!(
            account = %account_id,
            request = %receipt.request.id,
            amount = req.amount,
            "Payout requested"
        );
        Ok(receipt)
    }

    /// Debit the account and complete the request. Approving a completed
    /// request returns it unchanged.
    pub async fn approve(
        &self,
        principal: &Principal,
        req: &ApprovePayout,
    ) -> LedgerResult<PayoutReceipt> {
        principal.require_admin()?;

        let guard = IdempotencyGuard::new(
            "approve_payout",
            principal.account_id,
            req.idempotency_key.as_ref(),
            &req.request_id,
        )?;
        let guard = &guard;

        run_bounded(&self.ctx.policy, "approve_payout", move || async move {
            self.attempt_approve(principal.account_id, req.request_id, guard)
                .await
        })
        .await
    }

    async fn attempt_approve(
        &self,
        admin_id: AccountId,
        request_id: Uuid,
        guard: &IdempotencyGuard,
    ) -> LedgerResult<PayoutReceipt> {
        let mut tx = self.ctx.store.begin().await?;

        if let Reservation::Replay(mut prior) =
            guard.check_and_reserve::<PayoutReceipt, _>(&mut tx).await?
        {
            prior.replayed = true;
            return Ok(prior);
        }

        let mut request = tx
            .lock_payout(request_id)
            .await?
            .ok_or(LedgerError::PayoutNotFound(request_id))?;

        match request.status {
            PayoutStatus::Completed => {
                let account = tx
                    .get_account(request.account_id)
                    .await?
                    .ok_or(LedgerError::AccountNotFound(request.account_id))?;
                let locked = tx.locked_payout_total(request.account_id).await?;
                return Ok(PayoutReceipt {
                    balance: account.balance,
                    available: account.balance - locked,
                    request,
                    already_completed: true,
                    replayed: false,
                });
            }
            PayoutStatus::Rejected => return Err(LedgerError::AlreadyProcessed(request_id)),
            PayoutStatus::Pending | PayoutStatus::Approved => {}
        }

        let now = self.ctx.now();
        let balances = apply_entries(
            &mut tx,
            &[EntryDraft::debit(
                request.account_id,
                request.amount,
                ReasonCode::PayoutDebit,
            )],
            request.id,
            guard.key(),
            now,
        )
        .await?;

        let transition = PayoutTransition {
            status: PayoutStatus::Completed,
            processed_by: admin_id,
            processed_at: now,
            reject_reason: None,
        };
        tx.transition_payout(request.id, &transition).await?;
        request.status = transition.status;
        request.processed_by = Some(admin_id);
        request.processed_at = Some(now);

        let balance = balances[&request.account_id];
        let locked = tx.locked_payout_total(request.account_id).await?;
        let receipt = PayoutReceipt {
            request,
            balance,
            available: balance - locked,
            already_completed: false,
            replayed: false,
        };
        guard.record(&mut tx, &receipt).await?;
        tx.commit().await?;

        tracing::info!(
            admin = %admin_id,
            request = %receipt.request.id,
            account = %receipt.request.account_id,
            amount = receipt.request.amount,
            "Payout completed"
        );
        Ok(receipt)
    }

    /// Reject an open request, releasing its held funds. No ledger write.
    pub async fn reject(
        &self,
        principal: &Principal,
        req: &RejectPayout,
    ) -> LedgerResult<PayoutReceipt> {
        principal.require_admin()?;
        let reason = req.reason.trim();
        if reason.is_empty() || reason.len() > MAX_REASON_LEN {
            return Err(LedgerError::InvalidInput(
                "rejection reason must be 1 to 500 characters".into(),
            ));
        }

        run_bounded(&self.ctx.policy, "reject_payout", move || async move {
            self.attempt_reject(principal.account_id, req.request_id, reason)
                .await
        })
        .await
    }

    async fn attempt_reject(
        &self,
        admin_id: AccountId,
        request_id: Uuid,
        reason: &str,
    ) -> LedgerResult<PayoutReceipt> {
        let mut tx = self.ctx.store.begin().await?;

        let mut request = tx
            .lock_payout(request_id)
            .await?
            .ok_or(LedgerError::PayoutNotFound(request_id))?;
        if !request.status.locks_funds() {
            return Err(LedgerError::AlreadyProcessed(request_id));
        }

        let now = self.ctx.now();
        let transition = PayoutTransition {
            status: PayoutStatus::Rejected,
            processed_by: admin_id,
            processed_at: now,
            reject_reason: Some(reason.to_string()),
        };
        tx.transition_payout(request.id, &transition).await?;
        request.status = transition.status;
        request.processed_by = Some(admin_id);
        request.processed_at = Some(now);
        request.reject_reason = transition.reject_reason;

        let account = tx
            .get_account(request.account_id)
            .await?
            .ok_or(LedgerError::AccountNotFound(request.account_id))?;
        let locked = tx.locked_payout_total(request.account_id).await?;
        tx.commit().await?;

        tracing::info!(admin = %admin_id, request = %request.id, "Payout rejected");
        Ok(PayoutReceipt {
            request,
            balance: account.balance,
            available: account.balance - locked,
            already_completed: false,
            replayed: false,
        })
    }

    /// Newest first.
    pub async fn list(
        &self,
        principal: &Principal,
        account: AccountId,
    ) -> LedgerResult<Vec<PayoutRequest>> {
        principal.require_read(account)?;
        run_bounded(&self.ctx.policy, "list_payouts", move || async move {
            let mut tx = self.ctx.store.begin().await?;
            Ok(tx.payouts_for_account(account).await?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{deactivate, fund, open, test_context};
    use hikopo_storage::models::BankDetails;
    use hikopo_storage::{FailPoint, MemoryStore};

    async fn shop_owner(ctx: &Context<MemoryStore>, balance: i64) -> AccountId {
        let id = open(ctx, "SHOPOWNER1").await;
        if balance > 0 {
            fund(ctx, id, balance).await;
        }
        let hash = ctx.pins.hash("2468").unwrap();
        let details = BankDetails {
            bank_name: "Shiga Bank".into(),
            branch_name: "Hikone".into(),
            account_type: "ordinary".into(),
            account_number: "1234567".into(),
            account_holder: "Castle Road Cafe".into(),
        };
        let now = chrono::Utc::now();
        let mut tx = ctx.store.begin().await.unwrap();
        tx.set_payout_pin_hash(id, &hash, now).await.unwrap();
        tx.set_bank_details(id, &details, now).await.unwrap();
        tx.commit().await.unwrap();
        id
    }

    fn request(amount: i64, pin: &str) -> RequestPayout {
        RequestPayout {
            amount,
            pin: pin.into(),
            idempotency_key: None,
        }
    }

    fn approve(request_id: Uuid) -> ApprovePayout {
        ApprovePayout {
            request_id,
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn test_locked_funds_limit_new_requests() {
        let ctx = test_context(MemoryStore::new());
        let owner = shop_owner(&ctx, 1000).await;
        let workflow = PayoutWorkflow::new(ctx.clone());
        let principal = Principal::shop_owner(owner);

        let first = workflow.request(&principal, &request(600, "2468")).await.unwrap();
        assert_eq!(first.available, 400);
        assert_eq!(first.request.status, PayoutStatus::Pending);
        assert_eq!(first.request.bank_snapshot.0.bank_name, "Shiga Bank");

        let err = workflow
            .request(&principal, &request(500, "2468"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientAvailable {
                requested: 500,
                available: 400
            }
        ));
        // Requesting holds funds but moves none.
        assert_eq!(ctx.store.account(owner).await.unwrap().balance, 1000);
    }

    #[tokio::test]
    async fn test_request_preconditions() {
        let ctx = test_context(MemoryStore::new());
        let owner = shop_owner(&ctx, 1000).await;
        let bare = open(&ctx, "BAREOWNER1").await;
        fund(&ctx, bare, 1000).await;
        let workflow = PayoutWorkflow::new(ctx.clone());

        assert!(matches!(
            workflow
                .request(&Principal::member(owner), &request(100, "2468"))
                .await,
            Err(LedgerError::NotAuthorized(_))
        ));
        assert!(matches!(
            workflow
                .request(&Principal::shop_owner(owner), &request(100, "1357"))
                .await,
            Err(LedgerError::InvalidPin)
        ));
        assert!(matches!(
            workflow
                .request(&Principal::shop_owner(bare), &request(100, "2468"))
                .await,
            Err(LedgerError::PinNotSet)
        ));

        let hash = ctx.pins.hash("2468").unwrap();
        let mut tx = ctx.store.begin().await.unwrap();
        tx.set_payout_pin_hash(bare, &hash, chrono::Utc::now())
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert!(matches!(
            workflow
                .request(&Principal::shop_owner(bare), &request(100, "2468"))
                .await,
            Err(LedgerError::BankDetailsMissing)
        ));
    }

    #[tokio::test]
    async fn test_approval_debits_once() {
        let ctx = test_context(MemoryStore::new());
        let owner = shop_owner(&ctx, 1000).await;
        let admin = open(&ctx, "ADMIN0001").await;
        let workflow = PayoutWorkflow::new(ctx.clone());

        let requested = workflow
            .request(&Principal::shop_owner(owner), &request(600, "2468"))
            .await
            .unwrap();
        let id = requested.request.id;

        let done = workflow.approve(&Principal::admin(admin), &approve(id)).await.unwrap();
        assert_eq!(done.request.status, PayoutStatus::Completed);
        assert_eq!(done.balance, 400);
        assert_eq!(done.available, 400);

        let again = workflow.approve(&Principal::admin(admin), &approve(id)).await.unwrap();
        assert!(again.already_completed);
        assert_eq!(ctx.store.account(owner).await.unwrap().balance, 400);

        let debits: Vec<_> = ctx
            .store
            .entries_for(owner)
            .await
            .into_iter()
            .filter(|e| e.reason_code == ReasonCode::PayoutDebit)
            .collect();
        assert_eq!(debits.len(), 1);
        assert_eq!(debits[0].correlation_id, id);
    }

    #[tokio::test]
    async fn test_failure_between_debit_and_status_rolls_back() {
        let ctx = test_context(MemoryStore::new());
        let owner = shop_owner(&ctx, 1000).await;
        let admin = open(&ctx, "ADMIN0001").await;
        let workflow = PayoutWorkflow::new(ctx.clone());
        let id = workflow
            .request(&Principal::shop_owner(owner), &request(600, "2468"))
            .await
            .unwrap()
            .request
            .id;

        ctx.store.fail_at(FailPoint::TransitionPayout);
        assert!(workflow.approve(&Principal::admin(admin), &approve(id)).await.is_err());

        assert_eq!(ctx.store.account(owner).await.unwrap().balance, 1000);
        assert_eq!(ctx.store.payout(id).await.unwrap().status, PayoutStatus::Pending);
    }

    #[tokio::test]
    async fn test_rejection_releases_hold() {
        let ctx = test_context(MemoryStore::new());
        let owner = shop_owner(&ctx, 1000).await;
        let admin = open(&ctx, "ADMIN0001").await;
        let workflow = PayoutWorkflow::new(ctx.clone());
        let principal = Principal::shop_owner(owner);
        let id = workflow
            .request(&principal, &request(900, "2468"))
            .await
            .unwrap()
            .request
            .id;

        let rejected = workflow
            .reject(
                &Principal::admin(admin),
                &RejectPayout {
                    request_id: id,
                    reason: "account holder mismatch".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(rejected.request.status, PayoutStatus::Rejected);
        assert_eq!(rejected.available, 1000);

        let err = workflow
            .approve(&Principal::admin(admin), &approve(id))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyProcessed(_)));

        workflow.request(&principal, &request(900, "2468")).await.unwrap();
        assert_eq!(workflow.list(&principal, owner).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_only_admins_approve() {
        let ctx = test_context(MemoryStore::new());
        let owner = shop_owner(&ctx, 1000).await;
        let workflow = PayoutWorkflow::new(ctx.clone());
        let id = workflow
            .request(&Principal::shop_owner(owner), &request(100, "2468"))
            .await
            .unwrap()
            .request
            .id;

        let err = workflow
            .approve(&Principal::shop_owner(owner), &approve(id))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotAuthorized(_)));
    }

    #[tokio::test]
    async fn test_deactivated_owner_is_not_debited() {
        let ctx = test_context(MemoryStore::new());
        let owner = shop_owner(&ctx, 1000).await;
        let admin = open(&ctx, "ADMIN0001").await;
        let workflow = PayoutWorkflow::new(ctx.clone());
        let id = workflow
            .request(&Principal::shop_owner(owner), &request(600, "2468"))
            .await
            .unwrap()
            .request
            .id;
        deactivate(&ctx, owner).await;

        let err = workflow
            .approve(&Principal::admin(admin), &approve(id))
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::AccountInactive(acct) if acct == owner));
        assert_eq!(ctx.store.account(owner).await.unwrap().balance, 1000);
        assert_eq!(ctx.store.payout(id).await.unwrap().status, PayoutStatus::Pending);
    }

    #[tokio::test]
    async fn test_rejection_reason_is_validated() {
        let ctx = test_context(MemoryStore::new());
        let admin = open(&ctx, "ADMIN0001").await;
        let err = PayoutWorkflow::new(ctx.clone())
            .reject(
                &Principal::admin(admin),
                &RejectPayout {
                    request_id: Uuid::new_v4(),
                    reason: "   ".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidInput(_)));
    }
}
