//! Peer-to-peer point transfer by receiver code.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use hikopo_storage::models::{AccountId, ReasonCode};
use hikopo_storage::{Store, StoreTx};

use crate::context::Context;
use crate::error::{LedgerError, LedgerResult};
use crate::idempotency::{IdempotencyGuard, IdempotencyKey, Reservation};
use crate::ledger::{EntryDraft, apply_entries};
use crate::principal::Principal;
use crate::runner::run_bounded;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub receiver_code: String,
    pub amount: i64,
    pub idempotency_key: IdempotencyKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub correlation_id: Uuid,
    pub sender_id: AccountId,
    pub receiver_id: AccountId,
    pub amount: i64,
    pub sender_balance: i64,
    pub executed_at: DateTime<Utc>,
    /// True when this response replays an earlier identical request.
    #[serde(default)]
    pub replayed: bool,
}

#[derive(Serialize)]
struct Fingerprint<'a> {
    receiver_code: &'a str,
    amount: i64,
}

pub struct TransferService<S: Store> {
    ctx: Arc<Context<S>>,
}

impl<S: Store> TransferService<S> {
    pub fn new(ctx: Arc<Context<S>>) -> Self {
        Self { ctx }
    }

    /// Move `amount` from the principal to the account behind `receiver_code`.
    pub async fn transfer(
        &self,
        principal: &Principal,
        req: &TransferRequest,
    ) -> LedgerResult<TransferReceipt> {
        if req.amount <= 0 {
            return Err(LedgerError::InvalidAmount(req.amount));
        }
        let code = req.receiver_code.trim();
        if code.is_empty() {
            return Err(LedgerError::ReceiverNotFound);
        }

        let guard = IdempotencyGuard::new(
            "transfer",
            principal.account_id,
            Some(&req.idempotency_key),
            &Fingerprint {
                receiver_code: code,
                amount: req.amount,
            },
        )?;
        let guard = &guard;

        run_bounded(&self.ctx.policy, "transfer", move || async move {
            self.attempt(principal, code, req.amount, guard).await
        })
        .await
    }

    async fn attempt(
        &self,
        principal: &Principal,
        code: &str,
        amount: i64,
        guard: &IdempotencyGuard,
    ) -> LedgerResult<TransferReceipt> {
        let mut tx = self.ctx.store.begin().await?;

        if let Reservation::Replay(mut prior) =
            guard.check_and_reserve::<TransferReceipt, _>(&mut tx).await?
        {
            prior.replayed = true;
            return Ok(prior);
        }

        let sender_id = principal.account_id;
        let receiver = tx
            .find_account_by_code(code)
            .await?
            .ok_or(LedgerError::ReceiverNotFound)?;
        if receiver.id == sender_id {
            return Err(LedgerError::SelfTransfer);
        }

        let sender = tx
            .get_account(sender_id)
            .await?
            .ok_or(LedgerError::AccountNotFound(sender_id))?;
        if !sender.active {
            return Err(LedgerError::AccountInactive(sender_id));
        }

        let now = self.ctx.now();
        let correlation_id = Uuid::new_v4();
        let balances = apply_entries(
            &mut tx,
            &[
                EntryDraft::debit(sender_id, amount, ReasonCode::TransferOut),
                EntryDraft::credit(receiver.id, amount, ReasonCode::TransferIn),
            ],
            correlation_id,
            guard.key(),
            now,
        )
        .await?;

        let receipt = TransferReceipt {
            correlation_id,
            sender_id,
            receiver_id: receiver.id,
            amount,
            sender_balance: balances[&sender_id],
            executed_at: now,
            replayed: false,
        };
        guard.record(&mut tx, &receipt).await?;
        tx.commit().await?;

        tracing::info!(
            sender = %sender_id,
            receiver = %receiver.id,
            amount,
            correlation = %correlation_id,
            "Transfer committed"
        );
        Ok(receipt)
    }
}
