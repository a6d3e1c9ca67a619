//! Peer verification by a quorum of same-affiliation validators.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use hikopo_storage::models::{AccountId, ReasonCode, VerificationVote};
use hikopo_storage::{Store, StoreTx};

use crate::context::Context;
use crate::error::{LedgerError, LedgerResult};
use crate::idempotency::{IdempotencyGuard, IdempotencyKey, Reservation};
use crate::ledger::{EntryDraft, apply_entries};
use crate::principal::Principal;
use crate::runner::run_bounded;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CastVote {
    pub target_id: AccountId,
    #[serde(default)]
    pub idempotency_key: Option<IdempotencyKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteReceipt {
    pub validator_id: AccountId,
    pub target_id: AccountId,
    pub reward: i64,
    pub validator_balance: i64,
    pub votes: i64,
    pub quorum: i64,
    /// True only for the vote that completed the quorum.
    pub newly_verified: bool,
    #[serde(default)]
    pub replayed: bool,
}

pub struct VerificationQuorum<S: Store> {
    ctx: Arc<Context<S>>,
}

impl<S: Store> VerificationQuorum<S> {
    pub fn new(ctx: Arc<Context<S>>) -> Self {
        Self { ctx }
    }

    pub async fn vote(&self, principal: &Principal, req: &CastVote) -> LedgerResult<VoteReceipt> {
        if principal.account_id == req.target_id {
            return Err(LedgerError::SelfVote);
        }

        let guard = IdempotencyGuard::new(
            "vote_verification",
            principal.account_id,
            req.idempotency_key.as_ref(),
            &req.target_id,
        )?;
        let guard = &guard;

        run_bounded(&self.ctx.policy, "vote_verification", move || async move {
            self.attempt(principal.account_id, req.target_id, guard).await
        })
        .await
    }

    async fn attempt(
        &self,
        validator_id: AccountId,
        target_id: AccountId,
        guard: &IdempotencyGuard,
    ) -> LedgerResult<VoteReceipt> {
        let mut tx = self.ctx.store.begin().await?;

        if let Reservation::Replay(mut prior) =
            guard.check_and_reserve::<VoteReceipt, _>(&mut tx).await?
        {
            prior.replayed = true;
            return Ok(prior);
        }

        // Locking the target serializes every vote for it, so the count
        // below sees all earlier votes and the flag flips exactly once.
        let locked = tx.lock_accounts(&[validator_id, target_id]).await?;
        let validator = locked
            .iter()
            .find(|a| a.id == validator_id)
            .ok_or(LedgerError::AccountNotFound(validator_id))?;
        let target = locked
            .iter()
            .find(|a| a.id == target_id)
            .ok_or(LedgerError::AccountNotFound(target_id))?;

        if !validator.active {
            return Err(LedgerError::AccountInactive(validator_id));
        }
        if !target.active {
            return Err(LedgerError::NotEligible("target account is deactivated".into()));
        }
        match (&validator.affiliation, &target.affiliation) {
            (Some(a), Some(b)) if a == b => {}
            _ => {
                return Err(LedgerError::NotEligible(
                    "validator and target must share an affiliation".into(),
                ));
            }
        }
        if target.verified {
            return Err(LedgerError::NotEligible("target is already verified".into()));
        }
        if tx.has_vote(validator_id, target_id).await? {
            return Err(LedgerError::AlreadyVoted);
        }

        let now = self.ctx.now();
        tx.insert_vote(&VerificationVote {
            validator_id,
            target_id,
            created_at: now,
        })
        .await?;

        let reward = self.ctx.rules.verification_reward;
        let balances = apply_entries(
            &mut tx,
            &[EntryDraft::credit(
                validator_id,
                reward,
                ReasonCode::VerificationReward,
            )],
            Uuid::new_v4(),
            guard.key(),
            now,
        )
        .await?;

        let votes = tx.count_votes(target_id).await?;
        let quorum = self.ctx.rules.verification_quorum;
        let newly_verified = votes >= quorum;
        if newly_verified {
            tx.mark_verified(target_id, now).await?;
        }

        let receipt = VoteReceipt {
            validator_id,
            target_id,
            reward,
            validator_balance: balances[&validator_id],
            votes,
            quorum,
            newly_verified,
            replayed: false,
        };
        guard.record(&mut tx, &receipt).await?;
        tx.commit().await?;

        tracing::info!(
            validator = %validator_id,
            target = %target_id,
            votes,
            quorum,
            newly_verified,
            "Verification vote recorded"
        );
        Ok(receipt)
    }
}
