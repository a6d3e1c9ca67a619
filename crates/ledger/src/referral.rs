//! One-time signup bonus exchange between referrer and referee.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use hikopo_storage::models::{AccountId, ReasonCode, ReferralRedemption};
use hikopo_storage::{Store, StoreTx};

use crate::context::Context;
use crate::error::{LedgerError, LedgerResult};
use crate::ledger::{EntryDraft, apply_entries};
use crate::principal::Principal;
use crate::runner::run_bounded;

/// Referral codes are 8 to 12 ASCII alphanumerics.
pub fn is_well_formed_code(code: &str) -> bool {
    (8..=12).contains(&code.len()) && code.bytes().all(|b| b.is_ascii_alphanumeric())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralReceipt {
    pub correlation_id: Uuid,
    pub referrer_id: AccountId,
    pub referee_id: AccountId,
    pub bonus: i64,
    pub referee_balance: i64,
    pub applied_at: DateTime<Utc>,
}

pub struct ReferralService<S: Store> {
    ctx: Arc<Context<S>>,
}

impl<S: Store> ReferralService<S> {
    pub fn new(ctx: Arc<Context<S>>) -> Self {
        Self { ctx }
    }

    /// Redeem `code` for the principal. Each account can redeem once.
    pub async fn apply_code(
        &self,
        principal: &Principal,
        code: &str,
    ) -> LedgerResult<ReferralReceipt> {
        let code = code.trim();
        if !is_well_formed_code(code) {
            return Err(LedgerError::InvalidCode);
        }
        let referee_id = principal.account_id;

        run_bounded(&self.ctx.policy, "apply_referral", move || async move {
            self.attempt(referee_id, code).await
        })
        .await
    }

    async fn attempt(&self, referee_id: AccountId, code: &str) -> LedgerResult<ReferralReceipt> {
        let mut tx = self.ctx.store.begin().await?;

        let referrer = tx
            .find_account_by_code(code)
            .await?
            .ok_or(LedgerError::InvalidCode)?;
        if referrer.id == referee_id {
            return Err(LedgerError::SelfReferral);
        }

        // Lock both sides before looking at the redemption table so two
        // concurrent redemptions for the same referee serialize here.
        let locked = tx.lock_accounts(&[referee_id, referrer.id]).await?;
        let referee = locked
            .iter()
            .find(|a| a.id == referee_id)
            .ok_or(LedgerError::AccountNotFound(referee_id))?;
        if !referee.active {
            return Err(LedgerError::AccountInactive(referee_id));
        }
        if tx.get_redemption(referee_id).await?.is_some() {
            return Err(LedgerError::AlreadyRedeemed);
        }

        let now = self.ctx.now();
        let correlation_id = Uuid::new_v4();
        let bonus = self.ctx.rules.referral_bonus;

        tx.insert_redemption(&ReferralRedemption {
            referee_id,
            referrer_id: referrer.id,
            correlation_id,
            applied_at: now,
        })
        .await?;

        let balances = apply_entries(
            &mut tx,
            &[
                EntryDraft::credit(referrer.id, bonus, ReasonCode::Referral),
                EntryDraft::credit(referee_id, bonus, ReasonCode::Referral),
            ],
            correlation_id,
            None,
            now,
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            referrer = %referrer.id,
            referee = %referee_id,
            bonus,
            correlation = %correlation_id,
            "Referral redeemed"
        );

        Ok(ReferralReceipt {
            correlation_id,
            referrer_id: referrer.id,
            referee_id,
            bonus,
            referee_balance: balances[&referee_id],
            applied_at: now,
        })
    }
}
