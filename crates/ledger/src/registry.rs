//! Accounts, missions and shops: the rows the workflows act on.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use hikopo_storage::models::{Account, AccountId, BankDetails, Mission, Shop};
use hikopo_storage::{StorageError, Store, StoreTx};

use crate::context::Context;
use crate::error::{LedgerError, LedgerResult};
use crate::geo::valid_coordinates;
use crate::principal::Principal;
use crate::referral::is_well_formed_code;
use crate::runner::run_bounded;

const MAX_NAME_LEN: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAccount {
    pub referral_code: String,
    #[serde(default)]
    pub affiliation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMission {
    pub title: String,
    pub reward_points: i64,
    #[serde(default)]
    pub qr_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewShop {
    pub owner_id: AccountId,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

fn check_name(field: &str, value: &str) -> LedgerResult<()> {
    if value.trim().is_empty() || value.len() > MAX_NAME_LEN {
        return Err(LedgerError::InvalidInput(format!(
            "{field} must be 1 to {MAX_NAME_LEN} characters"
        )));
    }
    Ok(())
}

pub struct Registry<S: Store> {
    ctx: Arc<Context<S>>,
}

impl<S: Store> Registry<S> {
    pub fn new(ctx: Arc<Context<S>>) -> Self {
        Self { ctx }
    }

    /// Register the principal's account with a zero balance.
    pub async fn open_account(
        &self,
        principal: &Principal,
        req: &OpenAccount,
    ) -> LedgerResult<Account> {
        let code = req.referral_code.trim();
        if !is_well_formed_code(code) {
            return Err(LedgerError::InvalidCode);
        }
        let affiliation = req
            .affiliation
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty());

        run_bounded(&self.ctx.policy, "open_account", move || async move {
            let mut account = Account::new(principal.account_id, code, self.ctx.now());
            account.affiliation = affiliation.map(str::to_string);

            let mut tx = self.ctx.store.begin().await?;
            match tx.insert_account(&account).await {
                Err(StorageError::Duplicate(_)) => {
                    return Err(LedgerError::ReferralCodeTaken(code.to_string()));
                }
                other => other?,
            }
            tx.commit().await?;

            tracing::info!(account = %account.id, "Account opened");
            Ok(account)
        })
        .await
    }

    pub async fn account(&self, principal: &Principal, id: AccountId) -> LedgerResult<Account> {
        principal.require_read(id)?;
        run_bounded(&self.ctx.policy, "account", move || async move {
            let mut tx = self.ctx.store.begin().await?;
            tx.get_account(id)
                .await?
                .ok_or(LedgerError::AccountNotFound(id))
        })
        .await
    }

    /// Hide an account from code lookups and stop it sending or receiving.
    pub async fn deactivate_account(
        &self,
        principal: &Principal,
        id: AccountId,
    ) -> LedgerResult<Account> {
        principal.require_admin()?;

        run_bounded(&self.ctx.policy, "deactivate_account", move || async move {
            let mut tx = self.ctx.store.begin().await?;
            let mut account = tx
                .lock_accounts(&[id])
                .await?
                .into_iter()
                .next()
                .ok_or(LedgerError::AccountNotFound(id))?;
            let now = self.ctx.now();
            tx.set_account_active(id, false, now).await?;
            tx.commit().await?;

            account.active = false;
            account.updated_at = now;
            tracing::info!(admin = %principal.account_id, account = %id, "Account deactivated");
            Ok(account)
        })
        .await
    }

    pub async fn create_mission(
        &self,
        principal: &Principal,
        req: &NewMission,
    ) -> LedgerResult<Mission> {
        principal.require_admin()?;
        check_name("title", &req.title)?;
        if req.reward_points <= 0 {
            return Err(LedgerError::InvalidAmount(req.reward_points));
        }
        if let Some(token) = &req.qr_token {
            check_name("qr_token", token)?;
        }

        let mission = Mission {
            id: Uuid::new_v4(),
            title: req.title.trim().to_string(),
            reward_points: req.reward_points,
            qr_token: req.qr_token.as_deref().map(|t| t.trim().to_string()),
            active: true,
            created_at: self.ctx.now(),
        };
        let mission = &mission;

        run_bounded(&self.ctx.policy, "create_mission", move || async move {
            let mut tx = self.ctx.store.begin().await?;
            tx.insert_mission(mission).await?;
            tx.commit().await?;
            Ok(())
        })
        .await?;

        tracing::info!(mission = %mission.id, reward = mission.reward_points, "Mission created");
        Ok(mission.clone())
    }

    pub async fn register_shop(&self, principal: &Principal, req: &NewShop) -> LedgerResult<Shop> {
        principal.require_admin()?;
        check_name("name", &req.name)?;
        if !valid_coordinates(req.latitude, req.longitude) {
            return Err(LedgerError::InvalidCoordinates {
                latitude: req.latitude,
                longitude: req.longitude,
            });
        }

        let shop = Shop {
            id: Uuid::new_v4(),
            owner_id: req.owner_id,
            name: req.name.trim().to_string(),
            latitude: req.latitude,
            longitude: req.longitude,
        };
        let shop = &shop;

        run_bounded(&self.ctx.policy, "register_shop", move || async move {
            let mut tx = self.ctx.store.begin().await?;
            tx.get_account(shop.owner_id)
                .await?
                .ok_or(LedgerError::AccountNotFound(shop.owner_id))?;
            tx.insert_shop(shop).await?;
            tx.commit().await?;
            Ok(())
        })
        .await?;

        tracing::info!(shop = %shop.id, owner = %shop.owner_id, "Shop registered");
        Ok(shop.clone())
    }

    /// Store an Argon2 hash of the principal's payout PIN.
    pub async fn set_payout_pin(&self, principal: &Principal, pin: &str) -> LedgerResult<()> {
        let hash = self.ctx.pins.hash(pin)?;
        let hash = hash.as_str();

        run_bounded(&self.ctx.policy, "set_payout_pin", move || async move {
            let mut tx = self.ctx.store.begin().await?;
            tx.lock_accounts(&[principal.account_id])
                .await?
                .first()
                .ok_or(LedgerError::AccountNotFound(principal.account_id))?;
            tx.set_payout_pin_hash(principal.account_id, hash, self.ctx.now())
                .await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    /// Replace the live bank details. Existing payout snapshots are untouched.
    pub async fn set_bank_details(
        &self,
        principal: &Principal,
        details: &BankDetails,
    ) -> LedgerResult<()> {
        if !details.is_complete() {
            return Err(LedgerError::BankDetailsMissing);
        }

        run_bounded(&self.ctx.policy, "set_bank_details", move || async move {
            let mut tx = self.ctx.store.begin().await?;
            tx.lock_accounts(&[principal.account_id])
                .await?
                .first()
                .ok_or(LedgerError::AccountNotFound(principal.account_id))?;
            tx.set_bank_details(principal.account_id, details, self.ctx.now())
                .await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }
}
