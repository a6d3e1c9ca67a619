//! Authenticated caller identity.
//!
//! Authentication happens at the identity provider; the core only receives
//! the resulting principal and performs every authorization check itself.

use serde::{Deserialize, Serialize};

use hikopo_storage::models::AccountId;

use crate::error::{LedgerError, LedgerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Member,
    ShopOwner,
    Reviewer,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub account_id: AccountId,
    pub role: Role,
}

impl Principal {
    pub fn new(account_id: AccountId, role: Role) -> Self {
        Self { account_id, role }
    }

    pub fn member(account_id: AccountId) -> Self {
        Self::new(account_id, Role::Member)
    }

    pub fn shop_owner(account_id: AccountId) -> Self {
        Self::new(account_id, Role::ShopOwner)
    }

    pub fn reviewer(account_id: AccountId) -> Self {
        Self::new(account_id, Role::Reviewer)
    }

    pub fn admin(account_id: AccountId) -> Self {
        Self::new(account_id, Role::Admin)
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn require_admin(&self) -> LedgerResult<()> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(LedgerError::NotAuthorized("admin role required".into()))
        }
    }

    pub fn require_reviewer(&self) -> LedgerResult<()> {
        match self.role {
            Role::Reviewer | Role::Admin => Ok(()),
            _ => Err(LedgerError::NotAuthorized("reviewer role required".into())),
        }
    }

    pub fn require_shop_owner(&self) -> LedgerResult<()> {
        match self.role {
            Role::ShopOwner | Role::Admin => Ok(()),
            _ => Err(LedgerError::NotAuthorized("shop owner role required".into())),
        }
    }

    /// Reads are allowed on your own account, or on any account for admins.
    pub fn require_read(&self, account: AccountId) -> LedgerResult<()> {
        if self.account_id == account || self.is_admin() {
            Ok(())
        } else {
            Err(LedgerError::NotAuthorized(
                "cannot read another account".into(),
            ))
        }
    }
}
