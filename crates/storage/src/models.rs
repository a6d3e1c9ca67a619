use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

pub type AccountId = Uuid;

// ─── Account ────────────────────────────────────────────────────────────────

/// A Hikopo holder. Balance only moves through ledger entries.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: AccountId,
    /// 8-12 character code used to receive transfers and redeem referrals.
    pub referral_code: String,
    pub balance: i64,
    pub verified: bool,
    pub active: bool,
    /// Shared key (e.g. school) for peer verification.
    pub affiliation: Option<String>,
    #[serde(skip_serializing, default)]
    pub payout_pin_hash: Option<String>,
    pub bank_details: Option<Json<BankDetails>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: AccountId, referral_code: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            referral_code: referral_code.into(),
            balance: 0,
            verified: false,
            active: true,
            affiliation: None,
            payout_pin_hash: None,
            bank_details: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Bank account a shop owner is paid out to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankDetails {
    pub bank_name: String,
    pub branch_name: String,
    pub account_type: String,
    pub account_number: String,
    pub account_holder: String,
}

impl BankDetails {
    /// True when every field needed for an off-system transfer is filled in.
    pub fn is_complete(&self) -> bool {
        [
            &self.bank_name,
            &self.branch_name,
            &self.account_type,
            &self.account_number,
            &self.account_holder,
        ]
        .iter()
        .all(|field| !field.trim().is_empty())
    }
}

// ─── Ledger ─────────────────────────────────────────────────────────────────

/// Why a ledger entry was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "ledger_reason", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    TransferIn,
    TransferOut,
    Referral,
    MissionReward,
    VerificationReward,
    PayoutDebit,
}

/// An immutable balance movement. Paired entries share a `correlation_id`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub account_id: AccountId,
    pub delta: i64,
    pub reason_code: ReasonCode,
    pub correlation_id: Uuid,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ─── Referral ───────────────────────────────────────────────────────────────

/// One-time use of a referral code, unique per referee.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReferralRedemption {
    pub referee_id: AccountId,
    pub referrer_id: AccountId,
    pub correlation_id: Uuid,
    pub applied_at: DateTime<Utc>,
}

// ─── Mission ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Mission {
    pub id: Uuid,
    pub title: String,
    pub reward_points: i64,
    /// Token printed on the mission's QR code, if it has one.
    pub qr_token: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "proof_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProofType {
    Qr,
    Photo,
}

/// Persisted submission status. `Pending` is the reviewer queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "mission_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MissionSubmission {
    pub id: Uuid,
    pub user_id: AccountId,
    pub mission_id: Uuid,
    pub proof_type: ProofType,
    pub proof_ref: String,
    pub status: MissionStatus,
    pub reviewer_comment: Option<String>,
    pub reviewer_id: Option<AccountId>,
    pub heuristic_brightness: Option<f64>,
    pub heuristic_variance: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

// ─── Shop & Stamp ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Shop {
    pub id: Uuid,
    pub owner_id: AccountId,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Proof-of-visit record.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StampGrant {
    pub id: Uuid,
    pub user_id: AccountId,
    pub shop_id: Uuid,
    pub granted_at: DateTime<Utc>,
}

// ─── Verification ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct VerificationVote {
    pub validator_id: AccountId,
    pub target_id: AccountId,
    pub created_at: DateTime<Utc>,
}

// ─── Payout ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payout_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Approved,
    Completed,
    Rejected,
}

impl PayoutStatus {
    /// Requests in these states hold funds that cannot be paid out twice.
    pub fn locks_funds(self) -> bool {
        matches!(self, PayoutStatus::Pending | PayoutStatus::Approved)
    }
}

/// A shop owner's request to convert Hikopo into a bank transfer.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PayoutRequest {
    pub id: Uuid,
    pub account_id: AccountId,
    pub amount: i64,
    pub status: PayoutStatus,
    /// Copy of the bank details at request time. Never updated.
    pub bank_snapshot: Json<BankDetails>,
    pub reject_reason: Option<String>,
    pub processed_by: Option<AccountId>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Status change applied to an existing payout request.
#[derive(Debug, Clone)]
pub struct PayoutTransition {
    pub status: PayoutStatus,
    pub processed_by: AccountId,
    pub processed_at: DateTime<Utc>,
    pub reject_reason: Option<String>,
}

/// Reviewer decision applied to an existing submission.
#[derive(Debug, Clone)]
pub struct SubmissionReview {
    pub status: MissionStatus,
    pub reviewer_id: AccountId,
    pub reviewer_comment: Option<String>,
    pub reviewed_at: DateTime<Utc>,
}

/// Sum and count of an account's ledger entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub total: i64,
    pub entry_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details() -> BankDetails {
        BankDetails {
            bank_name: "Hikone Shinkin".into(),
            branch_name: "Ekimae".into(),
            account_type: "ordinary".into(),
            account_number: "1234567".into(),
            account_holder: "HIKONE CAFE".into(),
        }
    }

    #[test]
    fn bank_details_complete_requires_every_field() {
        assert!(details().is_complete());

        let mut missing = details();
        missing.account_number = "  ".into();
        assert!(!missing.is_complete());
    }

    #[test]
    fn only_open_payouts_lock_funds() {
        assert!(PayoutStatus::Pending.locks_funds());
        assert!(PayoutStatus::Approved.locks_funds());
        assert!(!PayoutStatus::Completed.locks_funds());
        assert!(!PayoutStatus::Rejected.locks_funds());
    }

    #[test]
    fn reason_codes_serialize_snake_case() {
        let json = serde_json::to_string(&ReasonCode::VerificationReward).unwrap();
        assert_eq!(json, "\"verification_reward\"");
    }
}
