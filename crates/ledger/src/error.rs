use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use hikopo_storage::StorageError;

/// Error taxonomy exposed to callers of the points core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    InsufficientFunds,
    Duplicate,
    RateLimit,
    Authorization,
    ConcurrencyConflict,
    ExternalValidationInconclusive,
    Timeout,
    Storage,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("amount must be a positive number of points, got {0}")]
    InvalidAmount(i64),

    #[error("referral code is malformed or unknown")]
    InvalidCode,

    #[error("referral code {0} is already in use")]
    ReferralCodeTaken(String),

    #[error("invalid idempotency key: {0}")]
    InvalidIdempotencyKey(String),

    #[error("idempotency key was already used for a different request")]
    IdempotencyKeyReused,

    #[error("invalid proof: {0}")]
    InvalidProof(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("coordinates out of range: ({latitude}, {longitude})")]
    InvalidCoordinates { latitude: f64, longitude: f64 },

    #[error("PIN must be 4 to 6 digits")]
    InvalidPinFormat,

    #[error("no receiver uses that code")]
    ReceiverNotFound,

    #[error("cannot transfer points to yourself")]
    SelfTransfer,

    #[error("insufficient funds in {account}: available {available}, required {required}")]
    InsufficientFunds {
        account: Uuid,
        available: i64,
        required: i64,
    },

    #[error("a referral code was already redeemed for this account")]
    AlreadyRedeemed,

    #[error("cannot redeem your own referral code")]
    SelfReferral,

    #[error("mission {0} not found")]
    MissionNotFound(Uuid),

    #[error("mission already submitted")]
    AlreadyCompleted,

    #[error("submission {0} not found")]
    SubmissionNotFound(Uuid),

    #[error("submission cannot move from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("shop {0} not found")]
    ShopNotFound(Uuid),

    #[error("too far from the shop: {distance_meters:.1} m")]
    TooFar { distance_meters: f64 },

    #[error("stamp already granted; next eligible at {next_eligible_at}")]
    RateLimited { next_eligible_at: DateTime<Utc> },

    #[error("not eligible to vote: {0}")]
    NotEligible(String),

    #[error("already voted for this account")]
    AlreadyVoted,

    #[error("cannot vote for yourself")]
    SelfVote,

    #[error("transaction PIN is not set")]
    PinNotSet,

    #[error("transaction PIN does not match")]
    InvalidPin,

    #[error("insufficient available points: requested {requested}, available {available}")]
    InsufficientAvailable { requested: i64, available: i64 },

    #[error("bank details are missing or incomplete")]
    BankDetailsMissing,

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("account {0} is deactivated")]
    AccountInactive(Uuid),

    #[error("request {0} was already processed")]
    AlreadyProcessed(Uuid),

    #[error("account {0} not found")]
    AccountNotFound(Uuid),

    #[error("payout request {0} not found")]
    PayoutNotFound(Uuid),

    #[error("concurrent update conflict: {0}")]
    Conflict(String),

    #[error("{operation} did not finish within {after_ms} ms")]
    Timeout {
        operation: &'static str,
        after_ms: u64,
    },

    #[error(transparent)]
    Storage(StorageError),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        use LedgerError::*;
        match self {
            InvalidAmount(_)
            | InvalidCode
            | InvalidIdempotencyKey(_)
            | IdempotencyKeyReused
            | InvalidProof(_)
            | InvalidInput(_)
            | InvalidCoordinates { .. }
            | InvalidPinFormat
            | SelfTransfer
            | SelfReferral
            | PinNotSet
            | BankDetailsMissing
            | InvalidTransition { .. } => ErrorKind::Validation,
            ReceiverNotFound
            | MissionNotFound(_)
            | SubmissionNotFound(_)
            | ShopNotFound(_)
            | AccountNotFound(_)
            | PayoutNotFound(_) => ErrorKind::NotFound,
            InsufficientFunds { .. } | InsufficientAvailable { .. } => ErrorKind::InsufficientFunds,
            ReferralCodeTaken(_)
            | AlreadyRedeemed
            | AlreadyCompleted
            | AlreadyVoted
            | AlreadyProcessed(_) => ErrorKind::Duplicate,
            TooFar { .. } | RateLimited { .. } => ErrorKind::RateLimit,
            NotEligible(_) | SelfVote | InvalidPin | NotAuthorized(_) | AccountInactive(_) => {
                ErrorKind::Authorization
            }
            Conflict(_) => ErrorKind::ConcurrencyConflict,
            Timeout { .. } => ErrorKind::Timeout,
            Storage(_) => ErrorKind::Storage,
        }
    }

    /// Whether retrying the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            LedgerError::Conflict(_) | LedgerError::Timeout { .. } => true,
            LedgerError::Storage(StorageError::Unavailable(_)) => true,
            _ => false,
        }
    }

    /// Unexpected failures the caller must not treat as a business answer.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LedgerError::Storage(_))
    }
}

impl From<StorageError> for LedgerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Conflict(reason) => LedgerError::Conflict(reason),
            // A unique index fired under a race; replaying the operation
            // observes the winner and reports the business error instead.
            StorageError::Duplicate(constraint) => LedgerError::Conflict(constraint),
            other => LedgerError::Storage(other),
        }
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Storage(StorageError::Serialization(err.to_string()))
    }
}
