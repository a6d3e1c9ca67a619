//! Points ledger and reward workflows for Hikopo.
//!
//! Every operation runs as one transaction through [`hikopo_storage::Store`],
//! bounded by [`runner::run_bounded`]. Balances move only through
//! [`ledger::apply_entries`].

pub mod clock;
pub mod context;
pub mod engine;
pub mod error;
pub mod geo;
pub mod idempotency;
pub mod ledger;
pub mod mission;
pub mod payout;
pub mod photo;
pub mod pin;
pub mod principal;
pub mod quorum;
pub mod referral;
pub mod registry;
pub mod runner;
pub mod stamp;
pub mod transfer;

#[cfg(test)]
mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::Context;
pub use engine::Engine;
pub use error::{ErrorKind, LedgerError, LedgerResult};
pub use idempotency::IdempotencyKey;
pub use principal::{Principal, Role};
pub use runner::TxPolicy;
