use std::sync::Arc;

use chrono::{DateTime, Utc};

use hikopo_core::Rules;
use hikopo_storage::Store;

use crate::clock::{Clock, SystemClock};
use crate::pin::PinHasher;
use crate::runner::TxPolicy;

/// Dependencies shared by every workflow service.
pub struct Context<S: Store> {
    pub store: Arc<S>,
    pub clock: Arc<dyn Clock>,
    pub policy: TxPolicy,
    pub rules: Rules,
    pub pins: PinHasher,
}

impl<S: Store> Context<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            policy: TxPolicy::default(),
            rules: Rules::default(),
            pins: PinHasher::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(mut self, policy: TxPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_rules(mut self, rules: Rules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_pin_hasher(mut self, pins: PinHasher) -> Self {
        self.pins = pins;
        self
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
