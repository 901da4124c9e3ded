//! Subscribed instruments, in subscription order.

use quotebar_schema::InstrumentKey;
use std::collections::HashSet;

#[derive(Debug, Default, Clone)]
pub struct SubscriptionRegistry {
    order: Vec<InstrumentKey>,
    members: HashSet<InstrumentKey>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if already present; the original position is kept.
    pub fn insert(&mut self, instrument: InstrumentKey) -> bool {
        if !self.members.insert(instrument.clone()) {
            return false;
        }
        self.order.push(instrument);
        true
    }

    pub fn remove(&mut self, instrument: &InstrumentKey) -> bool {
        if !self.members.remove(instrument) {
            return false;
        }
        self.order.retain(|k| k != instrument);
        true
    }

    pub fn contains(&self, instrument: &InstrumentKey) -> bool {
        self.members.contains(instrument)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstrumentKey> {
        self.order.iter()
    }

    pub fn snapshot(&self) -> Vec<InstrumentKey> {
        self.order.clone()
    }
}
