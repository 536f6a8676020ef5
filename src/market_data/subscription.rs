// =============================================================================
// Subscription bookkeeping and stale-result tagging
// =============================================================================
//
// Every asynchronous result (socket frame, REST response, timer) carries the
// tag of the subscription that started it.  A result whose tag is not the
// current one belongs to a selection the user has already left and is
// dropped.  The generation counter makes A -> B -> A produce a fresh tag for
// the second A, so nothing from the first A session can leak in.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::types::StreamStatus;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionTag {
    /// Symbol, or `SYMBOL@interval` for candle streams.
    pub key: String,
    pub generation: u64,
}

impl fmt::Display for SubscriptionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.key, self.generation)
    }
}

/// A result produced on behalf of one subscription.
#[derive(Debug, Clone)]
pub struct Tagged<E> {
    pub tag: SubscriptionTag,
    pub event: E,
}

impl<E> Tagged<E> {
    pub fn new(tag: SubscriptionTag, event: E) -> Self {
        Self { tag, event }
    }
}

/// Live stream attached to a symbol.
#[derive(Debug, Clone, Serialize)]
pub struct StreamSubscription {
    pub symbol: String,
    pub connection_handle: Uuid,
    pub status: StreamStatus,
    pub subscribed_at: DateTime<Utc>,
    #[serde(skip)]
    pub tag: SubscriptionTag,
}

/// At most one active subscription per manager.
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    generation: u64,
    active: Option<StreamSubscription>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the active subscription with a fresh one for `key`.
    /// Returns the new tag and the retired subscription, if any.
    pub fn activate(&mut self, key: &str) -> (SubscriptionTag, Option<StreamSubscription>) {
        self.generation += 1;
        let tag = SubscriptionTag {
            key: key.to_string(),
            generation: self.generation,
        };
        let retired = self.active.replace(StreamSubscription {
            symbol: key.to_string(),
            connection_handle: Uuid::new_v4(),
            status: StreamStatus::Connecting,
            subscribed_at: Utc::now(),
            tag: tag.clone(),
        });
        if let Some(old) = &retired {
            debug!(old = %old.tag, new = %tag, "subscription replaced");
        }
        (tag, retired)
    }

    /// Drop the active subscription without starting another.
    pub fn retire(&mut self) -> Option<StreamSubscription> {
        self.generation += 1;
        self.active.take()
    }

    pub fn active(&self) -> Option<&StreamSubscription> {
        self.active.as_ref()
    }

    pub fn active_key(&self) -> Option<&str> {
        self.active.as_ref().map(|s| s.symbol.as_str())
    }

    pub fn is_current(&self, tag: &SubscriptionTag) -> bool {
        self.active.as_ref().is_some_and(|s| &s.tag == tag)
    }

    /// Record a transport status change; ignored for stale tags.
    pub fn set_status(&mut self, tag: &SubscriptionTag, status: StreamStatus) -> bool {
        match self.active.as_mut() {
            Some(sub) if &sub.tag == tag => {
                sub.status = status;
                true
            }
            _ => false,
        }
    }
}
