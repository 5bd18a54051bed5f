//! Access state (session, security level) change notifications

use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

use crate::udstransport::{Address, GlobalChannelId};

/// Access state kinds tracked per conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessCategory {
    Session,
    SecurityLevel,
}

impl fmt::Display for AccessCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session => write!(f, "session"),
            Self::SecurityLevel => write!(f, "security level"),
        }
    }
}

/// Set of [`AccessCategory`] values an observer is interested in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CategoryMask(u8);

impl CategoryMask {
    pub const NONE: Self = Self(0);
    pub const SESSION: Self = Self(0x01);
    pub const SECURITY_LEVEL: Self = Self(0x02);
    pub const ALL: Self = Self(0x03);

    pub fn contains(&self, category: AccessCategory) -> bool {
        self.0 & Self::from(category).0 != 0
    }
}

impl From<AccessCategory> for CategoryMask {
    fn from(category: AccessCategory) -> Self {
        match category {
            AccessCategory::Session => Self::SESSION,
            AccessCategory::SecurityLevel => Self::SECURITY_LEVEL,
        }
    }
}

impl BitOr for CategoryMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Current session and security level of a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessState {
    pub session: u8,
    pub security_level: u8,
}

impl AccessState {
    pub fn get(&self, category: AccessCategory) -> u8 {
        match category {
            AccessCategory::Session => self.session,
            AccessCategory::SecurityLevel => self.security_level,
        }
    }
}

/// A change of one access state value on one conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessStateChange {
    pub category: AccessCategory,
    pub old: u8,
    pub new: u8,
    pub source_address: Address,
    pub channel: GlobalChannelId,
}

/// Receives access state changes
pub trait AccessStateObserver: Send + Sync {
    fn on_access_state_change(&self, change: &AccessStateChange);
}

/// Handle returned by [`AccessStateNotifier::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Access notification errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error("Subscriber limit of {max} reached")]
    SubscriberLimitReached { max: usize },

    #[error("Unknown subscription")]
    UnknownSubscription,
}

struct Subscriber {
    id: SubscriptionId,
    mask: CategoryMask,
    observer: Arc<dyn AccessStateObserver>,
}

/// Fans access state changes out to a bounded set of observers
pub struct AccessStateNotifier {
    max_subscribers: usize,
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl AccessStateNotifier {
    pub fn new(max_subscribers: usize) -> Self {
        Self {
            max_subscribers,
            subscribers: RwLock::new(Vec::with_capacity(max_subscribers)),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(
        &self,
        observer: Arc<dyn AccessStateObserver>,
        mask: CategoryMask,
    ) -> Result<SubscriptionId, AccessError> {
        let mut subscribers = self.subscribers.write();
        if subscribers.len() >= self.max_subscribers {
            warn!(max = self.max_subscribers, "Access state subscriber limit reached");
            return Err(AccessError::SubscriberLimitReached {
                max: self.max_subscribers,
            });
        }
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        subscribers.push(Subscriber { id, mask, observer });
        Ok(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<(), AccessError> {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        if subscribers.len() == before {
            return Err(AccessError::UnknownSubscription);
        }
        Ok(())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Deliver `change` to every observer whose mask matches
    pub fn notify(&self, change: &AccessStateChange) {
        debug!(
            category = %change.category,
            old = format!("0x{:02X}", change.old),
            new = format!("0x{:02X}", change.new),
            tester = format!("0x{:04X}", change.source_address),
            "Access state changed"
        );
        // Observers run without the list lock so they may (un)subscribe
        let targets: Vec<_> = self
            .subscribers
            .read()
            .iter()
            .filter(|s| s.mask.contains(change.category))
            .map(|s| Arc::clone(&s.observer))
            .collect();
        for observer in targets {
            observer.on_access_state_change(change);
        }
    }
}
