//! Weight Update Subscribers
//!
//! Ordered registry of push callbacks. Notification works on a snapshot of
//! the registry so a callback may unsubscribe itself (or a sibling) while a
//! reading is being delivered. A sibling removed mid-delivery is skipped for
//! the rest of that delivery; every other callback fires exactly once.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Callback invoked with the new weight in grams
pub type WeightCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Identifier handed out at registration
pub type SubscriptionId = u64;

struct Entry {
    id: SubscriptionId,
    active: Arc<AtomicBool>,
    callback: WeightCallback,
}

/// Registered callbacks, in registration order
pub(crate) struct SubscriberRegistry {
    next_id: AtomicU64,
    entries: Mutex<Vec<Entry>>,
}

impl SubscriberRegistry {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a callback; the returned handle removes exactly this one
    pub(crate) fn register(self: &Arc<Self>, callback: WeightCallback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));

        self.entries().push(Entry {
            id,
            active: Arc::clone(&active),
            callback,
        });

        tracing::debug!(subscription_id = id, "Weight subscriber registered");

        Subscription {
            id,
            active,
            registry: Arc::downgrade(self),
        }
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    /// Deliver a weight to every live subscriber; returns how many fired
    pub(crate) fn notify(&self, grams: f64) -> usize {
        let snapshot: Vec<(SubscriptionId, Arc<AtomicBool>, WeightCallback)> = self
            .entries()
            .iter()
            .map(|e| (e.id, Arc::clone(&e.active), Arc::clone(&e.callback)))
            .collect();

        let mut fired = 0;
        for (id, active, callback) in snapshot {
            if !active.load(Ordering::Acquire) {
                continue;
            }
            // A panicking subscriber must not take the session driver down with it
            if panic::catch_unwind(AssertUnwindSafe(|| callback(grams))).is_err() {
                tracing::error!(subscription_id = id, "Weight subscriber panicked");
            }
            fired += 1;
        }
        fired
    }

    pub(crate) fn len(&self) -> usize {
        self.entries().len()
    }
}

/// Handle returned by [`WeightFeed::on_weight_update`](super::WeightFeed::on_weight_update)
///
/// Dropping the handle does not unsubscribe; call [`Subscription::unsubscribe`].
pub struct Subscription {
    id: SubscriptionId,
    active: Arc<AtomicBool>,
    registry: Weak<SubscriberRegistry>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Whether the callback is still registered
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Remove the callback. Returns `false` if it was already removed.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
        tracing::debug!(subscription_id = self.id, "Weight subscriber removed");
        true
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
