/// Subscription fan-out for committed writes.
///
/// Subscriptions are `(path prefix, callback)` pairs. A committed write at a
/// path notifies every subscription whose prefix is an ancestor of the path
/// *or* a descendant of it: changing a parent notifies descendant-path
/// subscribers, changing a descendant notifies parent-path subscribers, and
/// exact equality matches. Callback panics are caught and logged; they never
/// abort the notification loop or the write that triggered it.
///
/// Per-path notifications arrive in the order their writes were committed to
/// the store. No cross-path ordering is guaranteed.
use crate::error::{MeshError, MeshResult};
use crate::types::paths_related;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// A subscriber callback. Receives the written path and the committed value
/// (`null` for deletions).
pub type SubscriberFn = dyn Fn(&str, &JsonValue) + Send + Sync;

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Information about an active subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    /// The subscription ID.
    pub id: SubscriptionId,
    /// The registered path prefix.
    pub prefix: String,
    /// When this subscription was created.
    pub created_at: DateTime<Utc>,
    /// Number of events delivered so far.
    pub events_delivered: u64,
}

struct SubscriptionState {
    prefix: String,
    callback: Arc<SubscriberFn>,
    created_at: DateTime<Utc>,
    events_delivered: AtomicU64,
}

/// Registry and dispatcher for path-prefix subscriptions.
pub struct SubscriptionBus {
    subscriptions: DashMap<SubscriptionId, SubscriptionState>,
    next_id: AtomicU64,
    shutting_down: Arc<AtomicBool>,
}

impl SubscriptionBus {
    /// Create a bus sharing the node's shutdown flag.
    pub fn new(shutting_down: Arc<AtomicBool>) -> Self {
        Self {
            subscriptions: DashMap::new(),
            next_id: AtomicU64::new(1),
            shutting_down,
        }
    }

    /// Register a callback for a path prefix.
    ///
    /// Fails with `ShuttingDown` once node shutdown has started.
    pub fn subscribe(
        &self,
        prefix: impl Into<String>,
        callback: Arc<SubscriberFn>,
    ) -> MeshResult<SubscriptionId> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(MeshError::ShuttingDown);
        }
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.subscriptions.insert(
            id,
            SubscriptionState {
                prefix: prefix.into(),
                callback,
                created_at: Utc::now(),
                events_delivered: AtomicU64::new(0),
            },
        );
        Ok(id)
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions.remove(&id).is_some()
    }

    /// Number of active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// List active subscriptions.
    pub fn list_subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.subscriptions
            .iter()
            .map(|entry| SubscriptionInfo {
                id: *entry.key(),
                prefix: entry.value().prefix.clone(),
                created_at: entry.value().created_at,
                events_delivered: entry.value().events_delivered.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Deliver a committed write to every matching subscription.
    ///
    /// Matching callbacks are snapshotted first so user code never runs
    /// while the registry is locked; a callback may subscribe or
    /// unsubscribe without deadlocking.
    pub fn notify(&self, path: &str, value: &JsonValue) {
        let matching: Vec<(SubscriptionId, Arc<SubscriberFn>)> = self
            .subscriptions
            .iter()
            .filter(|entry| paths_related(&entry.value().prefix, path))
            .map(|entry| (*entry.key(), entry.value().callback.clone()))
            .collect();

        for (id, callback) in matching {
            let result = catch_unwind(AssertUnwindSafe(|| callback(path, value)));
            match result {
                Ok(()) => {
                    if let Some(state) = self.subscriptions.get(&id) {
                        state.events_delivered.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(_) => warn!(%id, path, "subscriber panicked; continuing"),
            }
        }
    }
}
