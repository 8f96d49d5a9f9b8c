use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Result, anyhow};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use redline_protocol::{EngagementId, Notification, ServerMessage};

pub type SubscriberId = String;

/// A client notification handle. Returning an error deregisters it.
pub type Callback = Arc<dyn Fn(&Notification) -> Result<()> + Send + Sync>;

type Target = (EngagementId, SubscriberId, Callback);

/// Engagement id -> subscriber id -> callback.
///
/// Callbacks run outside the lock, so a slow or re-entrant callback never
/// blocks other registry operations.
pub struct SubscriptionRegistry {
    entries: Mutex<HashMap<EngagementId, HashMap<SubscriberId, Callback>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<EngagementId, HashMap<SubscriberId, Callback>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self, engagement_id: &str, callback: Callback) -> SubscriberId {
        let subscriber_id = uuid::Uuid::new_v4().to_string();
        self.entries()
            .entry(engagement_id.to_string())
            .or_default()
            .insert(subscriber_id.clone(), callback);
        debug!(engagement_id, subscriber_id = %subscriber_id, "subscribed");
        subscriber_id
    }

    pub fn unsubscribe(&self, engagement_id: &str, subscriber_id: &str) -> bool {
        let mut entries = self.entries();
        let Some(subs) = entries.get_mut(engagement_id) else {
            return false;
        };
        let removed = subs.remove(subscriber_id).is_some();
        if subs.is_empty() {
            entries.remove(engagement_id);
        }
        removed
    }

    /// Drop every subscription for one engagement. Returns how many were removed.
    pub fn remove_engagement(&self, engagement_id: &str) -> usize {
        self.entries()
            .remove(engagement_id)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Drop every subscription. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries();
        let count = entries.values().map(HashMap::len).sum();
        entries.clear();
        count
    }

    pub fn subscriber_count(&self, engagement_id: &str) -> usize {
        self.entries().get(engagement_id).map(HashMap::len).unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.entries().values().map(HashMap::len).sum()
    }

    /// Notify every subscriber of one engagement. Returns the delivered count.
    pub fn broadcast(&self, engagement_id: &str, notification: &Notification) -> usize {
        let targets: Vec<Target> = self
            .entries()
            .get(engagement_id)
            .map(|subs| {
                subs.iter()
                    .map(|(sid, cb)| (engagement_id.to_string(), sid.clone(), Arc::clone(cb)))
                    .collect()
            })
            .unwrap_or_default();
        self.deliver(targets, notification)
    }

    /// Notify every subscriber of every engagement.
    pub fn broadcast_all(&self, notification: &Notification) -> usize {
        let targets: Vec<Target> = self
            .entries()
            .iter()
            .flat_map(|(eid, subs)| {
                subs.iter()
                    .map(|(sid, cb)| (eid.clone(), sid.clone(), Arc::clone(cb)))
            })
            .collect();
        self.deliver(targets, notification)
    }

    fn deliver(&self, targets: Vec<Target>, notification: &Notification) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();
        for (engagement_id, subscriber_id, callback) in targets {
            match callback(notification) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(
                        engagement_id = %engagement_id,
                        subscriber_id = %subscriber_id,
                        error = %err,
                        "subscriber failed, deregistering"
                    );
                    failed.push((engagement_id, subscriber_id));
                }
            }
        }

        if !failed.is_empty() {
            let mut entries = self.entries();
            for (engagement_id, subscriber_id) in failed {
                if let Some(subs) = entries.get_mut(&engagement_id) {
                    subs.remove(&subscriber_id);
                    if subs.is_empty() {
                        entries.remove(&engagement_id);
                    }
                }
            }
        }
        delivered
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Adapt a connection's outbound queue into a callback. A full or closed queue fails the callback.
pub fn channel_callback(tx: mpsc::Sender<ServerMessage>) -> Callback {
    Arc::new(move |notification: &Notification| {
        tx.try_send(ServerMessage::from(notification.clone()))
            .map_err(|err| match err {
                TrySendError::Full(_) => anyhow!("subscriber queue full"),
                TrySendError::Closed(_) => anyhow!("subscriber disconnected"),
            })
    })
}
