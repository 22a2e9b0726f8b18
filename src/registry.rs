//! Live subscriber sets keyed by project id.
//!
//! The registry is an injectable value shared as `Arc<ConnectionRegistry>`.
//! Delivery never propagates errors to callers: a subscriber that fails or
//! stalls past the delivery timeout is dropped from the registry.
//!
//! Lock order is always membership → projects, and no map guard is held
//! across an `.await`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::DeliveryError;
use crate::messages::ServerMessage;

/// Default bound on a single delivery.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

pub type SubscriberId = u64;

/// A live transport handle.
#[async_trait]
pub trait Subscriber: Send + Sync {
    fn id(&self) -> SubscriberId;

    async fn deliver(&self, message: &str) -> Result<(), DeliveryError>;
}

/// Subscriber backed by a bounded FIFO channel drained by one writer task.
pub struct ChannelSubscriber {
    id: SubscriberId,
    tx: mpsc::Sender<String>,
}

impl ChannelSubscriber {
    pub fn new(id: SubscriberId, capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { id, tx }, rx)
    }
}

#[async_trait]
impl Subscriber for ChannelSubscriber {
    fn id(&self) -> SubscriberId {
        self.id
    }

    async fn deliver(&self, message: &str) -> Result<(), DeliveryError> {
        self.tx
            .send(message.to_string())
            .await
            .map_err(|_| DeliveryError::Closed)
    }
}

pub struct ConnectionRegistry {
    projects: DashMap<i64, HashMap<SubscriberId, Arc<dyn Subscriber>>>,
    membership: DashMap<SubscriberId, i64>,
    next_id: AtomicU64,
    delivery_timeout: Duration,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_DELIVERY_TIMEOUT)
    }
}

impl ConnectionRegistry {
    pub fn new(delivery_timeout: Duration) -> Self {
        Self {
            projects: DashMap::new(),
            membership: DashMap::new(),
            next_id: AtomicU64::new(1),
            delivery_timeout,
        }
    }

    /// Allocate a fresh subscriber id.
    pub fn next_subscriber_id(&self) -> SubscriberId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Add `subscriber` to `project_id`'s set. Idempotent. A subscriber
    /// registered for another project is moved.
    pub fn register(&self, subscriber: Arc<dyn Subscriber>, project_id: i64) {
        let id = subscriber.id();
        let previous = self.membership.insert(id, project_id);
        if let Some(prev) = previous
            && prev != project_id
        {
            self.remove_from_project(prev, id);
        }
        self.projects
            .entry(project_id)
            .or_default()
            .insert(id, subscriber);
        debug!(subscriber = id, project_id, "subscriber registered");
    }

    /// Remove a subscriber from `project_id`. Idempotent; an emptied project
    /// entry is dropped.
    pub fn unregister(&self, subscriber: SubscriberId, project_id: i64) {
        self.membership
            .remove_if(&subscriber, |_, pid| *pid == project_id);
        if self.remove_from_project(project_id, subscriber) {
            debug!(subscriber, project_id, "subscriber unregistered");
        }
    }

    fn remove_from_project(&self, project_id: i64, subscriber: SubscriberId) -> bool {
        let removed = match self.projects.get_mut(&project_id) {
            Some(mut set) => set.remove(&subscriber).is_some(),
            None => false,
        };
        self.projects.remove_if(&project_id, |_, set| set.is_empty());
        removed
    }

    /// Drop a subscriber from whichever project it belongs to.
    fn forget(&self, subscriber: SubscriberId) {
        if let Some((_, project_id)) = self.membership.remove(&subscriber) {
            self.remove_from_project(project_id, subscriber);
        }
    }

    async fn deliver_bounded(
        &self,
        subscriber: &dyn Subscriber,
        message: &str,
    ) -> Result<(), DeliveryError> {
        match tokio::time::timeout(self.delivery_timeout, subscriber.deliver(message)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout),
        }
    }

    /// Deliver to one subscriber. A failure unregisters it and is swallowed.
    pub async fn unicast(&self, subscriber: &Arc<dyn Subscriber>, message: &str) -> bool {
        match self.deliver_bounded(subscriber.as_ref(), message).await {
            Ok(()) => true,
            Err(e) => {
                warn!(subscriber = subscriber.id(), error = %e, "unicast failed, dropping subscriber");
                self.forget(subscriber.id());
                false
            }
        }
    }

    /// Deliver to the subscribers registered for `project_id` when the call
    /// starts. Returns how many deliveries succeeded.
    pub async fn broadcast(&self, project_id: i64, message: &str) -> usize {
        let snapshot: Vec<Arc<dyn Subscriber>> = match self.projects.get(&project_id) {
            Some(set) => set.values().cloned().collect(),
            None => return 0,
        };

        let outcomes = join_all(snapshot.iter().map(|sub| async move {
            (sub.id(), self.deliver_bounded(sub.as_ref(), message).await)
        }))
        .await;

        let mut delivered = 0;
        for (id, outcome) in outcomes {
            match outcome {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(subscriber = id, project_id, error = %e, "delivery failed, dropping subscriber");
                    self.unregister(id, project_id);
                }
            }
        }
        delivered
    }

    /// Serialize and broadcast a [`ServerMessage`] to its project.
    pub async fn publish(&self, message: &ServerMessage) -> usize {
        match message.to_json() {
            Ok(json) => self.broadcast(message.project_id(), &json).await,
            Err(e) => {
                warn!(error = %e, "failed to serialize server message");
                0
            }
        }
    }

    /// Serialize and deliver a [`ServerMessage`] to one subscriber.
    pub async fn send_to(&self, subscriber: &Arc<dyn Subscriber>, message: &ServerMessage) -> bool {
        match message.to_json() {
            Ok(json) => self.unicast(subscriber, &json).await,
            Err(e) => {
                warn!(error = %e, "failed to serialize server message");
                false
            }
        }
    }

    /// Live subscribers for one project, or across all projects.
    pub fn count(&self, project_id: Option<i64>) -> usize {
        match project_id {
            Some(id) => self.projects.get(&id).map(|set| set.len()).unwrap_or(0),
            None => self.projects.iter().map(|entry| entry.value().len()).sum(),
        }
    }

    pub fn project_counts(&self) -> BTreeMap<i64, usize> {
        self.projects
            .iter()
            .map(|entry| (*entry.key(), entry.value().len()))
            .collect()
    }
}
