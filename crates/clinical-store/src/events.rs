//! Post-commit change notifications.
//!
//! Every committed create, update and delete produces one
//! [`ResourceChangeEvent`] per touched resource. Events are handed to the
//! injected [`ResourceChangePublisher`] after the database commit, so a
//! subscriber never sees a change that was rolled back. A failing publisher
//! is logged and otherwise ignored.
//!
//! ```
//! use helios_clinical_store::events::{
//!     ChangeKind, CollectingPublisher, ResourceChangeEvent, ResourceChangePublisher,
//! };
//! use helios_clinical_store::types::StoredResource;
//! use serde_json::json;
//!
//! let publisher = CollectingPublisher::new();
//! let resource = StoredResource::new("Patient", "p1", json!({"resourceType": "Patient"}));
//! publisher
//!     .publish(&ResourceChangeEvent::from_resource(ChangeKind::Created, &resource))
//!     .unwrap();
//!
//! assert_eq!(publisher.events()[0].id, "p1");
//! ```

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::StoredResource;

/// What happened to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl ChangeKind {
    /// Returns the kind as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A committed change to one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceChangeEvent {
    pub kind: ChangeKind,
    pub resource_type: String,
    pub id: String,
    pub version_id: String,
    pub last_updated: DateTime<Utc>,
}

impl ResourceChangeEvent {
    /// Builds an event describing the version a write produced.
    pub fn from_resource(kind: ChangeKind, resource: &StoredResource) -> Self {
        Self {
            kind,
            resource_type: resource.resource_type().to_string(),
            id: resource.id().to_string(),
            version_id: resource.version_id().to_string(),
            last_updated: resource.last_modified(),
        }
    }
}

/// A publisher could not deliver an event.
#[derive(Debug, thiserror::Error)]
#[error("failed to publish change event: {message}")]
pub struct PublishError {
    pub message: String,
}

impl PublishError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Receives change events after commit.
///
/// Implementations must not block for long: publication runs on the
/// writer's task.
pub trait ResourceChangePublisher: Send + Sync {
    fn publish(&self, event: &ResourceChangeEvent) -> Result<(), PublishError>;
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

impl ResourceChangePublisher for NoopPublisher {
    fn publish(&self, _event: &ResourceChangeEvent) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Fans events out over a tokio broadcast channel.
///
/// Having no subscribers is not an error. Slow subscribers lag and lose
/// the oldest events, as with any broadcast receiver.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<ResourceChangeEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribes to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceChangeEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ResourceChangePublisher for BroadcastPublisher {
    fn publish(&self, event: &ResourceChangeEvent) -> Result<(), PublishError> {
        // send only fails when nobody is listening.
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

/// Records events in memory.
#[derive(Debug, Default)]
pub struct CollectingPublisher {
    events: Mutex<Vec<ResourceChangeEvent>>,
}

impl CollectingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of everything recorded so far.
    pub fn events(&self) -> Vec<ResourceChangeEvent> {
        self.events.lock().clone()
    }

    /// Returns and forgets everything recorded so far.
    pub fn take(&self) -> Vec<ResourceChangeEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl ResourceChangePublisher for CollectingPublisher {
    fn publish(&self, event: &ResourceChangeEvent) -> Result<(), PublishError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Publishes events in order, logging failures.
pub(crate) fn publish_all(publisher: &dyn ResourceChangePublisher, events: &[ResourceChangeEvent]) {
    for event in events {
        match publisher.publish(event) {
            Ok(()) => tracing::debug!(
                kind = %event.kind,
                resource_type = %event.resource_type,
                id = %event.id,
                version = %event.version_id,
                "published change event"
            ),
            Err(e) => tracing::warn!(
                kind = %event.kind,
                resource_type = %event.resource_type,
                id = %event.id,
                error = %e,
                "change event publication failed"
            ),
        }
    }
}
