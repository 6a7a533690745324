//! Normalized cluster events and the watch loop producing them.

pub mod dedup;
pub mod watcher;

use crate::resource::ResourceKey;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Event as KubeEvent;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use dedup::EventDeduplicator;
pub use watcher::{synthesize_terminal_events, EventWatcher};

/// Object an event is about
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvolvedObject {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl InvolvedObject {
    #[must_use]
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.kind, &self.namespace, &self.name)
    }
}

impl fmt::Display for InvolvedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.key(), f)
    }
}

/// Normalized event record, consumed once by the matcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub involved_object: InvolvedObject,
    pub reason: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub source_resource_version: String,
    /// Generated by a resync scan rather than observed on the event stream
    #[serde(default)]
    pub synthetic: bool,
}

impl ClusterEvent {
    /// Event stamped with the current time.
    #[must_use]
    pub fn new(involved_object: InvolvedObject, reason: &str, message: &str) -> Self {
        Self {
            involved_object,
            reason: reason.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
            source_resource_version: String::new(),
            synthetic: false,
        }
    }

    #[must_use]
    pub fn key(&self) -> ResourceKey {
        self.involved_object.key()
    }

    /// Normalize a core/v1 Event. Returns `None` for events without an
    /// identifiable involved object.
    #[must_use]
    pub fn from_kube_event(event: &KubeEvent) -> Option<Self> {
        let object = &event.involved_object;
        let kind = object.kind.clone().filter(|k| !k.is_empty())?;
        let name = object.name.clone().filter(|n| !n.is_empty())?;

        let timestamp = event
            .last_timestamp
            .as_ref()
            .map(|t| t.0)
            .or_else(|| event.event_time.as_ref().map(|t| t.0))
            .or_else(|| event.first_timestamp.as_ref().map(|t| t.0))
            .or_else(|| event.metadata.creation_timestamp.as_ref().map(|t| t.0))
            .unwrap_or_else(Utc::now);

        Some(Self {
            involved_object: InvolvedObject {
                kind,
                namespace: object.namespace.clone().unwrap_or_default(),
                name,
                uid: object.uid.clone().unwrap_or_default(),
            },
            reason: event.reason.clone().unwrap_or_default(),
            message: event.message.clone().unwrap_or_default(),
            timestamp,
            source_resource_version: event.metadata.resource_version.clone().unwrap_or_default(),
            synthetic: false,
        })
    }
}
