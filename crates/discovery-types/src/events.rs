//! Event types for registry observability
//!
//! Every state change in the registry (records published or withdrawn,
//! references bound and released) is reported as a [`DiscoveryEvent`].

use crate::{RecordId, ReferenceId, Status};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all discovery events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryEventEnvelope {
    /// Unique event ID
    pub id: Uuid,

    /// Event timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// The actual event
    pub event: DiscoveryEvent,
}

impl DiscoveryEventEnvelope {
    pub fn new(event: DiscoveryEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            event,
        }
    }
}

/// Discovery events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiscoveryEvent {
    // Record lifecycle
    RecordPublished {
        record_id: RecordId,
        name: String,
        service_type: String,
    },

    RecordUnpublished {
        record_id: RecordId,
        name: String,
    },

    StatusChanged {
        record_id: RecordId,
        from: Status,
        to: Status,
    },

    MetadataUpdated {
        record_id: RecordId,
    },

    // Reference lifecycle
    ReferenceAcquired {
        reference_id: ReferenceId,
        record_id: RecordId,
        use_count: usize,
    },

    ReferenceReleased {
        reference_id: ReferenceId,
        record_id: RecordId,
        use_count: usize,
    },

    HandleDestroyed {
        reference_id: ReferenceId,
        record_id: RecordId,
    },
}

impl DiscoveryEvent {
    /// Record the event is about.
    pub fn record_id(&self) -> &RecordId {
        match self {
            DiscoveryEvent::RecordPublished { record_id, .. }
            | DiscoveryEvent::RecordUnpublished { record_id, .. }
            | DiscoveryEvent::StatusChanged { record_id, .. }
            | DiscoveryEvent::MetadataUpdated { record_id }
            | DiscoveryEvent::ReferenceAcquired { record_id, .. }
            | DiscoveryEvent::ReferenceReleased { record_id, .. }
            | DiscoveryEvent::HandleDestroyed { record_id, .. } => record_id,
        }
    }
}
