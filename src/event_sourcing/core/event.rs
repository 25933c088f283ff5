use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

use crate::error::{StoreError, StoreResult};
use crate::utils::new_id;
use super::aggregate::AggregateIdentifier;

// ============================================================================
// Domain Event
// ============================================================================
//
// Immutable fact about one aggregate. Payloads are normalised to
// `serde_json::Value` on construction, so whatever reaches a store is
// always representable by every backend.
//
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    pub id: Uuid,
    pub aggregate_identifier: AggregateIdentifier,
    pub name: String,
    pub data: Value,
    pub metadata: DomainEventMetadata,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DomainEventMetadata {
    // Causation & Correlation
    pub causation_id: Uuid,
    pub correlation_id: Uuid,

    pub timestamp: DateTime<Utc>,
    pub initiator: Initiator,

    /// 1-based position in the aggregate's log
    pub revision: i64,
    pub tags: BTreeSet<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Initiator {
    pub user: InitiatorUser,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct InitiatorUser {
    pub id: String,
    #[serde(default)]
    pub claims: Value,
}

impl Default for Initiator {
    fn default() -> Self {
        Self {
            user: InitiatorUser {
                id: "system".to_string(),
                claims: Value::Object(Default::default()),
            },
        }
    }
}

impl DomainEvent {
    /// Build a new event. The event's own id doubles as causation and
    /// correlation id until told otherwise.
    pub fn new<D: Serialize>(
        aggregate_identifier: AggregateIdentifier,
        name: impl Into<String>,
        data: &D,
        revision: i64,
    ) -> StoreResult<Self> {
        if revision < 1 {
            return Err(StoreError::parameter(format!(
                "revision must be at least 1, got {revision}"
            )));
        }

        let id = new_id();

        Ok(Self {
            id,
            aggregate_identifier,
            name: name.into(),
            data: to_payload(data)?,
            metadata: DomainEventMetadata {
                causation_id: id,
                correlation_id: id,
                timestamp: Utc::now(),
                initiator: Initiator::default(),
                revision,
                tags: BTreeSet::new(),
            },
        })
    }

    pub fn with_causation_id(mut self, causation_id: Uuid) -> Self {
        self.metadata.causation_id = causation_id;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.metadata.correlation_id = correlation_id;
        self
    }

    pub fn with_initiator(mut self, initiator: Initiator) -> Self {
        self.metadata.initiator = initiator;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.metadata.timestamp = timestamp;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metadata.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn aggregate_id(&self) -> Uuid {
        self.aggregate_identifier.aggregate.id
    }

    pub fn revision(&self) -> i64 {
        self.metadata.revision
    }

    /// Decode the payload into a concrete type.
    pub fn data_as<D: for<'de> Deserialize<'de>>(&self) -> StoreResult<D> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

// ============================================================================
// Serialization Helpers
// ============================================================================

/// Normalise any serializable payload to a JSON value. Fields skipped by
/// their `Serialize` impl simply do not appear.
pub fn to_payload<D: Serialize + ?Sized>(data: &D) -> StoreResult<Value> {
    Ok(serde_json::to_value(data)?)
}

pub fn serialize_event(event: &DomainEvent) -> StoreResult<String> {
    Ok(serde_json::to_string(event)?)
}

pub fn deserialize_event(json: &str) -> StoreResult<DomainEvent> {
    Ok(serde_json::from_str(json)?)
}

// ============================================================================
// Tests
// ============================================================================
