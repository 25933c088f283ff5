// ============================================================================
// Event Sourcing Core - Data Model
// ============================================================================
//
// Aggregate identity, domain events and snapshots shared by every backend.
//
// ============================================================================

pub mod aggregate;
pub mod event;
pub mod snapshot;

// Re-export core types for convenience
pub use aggregate::{AggregateIdentifier, AggregateReference, ContextIdentifier};
pub use event::{
    deserialize_event, serialize_event, to_payload, DomainEvent, DomainEventMetadata, Initiator,
    InitiatorUser,
};
pub use snapshot::{Snapshot, SnapshotStrategy};
