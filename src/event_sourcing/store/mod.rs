// ============================================================================
// Event Sourcing Store - Persistence Layer
// ============================================================================
//
// One contract, three backends:
// - in-memory (reference implementation, tests)
// - PostgreSQL
// - ScyllaDB
//
// ============================================================================

pub mod event_store;
mod in_memory;
mod postgres;
mod scylla;

pub use event_store::{
    AggregateIdentifierStream, DomainEventStore, DomainEventStream, RevisionRange,
};
pub use in_memory::InMemoryDomainEventStore;
pub use postgres::PostgresDomainEventStore;
pub use scylla::ScyllaDomainEventStore;
