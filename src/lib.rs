// ============================================================================
// cqrs-persistence
// ============================================================================
//
// Persistence and coordination layer for event-sourced services:
// - domain event store with optimistic concurrency and snapshots
// - TTL lock store keyed by hashed values
// - discriminator-ordered priority queue with leases
// - consumer progress and wake-up notifications
//
// Every store is a trait with in-memory and database-backed implementations
// selected at startup through `BackendOptions`.
//
// ============================================================================

pub mod backends;
pub mod config;
pub mod consumer_progress;
pub mod dispatch;
pub mod error;
pub mod event_sourcing;
pub mod factory;
pub mod locks;
pub mod metrics;
pub mod notifications;
pub mod priority_queue;
pub mod telemetry;
pub mod utils;

pub use error::{StoreError, StoreResult};
