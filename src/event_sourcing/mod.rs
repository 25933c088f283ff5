// ============================================================================
// Event Sourcing
// ============================================================================
//
// Data model (aggregate identity, domain events, snapshots) and the domain
// event store built on it.
//
// ============================================================================

pub mod core;
pub mod store;

pub use self::core::*;
pub use self::store::*;
