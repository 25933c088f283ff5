// ============================================================================
// Backend Connections
// ============================================================================
//
// Connection setup and helpers shared by all stores of one engine. The
// store-specific adapters live next to their contracts.
//
// ============================================================================

pub mod postgres;
pub mod redis;
pub mod scylla;
