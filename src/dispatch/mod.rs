// ============================================================================
// Dispatch
// ============================================================================
//
// Command dispatch on top of the priority queue: enqueue + wake-up on one
// side, lease / process / settle with background renewal on the other.
//
// ============================================================================

mod lease_keeper;
mod worker;

pub use lease_keeper::LeaseKeeper;
pub use worker::{Dispatcher, ProcessOutcome, Worker};
