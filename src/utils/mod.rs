pub mod hashing;
pub mod lenient;
pub mod retry;

pub use hashing::{hash_value, new_id, LockKey};
pub use retry::{retry_with_backoff, RetryConfig, RetryResult};
