pub mod retry;

pub use retry::{compute_retry_delay, RetryPolicy, RETRY_BASE_DELAY, RETRY_MAX_DELAY};
