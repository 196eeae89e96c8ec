//! Resilience Module - Retries with exponential backoff
//! Used for connection bootstrap and for optimistic-write conflicts

mod retry;

pub use retry::{with_retry_async, with_retry_if, RetryConfig};
