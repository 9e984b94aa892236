//! Retry with pluggable backoff strategies. A strategy is just an
//! `Iterator<Item = Duration>`; when the iterator runs out, so do the retries.

pub mod retry;
pub mod strategy;

pub use retry::retry;
