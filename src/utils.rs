//! Utility functions and helpers for the Relay queue core
//!
//! Common helpers for identifier generation and timestamps.

use std::time::{SystemTime, UNIX_EPOCH};

/// Generate a globally unique task identifier
pub fn generate_task_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Generate a globally unique worker identifier
pub fn generate_worker_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Current wall-clock time as milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}
