//! Utility functions for ModelHub
//!
//! This module provides utility functions used throughout the ModelHub system.

use std::future::Future;
use std::time::Duration;

use bytesize::ByteSize;
use tokio::time::timeout;

use crate::error::{Error, Result};

/// Formats a byte size into a human-readable string
///
/// # Examples
///
/// ```
/// use common::utils::format_bytes;
///
/// assert_eq!(format_bytes(1024), "1.0 KiB");
/// assert_eq!(format_bytes(1048576), "1.0 MiB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    ByteSize::b(bytes).to_string_as(true)
}

/// Executes a future with a timeout, mapping expiry to the error built by `on_timeout`
///
/// # Examples
///
/// ```
/// use common::utils::execute_with_timeout;
/// use common::{Error, InferenceError};
/// use std::time::Duration;
///
/// let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
/// let result = rt.block_on(execute_with_timeout(
///     async { Ok::<_, Error>(42) },
///     Duration::from_secs(1),
///     |d| InferenceError::Timeout(d).into(),
/// ));
/// assert_eq!(result.unwrap(), 42);
/// ```
pub async fn execute_with_timeout<T, F, E>(future: F, duration: Duration, on_timeout: E) -> Result<T>
where
    F: Future<Output = Result<T>>,
    E: FnOnce(Duration) -> Error,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout(duration)),
    }
}

/// Truncates a string to at most `max_chars` characters, adding an ellipsis if truncated
///
/// # Examples
///
/// ```
/// use common::utils::truncate_string;
///
/// assert_eq!(truncate_string("Hello, world!", 5), "Hello...");
/// assert_eq!(truncate_string("Hello", 10), "Hello");
/// ```
pub fn truncate_string(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
