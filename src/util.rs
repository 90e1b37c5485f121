//! Shared utility functions.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::time::timeout;

use crate::{Error, Result};

/// Number of hex characters kept from a SHA-256 digest.
pub const DIGEST_LEN: usize = 16;

/// Short, stable digest of any serializable value.
///
/// JSON objects serialize with sorted keys, so equal values always produce
/// equal digests. Values that cannot be serialized digest a fixed placeholder.
pub fn digest<T: Serialize + ?Sized>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_else(|_| b"<unserializable>".to_vec());
    digest_bytes(&bytes)
}

/// Short digest of raw bytes.
pub fn digest_bytes(bytes: &[u8]) -> String {
    let hash = Sha256::digest(bytes);
    let mut hex = hex::encode(hash);
    hex.truncate(DIGEST_LEN);
    hex
}

/// Truncate a string to at most `max` characters, marking the cut.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Await a future, failing with `Error::Timeout` once `duration` elapses.
pub async fn with_timeout<F, T>(duration: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, fut).await {
        Ok(inner) => inner,
        Err(_) => Err(Error::Timeout(duration)),
    }
}
