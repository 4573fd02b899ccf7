//! Payload encoding for the persisted state
//!
//! The whole [`StoredData`] is written as indented JSON so the secret stays
//! readable with `kubectl get secret -o jsonpath`.

use crate::error::StoreResult;
use crate::types::StoredData;

/// Encode the state as pretty-printed JSON.
pub fn encode(data: &StoredData) -> StoreResult<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(data)?)
}

/// Decode a payload produced by [`encode`].
pub fn decode(payload: &[u8]) -> StoreResult<StoredData> {
    Ok(serde_json::from_slice(payload)?)
}
