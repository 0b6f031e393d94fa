//! Wire codec for ownership records
//!
//! Records are stored as compact JSON:
//!
//! ```json
//! {"ownerId":"2f0c...","address":"http://10.0.1.5:5000","claimedAt":"2025-01-01T00:00:00Z"}
//! ```
//!
//! `claimedAt` is omitted when absent. A literal `null` document is rejected
//! instead of being read as "no record".

use thiserror::Error;

use crate::types::OwnershipRecord;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Ownership record document is null")]
    NullDocument,
    #[error("Malformed ownership record: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub fn encode(record: &OwnershipRecord) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(record)?)
}

pub fn decode(bytes: &[u8]) -> Result<OwnershipRecord, CodecError> {
    serde_json::from_slice::<Option<OwnershipRecord>>(bytes)?.ok_or(CodecError::NullDocument)
}
