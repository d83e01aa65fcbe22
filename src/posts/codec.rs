//! Encoding of `post.record` files.
//!
//! Records are JSON objects with a fixed field order:
//! `{"title": .., "body": .., "date": .., "image": .., "summary": ..}`,
//! where `image` and `summary` are omitted when absent.

use super::{error::PostsError, types::PostRecord};

pub fn encode(record: &PostRecord) -> Result<Vec<u8>, PostsError> {
    Ok(serde_json::to_vec(record)?)
}

pub fn decode(bytes: &[u8]) -> Result<PostRecord, PostsError> {
    serde_json::from_slice(bytes).map_err(|e| PostsError::CorruptRecord(e.to_string()))
}
