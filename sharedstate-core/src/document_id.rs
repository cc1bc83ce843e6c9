//! Document ids for shared elements.
//!
//! Every (room, element) pair maps to exactly one document id, computed as
//! `bs58check(sha256(room ":" element)[0..16])`. Two clients that bind the
//! same element in the same room therefore address the same document
//! without any coordination.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::element::{ElementId, RoomId};

/// Errors that can occur with document ids
#[derive(Error, Debug)]
pub enum DocumentIdError {
    #[error("Invalid bs58check encoding: {0}")]
    InvalidEncoding(String),

    #[error("Invalid document ID length: expected 16 bytes, got {0}")]
    InvalidLength(usize),
}

/// A 16-byte document id, displayed and serialized as bs58check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId([u8; 16]);

impl DocumentId {
    /// Derives the document id for an element in a room.
    pub fn for_element(room: &RoomId, element: &ElementId) -> Self {
        Self(truncated_digest(&[
            room.as_str().as_bytes(),
            b":".as_slice(),
            element.as_str().as_bytes(),
        ]))
    }

    /// Create a document ID from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Encode as bs58check string
    pub fn to_bs58check(&self) -> String {
        bs58::encode(&self.0).with_check().into_string()
    }

    /// Decode from bs58check string
    pub fn from_bs58check(s: &str) -> Result<Self, DocumentIdError> {
        let bytes = bs58::decode(s)
            .with_check(None)
            .into_vec()
            .map_err(|e| DocumentIdError::InvalidEncoding(e.to_string()))?;

        if bytes.len() != 16 {
            return Err(DocumentIdError::InvalidLength(bytes.len()));
        }

        let mut arr = [0u8; 16];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

/// Filesystem-safe key for a room, used by server-side storage.
pub fn room_key(room: &RoomId) -> String {
    bs58::encode(truncated_digest(&[room.as_str().as_bytes()])).into_string()
}

pub(crate) fn truncated_digest(parts: &[&[u8]]) -> [u8; 16] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let hash = hasher.finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&hash[..16]);
    out
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_bs58check())
    }
}

impl std::str::FromStr for DocumentId {
    type Err = DocumentIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bs58check(s)
    }
}

impl Serialize for DocumentId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_bs58check())
    }
}

impl<'de> Deserialize<'de> for DocumentId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_bs58check(&s).map_err(serde::de::Error::custom)
    }
}
