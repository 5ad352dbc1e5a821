//! Core type definitions for depot
//!
//! This module defines the identifier types shared between the store and
//! the transfer layer.

use crate::error::Error;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;

/// Length of a SHA-256 digest rendered as hex.
pub const DIGEST_HEX_LEN: usize = 64;

/// A content digest rendered as lowercase hex.
///
/// The store consumes only the hex string (it is the file name in
/// content-addressed layouts); computing digests over artifact content
/// belongs to the transfer layer.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct Digest(String);

impl Digest {
    /// Compute the SHA-256 digest of `data`.
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(data)))
    }

    /// Wrap an existing hex rendering, validating the grammar
    /// (`[0-9a-f]{64}`).
    pub fn from_hex(hex_str: impl Into<String>) -> Result<Self, Error> {
        let hex_str = hex_str.into();
        if hex_str.len() != DIGEST_HEX_LEN
            || !hex_str.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(Error::InvalidName { name: hex_str });
        }
        Ok(Self(hex_str))
    }

    /// Get the hex rendering
    #[must_use]
    pub fn hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.0)
    }
}
