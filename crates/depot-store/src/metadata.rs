//! Sidecar metadata protocol
//!
//! Every metadata kind lives in its own small file next to the main
//! file, named `<basename>_<kind>`. Descriptors are supplied by the
//! caller; the entry keeps a write-through byte cache per kind, mutated
//! only under the entry lock.

use depot_common::Result;
use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

/// A typed sidecar descriptor.
///
/// `kind` must match `[a-z0-9_]+`; it is the stable filename suffix of
/// the sidecar, so it has to stay unambiguous against hex main-file
/// names and survive restarts unchanged.
pub trait Metadata: Send {
    /// Stable identifier, used as the sidecar filename suffix.
    fn kind(&self) -> &'static str;

    /// Whether the sidecar follows the main file across state moves.
    /// Non-movable sidecars are dropped on transition.
    fn movable(&self) -> bool {
        false
    }

    /// Current value as bytes.
    fn serialize(&self) -> Result<Vec<u8>>;

    /// Replace the value from stored bytes.
    fn deserialize(&mut self, data: &[u8]) -> Result<()>;
}

/// Wall-clock last access of a tracked file, maintained by the cache
/// cleanup pass of the enclosing daemon. Follows the file across moves.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LastAccessTime {
    pub unix_secs: u64,
}

impl LastAccessTime {
    /// Capture the current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        let unix_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self { unix_secs }
    }
}

impl Metadata for LastAccessTime {
    fn kind(&self) -> &'static str {
        "last_access_time"
    }

    fn movable(&self) -> bool {
        true
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        Ok(self.unix_secs.to_be_bytes().to_vec())
    }

    fn deserialize(&mut self, data: &[u8]) -> Result<()> {
        let raw: [u8; 8] = data.try_into().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("last_access_time sidecar has {} bytes, want 8", data.len()),
            )
        })?;
        self.unix_secs = u64::from_be_bytes(raw);
        Ok(())
    }
}
