//! Path layout strategies
//!
//! A layout maps a logical file name to its relative path under a state
//! directory. Two layouts exist:
//! - flat: the name is the path
//! - CAS-sharded: lowercase-hex names split into two levels of
//!   two-hex-char directories to bound per-directory fanout

use crate::entry::FileEntry;
use crate::state::State;
use depot_common::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;

/// Minimum length of a name accepted by the CAS layout.
const MIN_CAS_NAME_LEN: usize = 4;

/// Strategy mapping logical names to relative on-disk paths.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathLayout {
    /// Name used as-is; any filesystem-legal basename is accepted.
    Flat,
    /// Content-addressed sharding: `name[0..2]/name[2..4]/name`.
    /// Names must be lowercase hex of at least four characters.
    CasSharded,
}

impl PathLayout {
    /// Relative path of `name` under a state directory.
    ///
    /// Pure; never touches disk. CAS names violating the hex-prefix
    /// precondition fail with `InvalidName`.
    pub fn relative_path(&self, name: &str) -> Result<PathBuf> {
        match self {
            Self::Flat => Ok(PathBuf::from(name)),
            Self::CasSharded => {
                if name.len() < MIN_CAS_NAME_LEN || !is_lower_hex(name) {
                    return Err(Error::InvalidName { name: name.to_string() });
                }
                Ok([&name[0..2], &name[2..4], name].iter().collect())
            }
        }
    }

    /// Build an entry for `name` bound to `state`, without touching disk.
    pub(crate) fn create_entry(&self, name: &str, state: &State) -> Result<Arc<FileEntry>> {
        self.relative_path(name)?;
        Ok(FileEntry::new(name, *self, state.clone()))
    }
}

fn is_lower_hex(name: &str) -> bool {
    name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
