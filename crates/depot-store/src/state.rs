//! Store states
//!
//! A state is a named directory that holds tracked files. The set of
//! states is fixed when a store is built; files transition between
//! states via `move_file`.

use std::fmt;
use std::path::{Path, PathBuf};

/// A named directory root that tracked files move through.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct State {
    name: String,
    directory: PathBuf,
}

impl State {
    /// Define a state rooted at `directory` (absolute path).
    pub fn new(name: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            directory: directory.into(),
        }
    }

    /// State name, used in diagnostics and state-gate errors.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory root holding this state's files.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}
