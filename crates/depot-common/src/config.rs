//! Configuration types for depot
//!
//! This module defines the store configuration consumed by the enclosing
//! daemon when it assembles its stores.

use serde::{Deserialize, Serialize};

/// How logical names map to relative on-disk paths.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutKind {
    /// Name used as-is.
    Flat,
    /// Hex names sharded into two levels of two-hex-char directories.
    CasSharded,
}

/// Configuration for a local file store
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path layout for tracked files
    pub layout: LayoutKind,
    /// Bound on resident registry entries; `None` keeps the registry
    /// unbounded. Eviction drops the in-memory entry only, never disk.
    pub max_entries: Option<usize>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            layout: LayoutKind::CasSharded,
            max_entries: None,
        }
    }
}
