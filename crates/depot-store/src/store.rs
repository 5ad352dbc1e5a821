//! Local file store assembly
//!
//! A store is a fixed set of states, a path layout, and the entry
//! registry. All access goes through transient file operations obtained
//! from [`LocalFileStore::new_file_op`].

use crate::file_map::{FileMap, LruFileMap, SimpleFileMap};
use crate::file_op::FileOp;
use crate::layout::PathLayout;
use crate::state::State;
use depot_common::{LayoutKind, Result, StoreConfig};
use std::fs;
use tracing::info;

/// Stateful local file store.
pub struct LocalFileStore {
    states: Vec<State>,
    layout: PathLayout,
    map: Box<dyn FileMap>,
}

impl LocalFileStore {
    /// Flat layout, unbounded registry.
    pub fn new(states: Vec<State>) -> Result<Self> {
        Self::build(states, PathLayout::Flat, Box::new(SimpleFileMap::new()))
    }

    /// CAS-sharded layout, unbounded registry.
    pub fn new_cas(states: Vec<State>) -> Result<Self> {
        Self::build(states, PathLayout::CasSharded, Box::new(SimpleFileMap::new()))
    }

    /// CAS-sharded layout with a bounded registry. Eviction drops the
    /// in-memory entry only; disk content and open handles survive.
    pub fn new_lru(states: Vec<State>, capacity: usize) -> Result<Self> {
        Self::build(
            states,
            PathLayout::CasSharded,
            Box::new(LruFileMap::new(capacity)),
        )
    }

    /// Assemble a store from daemon configuration.
    pub fn from_config(states: Vec<State>, config: &StoreConfig) -> Result<Self> {
        let layout = match config.layout {
            LayoutKind::Flat => PathLayout::Flat,
            LayoutKind::CasSharded => PathLayout::CasSharded,
        };
        let map: Box<dyn FileMap> = match config.max_entries {
            Some(capacity) => Box::new(LruFileMap::new(capacity)),
            None => Box::new(SimpleFileMap::new()),
        };
        Self::build(states, layout, map)
    }

    fn build(states: Vec<State>, layout: PathLayout, map: Box<dyn FileMap>) -> Result<Self> {
        for state in &states {
            fs::create_dir_all(state.directory())?;
        }
        info!(states = states.len(), ?layout, "initialized local file store");
        Ok(Self { states, layout, map })
    }

    /// Start a file operation. Each operation executes exactly one verb.
    pub fn new_file_op(&self) -> FileOp<'_> {
        FileOp::new(self)
    }

    /// The states this store was built with.
    #[must_use]
    pub fn states(&self) -> &[State] {
        &self.states
    }

    pub(crate) fn layout(&self) -> PathLayout {
        self.layout
    }

    pub(crate) fn map(&self) -> &dyn FileMap {
        self.map.as_ref()
    }
}
