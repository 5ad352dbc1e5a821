//! File entries
//!
//! One entry per tracked file: identity, current state, the per-entry
//! lock, the sidecar byte cache, and the open-handle count that
//! decouples the inode's lifetime from the entry's on-disk path.
//!
//! Entry methods are invoked through the file-operation façade and
//! receive the lock guard; they never lock themselves.

use crate::handle::{FileReader, FileReadWriter};
use crate::layout::PathLayout;
use crate::metadata::Metadata;
use crate::state::State;
use depot_common::{Error, Result};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

/// Size and mtime of a tracked file, as reported by `get_file_stat`.
#[derive(Clone, Debug)]
pub struct FileStat {
    pub size: u64,
    pub modified: SystemTime,
}

/// Cached sidecar content plus the movability learned from the
/// descriptor that last touched it.
#[derive(Debug)]
struct CachedMeta {
    bytes: Vec<u8>,
    movable: bool,
}

/// Mutable half of an entry, guarded by the per-entry lock.
#[derive(Debug)]
pub(crate) struct EntryGuts {
    state: State,
    metadata: HashMap<String, CachedMeta>,
}

/// In-memory record for one tracked file.
///
/// Shared as `Arc`: the registry holds one reference, every open handle
/// holds another. Deletion and LRU eviction drop the registry reference
/// only; the entry object lives until the last handle closes.
#[derive(Debug)]
pub struct FileEntry {
    name: String,
    layout: PathLayout,
    guts: Mutex<EntryGuts>,
    open_handles: AtomicUsize,
    deleted: AtomicBool,
}

impl FileEntry {
    pub(crate) fn new(name: &str, layout: PathLayout, state: State) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            layout,
            guts: Mutex::new(EntryGuts {
                state,
                metadata: HashMap::new(),
            }),
            open_handles: AtomicUsize::new(0),
            deleted: AtomicBool::new(false),
        })
    }

    /// Logical name of the tracked file.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EntryGuts> {
        self.guts.lock()
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::SeqCst);
    }

    fn path_in(&self, state: &State) -> Result<PathBuf> {
        Ok(state.directory().join(self.layout.relative_path(&self.name)?))
    }

    pub(crate) fn current_path(&self, guts: &EntryGuts) -> Result<PathBuf> {
        self.path_in(&guts.state)
    }

    fn sidecar_path(&self, state: &State, kind: &str) -> Result<PathBuf> {
        let main = self.path_in(state)?;
        let parent = main
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| state.directory().to_path_buf());
        Ok(parent.join(format!("{}_{}", self.name, kind)))
    }

    /// Kinds of every sidecar present on disk next to the main file.
    fn sidecar_kinds_on_disk(&self, state: &State) -> Result<Vec<String>> {
        let main = self.path_in(state)?;
        let parent = match main.parent() {
            Some(p) => p.to_path_buf(),
            None => state.directory().to_path_buf(),
        };
        let prefix = format!("{}_", self.name);
        let mut kinds = Vec::new();
        let dir = match fs::read_dir(&parent) {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(kinds),
            Err(e) => return Err(e.into()),
        };
        for item in dir {
            let item = item?;
            if let Some(file_name) = item.file_name().to_str() {
                if let Some(kind) = file_name.strip_prefix(&prefix) {
                    kinds.push(kind.to_string());
                }
            }
        }
        Ok(kinds)
    }

    /// Fail with `FileState` unless the current state is acceptable.
    /// An empty accept set accepts any state.
    pub(crate) fn verify(&self, guts: &EntryGuts, op: &'static str, accepted: &[State]) -> Result<()> {
        if accepted.is_empty() || accepted.contains(&guts.state) {
            return Ok(());
        }
        Err(Error::FileState {
            op,
            name: self.name.clone(),
            current: guts.state.name().to_string(),
            accepted: accepted.iter().map(|s| s.name().to_string()).collect(),
        })
    }

    /// Exclusive-create the main file at the bound state and size it.
    ///
    /// The filesystem's exclusive create is the race arbiter: exactly
    /// one concurrent creator succeeds, the rest observe `FileExists`.
    pub(crate) fn create(&self, guts: &mut EntryGuts, target: &State, size: u64) -> Result<()> {
        if guts.state != *target {
            return Err(Error::FileState {
                op: "create_file",
                name: self.name.clone(),
                current: guts.state.name().to_string(),
                accepted: vec![target.name().to_string()],
            });
        }
        let path = self.current_path(guts)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(Error::exists(path));
            }
            Err(e) => return Err(e.into()),
        };
        if let Err(e) = file.set_len(size) {
            let _ = fs::remove_file(&path);
            return Err(e.into());
        }
        debug!(name = %self.name, state = %guts.state, size, "created file");
        Ok(())
    }

    /// Rename the main file into `target`, then relocate sidecars.
    ///
    /// The main rename is atomic on the local filesystem and is never
    /// rolled back; the first sidecar failure is surfaced after the
    /// remaining sidecars have been attempted. Open handles keep
    /// referencing the same inode.
    pub(crate) fn move_to(&self, guts: &mut EntryGuts, target: &State) -> Result<()> {
        let src = self.current_path(guts)?;
        let dst = self.path_in(target)?;
        if dst.exists() {
            return Err(Error::exists(dst));
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        let kinds = self.sidecar_kinds_on_disk(&guts.state)?;
        fs::rename(&src, &dst)?;
        let source = std::mem::replace(&mut guts.state, target.clone());
        debug!(name = %self.name, from = %source, to = %target, "moved file");

        let mut first_err = None;
        for kind in kinds {
            if let Err(e) = self.relocate_sidecar(guts, &source, target, &kind) {
                warn!(name = %self.name, kind = %kind, error = %e, "sidecar relocation failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Movable sidecars follow the main file; non-movable sidecars are
    /// dropped from disk and cache. A kind never seen by this process
    /// defaults to movable so it stays co-located with the main file.
    fn relocate_sidecar(
        &self,
        guts: &mut EntryGuts,
        source: &State,
        target: &State,
        kind: &str,
    ) -> Result<()> {
        let from = self.sidecar_path(source, kind)?;
        let movable = guts.metadata.get(kind).map_or(true, |m| m.movable);
        if movable {
            let to = self.sidecar_path(target, kind)?;
            fs::rename(&from, &to)?;
        } else {
            guts.metadata.remove(kind);
            remove_ignoring_not_found(&from)?;
        }
        Ok(())
    }

    /// Hard-link the main file to `dst`. State and sidecars untouched.
    pub(crate) fn link_to(&self, guts: &EntryGuts, dst: &Path) -> Result<()> {
        let src = self.current_path(guts)?;
        match fs::hard_link(&src, dst) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(Error::exists(dst)),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the main file and every sidecar, and mark the entry
    /// deleted. Open handles keep the inode alive; the registry slot is
    /// dropped by the caller after the lock is released.
    pub(crate) fn delete(&self, guts: &mut EntryGuts) -> Result<()> {
        for kind in self.sidecar_kinds_on_disk(&guts.state)? {
            let path = self.sidecar_path(&guts.state, &kind)?;
            remove_ignoring_not_found(&path)?;
        }
        guts.metadata.clear();
        let main = self.current_path(guts)?;
        remove_ignoring_not_found(&main)?;
        self.mark_deleted();
        debug!(name = %self.name, state = %guts.state, "deleted file");
        Ok(())
    }

    pub(crate) fn stat(&self, guts: &EntryGuts) -> Result<FileStat> {
        let path = self.current_path(guts)?;
        let meta = fs::metadata(&path).map_err(|e| map_not_found(e, &path))?;
        Ok(FileStat {
            size: meta.len(),
            modified: meta.modified()?,
        })
    }

    pub(crate) fn open_reader(
        self: &Arc<Self>,
        guts: &EntryGuts,
        read_part_size: usize,
    ) -> Result<FileReader> {
        let path = self.current_path(guts)?;
        let file = File::open(&path).map_err(|e| map_not_found(e, &path))?;
        self.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(FileReader::new(file, Arc::clone(self), read_part_size))
    }

    pub(crate) fn open_read_writer(
        self: &Arc<Self>,
        guts: &EntryGuts,
        read_part_size: usize,
        write_part_size: usize,
    ) -> Result<FileReadWriter> {
        let path = self.current_path(guts)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| map_not_found(e, &path))?;
        self.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(FileReadWriter::new(
            file,
            Arc::clone(self),
            read_part_size,
            write_part_size,
        ))
    }

    pub(crate) fn release_handle(&self) {
        let before = self.open_handles.fetch_sub(1, Ordering::SeqCst);
        if before == 1 && self.is_deleted() {
            debug!(name = %self.name, "last handle closed on deleted entry");
        }
    }

    // Metadata verbs. All run under the entry lock; the cache is a
    // write-through projection of the sidecar files.

    /// Cached or on-disk bytes for `kind`; populates the cache on a disk
    /// hit. `None` means the sidecar does not exist.
    fn read_current(
        &self,
        guts: &mut EntryGuts,
        kind: &str,
        movable: bool,
    ) -> Result<Option<Vec<u8>>> {
        if let Some(cached) = guts.metadata.get(kind) {
            return Ok(Some(cached.bytes.clone()));
        }
        let path = self.sidecar_path(&guts.state, kind)?;
        match fs::read(&path) {
            Ok(bytes) => {
                guts.metadata.insert(
                    kind.to_string(),
                    CachedMeta {
                        bytes: bytes.clone(),
                        movable,
                    },
                );
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_sidecar(
        &self,
        guts: &mut EntryGuts,
        kind: &str,
        movable: bool,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let path = self.sidecar_path(&guts.state, kind)?;
        fs::write(&path, &bytes)?;
        guts.metadata.insert(kind.to_string(), CachedMeta { bytes, movable });
        Ok(())
    }

    pub(crate) fn get_metadata(&self, guts: &mut EntryGuts, desc: &mut dyn Metadata) -> Result<()> {
        let kind = desc.kind();
        match self.read_current(guts, kind, desc.movable())? {
            Some(bytes) => desc.deserialize(&bytes),
            None => Err(Error::not_found(self.sidecar_path(&guts.state, kind)?)),
        }
    }

    /// Load the stored value into `desc` if the kind exists, otherwise
    /// persist `desc`'s value. Either way `desc` ends up holding the
    /// authoritative bytes.
    pub(crate) fn get_or_set_metadata(
        &self,
        guts: &mut EntryGuts,
        desc: &mut dyn Metadata,
    ) -> Result<()> {
        let kind = desc.kind();
        if let Some(bytes) = self.read_current(guts, kind, desc.movable())? {
            return desc.deserialize(&bytes);
        }
        let bytes = desc.serialize()?;
        self.write_sidecar(guts, kind, desc.movable(), bytes)
    }

    /// Unconditional write-through; `true` iff the stored bytes changed.
    pub(crate) fn set_metadata(&self, guts: &mut EntryGuts, desc: &dyn Metadata) -> Result<bool> {
        let kind = desc.kind();
        let bytes = desc.serialize()?;
        let current = self.read_current(guts, kind, desc.movable())?;
        if current.as_deref() == Some(bytes.as_slice()) {
            return Ok(false);
        }
        self.write_sidecar(guts, kind, desc.movable(), bytes)?;
        Ok(true)
    }

    /// Overwrite `[offset, offset + data.len())` of the stored sidecar
    /// in place; the range must lie within the current content.
    pub(crate) fn set_metadata_at(
        &self,
        guts: &mut EntryGuts,
        desc: &dyn Metadata,
        data: &[u8],
        offset: u64,
    ) -> Result<bool> {
        let kind = desc.kind();
        let mut current = match self.read_current(guts, kind, desc.movable())? {
            Some(bytes) => bytes,
            None => return Err(Error::not_found(self.sidecar_path(&guts.state, kind)?)),
        };
        let size = current.len();
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let end = match start.checked_add(data.len()) {
            Some(end) if end <= size => end,
            _ => {
                return Err(Error::OutOfRange {
                    offset,
                    len: data.len(),
                    size,
                })
            }
        };
        if &current[start..end] == data {
            return Ok(false);
        }
        current[start..end].copy_from_slice(data);
        self.write_sidecar(guts, kind, desc.movable(), current)?;
        Ok(true)
    }

    /// Remove the sidecar and its cache slot. Removing an absent sidecar
    /// succeeds.
    pub(crate) fn delete_metadata(&self, guts: &mut EntryGuts, desc: &dyn Metadata) -> Result<()> {
        let kind = desc.kind();
        guts.metadata.remove(kind);
        let path = self.sidecar_path(&guts.state, kind)?;
        remove_ignoring_not_found(&path)
    }
}

fn remove_ignoring_not_found(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn map_not_found(e: io::Error, path: &Path) -> Error {
    if e.kind() == io::ErrorKind::NotFound {
        Error::not_found(path)
    } else {
        Error::Io(e)
    }
}
