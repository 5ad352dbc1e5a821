//! File operations
//!
//! A file operation is a transient command object binding an
//! acceptable-state set to a single verb against one entry:
//!
//! ```no_run
//! # use depot_store::{LocalFileStore, State};
//! # fn demo(store: &LocalFileStore, uploading: &State, cached: &State) -> depot_common::Result<()> {
//! store
//!     .new_file_op()
//!     .accept_state(uploading)
//!     .move_file("3d4f", cached)?;
//! # Ok(())
//! # }
//! ```
//!
//! Every verb resolves the entry through the registry (reloading it
//! from disk on miss), takes the entry lock, validates the state gate,
//! performs the filesystem call, and updates the registry. Operations
//! on the same entry are linearizable; operations on distinct entries
//! are independent.

use crate::entry::{EntryGuts, FileEntry, FileStat};
use crate::file_map::FileMap;
use crate::handle::{FileReader, FileReadWriter};
use crate::metadata::Metadata;
use crate::state::State;
use crate::store::LocalFileStore;
use depot_common::{Error, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// A deleted entry can reappear in the registry at most once per
/// concurrent delete; a few retries are always enough to resolve a
/// stable slot or a definitive miss.
const RESOLVE_RETRIES: usize = 3;

/// One file operation: an acceptable-state set plus exactly one verb.
pub struct FileOp<'a> {
    store: &'a LocalFileStore,
    accepted: Vec<State>,
}

impl<'a> FileOp<'a> {
    pub(crate) fn new(store: &'a LocalFileStore) -> Self {
        Self {
            store,
            accepted: Vec::new(),
        }
    }

    /// Widen the set of source states this operation accepts.
    ///
    /// An operation with an empty set accepts any state; `create_file`
    /// is the only verb commonly used unrestricted.
    #[must_use]
    pub fn accept_state(mut self, state: &State) -> Self {
        if !self.accepted.contains(state) {
            self.accepted.push(state.clone());
        }
        self
    }

    /// Create `name` in `target` with `size` zero bytes (sparse).
    ///
    /// If an entry already exists — resident or on disk — the accept
    /// set is verified first: a state outside it fails with
    /// `FileState`, an acceptable one with `FileExists`. Concurrent
    /// creates of a new name are arbitrated by the filesystem's
    /// exclusive create: exactly one succeeds.
    pub fn create_file(self, name: &str, target: &State, size: u64) -> Result<()> {
        for _ in 0..RESOLVE_RETRIES {
            if let Some(entry) = self.resolve_existing(name)? {
                let guts = entry.lock();
                if entry.is_deleted() {
                    drop(guts);
                    self.store.map().remove(name, &entry);
                    continue;
                }
                entry.verify(&guts, "create_file", &self.accepted)?;
                return Err(Error::exists(entry.current_path(&guts)?));
            }

            // New name: bind a fresh entry to the target state and let
            // the exclusive create arbitrate insertion races.
            let fresh = self.store.layout().create_entry(name, target)?;
            let entry = self.store.map().try_store(name, fresh);
            let mut guts = entry.lock();
            if entry.is_deleted() {
                drop(guts);
                self.store.map().remove(name, &entry);
                continue;
            }
            return match entry.create(&mut guts, target, size) {
                Ok(()) => Ok(()),
                Err(e) if e.is_exists() || e.is_file_state_error() => Err(e),
                Err(e) => {
                    // The slot holds an entry with no backing file.
                    entry.mark_deleted();
                    drop(guts);
                    self.store.map().remove(name, &entry);
                    Err(e)
                }
            };
        }
        Err(Error::not_found(name))
    }

    /// Move `name` into `target`. Open handles keep the inode.
    pub fn move_file(self, name: &str, target: &State) -> Result<()> {
        self.with_entry("move_file", name, |entry, guts| entry.move_to(guts, target))
    }

    /// Hard-link `name`'s current file to the absolute path `dst`.
    /// Entry state is unchanged; sidecars are not linked.
    pub fn link_file_to(self, name: &str, dst: impl AsRef<Path>) -> Result<()> {
        let dst = dst.as_ref();
        self.with_entry("link_file_to", name, |entry, guts| entry.link_to(guts, dst))
    }

    /// Delete `name`: main file, sidecars, and the registry slot.
    /// Outstanding handles stay readable and writable until closed.
    pub fn delete_file(self, name: &str) -> Result<()> {
        let entry = self.with_entry("delete_file", name, |entry, guts| {
            entry.delete(guts)?;
            Ok(Arc::clone(entry))
        })?;
        // Map lock is taken only after the entry lock is released.
        self.store.map().remove(name, &entry);
        Ok(())
    }

    /// Size and mtime of `name`'s main file.
    pub fn get_file_stat(self, name: &str) -> Result<FileStat> {
        self.with_entry("get_file_stat", name, |entry, guts| entry.stat(guts))
    }

    /// Open a read-only handle.
    pub fn get_file_reader(self, name: &str, read_part_size: usize) -> Result<FileReader> {
        self.with_entry("get_file_reader", name, |entry, guts| {
            entry.open_reader(guts, read_part_size)
        })
    }

    /// Open a read-write handle.
    pub fn get_file_read_writer(
        self,
        name: &str,
        read_part_size: usize,
        write_part_size: usize,
    ) -> Result<FileReadWriter> {
        self.with_entry("get_file_read_writer", name, |entry, guts| {
            entry.open_read_writer(guts, read_part_size, write_part_size)
        })
    }

    /// Populate `desc` from the stored sidecar of its kind.
    pub fn get_file_metadata(self, name: &str, desc: &mut dyn Metadata) -> Result<()> {
        self.with_entry("get_file_metadata", name, |entry, guts| {
            entry.get_metadata(guts, desc)
        })
    }

    /// Load the stored value into `desc`, or persist `desc`'s value if
    /// the kind does not exist yet.
    pub fn get_or_set_file_metadata(self, name: &str, desc: &mut dyn Metadata) -> Result<()> {
        self.with_entry("get_or_set_file_metadata", name, |entry, guts| {
            entry.get_or_set_metadata(guts, desc)
        })
    }

    /// Write `desc`'s value; `true` iff the stored bytes changed.
    pub fn set_file_metadata(self, name: &str, desc: &dyn Metadata) -> Result<bool> {
        self.with_entry("set_file_metadata", name, |entry, guts| {
            entry.set_metadata(guts, desc)
        })
    }

    /// Overwrite a byte range of the stored sidecar in place; `true`
    /// iff any byte changed.
    pub fn set_file_metadata_at(
        self,
        name: &str,
        desc: &dyn Metadata,
        data: &[u8],
        offset: u64,
    ) -> Result<bool> {
        self.with_entry("set_file_metadata_at", name, |entry, guts| {
            entry.set_metadata_at(guts, desc, data, offset)
        })
    }

    /// Remove the sidecar of `desc`'s kind. Succeeds even if absent.
    pub fn delete_file_metadata(self, name: &str, desc: &dyn Metadata) -> Result<()> {
        self.with_entry("delete_file_metadata", name, |entry, guts| {
            entry.delete_metadata(guts, desc)
        })
    }

    /// Resolve a resident entry, falling back to a disk reload.
    fn resolve_existing(&self, name: &str) -> Result<Option<Arc<FileEntry>>> {
        if let Some(entry) = self.store.map().load(name) {
            return Ok(Some(entry));
        }
        self.reload(name)
    }

    /// Probe every known state for `name` and materialize the entry.
    /// Zero hits is a miss; more than one is on-disk corruption.
    fn reload(&self, name: &str) -> Result<Option<Arc<FileEntry>>> {
        let relative = self.store.layout().relative_path(name)?;
        let mut found: Vec<&State> = Vec::new();
        for state in self.store.states() {
            if state.directory().join(&relative).is_file() {
                found.push(state);
            }
        }
        match found.as_slice() {
            [] => Ok(None),
            [state] => {
                let entry = self.store.layout().create_entry(name, state)?;
                debug!(name, state = %state, "reloaded entry from disk");
                Ok(Some(self.store.map().try_store(name, entry)))
            }
            states => Err(Error::Corrupt {
                name: name.to_string(),
                states: states.iter().map(|s| s.name().to_string()).collect(),
            }),
        }
    }

    /// Resolve, lock, gate, run. The per-entry lock is held for the
    /// whole of `f`; the registry lock is never held at the same time.
    fn with_entry<T, F>(&self, op: &'static str, name: &str, f: F) -> Result<T>
    where
        F: FnOnce(&Arc<FileEntry>, &mut EntryGuts) -> Result<T>,
    {
        let mut f = Some(f);
        for _ in 0..RESOLVE_RETRIES {
            let entry = match self.resolve_existing(name)? {
                Some(entry) => entry,
                None => return Err(Error::not_found(name)),
            };
            let mut guts = entry.lock();
            if entry.is_deleted() {
                // Stale slot left behind by a concurrent delete.
                drop(guts);
                self.store.map().remove(name, &entry);
                continue;
            }
            entry.verify(&guts, op, &self.accepted)?;
            let f = f.take().expect("verb closure runs once");
            return f(&entry, &mut guts);
        }
        Err(Error::not_found(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_common::Digest;
    use rand::RngCore;
    use std::fs;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use tempfile::TempDir;

    #[derive(Clone, Copy)]
    enum FixtureKind {
        Flat,
        Cas,
        Lru,
    }

    struct Bundle {
        _root: TempDir,
        kind: FixtureKind,
        store: LocalFileStore,
        s1: State,
        s2: State,
        s3: State,
    }

    impl Bundle {
        fn new(kind: FixtureKind) -> Self {
            let root = TempDir::new().unwrap();
            let s1 = State::new("s1", root.path().join("s1"));
            let s2 = State::new("s2", root.path().join("s2"));
            let s3 = State::new("s3", root.path().join("s3"));
            let store = Self::build_store(kind, &[s1.clone(), s2.clone(), s3.clone()]);
            Self {
                _root: root,
                kind,
                store,
                s1,
                s2,
                s3,
            }
        }

        fn build_store(kind: FixtureKind, states: &[State]) -> LocalFileStore {
            let states = states.to_vec();
            match kind {
                FixtureKind::Flat => LocalFileStore::new(states),
                FixtureKind::Cas => LocalFileStore::new_cas(states),
                FixtureKind::Lru => LocalFileStore::new_lru(states, 2),
            }
            .unwrap()
        }

        /// Rebuild the store over the same directories, as after a
        /// process restart: the registry starts empty.
        fn recreate_store(&mut self) {
            self.store = Self::build_store(
                self.kind,
                &[self.s1.clone(), self.s2.clone(), self.s3.clone()],
            );
        }

        fn op(&self) -> FileOp<'_> {
            self.store.new_file_op()
        }

        fn contains(&self, name: &str) -> bool {
            self.store.map().contains(name)
        }

        fn main_path(&self, state: &State, name: &str) -> PathBuf {
            state
                .directory()
                .join(self.store.layout().relative_path(name).unwrap())
        }

        fn sidecar_path(&self, state: &State, name: &str, kind: &str) -> PathBuf {
            self.main_path(state, name)
                .parent()
                .unwrap()
                .join(format!("{name}_{kind}"))
        }

        /// Create a fixture file in `state` and return its name.
        fn create_fixture_file(&self, state: &State) -> String {
            let name = digest_fixture();
            self.op().create_file(&name, state, 5).unwrap();
            name
        }
    }

    fn all_fixtures() -> Vec<Bundle> {
        vec![
            Bundle::new(FixtureKind::Flat),
            Bundle::new(FixtureKind::Cas),
            Bundle::new(FixtureKind::Lru),
        ]
    }

    fn digest_fixture() -> String {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        Digest::from_bytes(&raw).hex().to_string()
    }

    #[derive(Clone)]
    struct MockMetadata {
        kind_name: &'static str,
        is_movable: bool,
        content: Vec<u8>,
    }

    impl MockMetadata {
        fn one() -> Self {
            Self {
                kind_name: "mock1",
                is_movable: false,
                content: Vec::new(),
            }
        }

        fn movable() -> Self {
            Self {
                kind_name: "mock2",
                is_movable: true,
                content: Vec::new(),
            }
        }
    }

    impl Metadata for MockMetadata {
        fn kind(&self) -> &'static str {
            self.kind_name
        }

        fn movable(&self) -> bool {
            self.is_movable
        }

        fn serialize(&self) -> Result<Vec<u8>> {
            Ok(self.content.clone())
        }

        fn deserialize(&mut self, data: &[u8]) -> Result<()> {
            self.content = data.to_vec();
            Ok(())
        }
    }

    #[test]
    fn test_create_file_is_exclusive_under_contention() {
        for bundle in all_fixtures() {
            let name = digest_fixture();
            let successes = AtomicUsize::new(0);
            let already_exists = AtomicUsize::new(0);

            thread::scope(|scope| {
                for _ in 0..100 {
                    scope.spawn(|| {
                        match bundle
                            .op()
                            .accept_state(&bundle.s1)
                            .create_file(&name, &bundle.s1, 5)
                        {
                            Ok(()) => successes.fetch_add(1, Ordering::SeqCst),
                            Err(e) if e.is_exists() => {
                                already_exists.fetch_add(1, Ordering::SeqCst)
                            }
                            Err(e) => panic!("unexpected error: {e}"),
                        };
                    });
                }
            });

            assert_eq!(successes.load(Ordering::SeqCst), 1);
            assert_eq!(already_exists.load(Ordering::SeqCst), 99);
            assert!(bundle.main_path(&bundle.s1, &name).is_file());

            // Re-create with a different target but the current state
            // accepted: the existing file wins.
            let err = bundle
                .op()
                .accept_state(&bundle.s1)
                .create_file(&name, &bundle.s2, 5)
                .unwrap_err();
            assert!(err.is_exists());
            assert!(bundle.main_path(&bundle.s1, &name).is_file());
        }
    }

    #[test]
    fn test_create_file_state_gate() {
        for bundle in all_fixtures() {
            let name = bundle.create_fixture_file(&bundle.s1);

            // Existing file in a state outside the accept set.
            let err = bundle
                .op()
                .accept_state(&bundle.s3)
                .create_file(&name, &bundle.s2, 5)
                .unwrap_err();
            assert!(err.is_file_state_error());
            assert!(err.to_string().starts_with("failed to perform"));
            assert!(bundle.main_path(&bundle.s1, &name).is_file());
        }
    }

    #[test]
    fn test_cas_layout_on_disk() {
        let bundle = Bundle::new(FixtureKind::Cas);
        let name = bundle.create_fixture_file(&bundle.s1);
        let expected = bundle
            .s1
            .directory()
            .join(&name[0..2])
            .join(&name[2..4])
            .join(&name);
        assert!(expected.is_file());

        let err = bundle.op().create_file("xyz", &bundle.s1, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidName { .. }));
    }

    #[test]
    fn test_get_file_stat() {
        for bundle in all_fixtures() {
            let name = bundle.create_fixture_file(&bundle.s1);
            let stat = bundle
                .op()
                .accept_state(&bundle.s1)
                .get_file_stat(&name)
                .unwrap();
            assert_eq!(stat.size, 5);

            let err = bundle
                .op()
                .accept_state(&bundle.s2)
                .get_file_stat(&name)
                .unwrap_err();
            assert!(err.is_file_state_error());
        }
    }

    #[test]
    fn test_reload_round_trip() {
        for mut bundle in all_fixtures() {
            let name = bundle.create_fixture_file(&bundle.s1);
            let mut m = MockMetadata::one();
            m.content = b"foo".to_vec();
            let updated = bundle
                .op()
                .accept_state(&bundle.s1)
                .set_file_metadata(&name, &m)
                .unwrap();
            assert!(updated);
            assert!(bundle.contains(&name));

            // Restart: the registry is empty until an operation
            // references the on-disk file.
            bundle.recreate_store();
            assert!(!bundle.contains(&name));

            let reader = bundle
                .op()
                .accept_state(&bundle.s1)
                .get_file_reader(&name, 0)
                .unwrap();
            drop(reader);
            assert!(bundle.contains(&name));

            let mut result = MockMetadata::one();
            bundle
                .op()
                .accept_state(&bundle.s1)
                .get_file_metadata(&name, &mut result)
                .unwrap();
            assert_eq!(result.content, b"foo");
        }
    }

    #[test]
    fn test_move_file() {
        for bundle in all_fixtures() {
            let name = bundle.create_fixture_file(&bundle.s1);
            let part = 100;

            let mut rw = bundle
                .op()
                .accept_state(&bundle.s1)
                .get_file_read_writer(&name, part, part)
                .unwrap();
            rw.write_all(b"test\n").unwrap();
            rw.close().unwrap();
            let mut rw_old = bundle
                .op()
                .accept_state(&bundle.s1)
                .get_file_read_writer(&name, part, part)
                .unwrap();

            bundle
                .op()
                .accept_state(&bundle.s1)
                .move_file(&name, &bundle.s2)
                .unwrap();
            assert!(bundle.main_path(&bundle.s2, &name).is_file());
            assert!(!bundle.main_path(&bundle.s1, &name).exists());
            bundle
                .op()
                .accept_state(&bundle.s2)
                .get_file_reader(&name, part)
                .unwrap();

            // Stale accept set after the move.
            let err = bundle
                .op()
                .accept_state(&bundle.s1)
                .move_file(&name, &bundle.s3)
                .unwrap_err();
            assert!(err.is_file_state_error());

            // A handle opened before the move and one opened after see
            // the same inode.
            let mut rw_new = bundle
                .op()
                .accept_state(&bundle.s2)
                .get_file_read_writer(&name, part, part)
                .unwrap();
            let mut via_new = Vec::new();
            let mut via_old = Vec::new();
            rw_new.read_to_end(&mut via_new).unwrap();
            rw_old.read_to_end(&mut via_old).unwrap();
            assert_eq!(via_new, via_old);
            assert_eq!(via_new, b"test\n");

            rw_new.write_at(b"1", 0).unwrap();
            rw_new.seek(SeekFrom::Start(0)).unwrap();
            rw_old.seek(SeekFrom::Start(0)).unwrap();
            via_new.clear();
            via_old.clear();
            rw_new.read_to_end(&mut via_new).unwrap();
            rw_old.read_to_end(&mut via_old).unwrap();
            assert_eq!(via_new, via_old);
            assert_eq!(via_new, b"1est\n");

            rw_old.close().unwrap();
            rw_new.close().unwrap();

            let mut reopened = bundle
                .op()
                .accept_state(&bundle.s2)
                .get_file_read_writer(&name, part, part)
                .unwrap();
            let mut content = Vec::new();
            reopened.read_to_end(&mut content).unwrap();
            assert_eq!(content, b"1est\n");
            reopened.close().unwrap();

            // And back again.
            bundle
                .op()
                .accept_state(&bundle.s2)
                .move_file(&name, &bundle.s1)
                .unwrap();
            bundle
                .op()
                .accept_state(&bundle.s1)
                .get_file_reader(&name, part)
                .unwrap();
        }
    }

    #[test]
    fn test_move_file_relocates_movable_sidecars_only() {
        for bundle in all_fixtures() {
            let name = bundle.create_fixture_file(&bundle.s1);

            let mut fixed = MockMetadata::one();
            fixed.content = b"f".to_vec();
            let mut movable = MockMetadata::movable();
            movable.content = b"m".to_vec();
            let op = bundle.op().accept_state(&bundle.s1);
            op.set_file_metadata(&name, &fixed).unwrap();
            bundle
                .op()
                .accept_state(&bundle.s1)
                .set_file_metadata(&name, &movable)
                .unwrap();

            bundle
                .op()
                .accept_state(&bundle.s1)
                .move_file(&name, &bundle.s2)
                .unwrap();

            assert!(bundle.sidecar_path(&bundle.s2, &name, "mock2").is_file());
            assert!(!bundle.sidecar_path(&bundle.s1, &name, "mock2").exists());
            assert!(!bundle.sidecar_path(&bundle.s1, &name, "mock1").exists());
            assert!(!bundle.sidecar_path(&bundle.s2, &name, "mock1").exists());

            let mut result = MockMetadata::movable();
            bundle
                .op()
                .accept_state(&bundle.s2)
                .get_file_metadata(&name, &mut result)
                .unwrap();
            assert_eq!(result.content, b"m");

            let err = bundle
                .op()
                .accept_state(&bundle.s2)
                .get_file_metadata(&name, &mut MockMetadata::one())
                .unwrap_err();
            assert!(err.is_not_found());
        }
    }

    #[test]
    fn test_link_file_to() {
        for bundle in all_fixtures() {
            let name = bundle.create_fixture_file(&bundle.s1);
            let dst = bundle.s3.directory().join("test_dst");

            bundle
                .op()
                .accept_state(&bundle.s1)
                .link_file_to(&name, &dst)
                .unwrap();
            assert!(dst.is_file());

            // State unchanged by linking.
            bundle
                .op()
                .accept_state(&bundle.s1)
                .get_file_stat(&name)
                .unwrap();

            let err = bundle
                .op()
                .accept_state(&bundle.s1)
                .link_file_to(&name, &dst)
                .unwrap_err();
            assert!(err.is_exists());
        }
    }

    #[test]
    fn test_delete_file_keeps_open_handles_valid() {
        for bundle in all_fixtures() {
            let name = bundle.create_fixture_file(&bundle.s1);
            let content = b"this a test for read after delete";

            let mut rw = bundle
                .op()
                .accept_state(&bundle.s1)
                .get_file_read_writer(&name, 100, 100)
                .unwrap();
            rw.write_all(content).unwrap();

            bundle.op().accept_state(&bundle.s1).delete_file(&name).unwrap();
            assert!(!bundle.main_path(&bundle.s1, &name).exists());

            // The descriptor still references the unlinked inode.
            rw.seek(SeekFrom::Start(0)).unwrap();
            let mut read_back = Vec::new();
            rw.read_to_end(&mut read_back).unwrap();
            assert_eq!(read_back, content);

            rw.write_all(content).unwrap();
            rw.seek(SeekFrom::Start(0)).unwrap();
            read_back.clear();
            rw.read_to_end(&mut read_back).unwrap();
            assert_eq!(read_back.len(), content.len() * 2);

            rw.close().unwrap();
            rw.close().unwrap(); // close is idempotent

            let err = bundle
                .op()
                .accept_state(&bundle.s1)
                .get_file_reader(&name, 100)
                .unwrap_err();
            assert!(err.is_not_found());
        }
    }

    #[test]
    fn test_get_file_reader_concurrently() {
        for bundle in all_fixtures() {
            let name = bundle.create_fixture_file(&bundle.s1);
            let mut rw = bundle
                .op()
                .accept_state(&bundle.s1)
                .get_file_read_writer(&name, 100, 100)
                .unwrap();
            rw.write_all(b"test\n").unwrap();

            thread::scope(|scope| {
                for _ in 0..100 {
                    scope.spawn(|| {
                        let mut reader = bundle
                            .op()
                            .accept_state(&bundle.s1)
                            .get_file_reader(&name, 100)
                            .unwrap();
                        let mut buf = [0u8; 5];
                        reader.seek(SeekFrom::Start(0)).unwrap();
                        let n = reader.read_at(&mut buf, 0).unwrap();
                        assert_eq!(n, 5);
                        assert_eq!(&buf, b"test\n");
                        reader.close().unwrap();
                    });
                }
            });

            rw.close().unwrap();
        }
    }

    #[test]
    fn test_get_file_read_writer_concurrently() {
        for bundle in all_fixtures() {
            let name = bundle.create_fixture_file(&bundle.s1);

            thread::scope(|scope| {
                for _ in 0..100 {
                    scope.spawn(|| {
                        let mut rw = bundle
                            .op()
                            .accept_state(&bundle.s1)
                            .get_file_read_writer(&name, 100, 100)
                            .unwrap();
                        rw.write_all(b"test\n").unwrap();

                        let mut buf = [0u8; 3];
                        rw.seek(SeekFrom::Start(1)).unwrap();
                        rw.read_exact(&mut buf).unwrap();
                        assert_eq!(&buf, b"est");
                        rw.close().unwrap();
                    });
                }
            });

            let reader = bundle
                .op()
                .accept_state(&bundle.s1)
                .get_file_reader(&name, 100)
                .unwrap();
            let mut buf = [0u8; 5];
            let n = reader.read_at(&mut buf, 0).unwrap();
            assert_eq!(n, 5);
            assert_eq!(&buf, b"test\n");
        }
    }

    #[test]
    fn test_get_or_set_file_metadata_concurrently() {
        for bundle in all_fixtures() {
            let name = bundle.create_fixture_file(&bundle.s1);
            let original = b"foo";

            thread::scope(|scope| {
                for _ in 0..50 {
                    scope.spawn(|| {
                        let mut m = MockMetadata::one();
                        m.content = original.to_vec();
                        bundle
                            .op()
                            .accept_state(&bundle.s1)
                            .get_or_set_file_metadata(&name, &mut m)
                            .unwrap();
                        assert_eq!(m.content, original);
                    });
                }
            });

            let mut m = MockMetadata::one();
            bundle
                .op()
                .accept_state(&bundle.s1)
                .get_file_metadata(&name, &mut m)
                .unwrap();
            assert_eq!(m.content, original);
        }
    }

    #[test]
    fn test_set_file_metadata_at_concurrently() {
        for bundle in all_fixtures() {
            let name = bundle.create_fixture_file(&bundle.s1);

            let mut m = MockMetadata::one();
            m.content = vec![0u8; 50];
            let updated = bundle
                .op()
                .accept_state(&bundle.s1)
                .set_file_metadata(&name, &m)
                .unwrap();
            assert!(updated);

            let bundle = &bundle;
            let name = &name;
            thread::scope(|scope| {
                for offset in 0..50u64 {
                    scope.spawn(move || {
                        let m = MockMetadata::one();
                        bundle
                            .op()
                            .accept_state(&bundle.s1)
                            .set_file_metadata_at(name, &m, b"f", offset)
                            .unwrap();
                    });
                }
            });

            let mut result = MockMetadata::one();
            bundle
                .op()
                .accept_state(&bundle.s1)
                .get_file_metadata(&name, &mut result)
                .unwrap();
            assert_eq!(result.content, vec![b'f'; 50]);
        }
    }

    #[test]
    fn test_set_file_metadata_reports_changes() {
        for bundle in all_fixtures() {
            let name = bundle.create_fixture_file(&bundle.s1);
            let mut m = MockMetadata::one();
            m.content = b"a".to_vec();

            assert!(bundle
                .op()
                .accept_state(&bundle.s1)
                .set_file_metadata(&name, &m)
                .unwrap());
            assert!(!bundle
                .op()
                .accept_state(&bundle.s1)
                .set_file_metadata(&name, &m)
                .unwrap());

            m.content = b"b".to_vec();
            assert!(bundle
                .op()
                .accept_state(&bundle.s1)
                .set_file_metadata(&name, &m)
                .unwrap());
        }
    }

    #[test]
    fn test_set_file_metadata_at_rejects_bad_ranges() {
        for bundle in all_fixtures() {
            let name = bundle.create_fixture_file(&bundle.s1);
            let mut m = MockMetadata::one();

            // Sidecar must already exist.
            let err = bundle
                .op()
                .accept_state(&bundle.s1)
                .set_file_metadata_at(&name, &m, b"f", 0)
                .unwrap_err();
            assert!(err.is_not_found());

            m.content = vec![0u8; 10];
            bundle
                .op()
                .accept_state(&bundle.s1)
                .set_file_metadata(&name, &m)
                .unwrap();
            let err = bundle
                .op()
                .accept_state(&bundle.s1)
                .set_file_metadata_at(&name, &m, b"ffff", 8)
                .unwrap_err();
            assert!(matches!(err, Error::OutOfRange { .. }));
        }
    }

    #[test]
    fn test_delete_file_metadata_is_idempotent() {
        for bundle in all_fixtures() {
            let name = bundle.create_fixture_file(&bundle.s1);
            let mut m = MockMetadata::one();

            // Deleting a sidecar that never existed succeeds.
            bundle
                .op()
                .accept_state(&bundle.s1)
                .delete_file_metadata(&name, &m)
                .unwrap();

            m.content = vec![0u8; 1];
            let updated = bundle
                .op()
                .accept_state(&bundle.s1)
                .set_file_metadata(&name, &m)
                .unwrap();
            assert!(updated);

            bundle
                .op()
                .accept_state(&bundle.s1)
                .get_file_metadata(&name, &mut m)
                .unwrap();
            bundle
                .op()
                .accept_state(&bundle.s1)
                .delete_file_metadata(&name, &m)
                .unwrap();
            let err = bundle
                .op()
                .accept_state(&bundle.s1)
                .get_file_metadata(&name, &mut m)
                .unwrap_err();
            assert!(err.is_not_found());
        }
    }

    #[test]
    fn test_missing_file_is_not_found() {
        for bundle in all_fixtures() {
            let err = bundle
                .op()
                .accept_state(&bundle.s1)
                .get_file_stat(&digest_fixture())
                .unwrap_err();
            assert!(err.is_not_found());
        }
    }

    #[test]
    fn test_same_name_in_two_states_is_corrupt() {
        let bundle = Bundle::new(FixtureKind::Flat);
        let name = "dup";
        fs::write(bundle.s1.directory().join(name), b"x").unwrap();
        fs::write(bundle.s2.directory().join(name), b"x").unwrap();

        let err = bundle.op().get_file_stat(name).unwrap_err();
        assert!(matches!(err, Error::Corrupt { .. }));
    }

    #[test]
    fn test_lru_eviction_is_map_only() {
        let bundle = Bundle::new(FixtureKind::Lru);
        let first = bundle.create_fixture_file(&bundle.s1);

        let mut reader = bundle
            .op()
            .accept_state(&bundle.s1)
            .get_file_reader(&first, 0)
            .unwrap();

        // Capacity is two; two more creates push `first` out.
        let _second = bundle.create_fixture_file(&bundle.s1);
        let _third = bundle.create_fixture_file(&bundle.s1);
        assert!(!bundle.contains(&first));

        // Disk content and the open handle are untouched by eviction.
        assert!(bundle.main_path(&bundle.s1, &first).is_file());
        let mut buf = [0u8; 5];
        let n = reader.read_at(&mut buf, 0).unwrap();
        assert_eq!(n, 5);
        reader.close().unwrap();

        // A later operation reloads the entry from disk.
        let stat = bundle
            .op()
            .accept_state(&bundle.s1)
            .get_file_stat(&first)
            .unwrap();
        assert_eq!(stat.size, 5);
        assert!(bundle.contains(&first));
    }
}
