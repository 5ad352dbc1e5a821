//! Reader and read-writer handles
//!
//! A handle owns its file descriptor plus a back-reference to the entry
//! for handle accounting. The descriptor pins the inode, so reads and
//! writes keep working across moves and after deletion; only new opens
//! observe the entry's current path.
//!
//! Part sizes select the transfer granularity: `0` issues whole-buffer
//! syscalls, `> 0` splits transfers into chunks of at most that many
//! bytes. The observable contract is identical either way.

use crate::entry::FileEntry;
use depot_common::Result;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::sync::Arc;

#[derive(Debug)]
struct Handle {
    file: Option<File>,
    entry: Arc<FileEntry>,
    read_part_size: usize,
    write_part_size: usize,
}

fn chunk_len(part_size: usize, remaining: usize) -> usize {
    if part_size == 0 {
        remaining
    } else {
        remaining.min(part_size)
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "handle is closed")
}

impl Handle {
    fn new(file: File, entry: Arc<FileEntry>, read_part_size: usize, write_part_size: usize) -> Self {
        Self {
            file: Some(file),
            entry,
            read_part_size,
            write_part_size,
        }
    }

    fn file(&self) -> io::Result<&File> {
        self.file.as_ref().ok_or_else(closed)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = chunk_len(self.read_part_size, buf.len());
        let mut file = self.file()?;
        file.read(&mut buf[..n])
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = chunk_len(self.write_part_size, buf.len());
        let mut file = self.file()?;
        file.write(&buf[..n])
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let mut file = self.file()?;
        file.seek(pos)
    }

    /// Fill `buf` from `offset`, stopping early only at end of file.
    fn read_at(&self, mut buf: &mut [u8], mut offset: u64) -> Result<usize> {
        let file = self.file()?;
        let mut total = 0;
        while !buf.is_empty() {
            let n = chunk_len(self.read_part_size, buf.len());
            match file.read_at(&mut buf[..n], offset) {
                Ok(0) => break,
                Ok(read) => {
                    total += read;
                    offset += read as u64;
                    buf = &mut buf[read..];
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    /// Write all of `buf` at `offset`.
    fn write_at(&self, mut buf: &[u8], mut offset: u64) -> Result<usize> {
        let file = self.file()?;
        let mut total = 0;
        while !buf.is_empty() {
            let n = chunk_len(self.write_part_size, buf.len());
            match file.write_at(&buf[..n], offset) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write_at wrote 0 bytes").into())
                }
                Ok(written) => {
                    total += written;
                    offset += written as u64;
                    buf = &buf[written..];
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    /// Idempotent: the first call drops the descriptor and releases the
    /// handle's slot on the entry.
    fn close(&mut self) {
        if self.file.take().is_some() {
            self.entry.release_handle();
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read-only handle over a tracked file.
#[derive(Debug)]
pub struct FileReader {
    inner: Handle,
}

impl FileReader {
    pub(crate) fn new(file: File, entry: Arc<FileEntry>, read_part_size: usize) -> Self {
        Self {
            inner: Handle::new(file, entry, read_part_size, 0),
        }
    }

    /// Read into `buf` starting at `offset`, without moving the cursor.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.inner.read_at(buf, offset)
    }

    /// Close the handle. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        self.inner.close();
        Ok(())
    }
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Seek for FileReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

/// Read-write handle over a tracked file.
pub struct FileReadWriter {
    inner: Handle,
}

impl FileReadWriter {
    pub(crate) fn new(
        file: File,
        entry: Arc<FileEntry>,
        read_part_size: usize,
        write_part_size: usize,
    ) -> Self {
        Self {
            inner: Handle::new(file, entry, read_part_size, write_part_size),
        }
    }

    /// Read into `buf` starting at `offset`, without moving the cursor.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.inner.read_at(buf, offset)
    }

    /// Write `buf` at `offset`, without moving the cursor.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        self.inner.write_at(buf, offset)
    }

    /// Close the handle. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        self.inner.close();
        Ok(())
    }
}

impl Read for FileReadWriter {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for FileReadWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for FileReadWriter {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}
