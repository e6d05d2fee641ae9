//! File-lock helpers for append-only JSONL streams (§4.1 invariant 4).
//!
//! Writers hold an exclusive lock for the duration of the append; readers hold a
//! shared lock. `fs2` locks are advisory and held for the lifetime of the returned
//! guard, matching the teacher's tmp+fsync+rename idiom used elsewhere for crash-safe
//! writes (see `sqlite_store.rs`'s connection handling for the same "open, mutate,
//! close" shape).

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use fs2::FileExt;

pub struct ExclusiveGuard {
    file: File,
}

impl ExclusiveGuard {
    pub fn acquire(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }

    pub fn file(&mut self) -> &mut File {
        &mut self.file
    }
}

impl Drop for ExclusiveGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

pub struct SharedGuard {
    file: File,
}

impl SharedGuard {
    pub fn acquire(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        file.lock_shared()?;
        Ok(Self { file })
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

impl Drop for SharedGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
