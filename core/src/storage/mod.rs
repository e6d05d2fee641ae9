//! Append-only JSONL stream storage (§4.1). Single source of truth for all learning
//! state; every other component reads and writes through here.

pub mod lock;
pub mod record;

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::error::{CoreError, CoreResult, ErrorKind};
use lock::{ExclusiveGuard, SharedGuard};

/// Named append-only streams under `work/memory/`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stream {
    Experiences,
    Insights,
    Skills,
    Knowledge,
    Entities,
    Relations,
    Curriculum,
    GenesisSuggestions,
    StimulusDone,
    AutonomicAudit,
}

impl Stream {
    pub fn file_stem(&self) -> &'static str {
        match self {
            Stream::Experiences => "experiences",
            Stream::Insights => "insights",
            Stream::Skills => "skills",
            Stream::Knowledge => "knowledge",
            Stream::Entities => "entities",
            Stream::Relations => "relations",
            Stream::Curriculum => "curriculum",
            Stream::GenesisSuggestions => "genesis_suggestions",
            Stream::StimulusDone => "stimulus_done",
            Stream::AutonomicAudit => "autonomic_audit",
        }
    }
}

/// Handle to `work/memory/`. Cheap to clone (just a path).
#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(work_root: impl AsRef<Path>) -> CoreResult<Self> {
        let root = work_root.as_ref().join("memory");
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, stream: Stream) -> PathBuf {
        self.root.join(format!("{}.jsonl", stream.file_stem()))
    }

    fn archive_path_for(&self, stream: Stream) -> PathBuf {
        self.root
            .join(format!("{}.archive.jsonl", stream.file_stem()))
    }

    /// Atomically appends one record as a single JSON line. Holds an exclusive lock
    /// for the duration of the write.
    pub fn append<T: Serialize>(&self, stream: Stream, record: &T) -> CoreResult<()> {
        let path = self.path_for(stream);
        let mut guard = ExclusiveGuard::acquire(&path)?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        guard.file().seek(SeekFrom::End(0))?;
        guard.file().write_all(line.as_bytes())?;
        guard.file().sync_all()?;
        Ok(())
    }

    /// Reads records in append order, skipping malformed lines (logged, never
    /// propagated). `max_records`, if given, returns only the most recent N.
    pub fn read<T: DeserializeOwned>(
        &self,
        stream: Stream,
        max_records: Option<usize>,
    ) -> CoreResult<Vec<T>> {
        let path = self.path_for(stream);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let guard = SharedGuard::acquire(&path)?;
        let reader = BufReader::new(guard.file());
        let mut out = Vec::new();
        for (i, line) in reader.lines().enumerate() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    warn!(stream = stream.file_stem(), line = i, error = %e, "unreadable line, skipping");
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(&line) {
                Ok(record) => out.push(record),
                Err(e) => {
                    warn!(stream = stream.file_stem(), line = i, error = %e, "malformed record, skipping");
                }
            }
        }
        if let Some(n) = max_records {
            if out.len() > n {
                let drop_count = out.len() - n;
                out.drain(0..drop_count);
            }
        }
        Ok(out)
    }

    /// Reads raw `Value` records, for callers that need heterogeneous payloads
    /// (insights carry a discriminated free-text shape per `type`).
    pub fn read_values(&self, stream: Stream, max_records: Option<usize>) -> CoreResult<Vec<Value>> {
        self.read(stream, max_records)
    }

    /// Rewrites a stream keeping only the most recent record per logical key, as
    /// computed by `dedup_key_fn`. Crash-safe: writes to `tmp`, fsyncs, renames over
    /// the original.
    pub fn compact<T, K, F>(&self, stream: Stream, dedup_key_fn: F) -> CoreResult<()>
    where
        T: DeserializeOwned + Serialize,
        K: Eq + std::hash::Hash,
        F: Fn(&T) -> K,
    {
        let records: Vec<T> = self.read(stream, None)?;
        let mut kept: HashMap<K, T> = HashMap::new();
        for record in records {
            let key = dedup_key_fn(&record);
            kept.insert(key, record);
        }
        self.rewrite_atomic(stream, kept.into_values().collect())
    }

    /// Moves the oldest records beyond `max_records` into the archive stream.
    pub fn rotate<T: DeserializeOwned + Serialize + Clone>(
        &self,
        stream: Stream,
        max_records: usize,
        archive: bool,
    ) -> CoreResult<usize> {
        let records: Vec<T> = self.read(stream, None)?;
        if records.len() <= max_records {
            return Ok(0);
        }
        let cut = records.len() - max_records;
        let (evicted, kept) = records.split_at(cut);
        if archive {
            let archive_path = self.archive_path_for(stream);
            let mut guard = ExclusiveGuard::acquire(&archive_path)?;
            for record in evicted {
                let mut line = serde_json::to_string(record)?;
                line.push('\n');
                guard.file().seek(SeekFrom::End(0))?;
                guard.file().write_all(line.as_bytes())?;
            }
            guard.file().sync_all()?;
        }
        self.rewrite_atomic(stream, kept.to_vec())?;
        Ok(evicted.len())
    }

    fn rewrite_atomic<T: Serialize>(&self, stream: Stream, records: Vec<T>) -> CoreResult<()> {
        let path = self.path_for(stream);
        let tmp_path = path.with_extension("jsonl.tmp");
        {
            let mut tmp = fs::File::create(&tmp_path)?;
            for record in &records {
                let mut line = serde_json::to_string(record)?;
                line.push('\n');
                tmp.write_all(line.as_bytes())?;
            }
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Returns the last `n` bytes of the raw stream file, for tailing/diagnostics.
    pub fn tail_bytes(&self, stream: Stream, n: u64) -> CoreResult<Vec<u8>> {
        let path = self.path_for(stream);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let guard = SharedGuard::acquire(&path)?;
        let len = guard.file().metadata()?.len();
        let start = len.saturating_sub(n);
        let mut file = guard.file().try_clone()?;
        file.seek(SeekFrom::Start(start))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Writes (overwrites) a single-record stream, for streams where "last wins"
    /// (curriculum, autonomic state). Not lock-contended with appenders of the same
    /// stream name since these streams are never appended to directly.
    pub fn write_single<T: Serialize>(&self, file_name: &str, record: &T) -> CoreResult<()> {
        let path = self.root.join(file_name);
        let tmp_path = path.with_extension("tmp");
        {
            let mut tmp = fs::File::create(&tmp_path)?;
            let body = serde_json::to_string_pretty(record)?;
            tmp.write_all(body.as_bytes())?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    pub fn read_single<T: DeserializeOwned>(&self, file_name: &str) -> CoreResult<Option<T>> {
        let path = self.root.join(file_name);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        if raw.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

pub fn io_error(detail: impl Into<String>) -> CoreError {
    CoreError::kind(ErrorKind::IoError, detail)
}

#[cfg(test)]
mod tests {
    use super::record::Experience;
    use super::*;

    fn experience(tool: &str, success: bool) -> Experience {
        Experience::new("execute", "hello", super::record::IntentType::Action, tool, success, 0.1, "ok")
    }

    #[tokio::test]
    async fn append_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).unwrap();
        storage.append(Stream::Experiences, &experience("SHELL.EXEC", true)).unwrap();
        storage.append(Stream::Experiences, &experience("FILE.READ", false)).unwrap();
        let records: Vec<Experience> = storage.read(Stream::Experiences, None).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].tool_used, "SHELL.EXEC");
        assert!(records[0].success);
        assert!(!records[1].success);
    }

    #[tokio::test]
    async fn read_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).unwrap();
        storage.append(Stream::Experiences, &experience("A", true)).unwrap();
        let path = storage.path_for(Stream::Experiences);
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "not json at all").unwrap();
        storage.append(Stream::Experiences, &experience("B", true)).unwrap();

        let records: Vec<Experience> = storage.read(Stream::Experiences, None).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn compact_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).unwrap();
        storage.append(Stream::Experiences, &experience("A", true)).unwrap();
        storage.append(Stream::Experiences, &experience("A", false)).unwrap();
        storage
            .compact::<Experience, String, _>(Stream::Experiences, |e| e.tool_used.clone())
            .unwrap();
        let once: Vec<Experience> = storage.read(Stream::Experiences, None).unwrap();
        storage
            .compact::<Experience, String, _>(Stream::Experiences, |e| e.tool_used.clone())
            .unwrap();
        let twice: Vec<Experience> = storage.read(Stream::Experiences, None).unwrap();
        assert_eq!(once.len(), twice.len());
        assert_eq!(once.len(), 1);
    }

    #[tokio::test]
    async fn rotate_moves_overflow_to_archive() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).unwrap();
        for i in 0..10 {
            storage
                .append(Stream::Experiences, &experience(&format!("T{i}"), true))
                .unwrap();
        }
        let evicted = storage
            .rotate::<Experience>(Stream::Experiences, 4, true)
            .unwrap();
        assert_eq!(evicted, 6);
        let kept: Vec<Experience> = storage.read(Stream::Experiences, None).unwrap();
        assert_eq!(kept.len(), 4);
    }

    #[tokio::test]
    async fn read_missing_stream_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).unwrap();
        let records: Vec<Experience> = storage.read(Stream::Skills, None).unwrap();
        assert!(records.is_empty());
    }
}
