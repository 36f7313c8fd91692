//! # Persistable Cache
//!
//! Wraps an in-memory cache so its contents survive a restart. Every write
//! goes three places:
//!
//! 1. the wrapped [`CacheBackend`], which serves reads;
//! 2. a shadow map holding exactly what has been written and not deleted;
//! 3. the active `<ms>.inc` log, as a length-prefixed bincode record.
//!
//! Every interval the log is rotated: a fresh `.inc` is started, the shadow
//! map is written to `<ms>.snap`, and an empty `<ms>.done` sentinel marks
//! the snapshot complete. Only then are older files removed. A crash before
//! the sentinel leaves the previous generation intact.
//!
//! Restore loads the newest snapshot that has a `.done` sentinel and replays
//! every `.inc` with a timestamp at or after it, oldest first. A torn record
//! at the end of a log (crash mid-append) ends that log's replay.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache journal I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache journal codec: {0}")]
    Codec(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// The cache being made persistent. Keys and values are opaque bytes;
/// callers carry their own codec.
pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn set(&self, key: &[u8], value: &[u8]);
    fn remove(&self, key: &[u8]);
}

/// Bounded LRU backend. Evictions only affect reads; the shadow map still
/// remembers evicted entries until they are deleted.
pub struct LruBackend {
    inner: Mutex<LruCache<Vec<u8>, Vec<u8>>>,
}

impl LruBackend {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }
}

impl CacheBackend for LruBackend {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.lock().get(key).cloned()
    }

    fn set(&self, key: &[u8], value: &[u8]) {
        self.inner.lock().put(key.to_vec(), value.to_vec());
    }

    fn remove(&self, key: &[u8]) {
        self.inner.lock().pop(key);
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum Record {
    Set { key: Vec<u8>, value: Vec<u8> },
    Del { key: Vec<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Inc,
    Snap,
    Done,
}

impl FileKind {
    fn ext(self) -> &'static str {
        match self {
            FileKind::Inc => "inc",
            FileKind::Snap => "snap",
            FileKind::Done => "done",
        }
    }

    fn from_ext(ext: &str) -> Option<Self> {
        match ext {
            "inc" => Some(FileKind::Inc),
            "snap" => Some(FileKind::Snap),
            "done" => Some(FileKind::Done),
            _ => None,
        }
    }
}

struct IncLog {
    ts: i64,
    writer: BufWriter<File>,
}

pub struct PersistableCache<B: CacheBackend> {
    dir: PathBuf,
    backend: B,
    shadow: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    log: Mutex<IncLog>,
}

impl<B: CacheBackend> std::fmt::Debug for PersistableCache<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistableCache")
            .field("dir", &self.dir)
            .field("entries", &self.shadow.lock().len())
            .finish()
    }
}

impl<B: CacheBackend> PersistableCache<B> {
    /// Open the journal in `dir`, restore whatever it holds into `backend`,
    /// and start a fresh inc log.
    pub fn open(dir: impl AsRef<Path>, backend: B) -> CacheResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let shadow = restore(&dir)?;
        for (k, v) in &shadow {
            backend.set(k, v);
        }
        let latest = list_files(&dir)?.into_iter().map(|(ts, _, _)| ts).max();
        let ts = next_timestamp(latest);
        let writer = open_inc(&dir, ts)?;
        info!(dir = %dir.display(), entries = shadow.len(), "persistable cache restored");

        Ok(Self {
            dir,
            backend,
            shadow: Mutex::new(shadow),
            log: Mutex::new(IncLog { ts, writer }),
        })
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.backend.get(key)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.shadow.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.shadow.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> CacheResult<()> {
        let mut log = self.log.lock();
        append(
            &mut log.writer,
            &Record::Set {
                key: key.to_vec(),
                value: value.to_vec(),
            },
        )?;
        self.shadow.lock().insert(key.to_vec(), value.to_vec());
        self.backend.set(key, value);
        Ok(())
    }

    pub fn del(&self, key: &[u8]) -> CacheResult<()> {
        let mut log = self.log.lock();
        append(&mut log.writer, &Record::Del { key: key.to_vec() })?;
        self.shadow.lock().remove(key);
        self.backend.remove(key);
        Ok(())
    }

    /// Delete every entry `keep` rejects. Returns how many were deleted.
    pub fn retain(&self, keep: impl Fn(&[u8], &[u8]) -> bool) -> CacheResult<usize> {
        let doomed: Vec<Vec<u8>> = self
            .shadow
            .lock()
            .iter()
            .filter(|(k, v)| !keep(k, v))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            self.del(key)?;
        }
        Ok(doomed.len())
    }

    /// Start a new log generation and snapshot the shadow map into it.
    pub fn rotate(&self) -> CacheResult<()> {
        let (ts, snapshot) = {
            let mut log = self.log.lock();
            log.writer.flush()?;
            let ts = next_timestamp(Some(log.ts));
            let writer = open_inc(&self.dir, ts)?;
            *log = IncLog { ts, writer };
            (ts, self.shadow.lock().clone())
        };

        let bytes = bincode::serialize(&snapshot).map_err(|e| CacheError::Codec(e.to_string()))?;
        let snap = file_path(&self.dir, ts, FileKind::Snap);
        let mut f = File::create(&snap)?;
        f.write_all(&bytes)?;
        f.sync_all()?;
        File::create(file_path(&self.dir, ts, FileKind::Done))?.sync_all()?;

        for (old_ts, kind, path) in list_files(&self.dir)? {
            if old_ts < ts {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(file = %path.display(), kind = kind.ext(), error = %e, "cannot remove old cache file");
                }
            }
        }
        debug!(ts, entries = snapshot.len(), "cache snapshot written");
        Ok(())
    }

    /// Flush the active log to the OS.
    pub fn sync(&self) -> CacheResult<()> {
        let mut log = self.log.lock();
        log.writer.flush()?;
        log.writer.get_ref().sync_data()?;
        Ok(())
    }
}

impl<B: CacheBackend + 'static> PersistableCache<B> {
    /// Rotate every `interval` until `quit` flips. A failed snapshot is
    /// logged and retried on the next tick; the previous generation stays
    /// valid on disk meanwhile.
    pub async fn run(self: Arc<Self>, interval: Duration, mut quit: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let cache = self.clone();
                    let res = tokio::task::spawn_blocking(move || cache.rotate()).await;
                    match res {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!(dir = %self.dir.display(), error = %e, "cache snapshot failed"),
                        Err(e) => error!(error = %e, "cache snapshot task panicked"),
                    }
                }
                _ = quit.changed() => break,
            }
        }
        if let Err(e) = self.sync() {
            warn!(error = %e, "cannot sync cache log on shutdown");
        }
    }
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

fn next_timestamp(after: Option<i64>) -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    match after {
        Some(prev) if prev >= now => prev + 1,
        _ => now,
    }
}

fn file_path(dir: &Path, ts: i64, kind: FileKind) -> PathBuf {
    dir.join(format!("{ts}.{}", kind.ext()))
}

fn open_inc(dir: &Path, ts: i64) -> CacheResult<BufWriter<File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(file_path(dir, ts, FileKind::Inc))?;
    Ok(BufWriter::new(file))
}

/// Every journal file in `dir`, sorted by timestamp.
fn list_files(dir: &Path) -> CacheResult<Vec<(i64, FileKind, PathBuf)>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let (Some(stem), Some(ext)) = (
            path.file_stem().and_then(|s| s.to_str()),
            path.extension().and_then(|s| s.to_str()),
        ) else {
            continue;
        };
        if let (Ok(ts), Some(kind)) = (stem.parse::<i64>(), FileKind::from_ext(ext)) {
            out.push((ts, kind, path));
        }
    }
    out.sort_by_key(|(ts, _, _)| *ts);
    Ok(out)
}

fn append(writer: &mut BufWriter<File>, record: &Record) -> CacheResult<()> {
    let bytes = bincode::serialize(record).map_err(|e| CacheError::Codec(e.to_string()))?;
    let len = u32::try_from(bytes.len())
        .map_err(|_| CacheError::Codec("cache record too large".into()))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

fn restore(dir: &Path) -> CacheResult<HashMap<Vec<u8>, Vec<u8>>> {
    let files = list_files(dir)?;
    let base = files
        .iter()
        .filter(|(_, kind, _)| *kind == FileKind::Done)
        .map(|(ts, _, _)| *ts)
        .max();

    let mut map = match base {
        Some(ts) => {
            let bytes = fs::read(file_path(dir, ts, FileKind::Snap))?;
            bincode::deserialize(&bytes).map_err(|e| CacheError::Codec(e.to_string()))?
        }
        None => HashMap::new(),
    };

    for (ts, kind, path) in &files {
        if *kind != FileKind::Inc || base.is_some_and(|b| *ts < b) {
            continue;
        }
        replay(path, &mut map)?;
    }
    Ok(map)
}

fn replay(path: &Path, map: &mut HashMap<Vec<u8>, Vec<u8>>) -> CacheResult<()> {
    let mut buf = Vec::new();
    File::open(path)?.read_to_end(&mut buf)?;
    let mut rest: &[u8] = &buf;
    while !rest.is_empty() {
        let Ok(len) = crate::util::codec::decode_u32(rest) else {
            warn!(file = %path.display(), "torn cache record header");
            break;
        };
        let len = len as usize;
        if rest.len() < 4 + len {
            warn!(file = %path.display(), "torn cache record");
            break;
        }
        let record: Record = bincode::deserialize(&rest[4..4 + len])
            .map_err(|e| CacheError::Codec(e.to_string()))?;
        match record {
            Record::Set { key, value } => {
                map.insert(key, value);
            }
            Record::Del { key } => {
                map.remove(&key);
            }
        }
        rest = &rest[4 + len..];
    }
    Ok(())
}
