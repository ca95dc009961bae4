//! Durable storage for the consensus layer.
//!
//! The stable log lives in `{data-dir}/raft/raft.db` as an append-only
//! journal of JSON records, fronted by an LRU cache of the most recent
//! entries. Snapshots are whole files under `{data-dir}/raft/snapshots/`,
//! the three most recent are retained. A `peers.json` file, when present,
//! is read once at startup to recover a lost configuration.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use base64::prelude::{Engine, BASE64_STANDARD};
use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::raft::state::{LogEntry, Peer};

/// Recently appended entries kept decoded in front of the stable store.
const LOG_CACHE_SIZE: usize = 512;

/// Snapshots retained on disk.
const SNAPSHOT_RETAIN: usize = 3;

pub const LOG_FILE: &str = "raft.db";
pub const SNAPSHOT_DIR: &str = "snapshots";
pub const PEERS_FILE: &str = "peers.json";

#[derive(Debug, Serialize, Deserialize)]
enum WalRecord {
    Meta {
        term: u64,
        voted_for: Option<String>,
    },
    Entry(LogEntry),
    Truncate {
        from: u64,
    },
    Compact {
        through_index: u64,
        through_term: u64,
    },
}

/// The replicated log with optional durability. A `None` directory keeps
/// everything in memory (dev mode).
pub struct LogStore {
    path: Option<PathBuf>,
    file: Option<File>,

    entries: VecDeque<LogEntry>,
    /// Log index of `entries[0]`.
    first_index: u64,

    /// Index/term covered by the latest compaction (snapshot base).
    pub snapshot_last_index: u64,
    pub snapshot_last_term: u64,

    term: u64,
    voted_for: Option<String>,

    cache: LruCache<u64, LogEntry>,

    had_state: bool,
}

impl LogStore {
    pub fn open(dir: Option<&Path>) -> std::io::Result<Self> {
        let mut store = Self {
            path: dir.map(|d| d.join(LOG_FILE)),
            file: None,
            entries: VecDeque::new(),
            first_index: 1,
            snapshot_last_index: 0,
            snapshot_last_term: 0,
            term: 0,
            voted_for: None,
            cache: LruCache::new(NonZeroUsize::new(LOG_CACHE_SIZE).unwrap()),
            had_state: false,
        };

        if let Some(dir) = dir {
            fs::create_dir_all(dir)?;
        }

        if let Some(path) = store.path.clone() {
            if path.exists() {
                store.replay(&path)?;
                store.had_state = store.term > 0 || !store.entries.is_empty();
            }
            store.file = Some(OpenOptions::new().create(true).append(true).open(&path)?);
        }

        Ok(store)
    }

    fn replay(&mut self, path: &Path) -> std::io::Result<()> {
        let reader = BufReader::new(File::open(path)?);
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let record: WalRecord = serde_json::from_str(&line)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            match record {
                WalRecord::Meta { term, voted_for } => {
                    self.term = term;
                    self.voted_for = voted_for;
                }
                WalRecord::Entry(entry) => {
                    self.drop_from(entry.index);
                    self.entries.push_back(entry);
                }
                WalRecord::Truncate { from } => self.drop_from(from),
                WalRecord::Compact {
                    through_index,
                    through_term,
                } => self.drop_through(through_index, through_term),
            }
        }
        Ok(())
    }

    fn write_record(&mut self, record: &WalRecord) -> std::io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            let mut line = serde_json::to_vec(record)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            line.push(b'\n');
            file.write_all(&line)?;
            file.flush()?;
        }
        Ok(())
    }

    /// Whether the journal carried any state when it was opened. Bootstrap
    /// only seeds a configuration on a clean slate.
    pub fn has_existing_state(&self) -> bool {
        self.had_state
    }

    pub fn meta(&self) -> (u64, Option<String>) {
        (self.term, self.voted_for.clone())
    }

    pub fn set_meta(&mut self, term: u64, voted_for: Option<String>) -> std::io::Result<()> {
        self.term = term;
        self.voted_for = voted_for.clone();
        self.write_record(&WalRecord::Meta { term, voted_for })
    }

    pub fn last_index(&self) -> u64 {
        self.entries
            .back()
            .map(|e| e.index)
            .unwrap_or(self.snapshot_last_index)
    }

    pub fn last_term(&self) -> u64 {
        self.entries
            .back()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_last_term)
    }

    /// Term of the entry at `index`, falling back to the snapshot base.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_last_index {
            return Some(self.snapshot_last_term);
        }
        self.get(index).map(|e| e.term)
    }

    pub fn get(&self, index: u64) -> Option<LogEntry> {
        if let Some(entry) = self.cache.peek(&index) {
            return Some(entry.clone());
        }
        if index < self.first_index {
            return None;
        }
        self.entries.get((index - self.first_index) as usize).cloned()
    }

    /// Entries from `start_index` (inclusive) to the end of the log.
    pub fn entries_from(&self, start_index: u64) -> Vec<LogEntry> {
        let start = start_index.max(self.first_index);
        if start > self.last_index() {
            return Vec::new();
        }
        self.entries
            .iter()
            .skip((start - self.first_index) as usize)
            .cloned()
            .collect()
    }

    pub fn append(&mut self, entries: &[LogEntry]) -> std::io::Result<()> {
        for entry in entries {
            self.write_record(&WalRecord::Entry(entry.clone()))?;
            self.cache.put(entry.index, entry.clone());
            self.drop_from(entry.index);
            self.entries.push_back(entry.clone());
        }
        Ok(())
    }

    /// Remove entries from `from` (inclusive) onwards.
    pub fn truncate_from(&mut self, from: u64) -> std::io::Result<()> {
        self.write_record(&WalRecord::Truncate { from })?;
        self.drop_from(from);
        Ok(())
    }

    /// Drop the log prefix covered by a snapshot and rewrite the journal so
    /// the file does not grow without bound.
    pub fn compact_through(&mut self, through_index: u64, through_term: u64) -> std::io::Result<()> {
        self.drop_through(through_index, through_term);

        if let Some(path) = self.path.clone() {
            let tmp = path.with_extension("db.tmp");
            {
                let mut file = File::create(&tmp)?;
                let mut write = |record: &WalRecord| -> std::io::Result<()> {
                    let mut line = serde_json::to_vec(record)
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                    line.push(b'\n');
                    file.write_all(&line)
                };
                write(&WalRecord::Meta {
                    term: self.term,
                    voted_for: self.voted_for.clone(),
                })?;
                write(&WalRecord::Compact {
                    through_index: self.snapshot_last_index,
                    through_term: self.snapshot_last_term,
                })?;
                for entry in &self.entries {
                    write(&WalRecord::Entry(entry.clone()))?;
                }
                file.flush()?;
            }
            fs::rename(&tmp, &path)?;
            self.file = Some(OpenOptions::new().append(true).open(&path)?);
        }
        Ok(())
    }

    fn drop_from(&mut self, from: u64) {
        while self
            .entries
            .back()
            .map(|e| e.index >= from)
            .unwrap_or(false)
        {
            if let Some(entry) = self.entries.pop_back() {
                self.cache.pop(&entry.index);
            }
        }
    }

    fn drop_through(&mut self, through_index: u64, through_term: u64) {
        while self
            .entries
            .front()
            .map(|e| e.index <= through_index)
            .unwrap_or(false)
        {
            self.entries.pop_front();
        }
        self.first_index = through_index + 1;
        self.snapshot_last_index = self.snapshot_last_index.max(through_index);
        if through_index >= self.snapshot_last_index {
            self.snapshot_last_term = through_term;
        }
    }

    /// Number of entries currently held in the log.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_index: u64,
    pub last_term: u64,
    pub configuration: Vec<Peer>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    meta: SnapshotMeta,
    data: String,
}

/// File snapshot store. A `None` directory discards snapshots (dev mode).
pub struct SnapshotStore {
    dir: Option<PathBuf>,
}

impl SnapshotStore {
    pub fn open(raft_dir: Option<&Path>) -> std::io::Result<Self> {
        let dir = raft_dir.map(|d| d.join(SNAPSHOT_DIR));
        if let Some(dir) = &dir {
            fs::create_dir_all(dir)?;
        }
        Ok(Self { dir })
    }

    pub fn persist(&self, meta: &SnapshotMeta, data: &[u8]) -> std::io::Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };

        let name = format!("snapshot-{:020}-{:020}.json", meta.last_index, meta.last_term);
        let record = SnapshotFile {
            meta: meta.clone(),
            data: BASE64_STANDARD.encode(data),
        };
        let tmp = dir.join(format!("{name}.tmp"));
        fs::write(
            &tmp,
            serde_json::to_vec(&record)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?,
        )?;
        fs::rename(&tmp, dir.join(&name))?;

        self.reap()?;
        Ok(())
    }

    /// The most recent snapshot, if any.
    pub fn latest(&self) -> std::io::Result<Option<(SnapshotMeta, Vec<u8>)>> {
        let Some(dir) = &self.dir else {
            return Ok(None);
        };

        let Some(path) = self.sorted_snapshots()?.pop() else {
            return Ok(None);
        };
        let record: SnapshotFile = serde_json::from_slice(&fs::read(&path)?)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let data = BASE64_STANDARD
            .decode(record.data.as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(Some((record.meta, data)))
    }

    fn reap(&self) -> std::io::Result<()> {
        let mut snapshots = self.sorted_snapshots()?;
        while snapshots.len() > SNAPSHOT_RETAIN {
            let oldest = snapshots.remove(0);
            fs::remove_file(oldest)?;
        }
        Ok(())
    }

    fn sorted_snapshots(&self) -> std::io::Result<Vec<PathBuf>> {
        let Some(dir) = &self.dir else {
            return Ok(Vec::new());
        };
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("snapshot-") && n.ends_with(".json"))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();
        Ok(paths)
    }
}

#[derive(Debug, Deserialize)]
struct PeersFileEntry {
    id: String,
    address: String,
}

/// Read a manual recovery configuration from `peers.json`, if present.
/// The caller removes the file only after recovery succeeded.
pub fn read_peers_json(raft_dir: &Path) -> std::io::Result<Option<Vec<Peer>>> {
    let path = raft_dir.join(PEERS_FILE);
    if !path.exists() {
        return Ok(None);
    }

    let entries: Vec<PeersFileEntry> = serde_json::from_slice(&fs::read(&path)?)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(
        entries
            .into_iter()
            .map(|e| Peer {
                id: e.id,
                addr: e.address,
            })
            .collect(),
    ))
}

pub fn remove_peers_json(raft_dir: &Path) -> std::io::Result<()> {
    fs::remove_file(raft_dir.join(PEERS_FILE))
}
