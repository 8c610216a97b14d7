//! File-backed durability cache and block lists.
//!
//! Layout under the store root:
//!
//! ```text
//! events/<aa>/<bb>/<id>.json   cached row {root_id, cached_at, event}
//! index/by-root/<root>.txt     event ids cached under a root, one per line
//! blocks/<viewer>.txt          pubkeys blocked by a viewer, one per line
//! ```

use std::{
    collections::HashSet,
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context, Result};
use rand::{seq::SliceRandom, thread_rng};
use serde::{Deserialize, Serialize};

use crate::event::{self, unix_now, Event};

/// Local fallback copies of events, grouped under a root id.
pub trait DurabilityStore: Send + Sync {
    /// Events cached under `root_id` at or after `cutoff` (unix seconds).
    fn load_root(&self, root_id: &str, cutoff: u64) -> Result<Vec<Event>>;
    /// Cache `ev` under `root_id`, refreshing its timestamp if present.
    fn store(&self, root_id: &str, ev: &Event) -> Result<()>;
    /// Drop the row for `event_id`. Returns whether a row existed.
    fn remove(&self, event_id: &str) -> Result<bool>;
}

/// Per-viewer block lists.
pub trait BlockList: Send + Sync {
    fn blocked_for(&self, viewer: &str) -> Result<HashSet<String>>;
}

/// One cached event with the root it was cached under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedRow {
    pub root_id: String,
    pub cached_at: u64,
    pub event: Event,
}

/// Durability cache and block lists rooted at `root`.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ensure the on-disk directory structure exists.
    pub fn init(&self) -> Result<()> {
        for d in ["events", "index/by-root", "blocks"] {
            fs::create_dir_all(self.root.join(d))
                .with_context(|| format!("creating {}", self.root.join(d).display()))?;
        }
        Ok(())
    }

    /// Read one cached row.
    pub fn load_row(&self, event_id: &str) -> Result<Option<CachedRow>> {
        if !is_hex_id(event_id) {
            return Ok(None);
        }
        let path = self.event_path(event_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&path)?;
        let row: CachedRow = serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(row))
    }

    /// Rebuild the by-root index from the `events/` tree.
    pub fn reindex(&self) -> Result<usize> {
        let index_dir = self.root.join("index");
        if index_dir.exists() {
            fs::remove_dir_all(&index_dir)?;
        }
        fs::create_dir_all(self.root.join("index/by-root"))?;
        let mut count = 0;
        for path in self.row_paths()? {
            let data = fs::read_to_string(&path)?;
            let row: CachedRow =
                serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
            self.append_index(&row.root_id, &row.event.id)?;
            count += 1;
        }
        tracing::info!(count, "rebuilt durability cache index");
        Ok(count)
    }

    /// Verify ids and signatures for a random sample of cached events.
    /// Returns how many were checked.
    pub fn verify_sample(&self, sample: usize) -> Result<usize> {
        let mut paths = self.row_paths()?;
        paths.shuffle(&mut thread_rng());
        let take = sample.min(paths.len());
        for p in paths.iter().take(take) {
            let data = fs::read_to_string(p)?;
            let row: CachedRow = serde_json::from_str(&data)?;
            event::check_event(&row.event).with_context(|| format!("event {}", row.event.id))?;
        }
        Ok(take)
    }

    /// Add `pubkey` to `viewer`'s block list. Idempotent.
    pub fn block(&self, viewer: &str, pubkey: &str) -> Result<()> {
        let mut blocked = self.read_blocks(viewer)?;
        ensure_key(pubkey)?;
        if blocked.iter().any(|b| b == pubkey) {
            return Ok(());
        }
        blocked.push(pubkey.to_string());
        self.write_blocks(viewer, &blocked)?;
        tracing::info!(viewer, pubkey, "blocked author");
        Ok(())
    }

    /// Remove `pubkey` from `viewer`'s block list. Returns whether it was
    /// present.
    pub fn unblock(&self, viewer: &str, pubkey: &str) -> Result<bool> {
        let mut blocked = self.read_blocks(viewer)?;
        let before = blocked.len();
        blocked.retain(|b| b != pubkey);
        if blocked.len() == before {
            return Ok(false);
        }
        self.write_blocks(viewer, &blocked)?;
        tracing::info!(viewer, pubkey, "unblocked author");
        Ok(true)
    }

    fn read_blocks(&self, viewer: &str) -> Result<Vec<String>> {
        ensure_key(viewer)?;
        let path = self.blocks_path(viewer);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(path)?;
        Ok(data
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn write_blocks(&self, viewer: &str, blocked: &[String]) -> Result<()> {
        let path = self.blocks_path(viewer);
        let mut body = blocked.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        write_atomic(&path, body.as_bytes())
    }

    fn blocks_path(&self, viewer: &str) -> PathBuf {
        self.root.join("blocks").join(format!("{viewer}.txt"))
    }

    fn row_paths(&self) -> Result<Vec<PathBuf>> {
        let mut paths = vec![];
        let events = self.root.join("events");
        if !events.exists() {
            return Ok(paths);
        }
        for entry in walkdir::WalkDir::new(events) {
            let entry = entry?;
            if entry.file_type().is_file() && entry.path().extension().map_or(false, |e| e == "json") {
                paths.push(entry.into_path());
            }
        }
        Ok(paths)
    }

    /// Append an event id to `index/by-root/<root>.txt`.
    fn append_index(&self, root_id: &str, id: &str) -> Result<()> {
        let path = self.index_path(root_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = fs::OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(f, "{}", id)?;
        Ok(())
    }

    fn index_path(&self, root_id: &str) -> PathBuf {
        self.root.join("index/by-root").join(format!("{root_id}.txt"))
    }

    /// Canonical path for an event id.
    fn event_path(&self, id: &str) -> PathBuf {
        self.root
            .join("events")
            .join(&id[0..2])
            .join(&id[2..4])
            .join(format!("{}.json", id))
    }
}

impl DurabilityStore for FileStore {
    fn load_root(&self, root_id: &str, cutoff: u64) -> Result<Vec<Event>> {
        if !is_hex_id(root_id) {
            return Ok(Vec::new());
        }
        let mut seen = HashSet::new();
        let mut events = Vec::new();
        for id in read_lines(&self.index_path(root_id))? {
            if !seen.insert(id.clone()) {
                continue;
            }
            match self.load_row(&id) {
                Ok(Some(row)) if row.root_id == root_id && row.cached_at >= cutoff => events.push(row.event),
                Ok(_) => {}
                Err(e) => tracing::warn!(id = %id, error = %e, "skipping unreadable cached row"),
            }
        }
        Ok(events)
    }

    fn store(&self, root_id: &str, ev: &Event) -> Result<()> {
        if !is_hex_id(root_id) {
            bail!("invalid root id {root_id:?}");
        }
        if !is_hex_id(&ev.id) {
            bail!("invalid event id {:?}", ev.id);
        }
        let previous = self.load_row(&ev.id).ok().flatten();
        let row = CachedRow {
            root_id: root_id.to_string(),
            cached_at: unix_now(),
            event: ev.clone(),
        };
        write_atomic(&self.event_path(&ev.id), &serde_json::to_vec(&row)?)?;
        if previous.map_or(true, |p| p.root_id != root_id) {
            self.append_index(root_id, &ev.id)?;
        }
        tracing::debug!(root = root_id, id = %ev.id, "cached event");
        Ok(())
    }

    fn remove(&self, event_id: &str) -> Result<bool> {
        if !is_hex_id(event_id) {
            return Ok(false);
        }
        let path = self.event_path(event_id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
        tracing::debug!(id = event_id, "removed cached event");
        Ok(true)
    }
}

impl BlockList for FileStore {
    fn blocked_for(&self, viewer: &str) -> Result<HashSet<String>> {
        Ok(self.read_blocks(viewer)?.into_iter().collect())
    }
}

/// Write `data` to `path` via a temp file in the same directory.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent_dir = path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&parent_dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&parent_dir)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| anyhow!("persisting {}: {}", path.display(), e))?;
    Ok(())
}

/// Read non-empty lines from a text file; a missing file is empty.
fn read_lines(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = fs::read_to_string(path)?;
    Ok(data
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

fn is_hex_id(id: &str) -> bool {
    id.len() == 64 && id.bytes().all(|b| b.is_ascii_hexdigit())
}

fn ensure_key(key: &str) -> Result<()> {
    if !is_hex_id(key) {
        bail!("expected a 64-character hex public key, got {key:?}");
    }
    Ok(())
}
