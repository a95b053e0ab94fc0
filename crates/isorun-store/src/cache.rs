//! Bounded LRU mirror of remote content, keyed by digest.
//!
//! The ledger (`state.json`) records `[digest, size]` pairs from least to most
//! recently used. It is reconciled with the directory contents on open, trimmed
//! against [`CachePolicies`] on open and on drop, and rewritten wholesale when it
//! changes.

use std::{
    collections::{HashMap, HashSet},
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use isorun_domain::Digest;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::{
    error::StoreError,
    fetcher::{ContentFetcher, Priority},
    link::hardlink_or_copy,
};

pub const STATE_FILE: &str = "state.json";

pub const DEFAULT_MAX_CACHE_SIZE: u64 = 20 * 1024 * 1024 * 1024;
pub const DEFAULT_MIN_FREE_SPACE: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_MAX_ITEMS: usize = 100_000;

/// Limits applied by [`ContentAddressedCache::trim`]. Zero disables a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicies {
    pub max_cache_size: u64,
    pub min_free_space: u64,
    pub max_items: usize,
}

impl CachePolicies {
    #[must_use]
    pub const fn unbounded() -> Self {
        Self {
            max_cache_size: 0,
            min_free_space: 0,
            max_items: 0,
        }
    }
}

impl Default for CachePolicies {
    fn default() -> Self {
        Self {
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            min_free_space: DEFAULT_MIN_FREE_SPACE,
            max_items: DEFAULT_MAX_ITEMS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(Digest, u64)", into = "(Digest, u64)")]
pub struct CacheEntry {
    pub digest: Digest,
    pub size: u64,
}

impl From<(Digest, u64)> for CacheEntry {
    fn from((digest, size): (Digest, u64)) -> Self {
        Self { digest, size }
    }
}

impl From<CacheEntry> for (Digest, u64) {
    fn from(entry: CacheEntry) -> Self {
        (entry.digest, entry.size)
    }
}

#[derive(Debug, Default)]
struct RunStats {
    initial_items: usize,
    initial_size: u64,
    added: Vec<u64>,
    removed: Vec<u64>,
}

pub struct ContentAddressedCache {
    dir: PathBuf,
    policies: CachePolicies,
    fetcher: ContentFetcher,
    /// Least recently used first.
    entries: Vec<CacheEntry>,
    total_size: u64,
    index: HashMap<Digest, usize>,
    index_stale: bool,
    pending: HashSet<Digest>,
    dirty: bool,
    stats: RunStats,
}

impl ContentAddressedCache {
    /// Open the cache rooted at `dir`, reconcile its ledger with the files on
    /// disk and trim it to `policies`.
    pub fn open(
        dir: impl Into<PathBuf>,
        policies: CachePolicies,
        fetcher: ContentFetcher,
    ) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| StoreError::io(&dir, err))?;
        let entries = load_ledger(&dir.join(STATE_FILE));
        let mut cache = Self {
            dir,
            policies,
            fetcher,
            entries,
            total_size: 0,
            index: HashMap::new(),
            index_stale: true,
            pending: HashSet::new(),
            dirty: false,
            stats: RunStats::default(),
        };
        cache.reconcile()?;
        cache.total_size = cache.entries.iter().map(|entry| entry.size).sum();
        cache.stats.initial_items = cache.entries.len();
        cache.stats.initial_size = cache.total_size;
        cache.trim();
        Ok(cache)
    }

    /// Local file backing `digest`.
    pub fn path(&self, digest: &Digest) -> PathBuf {
        self.dir.join(digest.as_str())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn policies(&self) -> CachePolicies {
        self.policies
    }

    pub fn entries(&self) -> &[CacheEntry] {
        &self.entries
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn contains(&mut self, digest: &Digest) -> bool {
        self.position(digest).is_some()
    }

    pub fn is_pending(&self, digest: &Digest) -> bool {
        self.pending.contains(digest)
    }

    /// Make `digest` available, fetching it unless a valid copy is cached.
    ///
    /// A cached copy whose size disagrees with `size` is evicted and fetched
    /// again. Already pending digests are left alone.
    pub fn retrieve(&mut self, priority: Priority, digest: &Digest, size: Option<u64>) {
        if let Some(pos) = self.position(digest) {
            if self.is_valid(digest, size) {
                self.touch(pos);
                return;
            }
            warn!(%digest, "cached item failed validation, fetching again");
            self.remove_at(pos);
        }
        if self.pending.contains(digest) {
            return;
        }
        self.fetcher
            .add_item(priority, digest.as_str(), self.path(digest), size);
        self.pending.insert(digest.clone());
    }

    /// Insert a local file under `digest` as most recently used. No-op when the
    /// digest is already cached or pending.
    pub fn add(&mut self, local: &Path, digest: &Digest) -> Result<(), StoreError> {
        if self.position(digest).is_some() || self.pending.contains(digest) {
            return Ok(());
        }
        let dest = self.path(digest);
        // Only reachable for a file that appeared after reconciliation.
        if dest.exists() {
            fs::remove_file(&dest).map_err(|err| StoreError::io(&dest, err))?;
        }
        hardlink_or_copy(local, &dest).map_err(|err| StoreError::io(&dest, err))?;
        let size = fs::metadata(&dest)
            .map_err(|err| StoreError::io(&dest, err))?
            .len();
        self.push_entry(digest.clone(), size);
        self.save();
        Ok(())
    }

    /// Block until one of `digests` is cached and return it.
    ///
    /// Already cached members win in the order given. Otherwise every fetch
    /// completion is adopted into the ledger as it arrives until a member of
    /// `digests` shows up. A permanent fetch failure aborts the wait.
    pub fn wait_for(&mut self, digests: &[Digest]) -> Result<Digest, StoreError> {
        for digest in digests {
            if !self.pending.contains(digest) && self.position(digest).is_some() {
                return Ok(digest.clone());
            }
        }
        if !digests.iter().any(|digest| self.pending.contains(digest)) {
            return Err(not_pending(digests));
        }
        loop {
            match self.fetcher.get_result() {
                None => return Err(not_pending(digests)),
                Some(Err(err)) => {
                    if let Ok(digest) = Digest::parse(err.key()) {
                        self.pending.remove(&digest);
                    }
                    return Err(err.into());
                }
                Some(Ok(key)) => {
                    let Ok(digest) = Digest::parse(&key) else {
                        warn!(%key, "ignoring fetch completion for a non-digest key");
                        continue;
                    };
                    self.pending.remove(&digest);
                    let path = self.path(&digest);
                    let size = fs::metadata(&path)
                        .map_err(|err| StoreError::io(&path, err))?
                        .len();
                    self.push_entry(digest.clone(), size);
                    if digests.contains(&digest) {
                        return Ok(digest);
                    }
                }
            }
        }
    }

    /// Evict least recently used entries until every policy holds or the
    /// ledger is empty, then persist the ledger if it changed.
    pub fn trim(&mut self) {
        let CachePolicies {
            max_cache_size,
            min_free_space,
            max_items,
        } = self.policies;
        if max_cache_size > 0 {
            while self.total_size > max_cache_size && !self.entries.is_empty() {
                self.remove_at(0);
            }
        }
        if max_items > 0 {
            while self.entries.len() > max_items {
                self.remove_at(0);
            }
        }
        if min_free_space > 0 {
            while !self.entries.is_empty() {
                match fs4::available_space(&self.dir) {
                    Ok(free) if free >= min_free_space => break,
                    Ok(_) => self.remove_at(0),
                    Err(err) => {
                        warn!(%err, dir = %self.dir.display(), "unable to query free space");
                        break;
                    }
                }
            }
        }
        self.save();
    }

    /// Rewrite the ledger if it changed since the last save. Failures are logged.
    pub fn save(&mut self) {
        if !self.dirty {
            return;
        }
        let path = self.dir.join(STATE_FILE);
        match write_ledger(&self.dir, &path, &self.entries) {
            Ok(()) => self.dirty = false,
            Err(err) => warn!(%err, path = %path.display(), "failed to persist cache ledger"),
        }
    }

    fn reconcile(&mut self) -> Result<(), StoreError> {
        let listing = fs::read_dir(&self.dir).map_err(|err| StoreError::io(&self.dir, err))?;
        let known: HashSet<Digest> = self.entries.iter().map(|e| e.digest.clone()).collect();
        let mut on_disk = HashSet::new();
        let mut adopted = Vec::new();
        for item in listing {
            let item = item.map_err(|err| StoreError::io(&self.dir, err))?;
            let name = item.file_name();
            let Some(name) = name.to_str() else {
                remove_stray(&item.path());
                continue;
            };
            if name == STATE_FILE {
                continue;
            }
            match Digest::parse(name) {
                Ok(digest) => {
                    if !known.contains(&digest) {
                        let size = item.metadata().map(|m| m.len()).unwrap_or_default();
                        adopted.push(CacheEntry {
                            digest: digest.clone(),
                            size,
                        });
                    }
                    on_disk.insert(digest);
                }
                Err(_) => remove_stray(&item.path()),
            }
        }

        let before = self.entries.len();
        self.entries.retain(|entry| on_disk.contains(&entry.digest));
        if self.entries.len() != before {
            warn!(
                missing = before - self.entries.len(),
                "dropping ledger entries without files"
            );
            self.dirty = true;
        }
        if !adopted.is_empty() {
            adopted.sort_by(|a, b| a.digest.cmp(&b.digest));
            warn!(count = adopted.len(), "adopting untracked cache files");
            adopted.append(&mut self.entries);
            self.entries = adopted;
            self.dirty = true;
        }
        self.index_stale = true;
        Ok(())
    }

    fn is_valid(&self, digest: &Digest, size: Option<u64>) -> bool {
        match (fs::metadata(self.path(digest)), size) {
            (Ok(meta), Some(expected)) => meta.len() == expected,
            (Ok(_), None) => true,
            (Err(_), _) => false,
        }
    }

    fn position(&mut self, digest: &Digest) -> Option<usize> {
        if self.index_stale {
            self.index = self
                .entries
                .iter()
                .enumerate()
                .map(|(pos, entry)| (entry.digest.clone(), pos))
                .collect();
            self.index_stale = false;
        }
        self.index.get(digest).copied()
    }

    fn touch(&mut self, pos: usize) {
        if pos + 1 == self.entries.len() {
            return;
        }
        let entry = self.entries.remove(pos);
        self.entries.push(entry);
        self.index_stale = true;
        self.dirty = true;
    }

    fn push_entry(&mut self, digest: Digest, size: u64) {
        self.entries.push(CacheEntry { digest, size });
        self.total_size += size;
        self.stats.added.push(size);
        self.index_stale = true;
        self.dirty = true;
    }

    fn remove_at(&mut self, pos: usize) {
        let entry = self.entries.remove(pos);
        self.total_size = self.total_size.saturating_sub(entry.size);
        self.stats.removed.push(entry.size);
        self.index_stale = true;
        self.dirty = true;
        let path = self.path(&entry.digest);
        debug!(digest = %entry.digest, size = entry.size, "evicting cache entry");
        if let Err(err) = fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(%err, path = %path.display(), "failed to remove evicted item");
            }
        }
    }
}

impl Drop for ContentAddressedCache {
    fn drop(&mut self) {
        self.trim();
        let free = fs4::available_space(&self.dir).ok();
        debug!(
            initial_items = self.stats.initial_items,
            initial_bytes = self.stats.initial_size,
            added_items = self.stats.added.len(),
            added_bytes = self.stats.added.iter().sum::<u64>(),
            removed_items = self.stats.removed.len(),
            removed_bytes = self.stats.removed.iter().sum::<u64>(),
            current_items = self.entries.len(),
            current_bytes = self.total_size,
            free_bytes = free,
            "cache statistics"
        );
    }
}

fn not_pending(digests: &[Digest]) -> StoreError {
    StoreError::NotPending {
        digests: digests
            .iter()
            .map(Digest::as_str)
            .collect::<Vec<_>>()
            .join(", "),
    }
}

fn load_ledger(path: &Path) -> Vec<CacheEntry> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(err) => {
            warn!(%err, path = %path.display(), "unreadable cache ledger, starting empty");
            return Vec::new();
        }
    };
    let entries: Vec<CacheEntry> = match serde_json::from_slice(&bytes) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(%err, path = %path.display(), "corrupt cache ledger, starting empty");
            return Vec::new();
        }
    };
    let mut seen = HashSet::new();
    if !entries.iter().all(|entry| seen.insert(&entry.digest)) {
        warn!(path = %path.display(), "cache ledger has duplicate entries, starting empty");
        return Vec::new();
    }
    entries
}

fn write_ledger(dir: &Path, path: &Path, entries: &[CacheEntry]) -> std::io::Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut tmp, entries)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

fn remove_stray(path: &Path) {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            debug!(path = %path.display(), "leaving stray directory in cache");
        }
        Ok(_) => {
            debug!(path = %path.display(), "removing stray cache file");
            if let Err(err) = fs::remove_file(path) {
                warn!(%err, path = %path.display(), "failed to remove stray cache file");
            }
        }
        Err(_) => {}
    }
}
