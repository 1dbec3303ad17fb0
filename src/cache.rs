//! Read-only cached view of a segment storage
//!
//! Presents a remote storage as a local file system. Construction refreshes
//! the remote listing and synthesizes a stat-only tree; the first read of a
//! file fetches just that file into the cache directory. The cache is
//! content-addressed by segment name: a local file whose size matches the
//! listing suppresses the re-fetch, and segments never change once named,
//! so there is no eviction and no staleness to manage within a session.
//!
//! Concurrent readers of the same un-cached segment join one fetch: the
//! first thread flips the entry to `Fetching` and runs the backend, the
//! rest wait on a condition variable until the entry lands in `Cached`.

use crate::collections::HashMap;
use crate::error::{BeakError, Result};
use crate::path::TreePath;
use crate::storage::{self, Listing, Storage};
use crate::types::{FileStat, Timespec};
use crate::vfs::FuseOps;
use parking_lot::{Condvar, Mutex};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, trace};

/// Fetch progress of one cached file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchState {
    /// Known from the listing only
    StatOnly,
    /// A thread is running the backend fetch right now
    Fetching,
    /// Present in the cache directory
    Cached,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    stat: FileStat,
    is_dir: bool,
    children: Vec<String>,
    state: FetchState,
}

/// Read-only storage view backed by a local cache directory
pub struct CacheFs {
    storage: Storage,
    cache_dir: PathBuf,
    entries: Mutex<HashMap<TreePath, CacheEntry>>,
    fetched: Condvar,
    fetch_invocations: AtomicUsize,
}

impl CacheFs {
    /// Build the view, refreshing the storage listing
    pub fn new(storage: Storage, cache_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&cache_dir)?;
        let listing = storage::list(&storage)?;
        debug!(
            good = listing.good.len(),
            bad = listing.bad.len(),
            "cache view of {}",
            storage.location
        );
        let entries = Self::build_entries(&listing);
        Ok(CacheFs {
            storage,
            cache_dir,
            entries: Mutex::new(entries),
            fetched: Condvar::new(),
            fetch_invocations: AtomicUsize::new(0),
        })
    }

    fn build_entries(listing: &Listing) -> HashMap<TreePath, CacheEntry> {
        let mut entries: HashMap<TreePath, CacheEntry> = HashMap::new();
        let dir_entry = || CacheEntry {
            stat: FileStat::directory(0o500, Timespec::default()),
            is_dir: true,
            children: Vec::new(),
            state: FetchState::Cached,
        };
        entries.insert(TreePath::root(), dir_entry());

        for (path, stat) in &listing.contents {
            // Materialize every ancestor directory.
            let mut dir = path.parent();
            let mut child = path.clone();
            while let Some(d) = dir {
                let entry = entries.entry(d.clone()).or_insert_with(dir_entry);
                if !entry.children.iter().any(|c| c == child.name()) {
                    entry.children.push(child.name().to_string());
                }
                child = d.clone();
                dir = child.parent();
            }
            entries.insert(
                path.clone(),
                CacheEntry {
                    stat: stat.clone(),
                    is_dir: false,
                    children: Vec::new(),
                    state: FetchState::StatOnly,
                },
            );
        }
        for e in entries.values_mut() {
            e.children.sort();
        }
        entries
    }

    /// Local path a segment is cached at
    pub fn local_path(&self, path: &TreePath) -> PathBuf {
        let mut out = self.cache_dir.clone();
        for c in path.components() {
            out.push(c);
        }
        out
    }

    /// How many backend fetches actually ran
    pub fn fetch_invocations(&self) -> usize {
        self.fetch_invocations.load(Ordering::SeqCst)
    }

    /// Make sure `path` is present in the cache directory, joining any
    /// fetch already in flight
    pub fn ensure_cached(&self, path: &TreePath) -> Result<PathBuf> {
        let local = self.local_path(path);
        let mut entries = self.entries.lock();
        loop {
            let entry = entries
                .get_mut(path)
                .ok_or_else(|| BeakError::not_found(format!("{path}")))?;
            if entry.is_dir {
                return Err(BeakError::not_found(format!("{path} is a directory")));
            }
            match entry.state {
                FetchState::Cached => return Ok(local),
                FetchState::Fetching => {
                    trace!(%path, "joining fetch in flight");
                    self.fetched.wait(&mut entries);
                }
                FetchState::StatOnly => {
                    // A previous session may have left the file behind.
                    if let Ok(meta) = local.metadata() {
                        if meta.len() == entry.stat.size {
                            entry.state = FetchState::Cached;
                            return Ok(local);
                        }
                    }
                    entry.state = FetchState::Fetching;
                    drop(entries);

                    self.fetch_invocations.fetch_add(1, Ordering::SeqCst);
                    let rc = storage::fetch(&self.storage, &[path.clone()], &self.cache_dir);

                    entries = self.entries.lock();
                    let entry = entries
                        .get_mut(path)
                        .ok_or_else(|| BeakError::not_found(format!("{path}")))?;
                    entry.state = if rc.is_ok() {
                        FetchState::Cached
                    } else {
                        FetchState::StatOnly
                    };
                    self.fetched.notify_all();
                    rc?;
                    return Ok(local);
                }
            }
        }
    }

    /// Fetch (if needed) and read a whole segment
    pub fn load(&self, path: &TreePath) -> Result<Vec<u8>> {
        let local = self.ensure_cached(path)?;
        Ok(std::fs::read(local)?)
    }
}

impl FuseOps for CacheFs {
    fn getattr(&self, path: &TreePath) -> Result<FileStat> {
        let entries = self.entries.lock();
        entries
            .get(path)
            .map(|e| e.stat.clone())
            .ok_or_else(|| BeakError::not_found(format!("{path}")))
    }

    fn readdir(&self, path: &TreePath) -> Result<Vec<String>> {
        let entries = self.entries.lock();
        let entry = entries
            .get(path)
            .ok_or_else(|| BeakError::not_found(format!("{path}")))?;
        if !entry.is_dir {
            return Err(BeakError::not_found(format!("{path} is not a directory")));
        }
        Ok(entry.children.clone())
    }

    fn read(&self, path: &TreePath, offset: u64, size: usize) -> Result<Vec<u8>> {
        let local = self.ensure_cached(path)?;
        let mut file = File::open(&local)?;
        let len = file.metadata()?.len();
        if offset >= len {
            return Ok(Vec::new());
        }
        let want = size.min((len - offset) as usize);
        let mut buf = vec![0u8; want];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn readlink(&self, path: &TreePath) -> Result<String> {
        Err(BeakError::not_found(format!("{path}")))
    }
}
