//! Reverse mounting: storage of segments back to a browsable origin tree
//!
//! A storage directory holds the history of an origin as points in time,
//! each anchored by a top-level index segment. The reverse loader discovers
//! those anchors, parses index blocks on demand and reconstructs the origin
//! tree read-only, fetching and decompressing segments lazily through the
//! cache layer.
//!
//! The tree is an arena of entries addressed by integer indices; a
//! directory's children are a vector of indices, so there are no pointer
//! cycles to manage. One coarse lock guards the whole load path; segment
//! bytes themselves come through [`CacheFs`], which de-duplicates
//! concurrent fetches on its own.

use crate::cache::CacheFs;
use crate::collections::{HashMap, HashSet};
use crate::error::{BeakError, Result};
use crate::index::{self, IndexEntry};
use crate::naming::{SegmentKind, SegmentName};
use crate::path::TreePath;
use crate::types::{FileStat, Timespec};
use crate::vfs::FuseOps;
use chrono::{Local, TimeZone};
use parking_lot::Mutex;
use std::io::Write;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, trace};

/// One node of a reconstructed origin tree
#[derive(Debug, Clone)]
pub struct Entry {
    /// Placement record the entry was built from
    pub index: IndexEntry,
    /// Storage-side directory holding the entry's payload segments
    pub seg_dir: TreePath,
    /// Child entries (directories only), arena indices in path order
    pub children: Vec<usize>,
    /// For directories: this directory's own index block has been parsed
    pub loaded: bool,
}

impl Entry {
    fn is_dir(&self) -> bool {
        self.index.stat.is_directory()
    }
}

/// How a snapshot presents itself to selection and browsing
#[derive(Debug, Clone)]
pub struct PointInTime {
    /// Relative age rank: 0 is the newest snapshot
    pub key: usize,
    /// Anchor timestamp from the index segment name
    pub ts: Timespec,
    /// Relative textual form, e.g. `2days 3h ago`
    pub ago: String,
    /// Absolute textual form, e.g. `2017-09-07 14:27`
    pub datetime: String,
    /// Directory entry name shown in browse mode, `@0 2017-09-07 14:27`
    pub direntry: String,
    /// File name of the anchoring index segment on the storage
    pub filename: String,

    entries: Vec<Entry>,
    by_path: HashMap<TreePath, usize>,
    /// Mount-side directory -> storage path of its (unparsed) index segment
    gz_files: HashMap<TreePath, TreePath>,
    loaded_gz_files: HashSet<TreePath>,
}

impl PointInTime {
    fn new(key: usize, name: &SegmentName, filename: String) -> Self {
        let datetime = match Local.timestamp_opt(name.time.secs, name.time.nanos) {
            chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%d %H:%M").to_string(),
            _ => format!("@{}", name.time.secs),
        };
        let age = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .saturating_sub(Duration::from_secs(name.time.secs.max(0) as u64));
        let ago = format!(
            "{} ago",
            humantime::format_duration(Duration::from_secs(age.as_secs()))
        );
        let direntry = format!("@{} {}", key, datetime);
        PointInTime {
            key,
            ts: name.time,
            ago,
            datetime,
            direntry,
            filename,
            entries: Vec::new(),
            by_path: HashMap::new(),
            gz_files: HashMap::new(),
            loaded_gz_files: HashSet::new(),
        }
    }

    /// Entry index for a mount path, without triggering loads
    fn lookup(&self, path: &TreePath) -> Option<usize> {
        self.by_path.get(path).copied()
    }
}

/// What the mount root shows
#[derive(Debug, Clone)]
enum Selection {
    /// One directory per point in time
    Browse,
    /// The tree of one resolved snapshot
    Single(usize),
    /// The selector matched nothing; the mount root does not resolve
    Unresolved(String),
}

/// Read-only reconstructed view of a segment storage
pub struct ReverseFs {
    cache: CacheFs,
    state: Mutex<State>,
}

struct State {
    points: Vec<PointInTime>,
    selection: Selection,
}

impl ReverseFs {
    /// Mount a storage, optionally selecting one point in time
    ///
    /// `selector` accepts the relative form `@0` (newest), `@3` (three
    /// snapshots back), or a prefix of the absolute form
    /// `YYYY-MM-DD HH:MM`. With no selector the mount root lists every
    /// point in time as its own directory. An unmatched selector is not an
    /// error here; the mount root simply fails to resolve.
    pub fn mount(cache: CacheFs, selector: Option<&str>) -> Result<ReverseFs> {
        let mut anchors: Vec<(SegmentName, String)> = Vec::new();
        for name in cache.readdir(&TreePath::root())? {
            if let Ok(parsed) = SegmentName::parse(&name) {
                if parsed.kind == SegmentKind::Index {
                    anchors.push((parsed, name));
                }
            }
        }
        // Newest first; the name timestamp is the anchor.
        anchors.sort_by(|a, b| b.0.time.cmp(&a.0.time));
        let points: Vec<PointInTime> = anchors
            .iter()
            .enumerate()
            .map(|(key, (name, file))| PointInTime::new(key, name, file.clone()))
            .collect();
        info!(points = points.len(), "points in time discovered");

        let selection = match selector {
            None => Selection::Browse,
            Some(sel) => match find_point(&points, sel) {
                Some(idx) => Selection::Single(idx),
                None => {
                    debug!("selector {sel:?} matched no point in time");
                    Selection::Unresolved(sel.to_string())
                }
            },
        };

        Ok(ReverseFs {
            cache,
            state: Mutex::new(State { points, selection }),
        })
    }

    /// Discovered points in time, newest first
    pub fn points_in_time(&self) -> Vec<PointInTime> {
        self.state.lock().points.clone()
    }

    /// The cache layer backing this mount
    pub fn cache(&self) -> &CacheFs {
        &self.cache
    }

    /// Resolve a mount path to `(point index, entry index)`, lazily
    /// parsing index blocks along the way
    fn resolve(&self, state: &mut State, path: &TreePath) -> Result<(usize, usize)> {
        let (point_idx, tree_path) = match &state.selection {
            Selection::Single(idx) => (*idx, path.clone()),
            Selection::Unresolved(sel) => {
                return Err(BeakError::not_found(format!("point in time {sel:?}")))
            }
            Selection::Browse => {
                if path.is_root() {
                    return Err(BeakError::not_found("browse root has no entry".to_string()));
                }
                let direntry = &path.components()[0];
                let idx = state
                    .points
                    .iter()
                    .position(|p| &p.direntry == direntry)
                    .ok_or_else(|| BeakError::not_found(format!("{path}")))?;
                (idx, path.clone())
            }
        };

        let entry_idx = self.ensure_entry(state, point_idx, &tree_path)?;
        Ok((point_idx, entry_idx))
    }

    /// Mount-side root directory of a point in time
    fn mount_root(state: &State, point_idx: usize) -> TreePath {
        match &state.selection {
            Selection::Browse => TreePath::root().join(&state.points[point_idx].direntry),
            _ => TreePath::root(),
        }
    }

    fn ensure_entry(&self, state: &mut State, point_idx: usize, path: &TreePath) -> Result<usize> {
        let mount_root = Self::mount_root(state, point_idx);

        // Seed the snapshot on first touch: a synthetic root directory and
        // the anchor index block waiting to be parsed.
        {
            let point = &mut state.points[point_idx];
            if point.entries.is_empty() {
                let root_entry = Entry {
                    index: synthetic_dir(&mount_root, point.ts),
                    seg_dir: TreePath::root(),
                    children: Vec::new(),
                    loaded: false,
                };
                point.by_path.insert(mount_root.clone(), 0);
                point.entries.push(root_entry);
                point.gz_files.insert(
                    mount_root.clone(),
                    TreePath::root().join(&point.filename),
                );
            }
        }

        loop {
            {
                let point = &state.points[point_idx];
                if let Some(idx) = point.lookup(path) {
                    let e = &point.entries[idx];
                    if !e.is_dir() || e.loaded || !point.gz_files.contains_key(path) {
                        return Ok(idx);
                    }
                }
            }

            // Find the deepest known-but-unparsed index block on the way
            // to `path` and parse it; repeat until the path resolves.
            let to_load = {
                let point = &state.points[point_idx];
                let mut probe = Some(path.clone());
                let mut found = None;
                while let Some(p) = probe {
                    if !p.is_below_or_equal(&mount_root) {
                        break;
                    }
                    if let Some(gz) = point.gz_files.get(&p) {
                        if !point.loaded_gz_files.contains(gz) {
                            found = Some((p.clone(), gz.clone()));
                        }
                    }
                    probe = p.parent();
                }
                found
            };

            match to_load {
                Some((dir, gz)) => self.load_gz(state, point_idx, &dir, &gz)?,
                None => return Err(BeakError::not_found(format!("{path}"))),
            }
        }
    }

    /// Fetch and parse one index block, populating the arena
    fn load_gz(
        &self,
        state: &mut State,
        point_idx: usize,
        mount_dir: &TreePath,
        gz_path: &TreePath,
    ) -> Result<()> {
        trace!(%mount_dir, %gz_path, "lazy loading index block");
        let bytes = self.cache.load(gz_path)?;
        let storage_dir = gz_path
            .parent()
            .ok_or_else(|| BeakError::parse(format!("index segment at no directory: {gz_path}")))?;

        let mut entries = Vec::new();
        let mut tars = Vec::new();
        index::load_index(
            &bytes,
            mount_dir,
            &storage_dir,
            |e| entries.push(e),
            |t| tars.push(t),
        )?;

        let point = &mut state.points[point_idx];
        for e in entries {
            let path = e.path.clone();
            if point.by_path.contains_key(&path) {
                continue;
            }
            let idx = point.entries.len();
            let is_dir = e.stat.is_directory();
            point.entries.push(Entry {
                index: e,
                seg_dir: storage_dir.clone(),
                children: Vec::new(),
                loaded: !is_dir,
            });
            point.by_path.insert(path.clone(), idx);
            if let Some(parent) = path.parent() {
                if let Some(&pidx) = point.by_path.get(&parent) {
                    point.entries[pidx].children.push(idx);
                }
            }
        }
        for t in tars {
            let name = match SegmentName::parse(t.tarfile_location.name()) {
                Ok(n) => n,
                Err(_) => continue,
            };
            if name.kind != SegmentKind::Index {
                continue;
            }
            // Map the child directory to its still-unparsed index block.
            let rel = t.backup_location.sub_path(storage_dir.depth());
            let child_mount = rel.prepend(mount_dir);
            point
                .gz_files
                .entry(child_mount)
                .or_insert_with(|| t.tarfile_location.clone());
        }
        point.loaded_gz_files.insert(gz_path.clone());
        if let Some(&idx) = point.by_path.get(mount_dir) {
            point.entries[idx].loaded = true;
        }
        Ok(())
    }

    /// Read a slice of a regular file, crossing part boundaries as needed
    fn read_entry(&self, entry: &Entry, offset: u64, size: usize) -> Result<Vec<u8>> {
        let ie = &entry.index;
        if !ie.stat.is_regular() || ie.is_hardlink {
            return Err(BeakError::not_found(format!("{}", ie.path)));
        }
        if offset >= ie.stat.size {
            return Ok(Vec::new());
        }
        let len = size.min((ie.stat.size - offset) as usize) as u64;
        let base = SegmentName::parse(&ie.segment)
            .map_err(|_| BeakError::parse(format!("entry {} has no segment", ie.path)))?;

        let part_span = if ie.num_parts > 1 {
            ie.part_size
        } else {
            ie.stat.size.max(1)
        };
        let mut out = Vec::with_capacity(len as usize);
        let mut pos = offset;
        let end = offset + len;
        while pos < end {
            let part = (pos / part_span) as u32;
            let in_part = pos - part as u64 * part_span;
            let avail = ie.content_size(part) - in_part;
            let want = avail.min(end - pos);

            let part_name = SegmentName::payload(
                base.time,
                ie.disk_size(part),
                base.fingerprint.clone(),
                part,
            );
            let seg_path = entry.seg_dir.join(&part_name.to_string());
            let bytes = self
                .cache
                .read(&seg_path, ie.offset + in_part, want as usize)?;
            if bytes.len() as u64 != want {
                return Err(BeakError::integrity(format!(
                    "short read from segment {seg_path}"
                )));
            }
            out.extend_from_slice(&bytes);
            pos += want;
        }
        Ok(out)
    }

    /// Extract the mounted tree below `src` into `dest` on the local FS
    ///
    /// Drives the same resolution and read paths a mount consumer would.
    pub fn restore_to(&self, src: &TreePath, dest: &std::path::Path) -> Result<usize> {
        std::fs::create_dir_all(dest)?;
        let mut restored = 0usize;
        let mut pending = vec![src.clone()];
        let mut hard_links: Vec<(std::path::PathBuf, String)> = Vec::new();
        while let Some(dir) = pending.pop() {
            for name in self.readdir(&dir)? {
                let path = dir.join(&name);
                let rel = path.sub_path(src.depth()).un_root();
                let target = dest.join(rel.as_str());
                let stat = self.getattr(&path)?;
                if stat.is_directory() {
                    std::fs::create_dir_all(&target)?;
                    pending.push(path);
                } else if stat.is_symlink() {
                    let link = self.readlink(&path)?;
                    symlink(&link, &target)?;
                    restored += 1;
                } else if stat.hard_link {
                    hard_links.push((target, stat.link.clone().unwrap_or_default()));
                } else if stat.is_regular() {
                    let mut out = std::fs::File::create(&target)?;
                    let mut offset = 0u64;
                    while offset < stat.size {
                        let chunk = self.read(&path, offset, 1 << 20)?;
                        if chunk.is_empty() {
                            break;
                        }
                        out.write_all(&chunk)?;
                        offset += chunk.len() as u64;
                    }
                    restored += 1;
                }
            }
        }
        // Hard links last: the content-carrying path must exist first.
        for (target, link) in hard_links {
            let original = dest.join(link.trim_start_matches('/'));
            std::fs::hard_link(&original, &target)?;
            restored += 1;
        }
        Ok(restored)
    }
}

#[cfg(unix)]
fn symlink(target: &str, path: &std::path::Path) -> Result<()> {
    std::os::unix::fs::symlink(target, path)?;
    Ok(())
}

#[cfg(not(unix))]
fn symlink(_target: &str, _path: &std::path::Path) -> Result<()> {
    Err(BeakError::unsupported("symlinks on this platform".into()))
}

fn synthetic_dir(path: &TreePath, mtime: Timespec) -> IndexEntry {
    IndexEntry {
        stat: FileStat::directory(0o555, mtime),
        path: path.clone(),
        link: String::new(),
        is_symlink: false,
        is_hardlink: false,
        segment: String::new(),
        offset: 0,
        num_parts: 1,
        part_offset: 0,
        part_size: 0,
        last_part_size: 0,
        disk_part_size: 0,
        disk_last_part_size: 0,
    }
}

/// Match a selector against the discovered points in time
fn find_point(points: &[PointInTime], selector: &str) -> Option<usize> {
    if let Some(rel) = selector.strip_prefix('@') {
        let key: usize = rel.parse().ok()?;
        return points.iter().position(|p| p.key == key);
    }
    points
        .iter()
        .position(|p| p.datetime == selector || p.datetime.starts_with(selector))
}

impl FuseOps for ReverseFs {
    fn getattr(&self, path: &TreePath) -> Result<FileStat> {
        let mut state = self.state.lock();
        let browsing = matches!(state.selection, Selection::Browse);
        if path.is_root() && browsing {
            return Ok(FileStat::directory(0o500, Timespec::default()));
        }
        if browsing && path.depth() == 1 {
            let found = state
                .points
                .iter()
                .find(|p| p.direntry == path.components()[0]);
            return match found {
                Some(p) => Ok(FileStat::directory(0o500, p.ts)),
                None => Err(BeakError::not_found(format!("{path}"))),
            };
        }
        let (point, idx) = self.resolve(&mut state, path)?;
        Ok(state.points[point].entries[idx].index.stat.clone())
    }

    fn readdir(&self, path: &TreePath) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        if path.is_root() {
            if let Selection::Browse = state.selection {
                return Ok(state.points.iter().map(|p| p.direntry.clone()).collect());
            }
        }
        let (point_idx, idx) = self.resolve(&mut state, path)?;
        let point = &state.points[point_idx];
        let entry = &point.entries[idx];
        if !entry.is_dir() {
            return Err(BeakError::not_found(format!("{path} is not a directory")));
        }
        let mut names: Vec<String> = entry
            .children
            .iter()
            .map(|&c| point.entries[c].index.path.name().to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    fn read(&self, path: &TreePath, offset: u64, size: usize) -> Result<Vec<u8>> {
        let entry = {
            let mut state = self.state.lock();
            let (point, idx) = self.resolve(&mut state, path)?;
            state.points[point].entries[idx].clone()
        };
        // Segment bytes come through the cache outside the tree lock; the
        // cache serializes concurrent fetches itself.
        self.read_entry(&entry, offset, size)
    }

    fn readlink(&self, path: &TreePath) -> Result<String> {
        let mut state = self.state.lock();
        let (point, idx) = self.resolve(&mut state, path)?;
        let entry = &state.points[point].entries[idx];
        if entry.index.is_symlink {
            Ok(entry.index.link.clone())
        } else {
            Err(BeakError::not_found(format!("{path} is not a symlink")))
        }
    }
}
