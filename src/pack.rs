//! Forward packer: origin tree to virtual segment tree
//!
//! The packer walks an origin directory depth-first and deterministically
//! groups every directory's direct entries into tar-formatted payload
//! segments, then writes one index segment per directory describing the
//! placement of every entry and the index segments of the child
//! directories. Nothing is materialized: the result is a [`SegmentTree`]
//! whose segments know how to synthesize any byte range on demand.
//!
//! Determinism is the whole point: identical origin input under the same
//! [`ChunkingPolicy`] yields identical segment names and identical bytes,
//! which is what makes push-time deduplication against a remote store
//! possible.

use crate::collections::HashMap;
use crate::error::{BeakError, Result};
use crate::index::{self, IndexEntry, IndexHeader, IndexTar};
use crate::naming::SegmentName;
use crate::path::TreePath;
use crate::stats::StoreStatistics;
use crate::tar;
use crate::types::{ChunkingPolicy, DiskUpdate, FileStat, Timespec};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, trace};
use walkdir::WalkDir;

/// One tar member inside a payload segment
#[derive(Debug, Clone)]
pub struct Member {
    /// Member path as written into the tar (relative to the segment's dir)
    pub tar_path: String,
    /// Absolute origin path the content is read from
    pub origin_path: PathBuf,
    /// Stat written into the header
    pub stat: FileStat,
    /// Symlink or hard link target
    pub link: Option<String>,
    /// Header typeflag is a hard link
    pub is_hard_link: bool,
    /// Precomputed header blocks (GNU prologues included)
    pub header: Arc<Vec<u8>>,
    /// Offset of the header inside the segment
    pub offset: u64,
    /// Content bytes stored in this segment (one part of a split file)
    pub content_len: u64,
    /// Offset inside the origin file where this part begins
    pub content_origin_offset: u64,
}

impl Member {
    /// Offset of the content payload inside the segment
    pub fn content_offset(&self) -> u64 {
        self.offset + self.header.len() as u64
    }

    /// Offset one past the 512-padded payload
    pub fn end_offset(&self) -> u64 {
        self.content_offset() + tar::padded_content_size(self.content_len)
    }
}

/// What a segment serves its bytes from
#[derive(Debug, Clone)]
pub enum SegmentContent {
    /// Tar members synthesized on the fly, then two zero blocks
    Members(Vec<Member>),
    /// Fully rendered bytes (index segments)
    Bytes(Arc<Vec<u8>>),
}

/// One named segment of the virtual tree
#[derive(Debug, Clone)]
pub struct Segment {
    /// Deterministic segment name
    pub name: SegmentName,
    /// Actual byte length (for indexes the name says zero, this does not)
    pub size: u64,
    /// Newest mtime covered
    pub mtime: Timespec,
    /// Byte source
    pub content: SegmentContent,
}

/// One directory of the virtual tree
#[derive(Debug, Clone)]
pub struct VirtualDir {
    /// Rooted storage path of the directory
    pub path: TreePath,
    /// Stat derived from the origin directory
    pub stat: FileStat,
    /// Child directories, in path order
    pub subdirs: Vec<TreePath>,
    /// Payload segments first, the index segment last
    pub segments: Vec<Segment>,
    /// Depth-first first origin path described by this directory's index,
    /// transitively through child indexes; the directory path itself when
    /// the subtree is empty
    pub first: TreePath,
    /// Depth-first last origin path described by this directory's index,
    /// `first <= last`
    pub last: TreePath,
}

/// The complete synthetic tree produced by one pack run
#[derive(Debug)]
pub struct SegmentTree {
    dirs: BTreeMap<TreePath, VirtualDir>,
    stats: StoreStatistics,
    config: String,
}

impl SegmentTree {
    /// Look up a virtual directory by rooted path
    pub fn dir(&self, path: &TreePath) -> Option<&VirtualDir> {
        self.dirs.get(path)
    }

    /// Look up the segment behind a virtual file path
    pub fn segment(&self, path: &TreePath) -> Option<&Segment> {
        let parent = path.parent()?;
        let dir = self.dirs.get(&parent)?;
        dir.segments
            .iter()
            .find(|s| s.name.to_string() == path.name())
    }

    /// All directories in depth-first path order
    pub fn dirs(&self) -> impl DoubleEndedIterator<Item = &VirtualDir> {
        self.dirs.values()
    }

    /// Statistics collected during the pack
    pub fn stats(&self) -> &StoreStatistics {
        &self.stats
    }

    /// The settings string recorded in every index header
    pub fn config(&self) -> &str {
        &self.config
    }
}

/// One origin entry scheduled for packing
#[derive(Debug, Clone)]
struct ScanEntry {
    /// Rooted storage path
    path: TreePath,
    origin_path: PathBuf,
    stat: FileStat,
    link: Option<String>,
    is_hard_link: bool,
}

#[derive(Debug, Default)]
struct DirScan {
    stat: Option<FileStat>,
    origin_path: PathBuf,
    entries: Vec<ScanEntry>,
    subdirs: Vec<TreePath>,
}

/// Forward packer
///
/// ```rust,no_run
/// use beak::{ChunkingPolicy, Packer};
/// # fn main() -> beak::Result<()> {
/// let mut packer = Packer::new(ChunkingPolicy::default());
/// packer.exclude("*.tmp")?;
/// let tree = packer.pack(std::path::Path::new("/home/me/work"))?;
/// # Ok(())
/// # }
/// ```
pub struct Packer {
    policy: ChunkingPolicy,
    excludes: GitignoreBuilder,
    exclude_config: Vec<String>,
    stats: StoreStatistics,
}

impl Packer {
    /// Packer with the given chunking policy and no filters
    pub fn new(policy: ChunkingPolicy) -> Self {
        Packer {
            policy,
            excludes: GitignoreBuilder::new("/"),
            exclude_config: Vec::new(),
            stats: StoreStatistics::default(),
        }
    }

    /// Add a gitignore-style exclude pattern
    pub fn exclude(&mut self, pattern: &str) -> Result<()> {
        self.excludes
            .add_line(None, pattern)
            .map_err(|e| BeakError::InvalidConfiguration(format!("bad glob {pattern:?}: {e}")))?;
        self.exclude_config.push(pattern.to_string());
        Ok(())
    }

    fn config_string(&self) -> String {
        let mut config = self.policy.config_string();
        for e in &self.exclude_config {
            config.push_str(&format!(" -e '{e}'"));
        }
        config
    }

    /// Walk `origin` and assemble the virtual segment tree
    ///
    /// Deterministic: the same origin content under the same policy yields
    /// the same set of `(SegmentName, bytes)` pairs. I/O failures abort the
    /// run; no partial segment ever enters the returned tree.
    pub fn pack(&mut self, origin: &Path) -> Result<SegmentTree> {
        info!("scanning {}", origin.display());
        self.stats = StoreStatistics::default();
        let matcher = self
            .excludes
            .build()
            .map_err(|e| BeakError::InvalidConfiguration(e.to_string()))?;
        let scans = self.scan(origin, &matcher)?;

        info!(
            files = self.stats.num_files,
            dirs = self.stats.num_dirs,
            "grouping into segments"
        );
        let config = self.config_string();
        let mut dirs: BTreeMap<TreePath, VirtualDir> = BTreeMap::new();
        // Children before parents: a directory's index embeds the names of
        // its child index segments, so those must exist first.
        for (dir_path, scan) in scans.iter().rev() {
            let vdir = self.pack_dir(dir_path, scan, &dirs, &config)?;
            dirs.insert(dir_path.clone(), vdir);
        }

        Ok(SegmentTree {
            dirs,
            stats: self.stats.clone(),
            config,
        })
    }

    /// Statistics of the last pack run
    pub fn stats(&self) -> &StoreStatistics {
        &self.stats
    }

    fn scan(&mut self, origin: &Path, matcher: &Gitignore) -> Result<BTreeMap<TreePath, DirScan>> {
        let origin_depth = TreePath::lookup(&origin.to_string_lossy()).depth();
        let mut scans: BTreeMap<TreePath, DirScan> = BTreeMap::new();
        // First regular path seen per (dev, inode), for hard link rewriting.
        let mut inodes: HashMap<(u64, u64), TreePath> = HashMap::new();

        let origin_owned = origin.to_path_buf();
        let walker = WalkDir::new(origin)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |e| {
                if e.depth() == 0 {
                    return true;
                }
                // Never descend into a sub-repository.
                if e.file_name() == ".beak" {
                    return false;
                }
                if e.file_type().is_dir() && e.path().join(".beak").exists() {
                    debug!("skipping sub-repository {}", e.path().display());
                    return false;
                }
                let rel = e.path().strip_prefix(&origin_owned).unwrap_or(e.path());
                if matcher
                    .matched_path_or_any_parents(rel, e.file_type().is_dir())
                    .is_ignore()
                {
                    debug!("filter dropped {}", rel.display());
                    return false;
                }
                true
            });

        for entry in walker {
            let entry = entry?;
            let meta = entry.path().symlink_metadata()?;
            let mut stat = FileStat::from_metadata(&meta);
            let path = TreePath::lookup(&entry.path().to_string_lossy()).sub_path(origin_depth);

            if is_socket(&meta) {
                trace!("skipping socket {}", entry.path().display());
                continue;
            }

            if stat.is_directory() {
                self.stats.num_dirs += 1;
                let scan = scans.entry(path.clone()).or_default();
                scan.stat = Some(stat);
                scan.origin_path = entry.path().to_path_buf();
                if let Some(parent) = path.parent() {
                    scans.entry(parent).or_default().subdirs.push(path.clone());
                }
                continue;
            }

            let mut link = None;
            let mut is_hard_link = false;
            if stat.is_symlink() {
                let target = std::fs::read_link(entry.path())?;
                link = Some(target.to_string_lossy().into_owned());
            } else if stat.is_regular() {
                let key = file_identity(&meta);
                if key.1 > 1 {
                    let id = (key.0, key.2);
                    if let Some(first) = inodes.get(&id) {
                        // Later occurrences become in-archive hard links to
                        // the first path that carried the content.
                        debug!("rewriting {} into a hard link to {}", path, first);
                        link = Some(first.as_str().to_string());
                        is_hard_link = true;
                        stat.size = 0;
                        self.stats.num_hard_links += 1;
                    } else {
                        inodes.insert(id, path.clone());
                    }
                }
            }

            if stat.is_regular() && !is_hard_link {
                self.stats.num_files += 1;
                self.stats.size_files += stat.size;
            }
            stat.link = link.clone();
            stat.hard_link = is_hard_link;
            stat.disk_update = DiskUpdate::Store;

            let parent = path.parent().ok_or_else(|| {
                BeakError::parse(format!("origin entry without a parent: {path}"))
            })?;
            scans.entry(parent).or_default().entries.push(ScanEntry {
                path,
                origin_path: entry.path().to_path_buf(),
                stat,
                link,
                is_hard_link,
            });
        }

        // The origin root is always a storage directory, even when empty.
        let root = scans.entry(TreePath::root()).or_default();
        if root.stat.is_none() {
            let meta = origin.metadata()?;
            root.stat = Some(FileStat::from_metadata(&meta));
            root.origin_path = origin.to_path_buf();
        }
        Ok(scans)
    }

    fn pack_dir(
        &self,
        dir_path: &TreePath,
        scan: &DirScan,
        packed_children: &BTreeMap<TreePath, VirtualDir>,
        config: &str,
    ) -> Result<VirtualDir> {
        let dir_stat = scan
            .stat
            .clone()
            .unwrap_or_else(|| FileStat::directory(0o755, Timespec::default()));

        let mut entries = scan.entries.clone();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        let mut subdirs = scan.subdirs.clone();
        subdirs.sort();

        // Content hashes feed both fingerprints and dedup; hashing is the
        // expensive part so it runs in parallel, collected in entry order.
        let content_hashes: Vec<Option<Vec<String>>> = entries
            .par_iter()
            .map(|e| {
                if e.stat.is_regular() && !e.is_hard_link {
                    hash_file_parts(&e.origin_path, e.stat.size, &self.policy).map(Some)
                } else {
                    Ok(None)
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let mut segments = Vec::new();
        let mut index_entries = Vec::new();
        let mut index_tars = Vec::new();

        // Depth-first bounds of everything this index describes, carried
        // bottom-up so the parent can record where the child's index
        // segment begins and ends in path order.
        let mut bounds: Option<(TreePath, TreePath)> = None;
        for entry in &entries {
            widen_bounds(&mut bounds, &entry.path, &entry.path);
        }

        let mut group: Vec<(usize, &ScanEntry)> = Vec::new();
        let mut group_size = 0u64;
        let target = self.policy.target_size;

        for (i, entry) in entries.iter().enumerate() {
            let encoded = encoded_member_size(dir_path, entry);
            let splittable = entry.stat.is_regular()
                && !entry.is_hard_link
                && entry.stat.size > target;
            if splittable {
                flush_group(
                    dir_path,
                    &mut group,
                    &content_hashes,
                    &mut segments,
                    &mut index_entries,
                    &mut index_tars,
                )?;
                group_size = 0;
                let parts = build_split_segments(
                    dir_path,
                    entry,
                    content_hashes[i].as_ref().expect("regular file has hashes"),
                    &self.policy,
                )?;
                record_split_index(dir_path, entry, &parts, &mut index_entries, &mut index_tars);
                segments.extend(parts);
                continue;
            }
            if !group.is_empty() && group_size + encoded + 2 * tar::BLOCK_SIZE > target {
                flush_group(
                    dir_path,
                    &mut group,
                    &content_hashes,
                    &mut segments,
                    &mut index_entries,
                    &mut index_tars,
                )?;
                group_size = 0;
            }
            group_size += encoded;
            group.push((i, entry));
        }
        flush_group(
            dir_path,
            &mut group,
            &content_hashes,
            &mut segments,
            &mut index_entries,
            &mut index_tars,
        )?;

        // Child directories appear in the index twice: as stat entries and
        // as locators of their own index segments.
        for sub in &subdirs {
            let child = packed_children
                .get(sub)
                .ok_or_else(|| BeakError::not_found(format!("unpacked child dir {sub}")))?;
            index_entries.push(IndexEntry {
                stat: child.stat.clone(),
                path: TreePath::lookup(sub.name()),
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
            });
            widen_bounds(&mut bounds, &child.first, &child.last);
            let child_index = child.segments.last().expect("every dir has an index");
            index_tars.push(IndexTar {
                backup_location: TreePath::lookup(sub.name()),
                tarfile_location: TreePath::lookup(sub.name())
                    .join(&child_index.name.to_string()),
                first: child.first.sub_path(dir_path.depth()),
                last: child.last.sub_path(dir_path.depth()),
            });
        }

        index_entries.sort_by(|a, b| a.path.cmp(&b.path));

        // The index timestamp covers the whole subtree: payloads, child
        // indexes and the directory itself.
        let mut index_mtime = dir_stat.mtime;
        for s in &segments {
            index_mtime = index_mtime.max(s.mtime);
        }
        for sub in &subdirs {
            if let Some(child) = packed_children.get(sub) {
                if let Some(ci) = child.segments.last() {
                    index_mtime = index_mtime.max(ci.mtime);
                }
            }
        }

        let header = IndexHeader {
            config: config.to_string(),
        };
        let text = index::render_index(&header, &index_entries, &index_tars);
        let fingerprint = hex_sha256(&text);
        let gz = index::write_index(&header, &index_entries, &index_tars)?;
        let gz_len = gz.len() as u64;
        let index_segment = Segment {
            name: SegmentName::index(index_mtime, fingerprint),
            size: gz_len,
            mtime: index_mtime,
            content: SegmentContent::Bytes(Arc::new(gz)),
        };
        trace!(
            dir = %dir_path,
            payloads = segments.len(),
            index = %index_segment.name,
            "directory packed"
        );
        segments.push(index_segment);

        let (first, last) =
            bounds.unwrap_or_else(|| (dir_path.clone(), dir_path.clone()));
        Ok(VirtualDir {
            path: dir_path.clone(),
            stat: dir_stat,
            subdirs,
            segments,
            first,
            last,
        })
    }
}

/// Grow a depth-first path range to cover `[lo, hi]`
fn widen_bounds(bounds: &mut Option<(TreePath, TreePath)>, lo: &TreePath, hi: &TreePath) {
    match bounds {
        None => *bounds = Some((lo.clone(), hi.clone())),
        Some((first, last)) => {
            if *lo < *first {
                *first = lo.clone();
            }
            if *hi > *last {
                *last = hi.clone();
            }
        }
    }
}

fn is_socket(meta: &std::fs::Metadata) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        meta.file_type().is_socket()
    }
    #[cfg(not(unix))]
    false
}

#[cfg(unix)]
fn file_identity(meta: &std::fs::Metadata) -> (u64, u64, u64) {
    use std::os::unix::fs::MetadataExt;
    (meta.dev(), meta.nlink(), meta.ino())
}

#[cfg(not(unix))]
fn file_identity(_meta: &std::fs::Metadata) -> (u64, u64, u64) {
    (0, 1, 0)
}

/// Close the current group into one payload segment, if non-empty
fn flush_group(
    dir: &TreePath,
    group: &mut Vec<(usize, &ScanEntry)>,
    content_hashes: &[Option<Vec<String>>],
    segments: &mut Vec<Segment>,
    index_entries: &mut Vec<IndexEntry>,
    index_tars: &mut Vec<IndexTar>,
) -> Result<()> {
    if group.is_empty() {
        return Ok(());
    }
    let segment = build_group_segment(dir, group, content_hashes)?;
    record_group_index(&segment, group, index_entries, index_tars);
    segments.push(segment);
    group.clear();
    Ok(())
}

/// Member path inside a segment of `dir`: relative, no leading separator
fn tar_path_in(dir: &TreePath, entry_path: &TreePath) -> String {
    entry_path.sub_path(dir.depth()).un_root().as_str().to_string()
}

fn encoded_member_size(dir: &TreePath, entry: &ScanEntry) -> u64 {
    let tp = tar_path_in(dir, &entry.path);
    let header = tar::header_size(&tp, entry.link.as_deref(), entry.is_hard_link);
    let content = if entry.stat.is_regular() && !entry.is_hard_link {
        tar::padded_content_size(entry.stat.size)
    } else {
        0
    };
    header + content
}

fn hex_sha256(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Hash a file's content, one digest per split part
fn hash_file_parts(path: &Path, size: u64, policy: &ChunkingPolicy) -> Result<Vec<String>> {
    let mut file = File::open(path)?;
    let num_parts = policy.num_parts(size);
    let mut hashes = Vec::with_capacity(num_parts as usize);
    let mut buf = vec![0u8; 1 << 20];
    for part in 0..num_parts {
        let mut remaining = policy.part_content_size(size, part);
        let mut hasher = Sha256::new();
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let got = file.read(&mut buf[..want])?;
            if got == 0 {
                return Err(BeakError::integrity(format!(
                    "{} shrank while packing",
                    path.display()
                )));
            }
            hasher.update(&buf[..got]);
            remaining -= got as u64;
        }
        hashes.push(format!("{:x}", hasher.finalize()));
    }
    Ok(hashes)
}

/// Feed one entry's identity into a group fingerprint
fn hash_entry(hasher: &mut Sha256, entry: &ScanEntry, content_hashes: Option<&Vec<String>>) {
    let s = &entry.stat;
    hasher.update(entry.path.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(
        format!(
            "{:?} {:o} {} {} {} {}.{} {} {}",
            s.kind,
            s.mode,
            s.uid,
            s.gid,
            s.size,
            s.mtime.secs,
            s.mtime.nanos,
            entry.link.as_deref().unwrap_or(""),
            entry.is_hard_link as u8,
        )
        .as_bytes(),
    );
    hasher.update([0u8]);
    if let Some(hashes) = content_hashes {
        for h in hashes {
            hasher.update(h.as_bytes());
            hasher.update([0u8]);
        }
    }
}

fn build_group_segment(
    dir: &TreePath,
    group: &[(usize, &ScanEntry)],
    content_hashes: &[Option<Vec<String>>],
) -> Result<Segment> {
    let mut hasher = Sha256::new();
    let mut mtime = Timespec::default();
    for (i, entry) in group {
        hash_entry(&mut hasher, entry, content_hashes[*i].as_ref());
        mtime = mtime.max(entry.stat.mtime);
    }
    let fingerprint = format!("{:x}", hasher.finalize());

    let mut members = Vec::with_capacity(group.len());
    let mut offset = 0u64;
    for (_, entry) in group {
        let tp = tar_path_in(dir, &entry.path);
        let header = tar::encode_header(
            &entry.stat,
            &tp,
            entry.link.as_deref(),
            entry.is_hard_link,
        );
        let content_len = if entry.stat.is_regular() && !entry.is_hard_link {
            entry.stat.size
        } else {
            0
        };
        let member = Member {
            tar_path: tp,
            origin_path: entry.origin_path.clone(),
            stat: entry.stat.clone(),
            link: entry.link.clone(),
            is_hard_link: entry.is_hard_link,
            header: Arc::new(header),
            offset,
            content_len,
            content_origin_offset: 0,
        };
        offset = member.end_offset();
        members.push(member);
    }
    let size = offset + 2 * tar::BLOCK_SIZE;
    Ok(Segment {
        name: SegmentName::payload(mtime, size, fingerprint, 0),
        size,
        mtime,
        content: SegmentContent::Members(members),
    })
}

fn build_split_segments(
    dir: &TreePath,
    entry: &ScanEntry,
    part_hashes: &[String],
    policy: &ChunkingPolicy,
) -> Result<Vec<Segment>> {
    // One fingerprint covers every part; the per-part content hashes are
    // what make it sensitive to any byte of the file.
    let mut hasher = Sha256::new();
    hasher.update(entry.path.as_str().as_bytes());
    hasher.update([0u8]);
    for h in part_hashes {
        hasher.update(h.as_bytes());
        hasher.update([0u8]);
    }
    let fingerprint = format!("{:x}", hasher.finalize());

    let tp = tar_path_in(dir, &entry.path);
    let num_parts = policy.num_parts(entry.stat.size);
    let mut segments = Vec::with_capacity(num_parts as usize);
    for part in 0..num_parts {
        let content_len = policy.part_content_size(entry.stat.size, part);
        let header = tar::encode_header(&entry.stat, &tp, None, false);
        let member = Member {
            tar_path: tp.clone(),
            origin_path: entry.origin_path.clone(),
            stat: entry.stat.clone(),
            link: None,
            is_hard_link: false,
            header: Arc::new(header),
            offset: 0,
            content_len,
            content_origin_offset: part as u64 * policy.target_size,
        };
        let size = member.end_offset() + 2 * tar::BLOCK_SIZE;
        segments.push(Segment {
            name: SegmentName::payload(entry.stat.mtime, size, fingerprint.clone(), part),
            size,
            mtime: entry.stat.mtime,
            content: SegmentContent::Members(vec![member]),
        });
    }
    Ok(segments)
}

fn record_group_index(
    segment: &Segment,
    group: &[(usize, &ScanEntry)],
    index_entries: &mut Vec<IndexEntry>,
    index_tars: &mut Vec<IndexTar>,
) {
    let name = segment.name.to_string();
    let members = match &segment.content {
        SegmentContent::Members(m) => m,
        SegmentContent::Bytes(_) => unreachable!("payload segments hold members"),
    };
    for (member, (_, entry)) in members.iter().zip(group) {
        index_entries.push(IndexEntry {
            stat: entry.stat.clone(),
            path: TreePath::lookup(&member.tar_path),
            link: entry.link.clone().unwrap_or_default(),
            is_symlink: entry.stat.is_symlink(),
            is_hardlink: entry.is_hard_link,
            segment: name.clone(),
            offset: member.content_offset(),
            num_parts: 1,
            part_offset: 0,
            part_size: entry.stat.size,
            last_part_size: entry.stat.size,
            disk_part_size: segment.size,
            disk_last_part_size: segment.size,
        });
    }
    index_tars.push(IndexTar {
        backup_location: TreePath::lookup(""),
        tarfile_location: TreePath::lookup(&name),
        first: TreePath::lookup(&members.first().expect("group is non-empty").tar_path),
        last: TreePath::lookup(&members.last().expect("group is non-empty").tar_path),
    });
}

fn record_split_index(
    dir: &TreePath,
    entry: &ScanEntry,
    parts: &[Segment],
    index_entries: &mut Vec<IndexEntry>,
    index_tars: &mut Vec<IndexTar>,
) {
    let first = &parts[0];
    let last = parts.last().expect("split file has parts");
    let member = match &first.content {
        SegmentContent::Members(m) => &m[0],
        SegmentContent::Bytes(_) => unreachable!("payload segments hold members"),
    };
    let tp = tar_path_in(dir, &entry.path);
    index_entries.push(IndexEntry {
        stat: entry.stat.clone(),
        path: TreePath::lookup(&tp),
        link: String::new(),
        is_symlink: false,
        is_hardlink: false,
        segment: first.name.to_string(),
        offset: member.content_offset(),
        num_parts: parts.len() as u32,
        part_offset: 0,
        part_size: match &first.content {
            SegmentContent::Members(m) => m[0].content_len,
            SegmentContent::Bytes(_) => 0,
        },
        last_part_size: match &last.content {
            SegmentContent::Members(m) => m[0].content_len,
            SegmentContent::Bytes(_) => 0,
        },
        disk_part_size: first.size,
        disk_last_part_size: last.size,
    });
    for part in parts {
        index_tars.push(IndexTar {
            backup_location: TreePath::lookup(""),
            tarfile_location: TreePath::lookup(&part.name.to_string()),
            first: TreePath::lookup(&tp),
            last: TreePath::lookup(&tp),
        });
    }
}
