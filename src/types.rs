//! Core data types shared across the archive engine
//!
//! The stat model is deliberately portable: it carries exactly the fields
//! the tar codec and the index format can represent, nothing else.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Seconds/nanoseconds timestamp as stored in segment names and indexes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Timespec {
    /// Whole seconds since the Unix epoch
    pub secs: i64,
    /// Nanosecond remainder, `< 1_000_000_000`
    pub nanos: u32,
}

impl Timespec {
    /// Construct from seconds and nanoseconds
    pub fn new(secs: i64, nanos: u32) -> Self {
        Timespec { secs, nanos }
    }
}

impl Ord for Timespec {
    fn cmp(&self, other: &Self) -> Ordering {
        self.secs
            .cmp(&other.secs)
            .then(self.nanos.cmp(&other.nanos))
    }
}

impl PartialOrd for Timespec {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// File kind subset the tar codec supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    /// Regular file
    Regular,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
    /// Character device
    CharDevice,
    /// Block device
    BlockDevice,
    /// Named pipe
    Fifo,
}

/// Whether a file must be written to the storage on the next push
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DiskUpdate {
    /// Storage copy matches, nothing to do
    #[default]
    Unchanged,
    /// Storage copy is missing or stale
    Store,
}

/// Portable file stat
///
/// `mode` holds the permission bits plus set-uid/set-gid/sticky, never the
/// kind bits; the kind travels separately so the struct round-trips through
/// the tar typeflag without consulting platform macros.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    /// File kind
    pub kind: FileKind,
    /// Permission bits incl. suid/sgid/sticky (max 0o7777)
    pub mode: u32,
    /// Numeric owner
    pub uid: u32,
    /// Numeric group
    pub gid: u32,
    /// Symbolic owner name, empty when unknown
    pub owner: String,
    /// Symbolic group name, empty when unknown
    pub group: String,
    /// Byte size for regular files, zero otherwise
    pub size: u64,
    /// Last modification time
    pub mtime: Timespec,
    /// Symlink or hard link target
    pub link: Option<String>,
    /// This entry is a hard link to `link`
    pub hard_link: bool,
    /// Derived push decision
    pub disk_update: DiskUpdate,
}

impl FileStat {
    /// A regular file stat with the given size, mode and mtime
    pub fn regular(size: u64, mode: u32, mtime: Timespec) -> Self {
        FileStat {
            kind: FileKind::Regular,
            mode,
            uid: 0,
            gid: 0,
            owner: String::new(),
            group: String::new(),
            size,
            mtime,
            link: None,
            hard_link: false,
            disk_update: DiskUpdate::default(),
        }
    }

    /// A directory stat with the given mode and mtime
    pub fn directory(mode: u32, mtime: Timespec) -> Self {
        FileStat {
            kind: FileKind::Directory,
            size: 0,
            ..FileStat::regular(0, mode, mtime)
        }
    }

    /// A symlink stat pointing at `target`
    pub fn symlink(target: impl Into<String>, mtime: Timespec) -> Self {
        FileStat {
            kind: FileKind::Symlink,
            link: Some(target.into()),
            ..FileStat::regular(0, 0o777, mtime)
        }
    }

    /// True for regular files (including hard links to them)
    pub fn is_regular(&self) -> bool {
        self.kind == FileKind::Regular
    }

    /// True for directories
    pub fn is_directory(&self) -> bool {
        self.kind == FileKind::Directory
    }

    /// True for symbolic links
    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }

    /// Same size as `other`
    pub fn same_size(&self, other: &FileStat) -> bool {
        self.size == other.size
    }

    /// Same mtime as `other`
    pub fn same_mtime(&self, other: &FileStat) -> bool {
        self.mtime == other.mtime
    }

    /// Same permission bits as `other`
    pub fn same_permissions(&self, other: &FileStat) -> bool {
        self.mode == other.mode
    }

    /// Compare against the storage copy and derive `disk_update`
    pub fn check_against(&mut self, existing: Option<&FileStat>) {
        self.disk_update = match existing {
            Some(old)
                if self.same_size(old) && self.same_mtime(old) && self.same_permissions(old) =>
            {
                DiskUpdate::Unchanged
            }
            _ => DiskUpdate::Store,
        };
    }

    /// Build a stat from filesystem metadata (symlink-aware)
    #[cfg(not(unix))]
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        let ft = meta.file_type();
        let kind = if ft.is_symlink() {
            FileKind::Symlink
        } else if ft.is_dir() {
            FileKind::Directory
        } else {
            FileKind::Regular
        };
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| Timespec::new(d.as_secs() as i64, d.subsec_nanos()))
            .unwrap_or_default();
        FileStat {
            kind,
            mode: if meta.permissions().readonly() { 0o444 } else { 0o644 },
            size: if kind == FileKind::Regular { meta.len() } else { 0 },
            mtime,
            ..FileStat::regular(0, 0, Timespec::default())
        }
    }

    /// Build a stat from filesystem metadata (symlink-aware)
    #[cfg(unix)]
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::FileTypeExt;
        use std::os::unix::fs::MetadataExt;

        let ft = meta.file_type();
        let kind = if ft.is_symlink() {
            FileKind::Symlink
        } else if ft.is_dir() {
            FileKind::Directory
        } else if ft.is_char_device() {
            FileKind::CharDevice
        } else if ft.is_block_device() {
            FileKind::BlockDevice
        } else if ft.is_fifo() {
            FileKind::Fifo
        } else {
            FileKind::Regular
        };
        FileStat {
            kind,
            mode: meta.mode() & 0o7777,
            uid: meta.uid(),
            gid: meta.gid(),
            owner: String::new(),
            group: String::new(),
            size: if kind == FileKind::Regular { meta.len() } else { 0 },
            mtime: Timespec::new(meta.mtime(), meta.mtime_nsec() as u32),
            link: None,
            hard_link: false,
            disk_update: DiskUpdate::default(),
        }
    }
}

/// Grouping policy for the forward packer
///
/// `target_size` is the tar-encoded byte budget of one payload segment; a
/// single regular file larger than the budget is split into parts of
/// exactly `target_size` logical bytes each (last part smaller).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingPolicy {
    /// Target tar-encoded segment size in bytes
    pub target_size: u64,
}

impl Default for ChunkingPolicy {
    fn default() -> Self {
        ChunkingPolicy {
            target_size: 100_000_000,
        }
    }
}

impl ChunkingPolicy {
    /// Policy with an explicit target size
    pub fn with_target_size(target_size: u64) -> Self {
        ChunkingPolicy { target_size }
    }

    /// The settings string recorded in every index header
    ///
    /// Layout-affecting knobs must be visible in the index so a reader can
    /// tell why two snapshots of identical trees differ.
    pub fn config_string(&self) -> String {
        format!("-ta {}", self.target_size)
    }

    /// Number of parts a regular file of `size` bytes splits into
    pub fn num_parts(&self, size: u64) -> u32 {
        if size <= self.target_size {
            1
        } else {
            size.div_ceil(self.target_size) as u32
        }
    }

    /// Logical bytes in part `part` of a file of `size` bytes
    pub fn part_content_size(&self, size: u64, part: u32) -> u64 {
        let num = self.num_parts(size);
        if num == 1 {
            size
        } else if part == num - 1 {
            size - (num as u64 - 1) * self.target_size
        } else {
            self.target_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timespec_order() {
        assert!(Timespec::new(1, 999_999_999) < Timespec::new(2, 0));
        assert!(Timespec::new(2, 1) > Timespec::new(2, 0));
    }

    #[test]
    fn test_disk_update_derivation() {
        let old = FileStat::regular(10, 0o644, Timespec::new(1000, 0));
        let mut new = old.clone();
        new.check_against(Some(&old));
        assert_eq!(new.disk_update, DiskUpdate::Unchanged);

        new.size = 11;
        new.check_against(Some(&old));
        assert_eq!(new.disk_update, DiskUpdate::Store);

        let mut fresh = old.clone();
        fresh.check_against(None);
        assert_eq!(fresh.disk_update, DiskUpdate::Store);
    }

    #[test]
    fn test_split_policy_conserves_content() {
        let policy = ChunkingPolicy::with_target_size(1024);
        let size = 3 * 1024 + 7;
        let parts = policy.num_parts(size);
        assert_eq!(parts, 4);
        let total: u64 = (0..parts).map(|p| policy.part_content_size(size, p)).sum();
        assert_eq!(total, size);
        assert_eq!(policy.part_content_size(size, 3), 7);
        assert_eq!(policy.part_content_size(size, 0), 1024);
    }

    #[test]
    fn test_small_file_is_one_part() {
        let policy = ChunkingPolicy::default();
        assert_eq!(policy.num_parts(0), 1);
        assert_eq!(policy.num_parts(2), 1);
        assert_eq!(policy.part_content_size(2, 0), 2);
    }
}
