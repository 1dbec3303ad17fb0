//! Index segment codec
//!
//! Every directory's index segment (`z` type) carries a gzip-compressed
//! textual block describing where each of the directory's files lives
//! inside the sibling payload segments, plus locators for the index
//! segments of its child directories. The byte format round-trips exactly:
//!
//! ```text
//! #beak 1
//! #fingerprint sha256
//! #config <policy string>
//! #files <N>
//! NUL
//! <N entry records>
//! #tars <M>
//! NUL
//! <M tar records>
//! ```
//!
//! A record is a run of NUL-terminated fields; NUL is the reserved
//! delimiter because it is the one byte that can never occur in a path.
//! Entry fields: path, link, kind, hardlink flag, octal mode, uid, gid,
//! size, mtime seconds, mtime nanos, offset, segment name, part count,
//! part offset, part size, last part size, on-disk part size, on-disk
//! last part size. Tar fields: backup location, tarfile location, first
//! and last origin path stored inside.

use crate::error::{BeakError, Result};
use crate::naming::SegmentName;
use crate::path::TreePath;
use crate::types::{FileKind, FileStat, Timespec};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use tracing::trace;

/// Format version emitted by [`write_index`]
pub const INDEX_VERSION: u32 = 1;

/// Fingerprint construction named in every index header
///
/// Versioned so old snapshots stay readable if the construction changes.
pub const FINGERPRINT_ALGORITHM: &str = "sha256";

/// Placement of one origin file or directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Stat of the origin entry
    pub stat: FileStat,
    /// Origin path (relative inside the block, prepended on load)
    pub path: TreePath,
    /// Symlink or hard link target, empty when none
    pub link: String,
    /// Entry is a symbolic link
    pub is_symlink: bool,
    /// Entry is a hard link
    pub is_hardlink: bool,
    /// Name of the payload segment holding the content, empty for dirs
    pub segment: String,
    /// Content offset inside the (each) payload segment
    pub offset: u64,
    /// Number of payload segments the file spans, `>= 1`
    pub num_parts: u32,
    /// Logical offset covered by part 0 (always zero today)
    pub part_offset: u64,
    /// Logical bytes per non-final part
    pub part_size: u64,
    /// Logical bytes in the final part
    pub last_part_size: u64,
    /// Encoded tar bytes per non-final part segment
    pub disk_part_size: u64,
    /// Encoded tar bytes of the final part segment
    pub disk_last_part_size: u64,
}

impl IndexEntry {
    /// Logical content bytes stored in part `part`
    pub fn content_size(&self, part: u32) -> u64 {
        if part == self.num_parts - 1 {
            self.last_part_size
        } else {
            self.part_size
        }
    }

    /// Encoded tar bytes of the segment holding part `part`
    pub fn disk_size(&self, part: u32) -> u64 {
        if part == self.num_parts - 1 {
            self.disk_last_part_size
        } else {
            self.disk_part_size
        }
    }
}

/// Locator of a segment storing (part of) a subtree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexTar {
    /// Directory the segment belongs to (relative inside the block)
    pub backup_location: TreePath,
    /// Segment file location (relative inside the block)
    pub tarfile_location: TreePath,
    /// Depth-first first origin path stored inside
    pub first: TreePath,
    /// Depth-first last origin path stored inside, `first <= last`
    pub last: TreePath,
}

/// Header settings recorded with every index block
#[derive(Debug, Clone, Default)]
pub struct IndexHeader {
    /// Layout-affecting settings string of the packer
    pub config: String,
}

fn kind_letter(stat: &FileStat) -> char {
    match stat.kind {
        FileKind::Regular => '0',
        FileKind::Symlink => '2',
        FileKind::CharDevice => '3',
        FileKind::BlockDevice => '4',
        FileKind::Directory => '5',
        FileKind::Fifo => '6',
    }
}

fn kind_from_letter(letter: &str) -> Result<FileKind> {
    match letter {
        "0" => Ok(FileKind::Regular),
        "2" => Ok(FileKind::Symlink),
        "3" => Ok(FileKind::CharDevice),
        "4" => Ok(FileKind::BlockDevice),
        "5" => Ok(FileKind::Directory),
        "6" => Ok(FileKind::Fifo),
        other => Err(BeakError::parse(format!(
            "unknown kind letter {other:?} in index record"
        ))),
    }
}

fn push_field(out: &mut Vec<u8>, field: &str) {
    out.extend_from_slice(field.as_bytes());
    out.push(0);
}

/// Serialize an index block and gzip it
///
/// Entry and tar paths must already be relative to the indexed directory;
/// [`load_index`] reapplies absolute prefixes on the way back in.
pub fn write_index(
    header: &IndexHeader,
    entries: &[IndexEntry],
    tars: &[IndexTar],
) -> Result<Vec<u8>> {
    let text = render_index(header, entries, tars);
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&text)?;
    Ok(encoder.finish()?)
}

/// The uncompressed index text, used for both storage and fingerprinting
pub fn render_index(header: &IndexHeader, entries: &[IndexEntry], tars: &[IndexTar]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(format!("#beak {}\n", INDEX_VERSION).as_bytes());
    out.extend_from_slice(format!("#fingerprint {}\n", FINGERPRINT_ALGORITHM).as_bytes());
    out.extend_from_slice(format!("#config {}\n", header.config).as_bytes());
    out.extend_from_slice(format!("#files {}\n", entries.len()).as_bytes());
    out.push(0);

    for e in entries {
        push_field(&mut out, e.path.un_root().as_str());
        push_field(&mut out, &e.link);
        push_field(&mut out, &kind_letter(&e.stat).to_string());
        push_field(&mut out, if e.is_hardlink { "1" } else { "0" });
        push_field(&mut out, &format!("{:o}", e.stat.mode));
        push_field(&mut out, &e.stat.uid.to_string());
        push_field(&mut out, &e.stat.gid.to_string());
        push_field(&mut out, &e.stat.size.to_string());
        push_field(&mut out, &e.stat.mtime.secs.to_string());
        push_field(&mut out, &e.stat.mtime.nanos.to_string());
        push_field(&mut out, &e.offset.to_string());
        push_field(&mut out, &e.segment);
        push_field(&mut out, &e.num_parts.to_string());
        push_field(&mut out, &e.part_offset.to_string());
        push_field(&mut out, &e.part_size.to_string());
        push_field(&mut out, &e.last_part_size.to_string());
        push_field(&mut out, &e.disk_part_size.to_string());
        push_field(&mut out, &e.disk_last_part_size.to_string());
    }

    out.extend_from_slice(format!("#tars {}\n", tars.len()).as_bytes());
    out.push(0);
    for t in tars {
        push_field(&mut out, t.backup_location.un_root().as_str());
        push_field(&mut out, t.tarfile_location.un_root().as_str());
        push_field(&mut out, t.first.un_root().as_str());
        push_field(&mut out, t.last.un_root().as_str());
    }
    out
}

struct Scanner<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn line(&mut self) -> Result<&'a str> {
        let rest = &self.data[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| BeakError::parse("index block truncated inside header line"))?;
        self.pos += end + 1;
        Ok(std::str::from_utf8(&rest[..end])?)
    }

    fn field(&mut self) -> Result<&'a str> {
        let rest = &self.data[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| BeakError::parse("index block truncated inside record"))?;
        self.pos += end + 1;
        Ok(std::str::from_utf8(&rest[..end])?)
    }

    fn expect_separator(&mut self) -> Result<()> {
        if self.data.get(self.pos) != Some(&0) {
            return Err(BeakError::parse("missing separator in index block"));
        }
        self.pos += 1;
        Ok(())
    }

    fn numeric<T: std::str::FromStr>(&mut self, what: &str) -> Result<T> {
        let f = self.field()?;
        f.parse()
            .map_err(|_| BeakError::parse(format!("bad {what} field {f:?} in index record")))
    }
}

fn header_count(line: &str, tag: &str) -> Result<usize> {
    let rest = line
        .strip_prefix(tag)
        .ok_or_else(|| BeakError::parse(format!("expected {tag:?} line, got {line:?}")))?;
    rest.trim()
        .parse()
        .map_err(|_| BeakError::parse(format!("bad count in {line:?}")))
}

/// Parse a gzip-compressed index block
///
/// Entry paths are prepended with `dir_to_prepend` (origin side); tar
/// locations with `safedir_to_prepend` (storage side). The whole block is
/// validated before the first callback fires, so a malformed record leaves
/// the caller with no partial state.
pub fn load_index(
    bytes: &[u8],
    dir_to_prepend: &TreePath,
    safedir_to_prepend: &TreePath,
    mut on_entry: impl FnMut(IndexEntry),
    mut on_tar: impl FnMut(IndexTar),
) -> Result<()> {
    let mut decoder = GzDecoder::new(bytes);
    let mut text = Vec::new();
    decoder
        .read_to_end(&mut text)
        .map_err(|e| BeakError::parse(format!("index block is not valid gzip: {e}")))?;

    let mut s = Scanner {
        data: &text,
        pos: 0,
    };

    let version = s.line()?;
    if version != format!("#beak {INDEX_VERSION}") {
        return Err(BeakError::parse(format!(
            "unknown index version line {version:?}"
        )));
    }
    let fingerprint = s.line()?;
    match fingerprint.strip_prefix("#fingerprint ") {
        Some(FINGERPRINT_ALGORITHM) => {}
        Some(other) => {
            return Err(BeakError::unsupported(format!(
                "index fingerprint algorithm {other:?}"
            )))
        }
        None => {
            return Err(BeakError::parse(format!(
                "expected \"#fingerprint\" line, got {fingerprint:?}"
            )))
        }
    }
    let config_line = s.line()?;
    if !config_line.starts_with("#config ") {
        return Err(BeakError::parse(format!(
            "expected \"#config\" line, got {config_line:?}"
        )));
    }
    let num_files = header_count(s.line()?, "#files")?;
    s.expect_separator()?;

    let mut entries = Vec::with_capacity(num_files);
    for _ in 0..num_files {
        let path = TreePath::lookup(s.field()?).prepend(dir_to_prepend);
        let link = s.field()?.to_string();
        let kind = kind_from_letter(s.field()?)?;
        let is_hardlink = s.field()? == "1";
        let mode_field = s.field()?;
        let mode = u32::from_str_radix(mode_field, 8)
            .map_err(|_| BeakError::parse(format!("bad mode field {mode_field:?}")))?;
        let uid: u32 = s.numeric("uid")?;
        let gid: u32 = s.numeric("gid")?;
        let size: u64 = s.numeric("size")?;
        let mtime_s: i64 = s.numeric("mtime seconds")?;
        let mtime_ns: u32 = s.numeric("mtime nanos")?;
        let offset: u64 = s.numeric("offset")?;
        let segment = s.field()?.to_string();
        if !segment.is_empty() {
            // Fail fast on references that could never resolve.
            SegmentName::parse(&segment)?;
        }
        let num_parts: u32 = s.numeric("part count")?;
        if num_parts == 0 {
            return Err(BeakError::parse("index record with zero parts"));
        }
        let part_offset: u64 = s.numeric("part offset")?;
        let part_size: u64 = s.numeric("part size")?;
        let last_part_size: u64 = s.numeric("last part size")?;
        let disk_part_size: u64 = s.numeric("disk part size")?;
        let disk_last_part_size: u64 = s.numeric("disk last part size")?;

        let is_symlink = kind == FileKind::Symlink;
        let stat = FileStat {
            kind,
            mode,
            uid,
            gid,
            owner: String::new(),
            group: String::new(),
            size,
            mtime: Timespec::new(mtime_s, mtime_ns),
            link: if link.is_empty() {
                None
            } else {
                Some(link.clone())
            },
            hard_link: is_hardlink,
            disk_update: Default::default(),
        };
        entries.push(IndexEntry {
            stat,
            path,
            link,
            is_symlink,
            is_hardlink,
            segment,
            offset,
            num_parts,
            part_offset,
            part_size,
            last_part_size,
            disk_part_size,
            disk_last_part_size,
        });
    }

    let num_tars = header_count(s.line()?, "#tars")?;
    s.expect_separator()?;
    let mut tars = Vec::with_capacity(num_tars);
    for _ in 0..num_tars {
        let backup_location = TreePath::lookup(s.field()?).prepend(safedir_to_prepend);
        let tarfile_location = TreePath::lookup(s.field()?).prepend(safedir_to_prepend);
        SegmentName::parse(tarfile_location.name())?;
        let first = TreePath::lookup(s.field()?).prepend(dir_to_prepend);
        let last = TreePath::lookup(s.field()?).prepend(dir_to_prepend);
        tars.push(IndexTar {
            backup_location,
            tarfile_location,
            first,
            last,
        });
    }

    trace!(
        entries = entries.len(),
        tars = tars.len(),
        "index block parsed"
    );
    for e in entries {
        on_entry(e);
    }
    for t in tars {
        on_tar(t);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(seed: u8) -> String {
        format!("{:02x}", seed).repeat(32)
    }

    fn sample_entry(name: &str, segment: &str) -> IndexEntry {
        IndexEntry {
            stat: FileStat::regular(10, 0o644, Timespec::new(1000, 500)),
            path: TreePath::lookup(name),
            link: String::new(),
            is_symlink: false,
            is_hardlink: false,
            segment: segment.to_string(),
            offset: 512,
            num_parts: 1,
            part_offset: 0,
            part_size: 10,
            last_part_size: 10,
            disk_part_size: 2048,
            disk_last_part_size: 2048,
        }
    }

    #[test]
    fn test_round_trip() {
        let seg = SegmentName::payload(Timespec::new(1000, 500), 2048, fp(0xaa), 0).to_string();
        let entries = vec![sample_entry("hello.txt", &seg)];
        let tars = vec![IndexTar {
            backup_location: TreePath::lookup("sub"),
            tarfile_location: TreePath::lookup("sub").join(
                &SegmentName::index(Timespec::new(1000, 0), fp(0xbb)).to_string(),
            ),
            first: TreePath::lookup("sub/a"),
            last: TreePath::lookup("sub/z"),
        }];
        let header = IndexHeader {
            config: "-ta 100000000".to_string(),
        };
        let bytes = write_index(&header, &entries, &tars).unwrap();

        let dir = TreePath::root();
        let mut got_entries = Vec::new();
        let mut got_tars = Vec::new();
        load_index(
            &bytes,
            &dir,
            &dir,
            |e| got_entries.push(e),
            |t| got_tars.push(t),
        )
        .unwrap();

        assert_eq!(got_entries.len(), 1);
        let e = &got_entries[0];
        assert_eq!(e.path.as_str(), "/hello.txt");
        assert_eq!(e.segment, seg);
        assert_eq!(e.stat.size, 10);
        assert_eq!(e.stat.mtime, Timespec::new(1000, 500));
        assert_eq!(e.offset, 512);

        assert_eq!(got_tars.len(), 1);
        assert_eq!(got_tars[0].backup_location.as_str(), "/sub");
        assert_eq!(got_tars[0].first.as_str(), "/sub/a");
    }

    #[test]
    fn test_prefixes_applied() {
        let seg = SegmentName::payload(Timespec::new(1, 0), 1024, fp(1), 0).to_string();
        let entries = vec![sample_entry("f", &seg)];
        let bytes = write_index(&IndexHeader::default(), &entries, &[]).unwrap();

        let origin = TreePath::lookup("/snapshots/@0");
        let storage = TreePath::lookup("/cache/store");
        let mut seen = Vec::new();
        load_index(&bytes, &origin, &storage, |e| seen.push(e), |_| {}).unwrap();
        assert_eq!(seen[0].path.as_str(), "/snapshots/@0/f");
    }

    #[test]
    fn test_malformed_record_fails_without_callbacks() {
        let seg = SegmentName::payload(Timespec::new(1, 0), 1024, fp(1), 0).to_string();
        let entries = vec![sample_entry("a", &seg), sample_entry("b", &seg)];
        let text = render_index(&IndexHeader::default(), &entries, &[]);
        // Corrupt the block but keep it valid gzip.
        let cut = text.len() - 20;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&text[..cut]).unwrap();
        let bytes = encoder.finish().unwrap();

        let dir = TreePath::root();
        let calls = std::cell::Cell::new(0usize);
        let rc = load_index(
            &bytes,
            &dir,
            &dir,
            |_| calls.set(calls.get() + 1),
            |_| calls.set(calls.get() + 1),
        );
        assert!(rc.is_err());
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_content_and_disk_size_accessors() {
        let mut e = sample_entry("big", "");
        e.num_parts = 3;
        e.part_size = 100;
        e.last_part_size = 40;
        e.disk_part_size = 1536;
        e.disk_last_part_size = 1024;
        assert_eq!(e.content_size(0), 100);
        assert_eq!(e.content_size(2), 40);
        assert_eq!(e.disk_size(1), 1536);
        assert_eq!(e.disk_size(2), 1024);
    }

    #[test]
    fn test_not_gzip_rejected() {
        let dir = TreePath::root();
        assert!(load_index(b"plainly not gzip", &dir, &dir, |_| {}, |_| {}).is_err());
    }
}
