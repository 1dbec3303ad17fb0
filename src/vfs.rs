//! Forward virtual file system
//!
//! Serves the packer's synthetic segment tree through the four FUSE-style
//! callbacks without ever materializing a tar file. `read` walks the
//! segment's logical byte layout (header blocks, 512-padded payloads,
//! trailing zero blocks) and generates exactly the requested slice: header
//! bytes come precomputed from the packer, payload bytes are read straight
//! out of the origin file. Reads are stateless and idempotent; the same
//! `(path, offset, size)` always yields the same bytes.

use crate::error::{BeakError, Result};
use crate::pack::{Segment, SegmentContent, SegmentTree};
use crate::path::TreePath;
use crate::types::FileStat;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, trace};

/// The four read-only callbacks a mount layer drives
///
/// `open` is intentionally absent: it is a no-op returning success on both
/// mount directions.
pub trait FuseOps: Send + Sync {
    /// Stat a path, `NotFound` maps to ENOENT
    fn getattr(&self, path: &TreePath) -> Result<FileStat>;
    /// List the names inside a directory
    fn readdir(&self, path: &TreePath) -> Result<Vec<String>>;
    /// Read a byte slice out of a file
    fn read(&self, path: &TreePath, offset: u64, size: usize) -> Result<Vec<u8>>;
    /// Resolve a symlink
    fn readlink(&self, path: &TreePath) -> Result<String>;
}

/// Read-only view of a packed segment tree
pub struct ForwardFs {
    tree: SegmentTree,
}

impl ForwardFs {
    /// Wrap a fully assembled tree
    ///
    /// The tree is immutable from here on, which is what makes `read`
    /// reentrant without any locking.
    pub fn new(tree: SegmentTree) -> Self {
        ForwardFs { tree }
    }

    /// The underlying tree
    pub fn tree(&self) -> &SegmentTree {
        &self.tree
    }

    /// Materialize every segment under `dest` by driving `read`
    ///
    /// This is the local store operation: the same code path a mount
    /// consumer would exercise, so what lands on disk is bit-identical to
    /// what a reader of the virtual tree sees.
    pub fn store_to(&self, dest: &Path) -> Result<usize> {
        let mut written = 0usize;
        // Deepest directories first: an index never lands before the
        // payload segments and child indexes it references.
        for dir in self.tree.dirs().rev() {
            let dir_dest = join_under(dest, &dir.path);
            std::fs::create_dir_all(&dir_dest)?;
            for segment in &dir.segments {
                let target = dir_dest.join(segment.name.to_string());
                let mut out = std::fs::File::create(&target)?;
                let mut offset = 0u64;
                while offset < segment.size {
                    let chunk = read_segment(segment, offset, 1 << 20)?;
                    if chunk.is_empty() {
                        break;
                    }
                    out.write_all(&chunk)?;
                    offset += chunk.len() as u64;
                }
                written += 1;
                debug!("stored {}", target.display());
            }
        }
        Ok(written)
    }
}

fn join_under(dest: &Path, dir: &TreePath) -> std::path::PathBuf {
    let mut out = dest.to_path_buf();
    for c in dir.components() {
        out.push(c);
    }
    out
}

impl FuseOps for ForwardFs {
    fn getattr(&self, path: &TreePath) -> Result<FileStat> {
        if let Some(dir) = self.tree.dir(path) {
            return Ok(FileStat::directory(0o500, dir.stat.mtime));
        }
        if let Some(segment) = self.tree.segment(path) {
            return Ok(FileStat::regular(segment.size, 0o444, segment.mtime));
        }
        Err(BeakError::not_found(format!("{path}")))
    }

    fn readdir(&self, path: &TreePath) -> Result<Vec<String>> {
        let dir = self
            .tree
            .dir(path)
            .ok_or_else(|| BeakError::not_found(format!("{path}")))?;
        let mut names: Vec<String> = dir.subdirs.iter().map(|d| d.name().to_string()).collect();
        names.extend(dir.segments.iter().map(|s| s.name.to_string()));
        Ok(names)
    }

    fn read(&self, path: &TreePath, offset: u64, size: usize) -> Result<Vec<u8>> {
        let segment = self
            .tree
            .segment(path)
            .ok_or_else(|| BeakError::not_found(format!("{path}")))?;
        trace!(%path, offset, size, "forward read");
        read_segment(segment, offset, size)
    }

    fn readlink(&self, path: &TreePath) -> Result<String> {
        // Segments are regular files; nothing in the forward tree links.
        Err(BeakError::not_found(format!("{path}")))
    }
}

/// Synthesize `[offset, offset+size)` of a segment's byte stream
pub fn read_segment(segment: &Segment, offset: u64, size: usize) -> Result<Vec<u8>> {
    if offset >= segment.size {
        return Ok(Vec::new());
    }
    let len = size.min((segment.size - offset) as usize);
    let mut buf = vec![0u8; len];
    let end = offset + len as u64;

    match &segment.content {
        SegmentContent::Bytes(bytes) => {
            buf.copy_from_slice(&bytes[offset as usize..end as usize]);
        }
        SegmentContent::Members(members) => {
            for member in members {
                // Header region.
                copy_overlap(
                    &mut buf,
                    offset,
                    member.offset,
                    &member.header,
                );
                // Payload region: real content then zero padding, which the
                // pre-zeroed buffer already provides.
                let content_start = member.content_offset();
                let content_end = content_start + member.content_len;
                let lo = offset.max(content_start);
                let hi = end.min(content_end);
                if lo < hi {
                    let mut file = File::open(&member.origin_path)?;
                    file.seek(SeekFrom::Start(
                        member.content_origin_offset + (lo - content_start),
                    ))?;
                    let dst = &mut buf[(lo - offset) as usize..(hi - offset) as usize];
                    file.read_exact(dst).map_err(|e| {
                        BeakError::integrity(format!(
                            "{} changed under the packer: {e}",
                            member.origin_path.display()
                        ))
                    })?;
                }
                if member.end_offset() >= end {
                    break;
                }
            }
            // Trailing zero blocks are already zeros in the buffer.
        }
    }
    Ok(buf)
}

/// Copy the intersection of `data` (placed at `data_offset`) into `buf`
/// (which represents the stream from `buf_offset`)
fn copy_overlap(buf: &mut [u8], buf_offset: u64, data_offset: u64, data: &[u8]) {
    let buf_end = buf_offset + buf.len() as u64;
    let data_end = data_offset + data.len() as u64;
    let lo = buf_offset.max(data_offset);
    let hi = buf_end.min(data_end);
    if lo >= hi {
        return;
    }
    buf[(lo - buf_offset) as usize..(hi - buf_offset) as usize]
        .copy_from_slice(&data[(lo - data_offset) as usize..(hi - data_offset) as usize]);
}
