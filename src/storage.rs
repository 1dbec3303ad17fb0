//! Storage synchronization: list, push and fetch over a generic remote
//!
//! Three backends share one contract. The local backend talks to the file
//! system directly; the rsync-like and rclone-like backends shell out to
//! the external tool and parse its listing output line by line. The
//! adapter never opens segment content; files are opaque blobs, and
//! deduplication rests entirely on segment-name equality.
//!
//! A listed file is *good* iff its name decodes to a valid [`SegmentName`]
//! and the size field matches what the name promises; a decodable name
//! with the wrong size is *bad* (a half-written transfer, detected and
//! re-pushed on the next run); everything else is *other* and ignored.

use crate::error::{BeakError, Result};
use crate::naming::{SegmentKind, SegmentName};
use crate::path::TreePath;
use crate::types::FileStat;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Closed set of storage backends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// A directory on the local file system
    Local,
    /// An rsync-style tool (listing via `--list-only`)
    RsyncLike {
        /// Executable to invoke
        tool: String,
    },
    /// An rclone-style tool (listing via `ls`, filtering via
    /// `--include-from`)
    RcloneLike {
        /// Executable to invoke
        tool: String,
    },
    /// Placeholder for an unresolved storage reference
    NoSuch,
}

/// One configured storage target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Storage {
    /// Backend flavor
    pub backend: StorageBackend,
    /// Directory path or remote URL
    pub location: String,
}

impl Storage {
    /// A local-directory storage
    pub fn local(path: impl Into<String>) -> Self {
        Storage {
            backend: StorageBackend::Local,
            location: path.into(),
        }
    }

    /// An rclone-class storage
    pub fn rclone(location: impl Into<String>) -> Self {
        Storage {
            backend: StorageBackend::RcloneLike {
                tool: "rclone".to_string(),
            },
            location: location.into(),
        }
    }

    /// An rsync-class storage
    pub fn rsync(location: impl Into<String>) -> Self {
        Storage {
            backend: StorageBackend::RsyncLike {
                tool: "rsync".to_string(),
            },
            location: location.into(),
        }
    }

    /// Cache-directory name for this storage: the URL with every byte
    /// outside `[A-Za-z0-9._-]` replaced by `_`
    pub fn sanitized_name(&self) -> String {
        self.location
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

/// One classified file from a storage listing
#[derive(Debug, Clone)]
pub struct ListedSegment {
    /// Path relative to the storage root (rooted form)
    pub path: TreePath,
    /// Decoded name
    pub name: SegmentName,
    /// Size reported by the listing
    pub size: u64,
}

/// Result of listing a storage
#[derive(Debug, Default)]
pub struct Listing {
    /// Valid segments whose sizes check out
    pub good: Vec<ListedSegment>,
    /// Valid names with mismatched sizes; re-push candidates
    pub bad: Vec<ListedSegment>,
    /// Files that are not segments at all
    pub other: Vec<String>,
    /// Stat map of the good files, keyed by relative path
    pub contents: BTreeMap<TreePath, FileStat>,
}

impl Listing {
    fn classify(&mut self, rel_path: &str, size: u64) {
        let path = TreePath::lookup(rel_path);
        let name = match SegmentName::parse(path.name()) {
            Ok(n) => n,
            Err(_) => {
                self.other.push(rel_path.to_string());
                return;
            }
        };
        let listed = ListedSegment {
            path: path.clone(),
            name: name.clone(),
            size,
        };
        if name.matches_listing(size) {
            let stat = FileStat::regular(size, 0o444, name.time);
            self.contents.insert(path, stat);
            self.good.push(listed);
        } else {
            warn!(
                "size mismatch for {}: listed {}, name says {}",
                rel_path, size, name.size
            );
            self.bad.push(listed);
        }
    }
}

/// List a storage and classify every file
pub fn list(storage: &Storage) -> Result<Listing> {
    match &storage.backend {
        StorageBackend::Local => list_local(Path::new(&storage.location)),
        StorageBackend::RcloneLike { tool } => {
            let out = run_tool(tool, &["ls", &storage.location], &mut |_| {})?;
            parse_rclone_listing(&out)
        }
        StorageBackend::RsyncLike { tool } => {
            let out = run_tool(tool, &["--list-only", "-r", &storage.location], &mut |_| {})?;
            parse_rsync_listing(&out)
        }
        StorageBackend::NoSuch => Err(BeakError::not_found(format!(
            "storage {:?}",
            storage.location
        ))),
    }
}

fn list_local(root: &Path) -> Result<Listing> {
    let mut listing = Listing::default();
    if !root.exists() {
        return Ok(listing);
    }
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| BeakError::parse("listing entry outside the storage root"))?;
        let size = entry.metadata()?.len();
        listing.classify(&rel.to_string_lossy(), size);
    }
    Ok(listing)
}

/// Parse `rclone ls` output: `<size> <path>` per line
fn parse_rclone_listing(out: &[u8]) -> Result<Listing> {
    let mut listing = Listing::default();
    for line in out.split(|&b| b == b'\n') {
        let line = std::str::from_utf8(line)?.trim();
        if line.is_empty() {
            continue;
        }
        let (size, rest) = line
            .split_once(' ')
            .ok_or_else(|| BeakError::parse(format!("bad listing line {line:?}")))?;
        let size: u64 = size
            .parse()
            .map_err(|_| BeakError::parse(format!("bad size in listing line {line:?}")))?;
        listing.classify(rest.trim_start(), size);
    }
    Ok(listing)
}

/// Parse `rsync --list-only` output:
/// `-rw-rw-r-- 15,920 2018/05/26 08:43:32 <path>` per line
fn parse_rsync_listing(out: &[u8]) -> Result<Listing> {
    let mut listing = Listing::default();
    for line in out.split(|&b| b == b'\n') {
        let line = std::str::from_utf8(line)?.trim_end();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let perms = match fields.next() {
            Some(p) => p,
            None => continue,
        };
        if perms.starts_with('d') {
            continue;
        }
        let size = match fields.next() {
            Some(s) => s.replace(',', ""),
            None => continue,
        };
        let size: u64 = match size.parse() {
            Ok(s) => s,
            Err(_) => continue,
        };
        // Date and time fields.
        let (Some(_), Some(_)) = (fields.next(), fields.next()) else {
            continue;
        };
        let path = fields.collect::<Vec<_>>().join(" ");
        if path.is_empty() || path == "." {
            continue;
        }
        listing.classify(&path, size);
    }
    Ok(listing)
}

/// Transfer segments from `local_dir` up to `storage`
///
/// With `files` only those relative paths move, otherwise everything under
/// `local_dir`. Payload segments always travel before index segments so a
/// reader listing the storage never observes an index whose references
/// dangle. `on_copied` fires once per confirmed file.
pub fn push(
    local_dir: &Path,
    storage: &Storage,
    files: Option<&[TreePath]>,
    on_copied: &mut dyn FnMut(&str),
) -> Result<()> {
    let all;
    let files = match files {
        Some(f) => f,
        None => {
            all = enumerate_segments(local_dir)?;
            &all[..]
        }
    };
    let (payloads, indexes) = split_by_kind(files);
    info!(
        payloads = payloads.len(),
        indexes = indexes.len(),
        "pushing to {}",
        storage.location
    );

    match &storage.backend {
        StorageBackend::Local => {
            for phase in [&payloads, &indexes] {
                for file in phase.iter() {
                    let rel = file.un_root();
                    let src = local_dir.join(rel.as_str());
                    let dst = Path::new(&storage.location).join(rel.as_str());
                    if let Some(parent) = dst.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::copy(&src, &dst)?;
                    on_copied(rel.as_str());
                }
            }
            Ok(())
        }
        StorageBackend::RcloneLike { tool } => {
            for phase in [&payloads, &indexes] {
                if phase.is_empty() {
                    continue;
                }
                copy_rclone(
                    tool,
                    &local_dir.to_string_lossy(),
                    &storage.location,
                    Some(phase.as_slice()),
                    on_copied,
                )?;
            }
            Ok(())
        }
        StorageBackend::RsyncLike { tool } => {
            let out = run_tool(
                tool,
                &["-a", &format!("{}/", local_dir.display()), &storage.location],
                &mut |_| {},
            );
            out.map(|_| ())
        }
        StorageBackend::NoSuch => Err(BeakError::not_found(format!(
            "storage {:?}",
            storage.location
        ))),
    }
}

/// Transfer `files` from `storage` down into `local_dir`
pub fn fetch(storage: &Storage, files: &[TreePath], local_dir: &Path) -> Result<()> {
    debug!(count = files.len(), "fetching from {}", storage.location);
    match &storage.backend {
        StorageBackend::Local => {
            for file in files {
                let rel = file.un_root();
                let src = Path::new(&storage.location).join(rel.as_str());
                let dst = local_dir.join(rel.as_str());
                if let Some(parent) = dst.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(&src, &dst)?;
            }
            Ok(())
        }
        StorageBackend::RcloneLike { tool } => copy_rclone(
            tool,
            &storage.location,
            &local_dir.to_string_lossy(),
            Some(files),
            &mut |_| {},
        ),
        StorageBackend::RsyncLike { tool } => {
            for file in files {
                let rel = file.un_root();
                let src = format!("{}/{}", storage.location, rel.as_str());
                let dst = local_dir.join(rel.as_str());
                if let Some(parent) = dst.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                run_tool(tool, &["-a", &src, &dst.to_string_lossy()], &mut |_| {})?;
            }
            Ok(())
        }
        StorageBackend::NoSuch => Err(BeakError::not_found(format!(
            "storage {:?}",
            storage.location
        ))),
    }
}

/// Outcome of a deduplicating push
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    /// Segments transferred
    pub pushed: usize,
    /// Segments already present and intact on the remote
    pub skipped: usize,
}

/// Push only what the remote is missing
///
/// Lists the remote, then transfers the local segments whose names are
/// absent or listed as bad (size mismatch, i.e. an interrupted transfer).
/// Identical subtrees produce identical segment names, so an unchanged
/// remote costs one listing and zero transfers.
pub fn sync(
    local_dir: &Path,
    storage: &Storage,
    on_copied: &mut dyn FnMut(&str),
) -> Result<SyncStats> {
    let remote = list(storage)?;
    let present: std::collections::BTreeSet<&TreePath> =
        remote.good.iter().map(|s| &s.path).collect();

    let local = list_local(local_dir)?;
    let mut to_push = Vec::new();
    let mut stats = SyncStats::default();
    for seg in &local.good {
        if present.contains(&seg.path) {
            stats.skipped += 1;
        } else {
            to_push.push(seg.path.clone());
        }
    }
    stats.pushed = to_push.len();
    if !to_push.is_empty() {
        push(local_dir, storage, Some(&to_push[..]), on_copied)?;
    }
    info!(pushed = stats.pushed, skipped = stats.skipped, "sync done");
    Ok(stats)
}

fn enumerate_segments(local_dir: &Path) -> Result<Vec<TreePath>> {
    let listing = list_local(local_dir)?;
    Ok(listing.good.into_iter().map(|s| s.path).collect())
}

fn split_by_kind(files: &[TreePath]) -> (Vec<TreePath>, Vec<TreePath>) {
    let mut payloads = Vec::new();
    let mut indexes = Vec::new();
    for f in files {
        match SegmentName::parse(f.name()) {
            Ok(n) if n.kind == SegmentKind::Index => indexes.push(f.clone()),
            _ => payloads.push(f.clone()),
        }
    }
    (payloads, indexes)
}

fn copy_rclone(
    tool: &str,
    from: &str,
    to: &str,
    files: Option<&[TreePath]>,
    on_copied: &mut dyn FnMut(&str),
) -> Result<()> {
    let mut include_file = None;
    let mut args: Vec<String> = vec!["copy".to_string(), "-v".to_string()];
    if let Some(files) = files {
        let mut tmp = tempfile::NamedTempFile::new()?;
        for f in files {
            writeln!(tmp, "{}", f.un_root().as_str())?;
        }
        tmp.flush()?;
        args.push("--include-from".to_string());
        args.push(tmp.path().to_string_lossy().into_owned());
        include_file = Some(tmp);
    }
    args.push(from.to_string());
    args.push(to.to_string());

    let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
    run_tool(tool, &arg_refs, &mut |line| {
        if let Some(path) = parse_copied_line(line) {
            on_copied(path);
        }
    })?;
    drop(include_file);
    Ok(())
}

/// Pull the copied path out of one verbose transfer line
///
/// Example: `2018/01/29 20:05:36 INFO  : src/s_15..._0.tar: Copied (new)`.
/// The path sits between the last `" : "` after the timestamp and the
/// `":"` preceding the status word.
pub fn parse_copied_line(line: &str) -> Option<&str> {
    if !line.contains("Copied") {
        return None;
    }
    let bytes = line.as_bytes();
    let mut from = None;
    for i in 1..bytes.len().saturating_sub(1) {
        if bytes[i - 1] == b' ' && bytes[i] == b':' && bytes[i + 1] == b' ' {
            from = Some(i + 2);
        }
    }
    let from = from?;
    let mut to = None;
    for i in (from..bytes.len().saturating_sub(1)).rev() {
        if bytes[i] == b':' && bytes[i + 1] == b' ' {
            to = Some(i);
            break;
        }
    }
    let to = to?;
    if to <= from {
        return None;
    }
    Some(&line[from..to])
}

/// Run an external tool, feeding every output line (stdout and stderr) to
/// `on_line`, returning captured stdout
///
/// No retries and no timeouts live here; both are caller policy.
fn run_tool(tool: &str, args: &[&str], on_line: &mut dyn FnMut(&str)) -> Result<Vec<u8>> {
    debug!("invoking {} {}", tool, args.join(" "));
    let mut child = Command::new(tool)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| BeakError::subprocess(tool, format!("failed to start: {e}")))?;

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    let mut captured = Vec::new();
    let mut stderr_tail = String::new();
    std::thread::scope(|scope| -> Result<()> {
        let err_lines = scope.spawn(move || {
            let mut lines = Vec::new();
            for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                lines.push(line);
            }
            lines
        });
        for line in BufReader::new(stdout).lines() {
            let line = line?;
            on_line(&line);
            captured.extend_from_slice(line.as_bytes());
            captured.push(b'\n');
        }
        for line in err_lines.join().unwrap_or_default() {
            on_line(&line);
            stderr_tail = line;
        }
        Ok(())
    })?;

    let status = child
        .wait()
        .map_err(|e| BeakError::subprocess(tool, e.to_string()))?;
    if !status.success() {
        let detail = match status.code() {
            Some(code) if !stderr_tail.is_empty() => {
                format!("status code {code} - {stderr_tail}")
            }
            Some(code) => format!("status code {code}"),
            None => "terminated by signal".to_string(),
        };
        return Err(BeakError::subprocess(tool, detail));
    }
    Ok(captured)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timespec;
    use std::fs;
    use tempfile::TempDir;

    fn fp(seed: u8) -> String {
        format!("{:02x}", seed).repeat(32)
    }

    fn payload_name(size: u64) -> String {
        SegmentName::payload(Timespec::new(100, 5), size, fp(0xcd), 0).to_string()
    }

    #[test]
    fn test_local_list_classifies() {
        let dir = TempDir::new().unwrap();
        let good = payload_name(4);
        fs::write(dir.path().join(&good), b"tarr").unwrap();
        let bad = SegmentName::payload(Timespec::new(1, 1), 9999, fp(0xee), 0).to_string();
        fs::write(dir.path().join(&bad), b"short").unwrap();
        fs::write(dir.path().join("README"), b"hello").unwrap();

        let listing = list(&Storage::local(dir.path().to_string_lossy())).unwrap();
        assert_eq!(listing.good.len(), 1);
        assert_eq!(listing.good[0].name.to_string(), good);
        assert_eq!(listing.bad.len(), 1);
        assert_eq!(listing.other, vec!["README".to_string()]);
        assert_eq!(listing.contents.len(), 1);
    }

    #[test]
    fn test_index_size_is_unconstrained() {
        let dir = TempDir::new().unwrap();
        let z = SegmentName::index(Timespec::new(7, 7), fp(0x11)).to_string();
        fs::write(dir.path().join(&z), vec![0u8; 12288]).unwrap();
        let listing = list(&Storage::local(dir.path().to_string_lossy())).unwrap();
        assert_eq!(listing.good.len(), 1);
        assert!(listing.bad.is_empty());
    }

    #[test]
    fn test_rclone_listing_parser() {
        let out =
            format!("    12288 sub/{}\n 17 not-a-segment.txt\n", payload_name(12288));
        let listing = parse_rclone_listing(out.as_bytes()).unwrap();
        assert_eq!(listing.good.len(), 1);
        assert_eq!(listing.good[0].path.as_str(), format!("/sub/{}", payload_name(12288)));
        assert_eq!(listing.other, vec!["not-a-segment.txt".to_string()]);
    }

    #[test]
    fn test_rsync_listing_parser() {
        let out = format!(
            "drwxrwxr-x          4,096 2018/05/26 08:43:31 .\n\
             -rw-rw-r--         15,920 2018/05/26 08:43:32 {}\n",
            payload_name(15920)
        );
        let listing = parse_rsync_listing(out.as_bytes()).unwrap();
        assert_eq!(listing.good.len(), 1);
        assert_eq!(listing.good[0].size, 15920);
    }

    #[test]
    fn test_copied_line_scraper() {
        let name = payload_name(11659264);
        let line = format!("2018/01/29 20:05:36 INFO  : code/src/{name}: Copied (new)");
        assert_eq!(parse_copied_line(&line), Some(format!("code/src/{name}").as_str()));
        assert_eq!(parse_copied_line("2018/01/29 plain noise"), None);
    }

    #[test]
    fn test_copied_line_scraper_takes_last_separator() {
        // Some tools prefix the level with extra ` : `-separated fields;
        // the path starts after the last one.
        let name = payload_name(4096);
        let line = format!("2018/01/29 20:05:36 INFO : attempt 2 : code/src/{name}: Copied (replaced)");
        assert_eq!(parse_copied_line(&line), Some(format!("code/src/{name}").as_str()));
    }

    #[test]
    fn test_local_push_orders_indexes_last() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let p = payload_name(3);
        let z = SegmentName::index(Timespec::new(9, 9), fp(0x22)).to_string();
        fs::write(src.path().join(&p), b"tar").unwrap();
        fs::write(src.path().join(&z), b"gz data").unwrap();

        let mut order = Vec::new();
        push(
            src.path(),
            &Storage::local(dst.path().to_string_lossy()),
            None,
            &mut |f| order.push(f.to_string()),
        )
        .unwrap();
        assert_eq!(order, vec![p.clone(), z.clone()]);
        assert!(dst.path().join(&p).exists());
        assert!(dst.path().join(&z).exists());
    }

    #[test]
    fn test_local_fetch() {
        let remote = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        let p = payload_name(3);
        fs::create_dir(remote.path().join("sub")).unwrap();
        fs::write(remote.path().join("sub").join(&p), b"tar").unwrap();

        let storage = Storage::local(remote.path().to_string_lossy());
        fetch(
            &storage,
            &[TreePath::lookup(&format!("/sub/{p}"))],
            local.path(),
        )
        .unwrap();
        assert_eq!(fs::read(local.path().join("sub").join(&p)).unwrap(), b"tar");
    }

    #[test]
    fn test_missing_tool_is_subprocess_error() {
        let storage = Storage {
            backend: StorageBackend::RcloneLike {
                tool: "definitely-not-a-real-tool-xyz".to_string(),
            },
            location: "remote:bucket".to_string(),
        };
        assert!(matches!(
            list(&storage),
            Err(BeakError::Subprocess { .. })
        ));
    }

    #[test]
    fn test_sanitized_name() {
        let s = Storage::rclone("gdrive:backups/tree");
        assert_eq!(s.sanitized_name(), "gdrive_backups_tree");
    }
}
