//! Tar codec: ustar headers plus GNU long-name/long-link extensions
//!
//! Everything here is bit-exact. Blocks are 512 bytes; a member is one or
//! more header blocks followed by its 512-padded payload; a logical stream
//! ends with two zero blocks. The encoder produces output `tar -x` accepts
//! for the supported kinds (regular, symlink, hardlink, directory, char and
//! block device, fifo); the parser is its inverse.
//!
//! Overlong paths and link targets get a GNU pseudo member first: a header
//! block with typeflag `L` (path) or `K` (link) named `././@LongLink`, then
//! the raw string (with terminating NUL) in 512-padded payload blocks, then
//! the real header with the truncated field.

use crate::error::{BeakError, Result};
use crate::types::{FileKind, FileStat, Timespec};

/// Tar block size; all segment offsets are multiples of this
pub const BLOCK_SIZE: u64 = 512;

const NAME_LEN: usize = 100;
const LINK_LEN: usize = 100;
const LONG_LINK_NAME: &[u8] = b"././@LongLink";

const REGTYPE: u8 = b'0';
const LNKTYPE: u8 = b'1';
const SYMTYPE: u8 = b'2';
const CHRTYPE: u8 = b'3';
const BLKTYPE: u8 = b'4';
const DIRTYPE: u8 = b'5';
const FIFOTYPE: u8 = b'6';
const GNU_LONGNAME_TYPE: u8 = b'L';
const GNU_LONGLINK_TYPE: u8 = b'K';

// Field offsets inside the 512-byte header block.
const OFF_NAME: usize = 0;
const OFF_MODE: usize = 100;
const OFF_UID: usize = 108;
const OFF_GID: usize = 116;
const OFF_SIZE: usize = 124;
const OFF_MTIME: usize = 136;
const OFF_CHKSUM: usize = 148;
const OFF_TYPEFLAG: usize = 156;
const OFF_LINKNAME: usize = 157;
const OFF_MAGIC: usize = 257;
const OFF_VERSION: usize = 263;
const OFF_UNAME: usize = 265;
const OFF_GNAME: usize = 297;
const OFF_DEVMAJOR: usize = 329;
const OFF_DEVMINOR: usize = 337;

/// Fixed user/group identifier written into every header
const OWNER_NAME: &[u8] = b"beak";

/// A member header recovered by [`parse_header`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedHeader {
    /// Reconstructed stat (kind, mode, size, whole-second mtime)
    pub stat: FileStat,
    /// Full member path, long-name prologue already applied
    pub path: String,
    /// Full link target, long-link prologue already applied
    pub link: Option<String>,
    /// Typeflag was a hard link
    pub is_hard_link: bool,
    /// Bytes of header blocks consumed, including GNU prologues
    pub header_len: u64,
}

fn round_up(n: u64) -> u64 {
    n.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

/// 512-padded payload length of a member with `content` content bytes
pub fn padded_content_size(content: u64) -> u64 {
    round_up(content)
}

fn long_field_blocks(len: usize) -> u64 {
    // One pseudo header plus the NUL-terminated string, 512 per block.
    2 + (len as u64) / BLOCK_SIZE
}

fn typeflag_for(stat: &FileStat, is_hard_link: bool) -> u8 {
    // A hard link wins over the stat kind; LNKTYPE in tar means hard link,
    // symlinks are SYMTYPE.
    if is_hard_link {
        return LNKTYPE;
    }
    match stat.kind {
        FileKind::Symlink => SYMTYPE,
        FileKind::Regular => REGTYPE,
        FileKind::CharDevice => CHRTYPE,
        FileKind::BlockDevice => BLKTYPE,
        FileKind::Directory => DIRTYPE,
        FileKind::Fifo => FIFOTYPE,
    }
}

fn kind_for(typeflag: u8) -> Result<(FileKind, bool)> {
    match typeflag {
        LNKTYPE => Ok((FileKind::Regular, true)),
        SYMTYPE => Ok((FileKind::Symlink, false)),
        REGTYPE | 0 => Ok((FileKind::Regular, false)),
        CHRTYPE => Ok((FileKind::CharDevice, false)),
        BLKTYPE => Ok((FileKind::BlockDevice, false)),
        DIRTYPE => Ok((FileKind::Directory, false)),
        FIFOTYPE => Ok((FileKind::Fifo, false)),
        other => Err(BeakError::unsupported(format!(
            "tar typeflag '{}'",
            other as char
        ))),
    }
}

fn write_octal(buf: &mut [u8], digits: usize, value: u64) {
    // snprintf style: `digits` zero-padded octal digits plus a NUL.
    let s = format!("{:0width$o}", value, width = digits);
    let b = s.as_bytes();
    let b = &b[b.len() - digits..];
    buf[..digits].copy_from_slice(b);
    buf[digits] = 0;
}

fn write_base_header(block: &mut [u8; 512], stat: &FileStat, typeflag: u8) {
    write_octal(&mut block[OFF_MODE..], 7, stat.mode as u64);
    write_octal(&mut block[OFF_UID..], 7, 0);
    write_octal(&mut block[OFF_GID..], 7, 0);
    let size = if typeflag == REGTYPE { stat.size } else { 0 };
    write_octal(&mut block[OFF_SIZE..], 11, size);
    write_octal(&mut block[OFF_MTIME..], 11, stat.mtime.secs.max(0) as u64);
    block[OFF_TYPEFLAG] = typeflag;
    block[OFF_MAGIC..OFF_MAGIC + 6].copy_from_slice(b"ustar ");
    block[OFF_VERSION] = b' ';
    block[OFF_VERSION + 1] = 0;
    block[OFF_UNAME..OFF_UNAME + OWNER_NAME.len()].copy_from_slice(OWNER_NAME);
    block[OFF_GNAME..OFF_GNAME + OWNER_NAME.len()].copy_from_slice(OWNER_NAME);
    write_octal(&mut block[OFF_DEVMAJOR..], 7, 0);
    write_octal(&mut block[OFF_DEVMINOR..], 7, 0);
}

fn finish_checksum(block: &mut [u8; 512]) {
    block[OFF_CHKSUM..OFF_CHKSUM + 8].fill(b' ');
    let sum: u64 = block.iter().map(|&b| b as u64).sum();
    write_octal(&mut block[OFF_CHKSUM..], 7, sum);
}

fn push_long_field(out: &mut Vec<u8>, base: &[u8; 512], typeflag: u8, value: &str) {
    let mut pseudo = *base;
    pseudo[OFF_NAME..OFF_NAME + NAME_LEN].fill(0);
    pseudo[OFF_NAME..OFF_NAME + LONG_LINK_NAME.len()].copy_from_slice(LONG_LINK_NAME);
    pseudo[OFF_LINKNAME..OFF_LINKNAME + LINK_LEN].fill(0);
    pseudo[OFF_TYPEFLAG] = typeflag;
    write_octal(&mut pseudo[OFF_MTIME..], 11, 0);
    // The payload carries the terminating NUL, like GNU tar.
    write_octal(&mut pseudo[OFF_SIZE..], 11, value.len() as u64 + 1);
    finish_checksum(&mut pseudo);
    out.extend_from_slice(&pseudo);

    let payload_len = round_up(value.len() as u64 + 1) as usize;
    let mut payload = vec![0u8; payload_len];
    payload[..value.len()].copy_from_slice(value.as_bytes());
    out.extend_from_slice(&payload);
}

/// Encode the header blocks for one member
///
/// `path` is the member path as stored (no leading separator); `link` is
/// the symlink or hard link target. When `is_hard_link` the target is
/// stored un-rooted, matching how the packer rewrites in-archive targets.
/// Returns all header blocks: GNU prologues (when needed) then the real
/// header. Content payload is not included.
pub fn encode_header(
    stat: &FileStat,
    path: &str,
    link: Option<&str>,
    is_hard_link: bool,
) -> Vec<u8> {
    let link_text = link.map(|l| {
        if is_hard_link {
            l.trim_start_matches('/').to_string()
        } else {
            l.to_string()
        }
    });

    let typeflag = typeflag_for(stat, is_hard_link);
    let mut real = [0u8; 512];
    write_base_header(&mut real, stat, typeflag);

    let name_fits = path.len() <= NAME_LEN;
    let n = path.len().min(NAME_LEN);
    real[OFF_NAME..OFF_NAME + n].copy_from_slice(&path.as_bytes()[..n]);

    let mut link_fits = true;
    if let Some(ref l) = link_text {
        link_fits = l.len() <= LINK_LEN;
        let n = l.len().min(LINK_LEN);
        real[OFF_LINKNAME..OFF_LINKNAME + n].copy_from_slice(&l.as_bytes()[..n]);
    }

    let mut out = Vec::with_capacity(512);
    if let Some(ref l) = link_text {
        if !link_fits {
            push_long_field(&mut out, &real, GNU_LONGLINK_TYPE, l);
        }
    }
    if !name_fits {
        push_long_field(&mut out, &real, GNU_LONGNAME_TYPE, path);
    }
    finish_checksum(&mut real);
    out.extend_from_slice(&real);
    out
}

/// Total header bytes [`encode_header`] would produce, without building it
///
/// The packer uses this for size planning before any byte is generated.
pub fn header_size(path: &str, link: Option<&str>, is_hard_link: bool) -> u64 {
    let mut blocks = 1u64;
    if path.len() > NAME_LEN {
        blocks += long_field_blocks(path.len());
    }
    if let Some(l) = link {
        let len = if is_hard_link {
            l.trim_start_matches('/').len()
        } else {
            l.len()
        };
        if len > LINK_LEN {
            blocks += long_field_blocks(len);
        }
    }
    blocks * BLOCK_SIZE
}

fn field_str(block: &[u8], off: usize, len: usize) -> Result<&str> {
    let raw = &block[off..off + len];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(len);
    Ok(std::str::from_utf8(&raw[..end])?)
}

fn field_octal(block: &[u8], off: usize, len: usize) -> Result<u64> {
    let s = field_str(block, off, len)?.trim_matches(|c| c == ' ');
    if s.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(s, 8)
        .map_err(|_| BeakError::parse(format!("bad octal field {:?} in tar header", s)))
}

fn verify_checksum(block: &[u8]) -> Result<()> {
    let recorded = field_octal(block, OFF_CHKSUM, 8)?;
    let mut sum: u64 = 0;
    for (i, &b) in block.iter().enumerate() {
        if (OFF_CHKSUM..OFF_CHKSUM + 8).contains(&i) {
            sum += b' ' as u64;
        } else {
            sum += b as u64;
        }
    }
    if sum != recorded {
        return Err(BeakError::integrity(format!(
            "tar header checksum mismatch: recorded {:o}, computed {:o}",
            recorded, sum
        )));
    }
    Ok(())
}

fn is_zero_block(block: &[u8]) -> bool {
    block.iter().all(|&b| b == 0)
}

/// Parse the header blocks at the start of `data`
///
/// Recognizes any sequence of GNU long-name/long-link prologues before the
/// real header and reconstructs the full strings. Returns `None` at a zero
/// (stream-terminator) block. The returned `header_len` counts every block
/// consumed; the member payload follows at that offset.
pub fn parse_header(data: &[u8]) -> Result<Option<ParsedHeader>> {
    let mut off = 0usize;
    let mut long_name: Option<String> = None;
    let mut long_link: Option<String> = None;

    loop {
        if data.len() < off + 512 {
            return Err(BeakError::parse("truncated tar header block"));
        }
        let block = &data[off..off + 512];
        if is_zero_block(block) {
            return Ok(None);
        }
        verify_checksum(block)?;
        let typeflag = block[OFF_TYPEFLAG];

        if typeflag == GNU_LONGNAME_TYPE || typeflag == GNU_LONGLINK_TYPE {
            let len = field_octal(block, OFF_SIZE, 12)? as usize;
            let padded = round_up(len as u64) as usize;
            if data.len() < off + 512 + padded {
                return Err(BeakError::parse("truncated GNU long-name payload"));
            }
            let raw = &data[off + 512..off + 512 + len];
            let end = raw.iter().position(|&b| b == 0).unwrap_or(len);
            let value = std::str::from_utf8(&raw[..end])?.to_string();
            if typeflag == GNU_LONGNAME_TYPE {
                long_name = Some(value);
            } else {
                long_link = Some(value);
            }
            off += 512 + padded;
            continue;
        }

        let (kind, is_hard_link) = kind_for(typeflag)?;
        let path = match long_name {
            Some(n) => n,
            None => field_str(block, OFF_NAME, NAME_LEN)?.to_string(),
        };
        let link = match long_link {
            Some(l) => Some(l),
            None => {
                let l = field_str(block, OFF_LINKNAME, LINK_LEN)?;
                if l.is_empty() {
                    None
                } else {
                    Some(l.to_string())
                }
            }
        };

        let mode = field_octal(block, OFF_MODE, 8)? as u32;
        let size = field_octal(block, OFF_SIZE, 12)?;
        let mtime = field_octal(block, OFF_MTIME, 12)? as i64;

        let stat = FileStat {
            kind,
            mode,
            uid: field_octal(block, OFF_UID, 8)? as u32,
            gid: field_octal(block, OFF_GID, 8)? as u32,
            owner: field_str(block, OFF_UNAME, 32)?.to_string(),
            group: field_str(block, OFF_GNAME, 32)?.to_string(),
            size: if kind == FileKind::Regular && !is_hard_link {
                size
            } else {
                0
            },
            mtime: Timespec::new(mtime, 0),
            link: link.clone(),
            hard_link: is_hard_link,
            disk_update: Default::default(),
        };

        return Ok(Some(ParsedHeader {
            stat,
            path,
            link,
            is_hard_link,
            header_len: (off + 512) as u64,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(size: u64, mode: u32, secs: i64) -> FileStat {
        FileStat::regular(size, mode, Timespec::new(secs, 0))
    }

    #[test]
    fn test_single_block_header() {
        let stat = reg(2, 0o644, 1000);
        let h = encode_header(&stat, "hello.txt", None, false);
        assert_eq!(h.len(), 512);
        assert_eq!(header_size("hello.txt", None, false), 512);
        assert_eq!(h[OFF_TYPEFLAG], b'0');
        assert_eq!(&h[OFF_MAGIC..OFF_MAGIC + 6], b"ustar ");
        assert_eq!(&h[OFF_UNAME..OFF_UNAME + 4], b"beak");
    }

    #[test]
    fn test_checksum_rule() {
        let stat = reg(2, 0o644, 1000);
        let h = encode_header(&stat, "hello.txt", None, false);
        // Recompute with the checksum field as spaces.
        let mut sum = 0u64;
        for (i, &b) in h.iter().enumerate() {
            sum += if (OFF_CHKSUM..OFF_CHKSUM + 8).contains(&i) {
                b' ' as u64
            } else {
                b as u64
            };
        }
        let recorded = field_octal(&h, OFF_CHKSUM, 8).unwrap();
        assert_eq!(sum, recorded);
        verify_checksum(&h).unwrap();
    }

    #[test]
    fn test_round_trip_regular() {
        let stat = reg(1234, 0o755, 99999);
        let h = encode_header(&stat, "a/b/c.bin", None, false);
        let parsed = parse_header(&h).unwrap().unwrap();
        assert_eq!(parsed.path, "a/b/c.bin");
        assert_eq!(parsed.stat.size, 1234);
        assert_eq!(parsed.stat.mode, 0o755);
        assert_eq!(parsed.stat.mtime.secs, 99999);
        assert_eq!(parsed.link, None);
        assert!(!parsed.is_hard_link);
        assert_eq!(parsed.header_len, 512);
    }

    #[test]
    fn test_round_trip_symlink_and_hardlink() {
        let mut stat = FileStat::symlink("target/file", Timespec::new(5, 0));
        let h = encode_header(&stat, "link", Some("target/file"), false);
        let parsed = parse_header(&h).unwrap().unwrap();
        assert_eq!(parsed.stat.kind, FileKind::Symlink);
        assert_eq!(parsed.link.as_deref(), Some("target/file"));

        stat.kind = FileKind::Regular;
        let h = encode_header(&stat, "copy", Some("/kept/original"), true);
        let parsed = parse_header(&h).unwrap().unwrap();
        assert!(parsed.is_hard_link);
        // Hard link targets are stored un-rooted.
        assert_eq!(parsed.link.as_deref(), Some("kept/original"));
    }

    #[test]
    fn test_long_name_layout() {
        let name: String = "d/".repeat(40) + &"x".repeat(70);
        assert!(name.len() > 100);
        let stat = reg(7, 0o600, 42);
        let h = encode_header(&stat, &name, None, false);
        // 'L' pseudo header, one payload block, real header.
        assert_eq!(h.len(), 3 * 512);
        assert_eq!(header_size(&name, None, false), 3 * 512);
        assert_eq!(h[OFF_TYPEFLAG], b'L');
        assert_eq!(&h[OFF_NAME..OFF_NAME + 13], b"././@LongLink");
        // Truncated name in the real header, correct size and typeflag.
        let real = &h[1024..];
        assert_eq!(real[OFF_TYPEFLAG], b'0');
        assert_eq!(field_octal(real, OFF_SIZE, 12).unwrap(), 7);

        let parsed = parse_header(&h).unwrap().unwrap();
        assert_eq!(parsed.path, name);
        assert_eq!(parsed.header_len, 3 * 512);
    }

    #[test]
    fn test_long_name_block_budget() {
        // A path longer than 511 bytes needs a second payload block.
        let name = "n".repeat(600);
        let stat = reg(0, 0o644, 0);
        assert_eq!(header_size(&name, None, false), (1 + 2 + 600 / 512) * 512);
        let h = encode_header(&stat, &name, None, false);
        assert_eq!(h.len() as u64, header_size(&name, None, false));
        let parsed = parse_header(&h).unwrap().unwrap();
        assert_eq!(parsed.path, name);
    }

    #[test]
    fn test_zero_block_terminates() {
        let zeros = [0u8; 1024];
        assert!(parse_header(&zeros).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_checksum_rejected() {
        let stat = reg(2, 0o644, 1000);
        let mut h = encode_header(&stat, "x", None, false);
        h[0] ^= 0xff;
        assert!(matches!(
            parse_header(&h),
            Err(BeakError::Integrity(_))
        ));
    }

    #[test]
    fn test_unknown_typeflag_unsupported() {
        let stat = reg(0, 0o644, 0);
        let mut h = encode_header(&stat, "x", None, false);
        h[OFF_TYPEFLAG] = b'V';
        finish_checksum((&mut h[..512]).try_into().unwrap());
        assert!(matches!(
            parse_header(&h),
            Err(BeakError::Unsupported(_))
        ));
    }
}
