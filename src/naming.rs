//! Segment file names
//!
//! A segment's name carries everything the synchronization layer needs
//! without opening the file:
//!
//! ```text
//! <type>_<secs>.<nanos>_<size>_<fingerprint>_<part>.<ext>
//! s_1501080787.579054757_1119232_3b5e...f3_0.tar     payload
//! z_1506595429.268937346_0_7eb6...b6_0.gz            index
//! ```
//!
//! The encoding is a bijection: `parse(format(n)) == n` for every valid
//! name, and `parse` fails only on structural mismatch. Unknown type
//! letters are rejected. Index names always carry size zero; their on-disk
//! size is unconstrained by the name (the index describes the segments it
//! sits next to, so it cannot contain its own length).

use crate::error::{BeakError, Result};
use crate::types::Timespec;
use std::fmt;

/// Length of the hex fingerprint in every segment name
pub const FINGERPRINT_LEN: usize = 64;

/// What a segment holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    /// Tar member data for a group of origin entries
    Payload,
    /// A textual index listing, gzip compressed
    Index,
}

impl SegmentKind {
    fn letter(self) -> char {
        match self {
            SegmentKind::Payload => 's',
            SegmentKind::Index => 'z',
        }
    }

    fn extension(self) -> &'static str {
        match self {
            SegmentKind::Payload => "tar",
            SegmentKind::Index => "gz",
        }
    }
}

/// Decoded segment file name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentName {
    /// Payload or index
    pub kind: SegmentKind,
    /// Newest mtime covered by the segment
    pub time: Timespec,
    /// Encoded tar length for payload segments, zero for index segments
    pub size: u64,
    /// 64 lowercase hex digits of the content fingerprint
    pub fingerprint: String,
    /// Part number for split files, zero otherwise
    pub part: u32,
}

impl SegmentName {
    /// Name a payload segment
    pub fn payload(time: Timespec, size: u64, fingerprint: String, part: u32) -> Self {
        debug_assert!(is_fingerprint(&fingerprint));
        SegmentName {
            kind: SegmentKind::Payload,
            time,
            size,
            fingerprint,
            part,
        }
    }

    /// Name an index segment (size is always encoded as zero)
    pub fn index(time: Timespec, fingerprint: String) -> Self {
        debug_assert!(is_fingerprint(&fingerprint));
        SegmentName {
            kind: SegmentKind::Index,
            time,
            size: 0,
            fingerprint,
            part: 0,
        }
    }

    /// Parse a file name, failing on any structural mismatch
    pub fn parse(name: &str) -> Result<SegmentName> {
        let (stem, ext) = name
            .rsplit_once('.')
            .ok_or_else(|| BeakError::parse(format!("segment name without extension: {name:?}")))?;

        let fields: Vec<&str> = stem.split('_').collect();
        if fields.len() != 5 {
            return Err(BeakError::parse(format!(
                "segment name needs 5 fields, got {}: {name:?}",
                fields.len()
            )));
        }

        let kind = match fields[0] {
            "s" => SegmentKind::Payload,
            "z" => SegmentKind::Index,
            other => {
                return Err(BeakError::parse(format!(
                    "unknown segment type letter {other:?} in {name:?}"
                )))
            }
        };
        if ext != kind.extension() {
            return Err(BeakError::parse(format!(
                "segment extension {ext:?} does not match type in {name:?}"
            )));
        }

        let (secs, nanos) = fields[1].split_once('.').ok_or_else(|| {
            BeakError::parse(format!("segment timestamp without nanoseconds: {name:?}"))
        })?;
        let secs: i64 = decimal(secs, name)?;
        let nanos: u32 = decimal(nanos, name)?;
        let size: u64 = decimal(fields[2], name)?;
        if !is_fingerprint(fields[3]) {
            return Err(BeakError::parse(format!(
                "segment fingerprint is not 64 lowercase hex digits: {name:?}"
            )));
        }
        let part: u32 = decimal(fields[4], name)?;

        Ok(SegmentName {
            kind,
            time: Timespec::new(secs, nanos),
            size,
            fingerprint: fields[3].to_string(),
            part,
        })
    }

    /// Listing validation rule for the synchronization layer
    ///
    /// A remote file is good iff its listed size matches what the name
    /// promises: the recorded size for payloads; for indexes the name must
    /// say zero and the listed size is free.
    pub fn matches_listing(&self, listed_size: u64) -> bool {
        match self.kind {
            SegmentKind::Payload => self.size == listed_size,
            SegmentKind::Index => self.size == 0,
        }
    }
}

impl fmt::Display for SegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}.{}_{}_{}_{}.{}",
            self.kind.letter(),
            self.time.secs,
            self.time.nanos,
            self.size,
            self.fingerprint,
            self.part,
            self.kind.extension()
        )
    }
}

fn is_fingerprint(s: &str) -> bool {
    s.len() == FINGERPRINT_LEN
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn decimal<T: std::str::FromStr>(field: &str, name: &str) -> Result<T> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BeakError::parse(format!(
            "non-decimal field {field:?} in segment name {name:?}"
        )));
    }
    field
        .parse()
        .map_err(|_| BeakError::parse(format!("field {field:?} out of range in {name:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(seed: u8) -> String {
        format!("{:02x}", seed).repeat(32)
    }

    #[test]
    fn test_payload_round_trip() {
        let n = SegmentName::payload(Timespec::new(1501080787, 579054757), 1119232, fp(0x3b), 13);
        let text = n.to_string();
        assert_eq!(
            text,
            format!("s_1501080787.579054757_1119232_{}_13.tar", fp(0x3b))
        );
        assert_eq!(SegmentName::parse(&text).unwrap(), n);
    }

    #[test]
    fn test_index_round_trip() {
        let n = SegmentName::index(Timespec::new(1506595429, 268937346), fp(0x7e));
        let text = n.to_string();
        assert!(text.starts_with("z_") && text.ends_with(".gz"));
        assert_eq!(SegmentName::parse(&text).unwrap(), n);
    }

    #[test]
    fn test_rejects_structural_mismatch() {
        assert!(SegmentName::parse("not a segment").is_err());
        assert!(SegmentName::parse(&format!("q_1.2_3_{}_0.tar", fp(1))).is_err());
        assert!(SegmentName::parse(&format!("s_1.2_3_{}_0.gz", fp(1))).is_err());
        assert!(SegmentName::parse(&format!("z_1.2_0_{}_0.tar", fp(1))).is_err());
        assert!(SegmentName::parse(&format!("s_12_3_{}_0.tar", fp(1))).is_err());
        assert!(SegmentName::parse("s_1.2_3_deadbeef_0.tar").is_err());
        assert!(SegmentName::parse(&format!("s_1.2_x_{}_0.tar", fp(1))).is_err());
    }

    #[test]
    fn test_listing_rule() {
        let p = SegmentName::payload(Timespec::new(1, 2), 2048, fp(2), 0);
        assert!(p.matches_listing(2048));
        assert!(!p.matches_listing(2047));

        let z = SegmentName::index(Timespec::new(1, 2), fp(3));
        assert!(z.matches_listing(12288));
        assert!(z.matches_listing(0));
    }

    #[test]
    fn test_uppercase_fingerprint_rejected() {
        let name = format!("s_1.2_3_{}_0.tar", "AB".repeat(32));
        assert!(SegmentName::parse(&name).is_err());
    }
}
