//! Binlog position tracking.
//!
//! A [`BinlogPosition`] identifies a location in the source's binary log as a
//! `(filename, byte offset)` pair, optionally augmented with a GTID. The
//! replayer orders positions to decide which journal entries lie strictly
//! after the durable checkpoint.

use std::cmp::Ordering;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// A location in the source's binary log.
///
/// Two positions are equal iff both `filename` and `position` are equal;
/// the GTID and timestamp are informational and excluded from equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinlogPosition {
    /// Binlog filename, e.g. `binlog.000011`. Lexicographic order matches
    /// rotation order because the numeric suffix is zero-padded.
    pub filename: String,
    /// Byte offset within the binlog file.
    pub position: u64,
    /// Optional GTID in `uuid:txn` or `uuid:lo-hi` form.
    pub gtid: Option<String>,
    /// Unix milliseconds at which this position was captured.
    pub timestamp: i64,
}

impl PartialEq for BinlogPosition {
    fn eq(&self, other: &Self) -> bool {
        self.filename == other.filename && self.position == other.position
    }
}

impl Eq for BinlogPosition {}

impl BinlogPosition {
    pub fn new(filename: impl Into<String>, position: u64) -> Self {
        Self {
            filename: filename.into(),
            position,
            gtid: None,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn with_gtid(mut self, gtid: Option<String>) -> Self {
        self.gtid = gtid.filter(|g| !g.is_empty());
        self
    }

    /// Render as `filename:position`.
    pub fn to_position_string(&self) -> String {
        format!("{}:{}", self.filename, self.position)
    }

    /// Parse the `filename:position` form produced by
    /// [`to_position_string`](Self::to_position_string).
    ///
    /// The offset is taken after the last `:` so that filenames containing
    /// colons do not confuse the parse.
    pub fn parse(s: &str) -> Option<Self> {
        let (filename, position) = s.rsplit_once(':')?;
        if filename.is_empty() {
            return None;
        }
        let position = position.parse().ok()?;
        Some(Self::new(filename, position))
    }

    /// Replication order between two positions.
    ///
    /// When both sides carry GTIDs with the same server uuid, the transaction
    /// ids are compared numerically, using the upper bound of a `lo-hi`
    /// range. Differing uuids are incomparable by GTID and fall back to
    /// `(filename, position)`, as do positions without GTIDs.
    pub fn cmp_replication(&self, other: &Self) -> Ordering {
        if let (Some(a), Some(b)) = (
            self.gtid.as_deref().and_then(parse_gtid),
            other.gtid.as_deref().and_then(parse_gtid),
        ) {
            if a.0 == b.0 {
                return a.1.cmp(&b.1);
            }
        }

        self.filename
            .cmp(&other.filename)
            .then_with(|| self.position.cmp(&other.position))
    }

    /// True iff `self` lies strictly after `other` in replication order.
    pub fn is_after(&self, other: &Self) -> bool {
        self.cmp_replication(other) == Ordering::Greater
    }
}

impl std::fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.gtid {
            Some(gtid) => write!(f, "{}:{} (gtid {})", self.filename, self.position, gtid),
            None => write!(f, "{}:{}", self.filename, self.position),
        }
    }
}

/// Split a `uuid:txn` or `uuid:lo-hi` GTID into its uuid part and the upper
/// transaction id. Returns `None` for anything malformed.
fn parse_gtid(gtid: &str) -> Option<(&str, u64)> {
    let (uuid, txn) = gtid.rsplit_once(':')?;
    if uuid.is_empty() || txn.is_empty() {
        return None;
    }
    let upper = match txn.split_once('-') {
        Some((_, hi)) => hi.parse().ok()?,
        None => txn.parse().ok()?,
    };
    Some((uuid, upper))
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID_A: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";
    const UUID_B: &str = "8f9e1d22-0b4c-11e2-aa91-d0509905a1b3";

    fn pos(filename: &str, position: u64) -> BinlogPosition {
        BinlogPosition::new(filename, position)
    }

    fn pos_gtid(filename: &str, position: u64, gtid: &str) -> BinlogPosition {
        BinlogPosition::new(filename, position).with_gtid(Some(gtid.to_string()))
    }

    #[test]
    fn position_string_round_trip() {
        let p = pos("binlog.000011", 1042);
        let parsed = BinlogPosition::parse(&p.to_position_string()).unwrap();
        assert_eq!(parsed, p);
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(BinlogPosition::parse("").is_none());
        assert!(BinlogPosition::parse("no-colon").is_none());
        assert!(BinlogPosition::parse(":42").is_none());
        assert!(BinlogPosition::parse("binlog.000001:not-a-number").is_none());
    }

    #[test]
    fn equality_needs_both_fields() {
        assert_eq!(pos("bin.000001", 500), pos("bin.000001", 500));
        assert_ne!(pos("bin.000001", 500), pos("bin.000001", 501));
        assert_ne!(pos("bin.000001", 500), pos("bin.000002", 500));
    }

    #[test]
    fn file_position_order() {
        let checkpoint = pos("bin.000001", 499);
        assert!(pos("bin.000001", 500).is_after(&checkpoint));
        assert!(!pos("bin.000001", 499).is_after(&checkpoint));
        assert!(!pos("bin.000001", 400).is_after(&checkpoint));
        // A later file always wins regardless of offset.
        assert!(pos("bin.000002", 4).is_after(&pos("bin.000001", 99999)));
    }

    #[test]
    fn gtid_order_same_uuid() {
        let a = pos_gtid("bin.000001", 100, &format!("{UUID_A}:5"));
        let b = pos_gtid("bin.000009", 900, &format!("{UUID_A}:4"));
        // GTID comparison overrides the file/position fallback.
        assert!(a.is_after(&b));
        assert!(!b.is_after(&a));
    }

    #[test]
    fn gtid_range_upper_bound() {
        let range = pos_gtid("bin.000001", 100, &format!("{UUID_A}:1-5"));
        let single = pos_gtid("bin.000001", 100, &format!("{UUID_A}:5"));
        let wider = pos_gtid("bin.000001", 100, &format!("{UUID_A}:1-6"));

        // uuid:1-5 vs uuid:5 is equal on the upper bound.
        assert_eq!(range.cmp_replication(&single), Ordering::Equal);
        // uuid:1-6 is strictly greater.
        assert!(wider.is_after(&single));
        assert!(wider.is_after(&range));
    }

    #[test]
    fn gtid_differing_uuids_fall_back_to_file_position() {
        let a = pos_gtid("bin.000001", 100, &format!("{UUID_A}:9"));
        let b = pos_gtid("bin.000002", 100, &format!("{UUID_B}:1"));
        // Incomparable by GTID, so the later file wins.
        assert!(b.is_after(&a));
        assert!(!a.is_after(&b));
    }

    #[test]
    fn malformed_gtid_falls_back() {
        let a = pos_gtid("bin.000001", 200, "not-a-gtid");
        let b = pos_gtid("bin.000001", 100, &format!("{UUID_A}:3"));
        assert!(a.is_after(&b));
    }

    #[test]
    fn empty_gtid_treated_as_absent() {
        let p = BinlogPosition::new("bin.000001", 4).with_gtid(Some(String::new()));
        assert!(p.gtid.is_none());
    }
}
