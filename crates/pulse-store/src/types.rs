use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// Flat key/value record as stored in a stream entry.
pub type StreamRecord = HashMap<String, String>;

/// Identifier of a single stream entry.
///
/// Ids are totally ordered within a stream: a millisecond timestamp plus a
/// sequence number disambiguating entries appended within the same
/// millisecond. Rendered as `"<ms>-<seq>"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    pub ms: i64,
    pub seq: u64,
}

impl EntryId {
    pub fn new(ms: i64, seq: u64) -> Self {
        Self { ms, seq }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || StoreError::MalformedEntryId {
            input: s.to_string(),
        };
        let (ms, seq) = s.split_once('-').ok_or_else(|| malformed())?;
        Ok(Self {
            ms: ms.parse().map_err(|_| malformed())?,
            seq: seq.parse().map_err(|_| malformed())?,
        })
    }
}

/// Where a newly created consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStart {
    /// Deliver every entry currently in the stream and all future ones.
    Beginning,
    /// Deliver only entries appended after group creation.
    End,
    /// Deliver entries with id strictly greater than the given one.
    After(EntryId),
}

/// Per-stream cursor for a group read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFrom {
    /// Entries never delivered to this group (the `>` cursor).
    New,
    /// This consumer's own pending entries with id greater than the given
    /// one. Used to re-inspect unacknowledged deliveries.
    Pending(EntryId),
}

/// Entries returned for one stream by a group read.
#[derive(Debug, Clone)]
pub struct StreamBatch {
    pub stream: String,
    pub entries: Vec<(EntryId, StreamRecord)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_id_display_round_trip() {
        let id = EntryId::new(1700000000123, 7);
        let parsed: EntryId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn entry_id_rejects_malformed_input() {
        assert!("".parse::<EntryId>().is_err());
        assert!("123".parse::<EntryId>().is_err());
        assert!("a-b".parse::<EntryId>().is_err());
    }

    #[test]
    fn entry_id_orders_by_ms_then_seq() {
        let a = EntryId::new(1, 5);
        let b = EntryId::new(2, 0);
        let c = EntryId::new(2, 1);
        assert!(a < b);
        assert!(b < c);
    }
}
