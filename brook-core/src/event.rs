use bincode::{Decode, Encode};

/// Fixed overhead charged for one `Event` on top of its payload bytes.
///
/// Covers the timestamps, the opcode, the ids and the allocation headers of the
/// two payload buffers. The estimate only feeds flush heuristics, it does not
/// need to be exact.
pub const EVENT_OVERHEAD_BYTES: i64 = 64;

/// Kind of change carried by an `Event`.
///
/// `Resolved` is a control marker, not a row change. A `Resolved` event with
/// timestamp `ts` promises that no later event on the same stream will carry
/// a commit timestamp less than or equal to `ts`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum OpType {
    #[default]
    Put,
    Delete,
    Resolved,
}

/// One row-change or resolved marker from the upstream change stream.
#[derive(Debug, Default, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Event {
    /// Commit timestamp. Primary sort key of the whole pipeline.
    pub crts: u64,

    /// Start timestamp of the transaction that produced the change.
    /// Secondary sort key.
    pub start_ts: u64,

    /// Opcode.
    pub op: OpType,

    /// Encoded row key. Empty for resolved markers.
    pub key: Vec<u8>,

    /// Encoded row value. Empty for deletes and resolved markers.
    pub value: Vec<u8>,

    /// The table the row belongs to.
    pub table_id: u64,

    /// The upstream region that produced the event.
    pub region_id: u64,
}

impl Event {
    pub fn put(crts: u64, start_ts: u64, key: Vec<u8>, value: Vec<u8>, table_id: u64) -> Self {
        Self {
            crts,
            start_ts,
            op: OpType::Put,
            key,
            value,
            table_id,
            region_id: 0,
        }
    }

    pub fn delete(crts: u64, start_ts: u64, key: Vec<u8>, table_id: u64) -> Self {
        Self {
            crts,
            start_ts,
            op: OpType::Delete,
            key,
            value: Vec::new(),
            table_id,
            region_id: 0,
        }
    }

    /// A resolved marker carries only a timestamp and the region it came from.
    pub fn resolved(region_id: u64, ts: u64) -> Self {
        Self {
            crts: ts,
            start_ts: ts,
            op: OpType::Resolved,
            key: Vec::new(),
            value: Vec::new(),
            table_id: 0,
            region_id,
        }
    }

    #[inline]
    pub fn is_resolved(&self) -> bool {
        self.op == OpType::Resolved
    }

    /// Approximate in-memory footprint in bytes.
    #[inline]
    pub fn approximate_size(&self) -> i64 {
        self.key.len() as i64 + self.value.len() as i64 + EVENT_OVERHEAD_BYTES
    }

    /// The `(crts, start_ts)` prefix of the total sort order. Callers append
    /// their own tie-break (push sequence, origin heap id) to make it total.
    #[inline]
    pub fn sort_key(&self) -> (u64, u64) {
        (self.crts, self.start_ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolved_event() {
        let event = Event::resolved(7, 100);
        assert!(event.is_resolved());
        assert_eq!(event.crts, 100);
        assert_eq!(event.start_ts, 100);
        assert_eq!(event.region_id, 7);
        assert!(event.key.is_empty());
        assert!(event.value.is_empty());
    }

    #[test]
    fn test_sort_key_order() {
        let a = Event::put(5, 1, b"k1".to_vec(), b"v1".to_vec(), 1);
        let b = Event::put(5, 3, b"k2".to_vec(), b"v2".to_vec(), 1);
        let c = Event::put(9, 0, b"k3".to_vec(), b"v3".to_vec(), 1);

        assert!(a.sort_key() < b.sort_key());
        assert!(b.sort_key() < c.sort_key());
    }

    #[test]
    fn test_approximate_size() {
        let event = Event::put(1, 1, vec![0u8; 10], vec![0u8; 30], 1);
        assert_eq!(event.approximate_size(), 40 + EVENT_OVERHEAD_BYTES);

        let marker = Event::resolved(0, 1);
        assert_eq!(marker.approximate_size(), EVENT_OVERHEAD_BYTES);
    }
}
