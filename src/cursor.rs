//! Whole-store enumeration in global key order.
//!
//! Point and polyline records for the same geographic area live in
//! different shards, so enumeration has to interleave every shard by
//! spatial key rather than walk files one at a time. The cursor keeps one
//! reader per shard on a min-heap keyed by each reader's current record
//! and always yields the globally smallest next record.
//!
//! Shards have different record widths, but every record leads with its
//! first vertex's full-resolution key followed by metadata bits; ordering
//! compares that leading prefix, which all shards share.

use crate::error::{Result, StoreError};
use crate::query::{RecordDecoder, ShardReader};
use crate::record::Record;
use crate::store::descriptor::{Descriptor, Format};
use crate::store::pool::PoolReader;
use crate::store::shard::ShardId;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::Path;

/// Merging cursor over every shard of a store.
pub struct Cursor<'a> {
    desc: &'a Descriptor,
    pool: Option<&'a PoolReader>,
    readers: Vec<ShardReader>,
    positions: Vec<usize>,
    heap: BinaryHeap<Reverse<(Vec<u8>, usize)>>,
    cmp_len: usize,
}

/// Shard identities that can exist for a store: bare points, then every
/// (vertex count, common) combination the descriptor allows.
fn candidate_shards(desc: &Descriptor) -> Vec<ShardId> {
    let mut ids = vec![ShardId::new(1, 0)];

    match desc.format {
        Format::Inline { .. } => {
            for common in 0..=desc.half() {
                for components in 2..=desc.maxn {
                    ids.push(ShardId::new(components, common));
                }
            }
        }
        Format::Tagged => {
            for common in 0..=desc.half() {
                ids.push(ShardId::new(0, common));
            }
        }
    }

    ids
}

impl<'a> Cursor<'a> {
    /// Open every shard file present in `dir`; missing combinations are
    /// silently skipped.
    pub(crate) fn open(
        dir: &Path,
        desc: &'a Descriptor,
        pool: Option<&'a PoolReader>,
    ) -> Result<Self> {
        let cmp_len = ((desc.mapbits + desc.metabits()) as usize).div_ceil(8);

        let mut readers = Vec::new();
        for id in candidate_shards(desc) {
            let path = id.path(dir);
            if !path.exists() {
                continue;
            }
            readers.push(ShardReader::open(&path, id, desc)?);
        }

        let mut positions = vec![0usize; readers.len()];
        let mut heap = BinaryHeap::new();
        for (i, reader) in readers.iter().enumerate() {
            if reader.record_count() > 0 {
                heap.push(Reverse((reader.record(0)[..cmp_len].to_vec(), i)));
                positions[i] = 1;
            }
        }

        Ok(Self {
            desc,
            pool,
            readers,
            positions,
            heap,
            cmp_len,
        })
    }

    /// Number of shard files the cursor is drawing from.
    pub fn shard_count(&self) -> usize {
        self.readers.len()
    }
}

impl Iterator for Cursor<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        let Some(Reverse((_, i))) = self.heap.pop() else {
            // All shards drained; a reader still holding records here would
            // mean the heap bookkeeping lost a cursor.
            if self
                .positions
                .iter()
                .zip(&self.readers)
                .any(|(&pos, reader)| pos < reader.record_count())
            {
                return Some(Err(StoreError::CursorInvariant));
            }
            return None;
        };

        let reader = &self.readers[i];
        let pos = self.positions[i];
        let raw = reader.record(pos - 1);

        let decoder = RecordDecoder {
            desc: self.desc,
            shard: reader.id(),
            pool: self.pool,
        };
        let record = decoder.decode(raw);

        if pos < reader.record_count() {
            self.heap
                .push(Reverse((reader.record(pos)[..self.cmp_len].to_vec(), i)));
            self.positions[i] = pos + 1;
        }

        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::encode_record;
    use crate::store::descriptor::Format;
    use tempfile::TempDir;

    #[test]
    fn test_candidate_shards_inline() {
        let desc = Descriptor {
            format: Format::Inline { metabits: 0 },
            mapbits: 20,
            maxn: 3,
        };

        let ids = candidate_shards(&desc);
        assert!(ids.contains(&ShardId::new(1, 0)));
        assert!(ids.contains(&ShardId::new(2, 0)));
        assert!(ids.contains(&ShardId::new(3, 10)));
        assert!(!ids.contains(&ShardId::new(4, 0)));
        assert!(!ids.contains(&ShardId::new(2, 11)));
        // Points exist only at common 0.
        assert_eq!(ids.iter().filter(|id| id.components == 1).count(), 1);
    }

    #[test]
    fn test_candidate_shards_tagged() {
        let desc = Descriptor {
            format: Format::Tagged,
            mapbits: 48,
            maxn: 1,
        };

        let ids = candidate_shards(&desc);
        assert!(ids.contains(&ShardId::new(1, 0)));
        assert!(ids.contains(&ShardId::new(0, 0)));
        assert!(ids.contains(&ShardId::new(0, 24)));
        assert!(!ids.contains(&ShardId::new(2, 0)));
    }

    #[test]
    fn test_cursor_merges_two_shards_in_key_order() {
        let dir = TempDir::new().unwrap();
        let desc = Descriptor {
            format: Format::Inline { metabits: 0 },
            mapbits: 48,
            maxn: 2,
        };

        // Points at even key positions, two-vertex lines at odd ones, so a
        // correct merge must alternate between the files.
        let mut point_rows: Vec<Vec<u8>> = Vec::new();
        let mut line_rows: Vec<Vec<u8>> = Vec::new();
        for i in 0u32..8 {
            let x = i << 26;
            let y = 0;
            if i % 2 == 0 {
                point_rows.push(encode_record(&[x], &[y], 0, 48, 0, &[]));
            } else {
                line_rows.push(encode_record(&[x, x + 256], &[y, y], 2, 48, 0, &[]));
            }
        }

        std::fs::write(ShardId::new(1, 0).path(dir.path()), point_rows.concat()).unwrap();
        std::fs::write(ShardId::new(2, 2).path(dir.path()), line_rows.concat()).unwrap();

        let cursor = Cursor::open(dir.path(), &desc, None).unwrap();
        assert_eq!(cursor.shard_count(), 2);

        let records: Vec<Record> = cursor.collect::<Result<_>>().unwrap();
        assert_eq!(records.len(), 8);

        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.xs[0], (i as u32) << 26, "wrong order at {i}");
            let expected_vertices = if i % 2 == 0 { 1 } else { 2 };
            assert_eq!(record.vertex_count(), expected_vertices);
        }
    }

    #[test]
    fn test_cursor_over_missing_and_empty_shards() {
        let dir = TempDir::new().unwrap();
        let desc = Descriptor {
            format: Format::Inline { metabits: 0 },
            mapbits: 48,
            maxn: 4,
        };

        std::fs::write(ShardId::new(2, 5).path(dir.path()), []).unwrap();

        let mut cursor = Cursor::open(dir.path(), &desc, None).unwrap();
        assert_eq!(cursor.shard_count(), 1);
        assert!(cursor.next().is_none());
    }
}
