//! Tile range queries over sorted shards.
//!
//! A tile address (z, x, y) occupies a contiguous range of the encoded key
//! space: every record whose first vertex falls inside the tile has the
//! tile's `2*z` interleaved bits as its key prefix. [`TileBounds`] builds
//! the lowest and highest keys of that range; [`ShardReader`] binary
//! searches a sorted, memory-mapped shard for the bounding positions and
//! iterates the records in between.

use crate::bits::{BitWriter, decode_record};
use crate::error::{Result, StoreError};
use crate::record::{GeomType, Metadata, Record};
use crate::store::descriptor::{Descriptor, Format};
use crate::store::pool::PoolReader;
use crate::store::shard::ShardId;
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

/// Inclusive key range covered by one tile at one record width.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TileBounds {
    /// Tile key prefix with every remaining bit zero.
    pub start: Vec<u8>,
    /// Tile key prefix with every remaining bit (metadata included) one.
    pub end: Vec<u8>,
}

impl TileBounds {
    pub fn new(z: u32, x: u32, y: u32, width: usize) -> Result<Self> {
        if z > 32 || (x as u64) >= 1u64 << z || (y as u64) >= 1u64 << z {
            return Err(StoreError::InvalidTile { z, x, y });
        }

        let wx = (((x as u64) << (32 - z as u64)) & 0xFFFF_FFFF) as u32;
        let wy = (((y as u64) << (32 - z as u64)) & 0xFFFF_FFFF) as u32;

        // Interleave the tile address, y bit first, and clip to the record
        // width: a tile finer than the stored resolution degenerates to the
        // key range of its ancestor at the stored depth.
        let mut key = 0u64;
        for i in 0..z {
            key = (key << 1) | u64::from((wy >> (31 - i)) & 1);
            key = (key << 1) | u64::from((wx >> (31 - i)) & 1);
        }

        let mut writer = BitWriter::new(width);
        writer.put_meta(key, 2 * z, width * 8);
        let prefix_bits = writer.position();
        let start = writer.into_vec();

        let mut end = start.clone();
        for bit in prefix_bits..(width * 8) {
            end[bit / 8] |= 1 << (7 - bit % 8);
        }

        Ok(Self { start, end })
    }
}

/// Decodes raw shard records into [`Record`]s, resolving pool references
/// for tagged stores.
pub(crate) struct RecordDecoder<'a> {
    pub desc: &'a Descriptor,
    pub shard: ShardId,
    pub pool: Option<&'a PoolReader>,
}

impl RecordDecoder<'_> {
    pub fn decode(&self, raw: &[u8]) -> Result<Record> {
        let n = self.shard.inline_components() as usize;
        let skip = if n > 1 { self.shard.common } else { 0 };

        let (mut xs, mut ys, meta) =
            decode_record(raw, self.desc.mapbits, self.desc.metabits(), skip, n)?;

        match self.desc.format {
            Format::Inline { metabits } => Ok(Record {
                geom: if n > 1 {
                    GeomType::LineString
                } else {
                    GeomType::Point
                },
                xs,
                ys,
                metadata: if metabits == 0 {
                    Metadata::None
                } else {
                    Metadata::Inline(meta)
                },
            }),
            Format::Tagged => {
                if meta == 0 {
                    return Ok(Record {
                        xs,
                        ys,
                        geom: GeomType::Point,
                        metadata: Metadata::None,
                    });
                }

                let pool = self.pool.ok_or(StoreError::Pool { offset: meta })?;
                let entry = pool.entry(meta)?;

                let mut x = xs[0] as i64;
                let mut y = ys[0] as i64;
                for &(dx, dy) in &entry.deltas {
                    x += dx;
                    y += dy;
                    xs.push(x as u32);
                    ys.push(y as u32);
                }

                Ok(Record {
                    xs,
                    ys,
                    geom: entry.geom,
                    metadata: if entry.tags.is_empty() {
                        Metadata::None
                    } else {
                        Metadata::Tags(entry.tags)
                    },
                })
            }
        }
    }
}

/// Read-only view of one sorted shard.
pub struct ShardReader {
    map: Mmap,
    width: usize,
    id: ShardId,
}

impl ShardReader {
    /// Map the shard at `path`. The file length must be a whole number of
    /// records of this shard's width.
    pub fn open(path: &Path, id: ShardId, desc: &Descriptor) -> Result<Self> {
        let width = id.record_width(desc);
        let file = File::open(path)?;
        let map = unsafe { Mmap::map(&file)? };

        if map.len() % width != 0 {
            return Err(StoreError::TruncatedShard {
                path: path.to_path_buf(),
                len: map.len() as u64,
                width,
            });
        }

        Ok(Self { map, width, id })
    }

    pub fn id(&self) -> ShardId {
        self.id
    }

    pub fn record_width(&self) -> usize {
        self.width
    }

    pub fn record_count(&self) -> usize {
        self.map.len() / self.width
    }

    /// Raw bytes of record `index`.
    pub fn record(&self, index: usize) -> &[u8] {
        &self.map[index * self.width..(index + 1) * self.width]
    }

    /// First index whose record does not satisfy `pred`, given that `pred`
    /// holds for a prefix of the shard and fails for the rest.
    fn partition_point(&self, pred: impl Fn(&[u8]) -> bool) -> usize {
        let mut low = 0usize;
        let mut high = self.record_count();

        while low < high {
            let probe = (low + high) / 2;
            if pred(self.record(probe)) {
                low = probe + 1;
            } else {
                high = probe;
            }
        }

        low
    }

    /// Record index range `[start, end)` covered by `bounds`.
    pub fn range(&self, bounds: &TileBounds) -> (usize, usize) {
        debug_assert_eq!(bounds.start.len(), self.width);

        let start = self.partition_point(|r| r < bounds.start.as_slice());
        let end = self.partition_point(|r| r <= bounds.end.as_slice());
        (start, end)
    }

    /// Lazily decode the records covered by `bounds`.
    ///
    /// A `stride` greater than one yields every stride-th record, with the
    /// scan start aligned up to a multiple of the stride from record 0 of
    /// the shard; nested strides therefore yield nested record sets, which
    /// keeps progressively-refined scans consistent with each other.
    pub fn scan<'a>(
        &'a self,
        desc: &'a Descriptor,
        pool: Option<&'a PoolReader>,
        bounds: &TileBounds,
        stride: usize,
    ) -> Scan<'a> {
        let stride = stride.max(1);
        let (mut pos, end) = self.range(bounds);
        if stride > 1 {
            pos = pos.next_multiple_of(stride);
        }

        Scan {
            reader: self,
            decoder: RecordDecoder {
                desc,
                shard: self.id,
                pool,
            },
            pos,
            end,
            stride,
        }
    }
}

/// Forward iterator over one shard's records within a tile's key range.
pub struct Scan<'a> {
    reader: &'a ShardReader,
    decoder: RecordDecoder<'a>,
    pos: usize,
    end: usize,
    stride: usize,
}

impl Iterator for Scan<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.end {
            return None;
        }

        let raw = self.reader.record(self.pos);
        self.pos += self.stride;
        Some(self.decoder.decode(raw))
    }
}
