//! The extra pool file for tagged stores.
//!
//! Fixed-width shard records can only carry a 40-bit metadata field, so
//! anything variable-length — extra polyline vertices, key/value tags,
//! strings — is appended here and referenced by offset. Byte 0 is a
//! reserved NUL so offset 0 can mean "nothing attached".
//!
//! An entry is a run of signed varints: a tag combining vertex count and
//! geometry type, per-vertex coordinate deltas for every vertex after the
//! first, the tag-pair count, then for each pair a key offset delta, a
//! value type code, and the value. Offset deltas are relative to the
//! entry's own start, so entries are self-contained. Strings are written
//! NUL-terminated and de-duplicated by content.

use crate::error::{Result, StoreError};
use crate::record::{GEOM_TYPE_BITS, GeomType, Tag, TagValue};
use crate::varint::{read_signed, write_signed};
use bytes::{BufMut, BytesMut};
use memmap2::Mmap;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Offsets must fit the shard records' 40-bit metadata field.
const MAX_OFFSET: u64 = (1 << 40) - 1;

const SCRATCH_INITIAL_CAPACITY: usize = 4 * 1024;

/// Append side of the pool, used during ingest.
pub struct PoolWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    len: u64,
    /// Interned strings by content; the ordered map doubles as the search
    /// tree that keeps each distinct string stored once.
    strings: BTreeMap<String, u64>,
    scratch: BytesMut,
}

impl PoolWriter {
    /// Create a fresh pool file, truncating any existing one. Writes the
    /// reserved NUL byte at offset 0.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        let mut writer = BufWriter::new(file);
        writer.write_all(&[0])?;

        Ok(Self {
            writer,
            path,
            len: 1,
            strings: BTreeMap::new(),
            scratch: BytesMut::with_capacity(SCRATCH_INITIAL_CAPACITY),
        })
    }

    /// Bytes written so far, including the reserved prefix byte.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len <= 1
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn push(&mut self, bytes: &[u8]) -> Result<u64> {
        let offset = self.len;
        if offset + bytes.len() as u64 > MAX_OFFSET {
            return Err(StoreError::PoolFull);
        }
        self.writer.write_all(bytes)?;
        self.len += bytes.len() as u64;
        Ok(offset)
    }

    /// Offset of `s` in the pool, writing it (NUL-terminated) on first use.
    fn intern(&mut self, s: &str) -> Result<u64> {
        if let Some(&offset) = self.strings.get(s) {
            return Ok(offset);
        }

        self.scratch.clear();
        self.scratch.put(s.as_bytes());
        self.scratch.put_u8(0);
        let bytes = self.scratch.split().freeze();
        let offset = self.push(&bytes)?;

        self.strings.insert(s.to_string(), offset);
        Ok(offset)
    }

    /// Append one record's variable-length payload and return the offset
    /// its shard record should carry.
    ///
    /// `xs`/`ys` are the full vertex arrays; the first vertex is already
    /// inline in the shard record, so only deltas for the rest are stored.
    pub fn entry(&mut self, xs: &[u32], ys: &[u32], geom: GeomType, tags: &[Tag]) -> Result<u64> {
        // Strings first, so the entry body can reference them backward.
        let mut resolved: Vec<(u64, &TagValue)> = Vec::with_capacity(tags.len());
        for tag in tags {
            let key_offset = self.intern(&tag.key)?;
            resolved.push((key_offset, &tag.value));
        }
        let mut string_offsets: Vec<u64> = Vec::new();
        for tag in tags {
            if let TagValue::String(s) = &tag.value {
                string_offsets.push(self.intern(s)?);
            }
        }

        let base = self.len;

        self.scratch.clear();
        let mut scratch = std::mem::take(&mut self.scratch);

        let header = ((xs.len() as i64) << GEOM_TYPE_BITS) | geom.code() as i64;
        write_signed(&mut scratch, header);

        for j in 1..xs.len() {
            write_signed(&mut scratch, xs[j] as i64 - xs[j - 1] as i64);
            write_signed(&mut scratch, ys[j] as i64 - ys[j - 1] as i64);
        }

        write_signed(&mut scratch, tags.len() as i64);
        let mut strings = string_offsets.into_iter();
        for (key_offset, value) in resolved {
            write_signed(&mut scratch, key_offset as i64 - base as i64);
            write_signed(&mut scratch, value.type_code());
            match value {
                TagValue::String(_) => {
                    let offset = strings.next().expect("string offset resolved above");
                    write_signed(&mut scratch, offset as i64 - base as i64);
                }
                TagValue::Integer(i) => write_signed(&mut scratch, *i),
                TagValue::Number(f) => write_signed(&mut scratch, f.to_bits() as i64),
            }
        }

        let result = self.push(&scratch);
        scratch.clear();
        self.scratch = scratch;
        result
    }

    /// Flush buffered writes to the file.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// One decoded pool entry.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolEntry {
    pub geom: GeomType,
    /// Total vertex count, including the inline first vertex.
    pub vertex_count: usize,
    /// Coordinate deltas for vertices 1..n relative to their predecessor.
    pub deltas: Vec<(i64, i64)>,
    pub tags: Vec<Tag>,
}

/// Read side of the pool, memory-mapped for random access at query time.
pub struct PoolReader {
    map: Mmap,
}

impl PoolReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self { map })
    }

    fn string_at(&self, offset: u64) -> Result<String> {
        let start = offset as usize;
        if offset == 0 || start >= self.map.len() {
            return Err(StoreError::Pool { offset });
        }

        let rest = &self.map[start..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(StoreError::Pool { offset })?;

        String::from_utf8(rest[..end].to_vec()).map_err(|_| StoreError::Pool { offset })
    }

    fn offset_from(&self, base: u64, delta: i64) -> Result<u64> {
        let offset = base as i64 + delta;
        if offset <= 0 || offset as u64 >= self.map.len() as u64 {
            return Err(StoreError::Pool { offset: base });
        }
        Ok(offset as u64)
    }

    /// Decode the entry starting at `offset`.
    pub fn entry(&self, offset: u64) -> Result<PoolEntry> {
        if offset == 0 || offset as usize >= self.map.len() {
            return Err(StoreError::Pool { offset });
        }

        let buf = &self.map[..];
        let mut pos = offset as usize;

        let header = read_signed(buf, &mut pos)?;
        if header < 0 {
            return Err(StoreError::Pool { offset });
        }
        let vertex_count = (header >> GEOM_TYPE_BITS) as usize;
        let geom = GeomType::from_code((header & 0xF) as u8).ok_or(StoreError::Pool { offset })?;
        if vertex_count == 0 {
            return Err(StoreError::Pool { offset });
        }

        let mut deltas = Vec::with_capacity((vertex_count - 1).min(1024));
        for _ in 1..vertex_count {
            let dx = read_signed(buf, &mut pos)?;
            let dy = read_signed(buf, &mut pos)?;
            deltas.push((dx, dy));
        }

        let tag_count = read_signed(buf, &mut pos)?;
        if tag_count < 0 {
            return Err(StoreError::Pool { offset });
        }

        let mut tags = Vec::with_capacity((tag_count as usize).min(1024));
        for _ in 0..tag_count {
            let key_delta = read_signed(buf, &mut pos)?;
            let key = self.string_at(self.offset_from(offset, key_delta)?)?;

            let value = match read_signed(buf, &mut pos)? {
                0 => {
                    let value_delta = read_signed(buf, &mut pos)?;
                    TagValue::String(self.string_at(self.offset_from(offset, value_delta)?)?)
                }
                -1 => TagValue::Integer(read_signed(buf, &mut pos)?),
                -2 => TagValue::Number(f64::from_bits(read_signed(buf, &mut pos)? as u64)),
                _ => return Err(StoreError::Pool { offset }),
            };

            tags.push(Tag { key, value });
        }

        Ok(PoolEntry {
            geom,
            vertex_count,
            deltas,
            tags,
        })
    }
}
