//! Bit-level record codec.
//!
//! Records are packed most-significant-bit first into byte buffers. A
//! vertex is written as its y and x bits interleaved one at a time (y first),
//! which makes plain unsigned byte comparison of two encoded records
//! equivalent to comparing the Z-order (Morton) positions of their first
//! vertices. That equivalence is what lets a sorted shard answer tile range
//! queries with binary search, so the exact bit order here is load-bearing.
//!
//! Polylines share their vertices' common leading bits: the first vertex is
//! stored in full, later vertices skip the shared prefix. Trailing padding
//! bits of the final partial byte are always zero, so records differing only
//! in padding compare equal.

use crate::error::Result;
use smallvec::{SmallVec, smallvec};

/// Inline vertex capacity for decoded coordinate arrays.
pub type CoordVec = SmallVec<[u32; 8]>;

/// Encoded byte width of one record.
///
/// `mapbits` covers the first vertex and `metabits` the trailing metadata
/// field; each later vertex costs `mapbits - 2 * common` bits.
pub fn bytes_for(mapbits: u32, metabits: u32, components: u32, common: u32) -> usize {
    let components = components.max(1);
    let bits = mapbits + metabits + (mapbits - 2 * common) * (components - 1);
    bits.div_ceil(8) as usize
}

/// Append-only bit cursor over a fixed-size, zero-initialized buffer.
pub struct BitWriter {
    buf: Vec<u8>,
    pos: usize,
}

impl BitWriter {
    /// Create a writer over `bytes` zeroed bytes.
    pub fn new(bytes: usize) -> Self {
        Self {
            buf: vec![0u8; bytes],
            pos: 0,
        }
    }

    /// Current bit offset from the start of the buffer.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn put_bit(&mut self, bit: u32) {
        assert!(self.pos < self.buf.len() * 8, "bit write past buffer end");
        if bit != 0 {
            self.buf[self.pos / 8] |= 1 << (7 - self.pos % 8);
        }
        self.pos += 1;
    }

    /// Write one vertex: `half_bits - skip` bits each of y and x,
    /// interleaved one bit at a time starting from bit `31 - skip`,
    /// y before x.
    ///
    /// `skip` is the shared-prefix bit count already represented by the
    /// record's first vertex; `skip == half_bits` writes nothing.
    pub fn put_vertex(&mut self, wx: u32, wy: u32, half_bits: u32, skip: u32) {
        debug_assert!(half_bits <= 32 && skip <= half_bits);

        let mut i = 31i64 - skip as i64;
        let lo = 32i64 - half_bits as i64;
        while i >= lo {
            self.put_bit((wy >> i) as u32 & 1);
            self.put_bit((wx >> i) as u32 & 1);
            i -= 1;
        }
    }

    /// Write `bits` bits of `value`, most significant first, stopping at the
    /// record's logical bit length `limit`. Bits past the limit are dropped;
    /// padding beyond it stays zero.
    pub fn put_meta(&mut self, value: u64, bits: u32, limit: usize) {
        debug_assert!(bits <= 64);

        let mut i = bits as i64 - 1;
        while i >= 0 && self.pos < limit {
            self.put_bit((value >> i) as u32 & 1);
            i -= 1;
        }
    }

    /// Consume the writer, yielding the encoded bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

/// Forward-only bit cursor over an encoded record.
pub struct BitReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bit(&mut self) -> u32 {
        assert!(self.pos < self.buf.len() * 8, "bit read past buffer end");
        let bit = (self.buf[self.pos / 8] >> (7 - self.pos % 8)) & 1;
        self.pos += 1;
        bit as u32
    }
}

/// Decode a record's coordinate arrays and trailing metadata field.
///
/// The shared prefix (`skip` bits of each coordinate) is read once and
/// broadcast to every vertex, then each vertex's remainder is read, then
/// `metabits` bits of metadata.
///
/// `buf` must be at least `bytes_for(mapbits, metabits, n, skip)` bytes.
pub fn decode_record(
    buf: &[u8],
    mapbits: u32,
    metabits: u32,
    skip: u32,
    n: usize,
) -> Result<(CoordVec, CoordVec, u64)> {
    assert!(
        buf.len() >= bytes_for(mapbits, metabits, n as u32, skip),
        "record buffer shorter than its encoded width"
    );

    let half = mapbits / 2;
    let mut reader = BitReader::new(buf);
    let mut xs: CoordVec = smallvec![0u32; n];
    let mut ys: CoordVec = smallvec![0u32; n];

    // Shared prefix, broadcast to every vertex.
    let mut i = 31i64;
    while i > 31 - skip as i64 {
        let y0 = reader.bit();
        let x0 = reader.bit();
        for j in 0..n {
            xs[j] |= x0 << i;
            ys[j] |= y0 << i;
        }
        i -= 1;
    }

    // Per-vertex remainders.
    for j in 0..n {
        let mut i = 31i64 - skip as i64;
        while i > 31 - half as i64 {
            let y0 = reader.bit();
            let x0 = reader.bit();
            xs[j] |= x0 << i;
            ys[j] |= y0 << i;
            i -= 1;
        }
    }

    let mut meta: u64 = 0;
    for _ in 0..metabits {
        meta = (meta << 1) | reader.bit() as u64;
    }

    Ok((xs, ys, meta))
}

/// Encode a complete record: first vertex in full, later vertices with the
/// shared prefix elided, then the metadata field.
pub fn encode_record(
    xs: &[u32],
    ys: &[u32],
    common: u32,
    mapbits: u32,
    metabits: u32,
    meta_fields: &[(u32, u64)],
) -> Vec<u8> {
    debug_assert_eq!(xs.len(), ys.len());

    let n = xs.len() as u32;
    let half = mapbits / 2;
    let bits = (mapbits + metabits + (mapbits - 2 * common) * (n - 1)) as usize;
    let mut writer = BitWriter::new(bytes_for(mapbits, metabits, n, common));

    writer.put_vertex(xs[0], ys[0], half, 0);
    for j in 1..xs.len() {
        writer.put_vertex(xs[j], ys[j], half, common);
    }

    for &(field_bits, value) in meta_fields {
        writer.put_meta(value, field_bits, bits);
    }

    writer.into_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interleave(wx: u32, wy: u32) -> u64 {
        let mut out = 0u64;
        for i in (0..32).rev() {
            out = (out << 1) | u64::from((wy >> i) & 1);
            out = (out << 1) | u64::from((wx >> i) & 1);
        }
        out
    }

    #[test]
    fn test_bytes_for() {
        // One full-resolution vertex, no metadata: mapbits bits.
        assert_eq!(bytes_for(48, 0, 1, 0), 6);
        assert_eq!(bytes_for(48, 16, 1, 0), 8);
        // Second vertex shares 12 leading bit pairs.
        assert_eq!(bytes_for(48, 0, 2, 12), 9);
        // Degenerate: all vertices identical at full resolution.
        assert_eq!(bytes_for(48, 0, 3, 24), 6);
        // Partial trailing byte rounds up.
        assert_eq!(bytes_for(18, 0, 1, 0), 3);
    }

    #[test]
    fn test_interleaving_order() {
        // All-ones x with zero y must produce 01 bit pairs: 0x55 bytes.
        let buf = encode_record(&[u32::MAX], &[0], 0, 64, 0, &[]);
        assert_eq!(buf, vec![0x55; 8]);

        // And the converse: y bits land first.
        let buf = encode_record(&[0], &[u32::MAX], 0, 64, 0, &[]);
        assert_eq!(buf, vec![0xAA; 8]);
    }

    #[test]
    fn test_single_vertex_round_trip() {
        let mapbits = 48;
        // Only the top mapbits/2 bits of each coordinate survive.
        let wx = 0x89AB_C000u32;
        let wy = 0x1234_5000u32;

        let buf = encode_record(&[wx], &[wy], 0, mapbits, 0, &[]);
        let (xs, ys, meta) = decode_record(&buf, mapbits, 0, 0, 1).unwrap();

        assert_eq!(xs.as_slice(), &[wx]);
        assert_eq!(ys.as_slice(), &[wy]);
        assert_eq!(meta, 0);
    }

    #[test]
    fn test_polyline_shared_prefix_round_trip() {
        let mapbits = 48;
        let xs = [0xABCD_1000u32, 0xABCD_2000, 0xABCD_3000];
        let ys = [0x1234_5000u32, 0x1234_6000, 0x1234_7000];
        let common = 16;

        let buf = encode_record(&xs, &ys, common, mapbits, 0, &[]);
        assert_eq!(buf.len(), bytes_for(mapbits, 0, 3, common));

        let (dx, dy, _) = decode_record(&buf, mapbits, 0, common, 3).unwrap();
        assert_eq!(dx.as_slice(), &xs);
        assert_eq!(dy.as_slice(), &ys);
    }

    #[test]
    fn test_degenerate_common_stores_nothing_extra() {
        let mapbits = 48;
        let xs = [0xABCD_E000u32; 4];
        let ys = [0x1234_5000u32; 4];
        let common = mapbits / 2;

        let buf = encode_record(&xs, &ys, common, mapbits, 0, &[]);
        assert_eq!(buf.len(), bytes_for(mapbits, 0, 1, 0));

        let (dx, dy, _) = decode_record(&buf, mapbits, 0, common, 4).unwrap();
        assert_eq!(dx.as_slice(), &xs);
        assert_eq!(dy.as_slice(), &ys);
    }

    #[test]
    fn test_metadata_field_round_trip() {
        let mapbits = 48;
        let metabits = 16;

        let buf = encode_record(&[123 << 24], &[456 << 24], 0, mapbits, metabits, &[(16, 0xBEEF)]);
        let (_, _, meta) = decode_record(&buf, mapbits, metabits, 0, 1).unwrap();
        assert_eq!(meta, 0xBEEF);
    }

    #[test]
    fn test_metadata_split_fields_concatenate() {
        let mapbits = 48;
        let metabits = 12;

        let buf = encode_record(&[0], &[0], 0, mapbits, metabits, &[(4, 0xA), (8, 0x5C)]);
        let (_, _, meta) = decode_record(&buf, mapbits, metabits, 0, 1).unwrap();
        assert_eq!(meta, 0xA5C);
    }

    #[test]
    fn test_metadata_clipped_at_record_length() {
        let mapbits = 48;
        let metabits = 8;

        // 16 bits offered into an 8-bit field: the low 8 offered bits fall
        // off the end and the padding stays zero.
        let buf = encode_record(&[0], &[0], 0, mapbits, metabits, &[(16, 0xFFFF)]);
        assert_eq!(buf.len(), 7);
        let (_, _, meta) = decode_record(&buf, mapbits, metabits, 0, 1).unwrap();
        assert_eq!(meta, 0xFF);
    }

    #[test]
    fn test_byte_order_matches_morton_order() {
        let coords = [
            (0u32, 0u32),
            (1 << 31, 1 << 30),
            (0x8000_0000, 0x8000_0000),
            (0xFFFF_0000, 0x0000_FFFF),
            (0x1234_5678, 0x9ABC_DEF0),
            (0x1234_5679, 0x9ABC_DEF0),
        ];

        for &(ax, ay) in &coords {
            for &(bx, by) in &coords {
                let a = encode_record(&[ax], &[ay], 0, 64, 0, &[]);
                let b = encode_record(&[bx], &[by], 0, 64, 0, &[]);

                assert_eq!(
                    a.cmp(&b),
                    interleave(ax, ay).cmp(&interleave(bx, by)),
                    "byte order diverged from Z-order for ({ax:#x},{ay:#x}) vs ({bx:#x},{by:#x})"
                );
            }
        }
    }
}
