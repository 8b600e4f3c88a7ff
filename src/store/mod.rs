//! The partition store.
//!
//! A store is a directory: a `meta` descriptor, one flat file per
//! (vertex count, shared prefix) shard, and — for tagged stores — an
//! `extra` pool file. Ingest appends fixed-width records to lazily opened
//! shard handles; [`Store::finish`] flushes everything and externally
//! sorts each shard, after which the store answers tile range queries.
//!
//! A store is either being written (via [`Store::create`]) or being read
//! (via [`Store::open`]); callers serialize access externally. There is no
//! locking, and a shard must never be queried while it is being sorted.

pub mod descriptor;
pub mod pool;
pub mod shard;

use crate::cursor::Cursor;
use crate::error::{Result, StoreError};
use crate::query::{RecordDecoder, ShardReader, TileBounds};
use crate::record::{Feature, Record, parse_line, project_feature, shared_prefix_bits};
use crate::types::{Config, StoreStats};
use crate::{bits, sort};
use descriptor::{Descriptor, Format, POOL_FILE, TAGGED_METABITS};
use pool::{PoolReader, PoolWriter};
use shard::ShardId;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};

/// An on-disk spatial shard store.
pub struct Store {
    dir: PathBuf,
    desc: Descriptor,
    config: Config,
    writable: bool,
    shards: BTreeMap<ShardId, BufWriter<File>>,
    pool: Option<PoolWriter>,
    pool_reader: Option<PoolReader>,
    stats: StoreStats,
}

impl Store {
    /// Create a new store directory for ingest.
    ///
    /// The directory is created if needed; an existing descriptor is
    /// overwritten and, for tagged stores, the pool file is reset.
    pub fn create<P: AsRef<Path>>(dir: P, config: Config) -> Result<Self> {
        config.validate().map_err(StoreError::Config)?;

        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let desc = Descriptor::from_config(&config);
        desc.write(&dir)?;

        let pool = if config.tagged {
            Some(PoolWriter::create(dir.join(POOL_FILE))?)
        } else {
            None
        };

        Ok(Self {
            dir,
            desc,
            config,
            writable: true,
            shards: BTreeMap::new(),
            pool,
            pool_reader: None,
            stats: StoreStats::default(),
        })
    }

    /// Open an existing store for queries.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let desc = Descriptor::read(&dir)?;

        let pool_reader = match desc.format {
            Format::Tagged => Some(PoolReader::open(dir.join(POOL_FILE))?),
            Format::Inline { .. } => None,
        };

        let config = Config {
            zoom: desc.half() - 8,
            metabits: match desc.format {
                Format::Inline { metabits } => metabits,
                Format::Tagged => 0,
            },
            tagged: matches!(desc.format, Format::Tagged),
            ..Config::default()
        };

        Ok(Self {
            dir,
            desc,
            config,
            writable: false,
            shards: BTreeMap::new(),
            pool: None,
            pool_reader,
            stats: StoreStats::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.desc
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// Ingest one textual input line. Returns whether a record was stored;
    /// unparsable lines and out-of-range coordinates are skipped with a
    /// warning, not errors.
    pub fn ingest_line(&mut self, line: &str) -> Result<bool> {
        match parse_line(line) {
            Ok(feature) => self.ingest(&feature),
            Err(e) => {
                log::warn!("skipping line {:?}: {}", line.trim_end(), e);
                self.stats.skip();
                Ok(false)
            }
        }
    }

    /// Ingest every line of a reader, e.g. stdin or a file.
    pub fn ingest_lines<R: BufRead>(&mut self, reader: R) -> Result<u64> {
        let mut stored = 0;
        for line in reader.lines() {
            if self.ingest_line(&line?)? {
                stored += 1;
            }
        }
        Ok(stored)
    }

    /// Ingest one parsed feature. Returns whether a record was stored.
    pub fn ingest(&mut self, feature: &Feature) -> Result<bool> {
        if !self.writable {
            return Err(StoreError::Config(
                "store was opened read-only; use create() for ingest".to_string(),
            ));
        }

        let Some((xs, ys)) = project_feature(feature) else {
            log::warn!("skipping record with out-of-range coordinates");
            self.stats.skip();
            return Ok(false);
        };

        let n = xs.len() as u32;
        let common = shared_prefix_bits(&xs, &ys, self.desc.half());

        match self.desc.format {
            Format::Inline { metabits } => {
                if !feature.tags.is_empty() {
                    log::debug!("inline store: dropping {} key/value tags", feature.tags.len());
                }

                let id = if n == 1 {
                    ShardId::new(1, 0)
                } else {
                    ShardId::new(n, common)
                };

                let fields: Vec<(u32, u64)> = feature
                    .fields
                    .iter()
                    .map(|f| (f.bits, f.value as u64))
                    .collect();

                let buf = bits::encode_record(&xs, &ys, id.common, self.desc.mapbits, metabits, &fields);
                self.append(id, &buf)?;

                if n > self.desc.maxn {
                    self.desc.maxn = n;
                }
            }
            Format::Tagged => {
                if !feature.fields.is_empty() {
                    log::debug!("tagged store: dropping {} inline fields", feature.fields.len());
                }

                let pool = self.pool.as_mut().expect("tagged stores own a pool writer");
                let offset = if n > 1 || !feature.tags.is_empty() {
                    let offset = pool.entry(&xs, &ys, feature.geom_type(), &feature.tags)?;
                    self.stats.pool_bytes = pool.len();
                    offset
                } else {
                    0
                };

                let id = if n > 1 {
                    ShardId::new(0, common)
                } else {
                    ShardId::new(1, 0)
                };

                let buf = bits::encode_record(
                    &xs[..1],
                    &ys[..1],
                    0,
                    self.desc.mapbits,
                    TAGGED_METABITS,
                    &[(TAGGED_METABITS, offset)],
                );
                self.append(id, &buf)?;
            }
        }

        self.stats.record(n as usize);
        Ok(true)
    }

    fn append(&mut self, id: ShardId, buf: &[u8]) -> Result<()> {
        if !self.shards.contains_key(&id) {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(id.path(&self.dir))?;
            self.shards.insert(id, BufWriter::new(file));
            self.stats.shards = self.shards.len() as u64;
        }

        let writer = self.shards.get_mut(&id).expect("inserted above");
        writer.write_all(buf)?;
        Ok(())
    }

    /// Flush everything, persist the final descriptor, and externally sort
    /// every shard. Consumes the store; reopen with [`Store::open`] to
    /// query.
    pub fn finish(mut self) -> Result<StoreStats> {
        for writer in self.shards.values_mut() {
            writer.flush()?;
        }
        self.shards.clear();

        if let Some(pool) = self.pool.as_mut() {
            pool.flush()?;
        }

        self.desc.write(&self.dir)?;

        let shard_ids = discover_shards(&self.dir)?;
        log::info!(
            "{}: sorting {} shards, {} records",
            self.dir.display(),
            shard_ids.len(),
            self.stats.records
        );

        for (i, id) in shard_ids.iter().enumerate() {
            let path = id.path(&self.dir);
            let width = id.record_width(&self.desc);
            sort::sort_file(&path, width, self.config.sort_budget_bytes)?;
            log::info!(
                "{}: sorted ({}/{})",
                path.display(),
                i + 1,
                shard_ids.len()
            );
        }

        Ok(self.stats)
    }

    /// Iterate every record whose geometry may intersect tile (z, x, y),
    /// in shard order.
    ///
    /// Point shards are downsampled by `stride` (1 yields everything);
    /// polyline shards are always scanned in full. Matching polylines are
    /// found by probing finer lookup zooms within the tile and every
    /// containing tile at coarser zooms, the way the shard naming scheme
    /// partitions them.
    pub fn tile_query(&self, z: u32, x: u32, y: u32, stride: usize) -> Result<TileQuery<'_>> {
        if z > 32 || (x as u64) >= 1u64 << z || (y as u64) >= 1u64 << z {
            return Err(StoreError::InvalidTile { z, x, y });
        }

        let half = self.desc.half();
        let mut scans = Vec::new();

        // A tile finer than the stored resolution covers the same records
        // as its ancestor at the stored depth.
        let (pz, px, py) = if z > half {
            (half, x >> (z - half), y >> (z - half))
        } else {
            (z, x, y)
        };
        self.add_scan(&mut scans, ShardId::new(1, 0), pz, px, py, stride.max(1))?;

        // Polylines filed under finer lookup zooms sit inside this tile.
        let mut common = z + 1;
        while common <= half {
            for id in self.polyline_shards(common) {
                self.add_scan(&mut scans, id, z, x, y, 1)?;
            }
            common += 1;
        }

        // At this zoom and coarser, the lookup covers a containing tile.
        for common in (0..=z.min(half)).rev() {
            for id in self.polyline_shards(common) {
                self.add_scan(&mut scans, id, common, x >> (z - common), y >> (z - common), 1)?;
            }
        }

        Ok(TileQuery {
            desc: &self.desc,
            pool: self.pool_reader.as_ref(),
            scans,
            current: 0,
        })
    }

    fn polyline_shards(&self, common: u32) -> Vec<ShardId> {
        match self.desc.format {
            Format::Inline { .. } => (2..=self.desc.maxn)
                .map(|n| ShardId::new(n, common))
                .collect(),
            Format::Tagged => vec![ShardId::new(0, common)],
        }
    }

    fn add_scan(
        &self,
        scans: &mut Vec<ScanState>,
        id: ShardId,
        z: u32,
        x: u32,
        y: u32,
        stride: usize,
    ) -> Result<()> {
        let path = id.path(&self.dir);
        if !path.exists() {
            return Ok(());
        }

        let reader = ShardReader::open(&path, id, &self.desc)?;
        let bounds = TileBounds::new(z, x, y, reader.record_width())?;
        let (start, end) = reader.range(&bounds);
        let pos = if stride > 1 {
            start.next_multiple_of(stride)
        } else {
            start
        };

        scans.push(ScanState {
            reader,
            pos,
            end,
            stride,
        });
        Ok(())
    }

    /// Enumerate the whole store in global ascending key order.
    pub fn cursor(&self) -> Result<Cursor<'_>> {
        Cursor::open(&self.dir, &self.desc, self.pool_reader.as_ref())
    }
}

/// Shard files present in a store directory, by filename.
fn discover_shards(dir: &Path) -> Result<Vec<ShardId>> {
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(id) = entry.file_name().to_str().and_then(ShardId::parse) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

struct ScanState {
    reader: ShardReader,
    pos: usize,
    end: usize,
    stride: usize,
}

/// Iterator over every record a tile's range queries produce, shard by
/// shard.
pub struct TileQuery<'a> {
    desc: &'a Descriptor,
    pool: Option<&'a PoolReader>,
    scans: Vec<ScanState>,
    current: usize,
}

impl Iterator for TileQuery<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(scan) = self.scans.get_mut(self.current) {
            if scan.pos >= scan.end {
                self.current += 1;
                continue;
            }

            let raw = scan.reader.record(scan.pos);
            scan.pos += scan.stride;

            let decoder = RecordDecoder {
                desc: self.desc,
                shard: scan.reader.id(),
                pool: self.pool,
            };
            return Some(decoder.decode(raw));
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::Point;
    use tempfile::TempDir;

    #[test]
    fn test_create_writes_descriptor_and_pool() {
        let dir = TempDir::new().unwrap();

        Store::create(dir.path(), Config::new(16)).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("meta")).unwrap(),
            "1\n48 0 1\n"
        );
        assert!(!dir.path().join(POOL_FILE).exists());

        Store::create(dir.path(), Config::new(16).with_tagged()).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("meta")).unwrap(),
            "2\n48 40 1\n"
        );
        assert_eq!(std::fs::read(dir.path().join(POOL_FILE)).unwrap(), vec![0]);
    }

    #[test]
    fn test_ingest_routes_records_to_shards() {
        let dir = TempDir::new().unwrap();
        let mut store = Store::create(dir.path(), Config::new(16)).unwrap();

        assert!(store.ingest_line("40.0,-73.0").unwrap());
        assert!(store.ingest_line("40.0,-73.0 40.1,-73.2").unwrap());
        assert!(!store.ingest_line("not a line").unwrap());
        assert!(!store.ingest_line("91.0,0.0").unwrap());

        let stats = store.finish().unwrap();
        assert_eq!(stats.records, 2);
        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.vertices, 3);
        assert_eq!(stats.shards, 2);

        // The point shard holds exactly one fixed-width record.
        let point_shard = std::fs::read(dir.path().join("1,0")).unwrap();
        assert_eq!(point_shard.len(), 6);

        // The polyline landed in a (2, common) shard; the descriptor kept
        // the observed maxn.
        let desc = Descriptor::read(dir.path()).unwrap();
        assert_eq!(desc.maxn, 2);
        assert_eq!(discover_shards(dir.path()).unwrap().len(), 2);
    }

    #[test]
    fn test_open_is_read_only() {
        let dir = TempDir::new().unwrap();
        let store = Store::create(dir.path(), Config::new(16)).unwrap();
        store.finish().unwrap();

        let mut reopened = Store::open(dir.path()).unwrap();
        let feature = Feature::from_points([Point::new(-73.0, 40.0)]);
        assert!(matches!(
            reopened.ingest(&feature),
            Err(StoreError::Config(_))
        ));
    }

    #[test]
    fn test_discover_shards_ignores_other_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("meta"), "1\n48 0 1\n").unwrap();
        std::fs::write(dir.path().join("extra"), [0]).unwrap();
        std::fs::write(dir.path().join("1,0"), []).unwrap();
        std::fs::write(dir.path().join("3,12"), []).unwrap();

        assert_eq!(
            discover_shards(dir.path()).unwrap(),
            vec![ShardId::new(1, 0), ShardId::new(3, 12)]
        );
    }
}
