//! Embedded spatial shard store for massive point and polyline datasets.
//!
//! Geographic coordinates are projected to 32-bit world coordinates and
//! bit-interleaved into sortable binary keys, records are partitioned into
//! fixed-width shard files, shards are externally sorted at any size, and
//! "everything intersecting tile (z, x, y)" queries run as binary searches
//! over the sorted byte streams.
//!
//! ```no_run
//! use geoshard::{Config, Store};
//!
//! let mut store = Store::create("stars", Config::new(16))?;
//! store.ingest_line("40.712,-74.006")?;
//! store.ingest_line("40.712,-74.006 40.713,-74.007")?;
//! store.finish()?;
//!
//! let store = Store::open("stars")?;
//! for record in store.tile_query(12, 1205, 1539, 1)? {
//!     let record = record?;
//!     println!("{} vertices", record.vertex_count());
//! }
//! # Ok::<(), geoshard::StoreError>(())
//! ```

pub mod bits;
pub mod cursor;
pub mod error;
pub mod projection;
pub mod query;
pub mod record;
pub mod sort;
pub mod store;
pub mod types;
pub mod varint;

pub use cursor::Cursor;
pub use error::{Result, StoreError};

pub use geo::Point;

pub use query::{Scan, ShardReader, TileBounds};

pub use record::{
    Feature, GeomType, InlineField, LineError, Metadata, Record, Tag, TagValue, parse_line,
};

pub use store::descriptor::{Descriptor, Format};
pub use store::pool::{PoolEntry, PoolReader, PoolWriter};
pub use store::shard::ShardId;
pub use store::{Store, TileQuery};

pub use types::{Config, StoreStats};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports
pub mod prelude {

    pub use crate::{Config, Result, Store, StoreError};

    pub use geo::Point;

    pub use crate::{Feature, GeomType, Metadata, Record, Tag, TagValue};

    pub use crate::{Cursor, TileBounds, TileQuery};
}
