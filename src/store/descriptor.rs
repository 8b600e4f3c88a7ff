//! The store descriptor file.
//!
//! `<dir>/meta` is the single source of truth for decoding everything else
//! in a store directory: two text lines, a format version and then
//! `mapbits metabits maxn`. Every shard file must agree with it.

use crate::error::{Result, StoreError};
use crate::types::Config;
use std::fs;
use std::path::{Path, PathBuf};

/// Descriptor file name inside a store directory.
pub const DESCRIPTOR_FILE: &str = "meta";

/// Pool file name inside a tagged store directory.
pub const POOL_FILE: &str = "extra";

/// Record layout variant, fixed at store creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    /// Version 1: a fixed-width metadata bit field inline in each record,
    /// one shard per (vertex count, common) pair.
    Inline { metabits: u32 },
    /// Version 2: the metadata field is a 40-bit offset into the extra
    /// pool; multi-vertex records collapse into shard `(0, common)`.
    Tagged,
}

/// Width of the pool-offset field in tagged stores.
pub const TAGGED_METABITS: u32 = 40;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Descriptor {
    pub format: Format,
    /// Total bits for one full-resolution coordinate pair.
    pub mapbits: u32,
    /// Largest vertex count stored in any shard.
    pub maxn: u32,
}

impl Descriptor {
    pub fn from_config(config: &Config) -> Self {
        Self {
            format: if config.tagged {
                Format::Tagged
            } else {
                Format::Inline {
                    metabits: config.metabits,
                }
            },
            mapbits: config.mapbits(),
            maxn: 1,
        }
    }

    pub fn version(&self) -> u32 {
        match self.format {
            Format::Inline { .. } => 1,
            Format::Tagged => 2,
        }
    }

    /// Width of the inline metadata field in bits.
    pub fn metabits(&self) -> u32 {
        match self.format {
            Format::Inline { metabits } => metabits,
            Format::Tagged => TAGGED_METABITS,
        }
    }

    /// Bits per coordinate; also the largest legal shared-prefix value.
    pub fn half(&self) -> u32 {
        self.mapbits / 2
    }

    fn path(dir: &Path) -> PathBuf {
        dir.join(DESCRIPTOR_FILE)
    }

    /// Read and validate the descriptor of the store at `dir`.
    pub fn read(dir: &Path) -> Result<Self> {
        let path = Self::path(dir);
        let text = fs::read_to_string(&path)?;
        let mut lines = text.lines();

        let version = lines.next().unwrap_or("").trim();
        let version: u32 = match version {
            "1" => 1,
            "2" => 2,
            other => {
                return Err(StoreError::UnknownVersion {
                    path,
                    version: other.to_string(),
                });
            }
        };

        let sizes = lines.next().unwrap_or("");
        let mut parts = sizes.split_whitespace();
        let (Some(mapbits), Some(metabits), Some(maxn)) = (
            parts.next().and_then(|s| s.parse::<u32>().ok()),
            parts.next().and_then(|s| s.parse::<u32>().ok()),
            parts.next().and_then(|s| s.parse::<u32>().ok()),
        ) else {
            return Err(StoreError::BadDescriptor { path });
        };

        if mapbits <= 16 || mapbits > 64 || mapbits % 2 != 0 {
            return Err(StoreError::BadDescriptor { path });
        }

        let format = match version {
            1 => {
                if metabits > 64 {
                    return Err(StoreError::BadDescriptor { path });
                }
                Format::Inline { metabits }
            }
            _ => {
                if metabits != TAGGED_METABITS {
                    return Err(StoreError::BadDescriptor { path });
                }
                Format::Tagged
            }
        };

        Ok(Self {
            format,
            mapbits,
            maxn,
        })
    }

    /// Write the descriptor into `dir`, replacing any existing one.
    pub fn write(&self, dir: &Path) -> Result<()> {
        let text = format!(
            "{}\n{} {} {}\n",
            self.version(),
            self.mapbits,
            self.metabits(),
            self.maxn
        );
        fs::write(Self::path(dir), text)?;
        Ok(())
    }

    /// Check that records from a store described by `other` could live in
    /// this store: mapbits and metabits must match exactly. `maxn` is free
    /// to differ; a merged store takes the maximum.
    pub fn ensure_compatible(&self, other: &Self, a: &Path, b: &Path) -> Result<()> {
        if self.mapbits != other.mapbits || self.metabits() != other.metabits() {
            return Err(StoreError::DescriptorMismatch {
                a: a.to_path_buf(),
                b: b.to_path_buf(),
            });
        }
        Ok(())
    }
}
