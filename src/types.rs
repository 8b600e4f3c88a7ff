//! Configuration and statistics types.
//!
//! The configuration is designed to be easily serializable and loadable
//! from JSON while keeping complexity minimal.

use serde::de::Error;
use serde::{Deserialize, Serialize};

/// Default working-set budget for the external sorter, in bytes.
pub const DEFAULT_SORT_BUDGET: usize = 50 * 1024 * 1024;

/// Store creation configuration.
///
/// `zoom` is the detail zoom level: coordinates are stored with enough bits
/// to address individual pixels of a 256x256 tile at that zoom
/// (`mapbits = 2 * (zoom + 8)`).
///
/// # Example
///
/// ```rust
/// use geoshard::Config;
///
/// let config = Config::new(16).with_metabits(8);
/// assert_eq!(config.mapbits(), 48);
///
/// let json = r#"{ "zoom": 18, "tagged": true }"#;
/// let config = Config::from_json(json).unwrap();
/// assert!(config.tagged);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Detail zoom level (1-24).
    pub zoom: u32,

    /// Width of the inline per-record metadata field, in bits.
    ///
    /// Ignored for tagged stores, where the field is fixed at 40 bits and
    /// holds a pool offset.
    #[serde(default)]
    pub metabits: u32,

    /// Use the tagged (version 2) layout: vertex overflow and key/value
    /// metadata live in the side pool file instead of inline bit fields.
    #[serde(default)]
    pub tagged: bool,

    /// Working-set budget for the external sorter, in bytes.
    #[serde(default = "Config::default_sort_budget")]
    pub sort_budget_bytes: usize,
}

impl Config {
    const fn default_sort_budget() -> usize {
        DEFAULT_SORT_BUDGET
    }

    /// Create a configuration for the given detail zoom level.
    pub fn new(zoom: u32) -> Self {
        Self {
            zoom,
            metabits: 0,
            tagged: false,
            sort_budget_bytes: Self::default_sort_budget(),
        }
    }

    /// Set the inline metadata field width in bits.
    pub fn with_metabits(mut self, metabits: u32) -> Self {
        self.metabits = metabits;
        self
    }

    /// Switch to the tagged (pool-backed) record layout.
    pub fn with_tagged(mut self) -> Self {
        self.tagged = true;
        self
    }

    /// Adjust the external sorter's working-set budget.
    pub fn with_sort_budget(mut self, bytes: usize) -> Self {
        self.sort_budget_bytes = bytes;
        self
    }

    /// Total bits used to encode one full-resolution coordinate pair.
    pub fn mapbits(&self) -> u32 {
        2 * (self.zoom + 8)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.zoom < 1 || self.zoom > 24 {
            return Err("Zoom level must be between 1 and 24".to_string());
        }

        if !self.tagged && self.metabits > 64 {
            return Err("Metadata field width must be at most 64 bits".to_string());
        }

        if self.tagged && self.metabits != 0 {
            return Err("Tagged stores use a fixed 40-bit pool offset field".to_string());
        }

        if self.sort_budget_bytes < 4096 {
            return Err("Sort budget must be at least one page (4096 bytes)".to_string());
        }

        Ok(())
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let config: Config = serde_json::from_str(json)?;
        if let Err(e) = config.validate() {
            return Err(Error::custom(e));
        }
        Ok(config)
    }

    /// Save configuration as a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(16)
    }
}

/// Ingest statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    /// Records accepted into a shard.
    pub records: u64,
    /// Input lines skipped (unparsable or out-of-range coordinates).
    pub skipped: u64,
    /// Total vertices across accepted records.
    pub vertices: u64,
    /// Shard files written during ingest.
    pub shards: u64,
    /// Bytes appended to the extra pool (tagged stores only).
    pub pool_bytes: u64,
}

impl StoreStats {
    pub fn record(&mut self, vertices: usize) {
        self.records += 1;
        self.vertices += vertices as u64;
    }

    pub fn skip(&mut self) {
        self.skipped += 1;
    }
}
