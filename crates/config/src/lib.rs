//! # Config
//!
//! Tuning knobs of the table index.
//!
//! Values come from [`IndexConfig::default`] and can be overridden through
//! environment variables with [`IndexConfig::from_env`]:
//!
//! ```text
//! TABLE_INDEX_MAX_MEMTABLE_ENTRIES    entries per memtable before a flush   (default: 1000000)
//! TABLE_INDEX_MAX_TABLES_PER_LEVEL    tables per level before a merge       (default: 4)
//! TABLE_INDEX_MAX_AUTO_MERGE_LEVEL    highest level merged automatically    (default: 4294967295)
//! TABLE_INDEX_PTABLE_VERSION          on-disk format for new tables, 1..=4  (default: 4)
//! TABLE_INDEX_CACHE_DEPTH             minimum midpoint depth, 8..=28        (default: 16)
//! TABLE_INDEX_SKIP_VERIFY             skip table checksums at startup       (default: false)
//! TABLE_INDEX_USE_BLOOM_FILTERS       write and use bloom sidecars          (default: true)
//! TABLE_INDEX_INIT_THREADS            threads opening tables at startup     (default: 1)
//! ```
//!
//! Unparsable values fall back to the default. Range checks happen in
//! [`IndexConfig::validate`].
use thiserror::Error;

/// Lowest accepted midpoint depth.
pub const MIN_CACHE_DEPTH: u32 = 8;
/// Highest accepted midpoint depth.
pub const MAX_CACHE_DEPTH: u32 = 28;
/// Newest PTable format.
pub const LATEST_PTABLE_VERSION: u8 = 4;

/// An invalid configuration value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_memtable_entries must be > 0")]
    ZeroMemtableEntries,

    #[error("max_tables_per_level must be >= 2, got {0}")]
    TablesPerLevel(usize),

    #[error("ptable_version must be in 1..=4, got {0}")]
    PTableVersion(u8),

    #[error("index_cache_depth must be in 8..=28, got {0}")]
    CacheDepth(u32),

    #[error("initialization_threads must be > 0")]
    ZeroThreads,
}

/// Settings of one table index instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexConfig {
    /// Entries the active memtable holds before it is switched out.
    pub max_memtable_entries: usize,
    /// Tables a level may hold before it is merged into the next one.
    pub max_tables_per_level: usize,
    /// Levels above this one are only merged by an explicit manual merge.
    pub max_auto_merge_level: u32,
    /// Format of newly written PTables.
    pub ptable_version: u8,
    /// Minimum midpoint depth of newly opened or written tables.
    pub index_cache_depth: u32,
    /// Skip checksum verification when opening tables.
    pub skip_index_verify: bool,
    pub use_bloom_filters: bool,
    /// Threads used to open tables while loading the index map.
    pub initialization_threads: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_memtable_entries: 1_000_000,
            max_tables_per_level: 4,
            max_auto_merge_level: u32::MAX,
            ptable_version: LATEST_PTABLE_VERSION,
            index_cache_depth: 16,
            skip_index_verify: false,
            use_bloom_filters: true,
            initialization_threads: 1,
        }
    }
}

impl IndexConfig {
    /// Defaults overridden by `TABLE_INDEX_*` environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_memtable_entries: env_parse("TABLE_INDEX_MAX_MEMTABLE_ENTRIES", d.max_memtable_entries),
            max_tables_per_level: env_parse("TABLE_INDEX_MAX_TABLES_PER_LEVEL", d.max_tables_per_level),
            max_auto_merge_level: env_parse("TABLE_INDEX_MAX_AUTO_MERGE_LEVEL", d.max_auto_merge_level),
            ptable_version: env_parse("TABLE_INDEX_PTABLE_VERSION", d.ptable_version),
            index_cache_depth: env_parse("TABLE_INDEX_CACHE_DEPTH", d.index_cache_depth),
            skip_index_verify: env_parse("TABLE_INDEX_SKIP_VERIFY", d.skip_index_verify),
            use_bloom_filters: env_parse("TABLE_INDEX_USE_BLOOM_FILTERS", d.use_bloom_filters),
            initialization_threads: env_parse("TABLE_INDEX_INIT_THREADS", d.initialization_threads),
        }
    }

    /// Checks every value against its accepted range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_memtable_entries == 0 {
            return Err(ConfigError::ZeroMemtableEntries);
        }
        if self.max_tables_per_level < 2 {
            return Err(ConfigError::TablesPerLevel(self.max_tables_per_level));
        }
        if !(1..=LATEST_PTABLE_VERSION).contains(&self.ptable_version) {
            return Err(ConfigError::PTableVersion(self.ptable_version));
        }
        if !(MIN_CACHE_DEPTH..=MAX_CACHE_DEPTH).contains(&self.index_cache_depth) {
            return Err(ConfigError::CacheDepth(self.index_cache_depth));
        }
        if self.initialization_threads == 0 {
            return Err(ConfigError::ZeroThreads);
        }
        Ok(())
    }
}

/// Reads a configuration value from the environment, falling back to `default`.
fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr + ToString>(key: &str, default: T) -> T {
    env_or(key, &default.to_string()).parse().unwrap_or(default)
}
