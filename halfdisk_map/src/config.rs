use halfdisk_core::LongIndexConfig;

/// Tuning knobs for a [`crate::HalfDiskHashMap`].
#[derive(Debug, Clone)]
pub struct MapConfig {
    /// Hard limit on the number of keys the map will ever hold. Sizes the
    /// bucket location index, which cannot grow after construction.
    pub max_keys: u64,
    /// Target average number of entries per bucket. When the projected load
    /// exceeds 70% of this target the bucket table doubles.
    pub good_average_bucket_entry_count: u32,
    /// Chunk geometry for the bucket location index.
    pub index_config: LongIndexConfig,
    /// Read-update worker threads used while flushing a write session.
    pub flush_threads: usize,
    /// Upper bound on buckets being read, updated or queued for store at
    /// any moment during a flush.
    pub max_in_flight_buckets: usize,
    /// Keep the bucket location index in a temp file instead of memory.
    /// Much slower, but the index then costs almost no RAM.
    pub prefer_disk_based_index: bool,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            max_keys: 4_000_000_000,
            good_average_bucket_entry_count: 32,
            index_config: LongIndexConfig::default(),
            flush_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_in_flight_buckets: 1024,
            prefer_disk_based_index: false,
        }
    }
}
