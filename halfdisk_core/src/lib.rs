pub mod bucket;
pub mod hash_list;
pub mod long_index;

pub use bucket::{Bucket, BucketEntry, BucketMutation, ReusableBucketPool, INVALID_VALUE};
pub use hash_list::{HashList, HashListConfig, HASH_SIZE_BYTES};
pub use long_index::{
    ChunkStorage, DiskChunks, HeapChunks, LongIndex, LongIndexConfig, LongIndexDisk, LongIndexHeap,
    LongIndexOffHeap, OffHeapChunks, IMPERMISSIBLE_VALUE,
};

#[cfg(test)]
mod hash_list_tests;
