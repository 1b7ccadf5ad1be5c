#[cfg(test)]
mod tests {
    use halfdisk_core::{Bucket, LongIndexConfig};
    use halfdisk_traits::{RecordSource, NON_EXISTENT_DATA_LOCATION};
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::path::Path;
    use std::thread;

    use crate::config::MapConfig;
    use crate::map::HalfDiskHashMap;

    const NOT_FOUND: i64 = -1;

    fn test_config() -> MapConfig {
        MapConfig {
            max_keys: 100_000,
            good_average_bucket_entry_count: 32,
            index_config: LongIndexConfig {
                longs_per_chunk: 256,
                reserved_buffer_length: 0,
            },
            flush_threads: 4,
            max_in_flight_buckets: 64,
            prefer_disk_based_index: false,
        }
    }

    fn small_bucket_config() -> MapConfig {
        MapConfig {
            good_average_bucket_entry_count: 4,
            ..test_config()
        }
    }

    fn new_map(dir: &Path) -> HalfDiskHashMap {
        HalfDiskHashMap::new(test_config(), 10_000, &dir.join("store"), "test").unwrap()
    }

    fn key_for(i: u64) -> Vec<u8> {
        format!("key-{i}").into_bytes()
    }

    fn hash_for(i: u64) -> u32 {
        i as u32
    }

    fn put_range(map: &HalfDiskHashMap, start: u64, count: u64, multiplier: i64) {
        map.start_writing();
        for i in start..start + count {
            map.put(&key_for(i), hash_for(i), i as i64 * multiplier);
        }
        map.end_writing().unwrap();
    }

    fn check_range(map: &HalfDiskHashMap, start: u64, count: u64, multiplier: i64) {
        for i in start..start + count {
            assert_eq!(
                map.get(&key_for(i), hash_for(i), NOT_FOUND).unwrap(),
                i as i64 * multiplier,
                "key {i} multiplier {multiplier}"
            );
        }
    }

    #[test]
    fn test_create_data_and_check() {
        let dir = tempfile::tempdir().unwrap();
        let map = new_map(dir.path());
        let count = 1000;
        put_range(&map, 1, count, 1);
        check_range(&map, 1, count, 1);

        // Random reads
        let mut rng = rand::rngs::StdRng::seed_from_u64(1234);
        for _ in 0..(count * 2) {
            let i = 1 + rng.gen_range(0..count);
            assert_eq!(map.get(&key_for(i), hash_for(i), 0).unwrap(), i as i64);
        }

        // Snapshot, then reload the snapshot and check the data again
        let snapshot_dir = dir.path().join("snapshot");
        map.snapshot(&snapshot_dir).unwrap();
        let from_snapshot =
            HalfDiskHashMap::new(test_config(), 10_000, &snapshot_dir, "test").unwrap();
        check_range(&from_snapshot, 1, count, 1);

        // Deletion
        map.start_writing();
        for i in [5u64, 50, 500] {
            map.delete(&key_for(i), hash_for(i));
        }
        map.end_writing().unwrap();
        for i in [5u64, 50, 500] {
            assert_eq!(map.get(&key_for(i), hash_for(i), NOT_FOUND).unwrap(), NOT_FOUND);
        }
        check_range(&map, 1, 4, 1);
        check_range(&map, 6, 43, 1);
        check_range(&map, 51, 448, 1);
        check_range(&map, 501, 499, 1);
    }

    #[test]
    fn test_multiple_write_batches() {
        let dir = tempfile::tempdir().unwrap();
        let map = new_map(dir.path());
        put_range(&map, 1, 1111, 1);
        check_range(&map, 1, 1111, 1);
        put_range(&map, 1111, 2222, 1);
        check_range(&map, 1, 3333, 1);
        put_range(&map, 1111, 5000, 1);
        check_range(&map, 1, 6111, 1);
    }

    #[test]
    fn test_update_data() {
        let dir = tempfile::tempdir().unwrap();
        let map = new_map(dir.path());
        put_range(&map, 0, 1000, 1);
        check_range(&map, 0, 1000, 1);
        // Overwrite the middle with new values
        put_range(&map, 200, 400, 2);
        check_range(&map, 0, 200, 1);
        check_range(&map, 200, 400, 2);
        check_range(&map, 600, 400, 1);
    }

    #[test]
    fn test_initial_bucket_count_from_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let map =
            HalfDiskHashMap::new(small_bucket_config(), 16, &dir.path().join("store"), "test")
                .unwrap();
        assert_eq!(map.num_of_buckets(), 4);

        // Minimum is two buckets no matter how small the capacity
        let tiny =
            HalfDiskHashMap::new(small_bucket_config(), 0, &dir.path().join("tiny"), "test")
                .unwrap();
        assert_eq!(tiny.num_of_buckets(), 2);
    }

    #[test]
    fn test_colliding_hashes_share_one_bucket() {
        // Four buckets, so hashes 0, 4, 8, 12 all mask down to bucket 0
        let dir = tempfile::tempdir().unwrap();
        let map =
            HalfDiskHashMap::new(small_bucket_config(), 16, &dir.path().join("store"), "test")
                .unwrap();
        assert_eq!(map.num_of_buckets(), 4);

        map.start_writing();
        for hash in [0u32, 4, 8, 12] {
            map.put(&key_for(hash as u64), hash, hash as i64 + 100);
        }
        map.end_writing().unwrap();

        for hash in [0u32, 4, 8, 12] {
            assert_eq!(
                map.get(&key_for(hash as u64), hash, NOT_FOUND).unwrap(),
                hash as i64 + 100
            );
        }

        // Bucket 0 on disk holds exactly the four entries, the other
        // buckets were never written
        let index = map.bucket_index_to_bucket_location();
        let data = map
            .file_collection()
            .read_data_item_using_index(index, 0)
            .unwrap()
            .unwrap();
        let mut bucket = Bucket::new();
        bucket.read_from(&data).unwrap();
        assert_eq!(bucket.bucket_index(), 0);
        assert_eq!(bucket.entry_count(), 4);
        for b in 1..4 {
            assert_eq!(index.get(b).unwrap(), NON_EXISTENT_DATA_LOCATION);
        }
    }

    #[test]
    fn test_put_then_put_if_equal_in_one_session() {
        let dir = tempfile::tempdir().unwrap();
        let map = new_map(dir.path());
        map.start_writing();
        map.put(&key_for(1), hash_for(1), 100);
        map.put_if_equal(&key_for(1), hash_for(1), 100, 200);
        map.end_writing().unwrap();
        assert_eq!(map.get(&key_for(1), hash_for(1), NOT_FOUND).unwrap(), 200);
    }

    #[test]
    fn test_put_if_equal_against_committed_value() {
        let dir = tempfile::tempdir().unwrap();
        let map = new_map(dir.path());
        put_range(&map, 1, 1, 1); // key 1 -> 1

        // Matching old value wins
        map.start_writing();
        map.put_if_equal(&key_for(1), hash_for(1), 1, 7);
        map.end_writing().unwrap();
        assert_eq!(map.get(&key_for(1), hash_for(1), NOT_FOUND).unwrap(), 7);

        // Stale old value is rejected, the map is unchanged
        map.start_writing();
        map.put_if_equal(&key_for(1), hash_for(1), 1, 9);
        map.end_writing().unwrap();
        assert_eq!(map.get(&key_for(1), hash_for(1), NOT_FOUND).unwrap(), 7);
    }

    #[test]
    fn test_delete_if_equal_with_wrong_old_value_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let map = new_map(dir.path());
        put_range(&map, 1, 1, 1); // key 1 -> 1

        map.start_writing();
        map.delete_if_equal(&key_for(1), hash_for(1), 2);
        map.end_writing().unwrap();
        assert_eq!(map.get(&key_for(1), hash_for(1), NOT_FOUND).unwrap(), 1);

        map.start_writing();
        map.delete_if_equal(&key_for(1), hash_for(1), 1);
        map.end_writing().unwrap();
        assert_eq!(map.get(&key_for(1), hash_for(1), NOT_FOUND).unwrap(), NOT_FOUND);
    }

    #[test]
    fn test_re_put_in_one_session_keeps_last_value() {
        let dir = tempfile::tempdir().unwrap();
        let map = new_map(dir.path());
        map.start_writing();
        map.put(&key_for(3), hash_for(3), 10);
        map.put(&key_for(3), hash_for(3), 20);
        map.end_writing().unwrap();
        assert_eq!(map.get(&key_for(3), hash_for(3), NOT_FOUND).unwrap(), 20);
    }

    #[test]
    fn test_deleting_last_entry_removes_bucket_from_index() {
        let dir = tempfile::tempdir().unwrap();
        let map = new_map(dir.path());
        let hash = hash_for(5);
        put_range(&map, 5, 1, 1);

        let bucket_index = (hash & (map.num_of_buckets() - 1)) as u64;
        let index = map.bucket_index_to_bucket_location();
        assert_ne!(index.get(bucket_index).unwrap(), NON_EXISTENT_DATA_LOCATION);

        map.start_writing();
        map.delete(&key_for(5), hash);
        map.end_writing().unwrap();

        assert_eq!(map.get(&key_for(5), hash, NOT_FOUND).unwrap(), NOT_FOUND);
        // The bucket went empty, so its index entry is gone, not just blank
        assert_eq!(index.get(bucket_index).unwrap(), NON_EXISTENT_DATA_LOCATION);
    }

    #[test]
    fn test_empty_session_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let map = new_map(dir.path());
        map.start_writing();
        assert_eq!(map.end_writing().unwrap(), None);
    }

    #[test]
    fn test_resize_preserves_all_keys() {
        let dir = tempfile::tempdir().unwrap();
        let map =
            HalfDiskHashMap::new(small_bucket_config(), 16, &dir.path().join("store"), "test")
                .unwrap();
        assert_eq!(map.num_of_buckets(), 4);

        let count = 200;
        put_range(&map, 0, count, 3);

        // Drive the table through several doublings
        let mut doublings = 0;
        loop {
            let before = map.num_of_buckets();
            map.resize_if_needed(0, count as i64 - 1).unwrap();
            let after = map.num_of_buckets();
            assert!(after.is_power_of_two());
            if after == before {
                break;
            }
            assert_eq!(after, before * 2);
            doublings += 1;
        }
        assert!(doublings >= 2, "expected the table to double, got {doublings}");

        // Every key is still readable with its last written value
        check_range(&map, 0, count, 3);

        // The next flush sanitizes relocated buckets and nothing is lost
        put_range(&map, 0, count, 5);
        check_range(&map, 0, count, 5);
    }

    #[test]
    fn test_concurrent_reads_during_flush() {
        let dir = tempfile::tempdir().unwrap();
        let map = new_map(dir.path());
        let count = 500;
        put_range(&map, 0, count, 1);

        map.start_writing();
        for i in 0..count {
            map.put(&key_for(i), hash_for(i), i as i64 + 10_000);
        }
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for i in 0..count {
                        let value = map.get(&key_for(i), hash_for(i), NOT_FOUND).unwrap();
                        // Readers see the old or the new value, nothing else
                        assert!(
                            value == i as i64 || value == i as i64 + 10_000,
                            "key {i} read {value}"
                        );
                    }
                });
            }
            map.end_writing().unwrap();
        });
        for i in 0..count {
            assert_eq!(
                map.get(&key_for(i), hash_for(i), NOT_FOUND).unwrap(),
                i as i64 + 10_000
            );
        }
    }

    #[test]
    #[should_panic(expected = "without calling start_writing")]
    fn test_put_without_session_panics() {
        let dir = tempfile::tempdir().unwrap();
        let map = new_map(dir.path());
        map.put(&key_for(1), hash_for(1), 1);
    }

    #[test]
    fn test_put_from_wrong_thread_panics() {
        let dir = tempfile::tempdir().unwrap();
        let map = new_map(dir.path());
        map.start_writing();
        thread::scope(|s| {
            let result = s
                .spawn(|| {
                    map.put(&key_for(1), hash_for(1), 1);
                })
                .join();
            assert!(result.is_err(), "write from a foreign thread must panic");
        });
        map.end_writing().unwrap();
    }

    #[test]
    fn test_load_from_directory_without_metadata_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("store")).unwrap();
        HalfDiskHashMap::new(test_config(), 10_000, &dir.path().join("store"), "test")
            .unwrap_err();
    }

    #[test]
    fn test_load_with_bad_metadata_version_fails() {
        let dir = tempfile::tempdir().unwrap();
        let map = new_map(dir.path());
        put_range(&map, 1, 10, 1);
        let snapshot_dir = dir.path().join("snapshot");
        map.snapshot(&snapshot_dir).unwrap();

        let metadata = snapshot_dir.join("test_metadata.hdhm");
        let mut file = std::fs::OpenOptions::new().write(true).open(&metadata).unwrap();
        file.write_all(&99u32.to_le_bytes()).unwrap();
        drop(file);

        HalfDiskHashMap::new(test_config(), 10_000, &snapshot_dir, "test").unwrap_err();
    }

    #[test]
    fn test_missing_index_snapshot_is_rebuilt_from_data_files() {
        let dir = tempfile::tempdir().unwrap();
        let map = new_map(dir.path());
        let count = 300;
        put_range(&map, 1, count, 1);
        // A couple of sessions so the rebuild has to pick the latest copies
        put_range(&map, 1, 100, 7);

        let snapshot_dir = dir.path().join("snapshot");
        map.snapshot(&snapshot_dir).unwrap();
        std::fs::remove_file(snapshot_dir.join("test_bucket_index.ll")).unwrap();

        let rebuilt = HalfDiskHashMap::new(test_config(), 10_000, &snapshot_dir, "test").unwrap();
        check_range(&rebuilt, 1, 100, 7);
        check_range(&rebuilt, 101, count - 100, 1);
    }

    #[test]
    fn test_disk_based_index_variant() {
        let dir = tempfile::tempdir().unwrap();
        let config = MapConfig {
            prefer_disk_based_index: true,
            ..test_config()
        };
        let map = HalfDiskHashMap::new(config.clone(), 10_000, &dir.path().join("store"), "test")
            .unwrap();
        assert_eq!(map.off_heap_consumption(), 0);
        put_range(&map, 1, 200, 1);
        check_range(&map, 1, 200, 1);

        let snapshot_dir = dir.path().join("snapshot");
        map.snapshot(&snapshot_dir).unwrap();
        let reloaded = HalfDiskHashMap::new(config, 10_000, &snapshot_dir, "test").unwrap();
        check_range(&reloaded, 1, 200, 1);
    }

    #[test]
    fn test_flush_self_heals_bucket_with_corrupt_index() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = dir.path().join("store");
        let map = HalfDiskHashMap::new(small_bucket_config(), 16, &store_dir, "test").unwrap();

        // One committed key in bucket 0
        map.start_writing();
        map.put(&key_for(0), 0, 11);
        map.end_writing().unwrap();

        // Rewrite the stored bucket's index field to a slot it cannot
        // belong to, fixing up the record checksum
        let location = map.bucket_index_to_bucket_location().get(0).unwrap();
        assert_ne!(location, NON_EXISTENT_DATA_LOCATION);
        let offset = (location & ((1 << 40) - 1)) as u64;
        let path = store_dir.join("test_0.hdd");
        let mut file = std::fs::OpenOptions::new().read(true).write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(offset)).unwrap();
        let mut frame = [0u8; 8];
        file.read_exact(&mut frame).unwrap();
        let len = u32::from_le_bytes(frame[0..4].try_into().unwrap()) as usize;
        let mut payload = vec![0u8; len];
        file.read_exact(&mut payload).unwrap();
        payload[0..4].copy_from_slice(&3u32.to_le_bytes());
        file.seek(SeekFrom::Start(offset + 4)).unwrap();
        file.write_all(&crc32fast::hash(&payload).to_le_bytes()).unwrap();
        file.write_all(&payload).unwrap();
        drop(file);

        // The next flush touching bucket 0 detects the mismatch, clears the
        // garbage and applies its own mutation instead of failing
        map.start_writing();
        map.put(&key_for(4), 4, 22);
        map.end_writing().unwrap();

        assert_eq!(map.get(&key_for(4), 4, NOT_FOUND).unwrap(), 22);
        assert_eq!(map.get(&key_for(0), 0, NOT_FOUND).unwrap(), NOT_FOUND);
    }

    // --- Repair ---

    #[derive(Default)]
    struct MapRecordSource {
        records: HashMap<i64, Vec<u8>>,
    }

    impl RecordSource for MapRecordSource {
        fn key_at(&self, path: i64) -> std::io::Result<Option<Vec<u8>>> {
            Ok(self.records.get(&path).cloned())
        }
    }

    #[test]
    fn test_repair_removes_stale_keys() {
        let dir = tempfile::tempdir().unwrap();
        let map = new_map(dir.path());
        map.start_writing();
        for i in 1..=4u64 {
            map.put(&key_for(i), hash_for(i), i as i64);
        }
        map.end_writing().unwrap();

        // The authoritative store only knows paths 2..=4
        let mut source = MapRecordSource::default();
        for i in 2..=4u64 {
            source.records.insert(i as i64, key_for(i));
        }
        map.repair(2, 4, &source).unwrap();

        assert_eq!(map.get(&key_for(1), hash_for(1), NOT_FOUND).unwrap(), NOT_FOUND);
        for i in 2..=4u64 {
            assert_eq!(map.get(&key_for(i), hash_for(i), NOT_FOUND).unwrap(), i as i64);
        }
    }

    #[test]
    fn test_repair_removes_keys_with_changed_records() {
        let dir = tempfile::tempdir().unwrap();
        let map = new_map(dir.path());
        map.start_writing();
        for i in 1..=3u64 {
            map.put(&key_for(i), hash_for(i), i as i64);
        }
        map.end_writing().unwrap();

        // Path 2 now belongs to a different key; path 100 replaces it
        let mut source = MapRecordSource::default();
        source.records.insert(1, key_for(1));
        source.records.insert(2, key_for(100));
        source.records.insert(3, key_for(3));
        map.start_writing();
        map.put(&key_for(100), hash_for(100), 2);
        map.end_writing().unwrap();

        map.repair(1, 3, &source).unwrap();
        assert_eq!(map.get(&key_for(2), hash_for(2), NOT_FOUND).unwrap(), NOT_FOUND);
        assert_eq!(map.get(&key_for(1), hash_for(1), NOT_FOUND).unwrap(), 1);
        assert_eq!(map.get(&key_for(100), hash_for(100), NOT_FOUND).unwrap(), 2);
        assert_eq!(map.get(&key_for(3), hash_for(3), NOT_FOUND).unwrap(), 3);
    }

    #[test]
    fn test_repair_fails_on_live_entry_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let map = new_map(dir.path());
        map.start_writing();
        for i in 1..=3u64 {
            map.put(&key_for(i), hash_for(i), i as i64);
        }
        map.end_writing().unwrap();

        let mut source = MapRecordSource::default();
        for i in 1..=3u64 {
            source.records.insert(i as i64, key_for(i));
        }
        // The expected range claims a fourth live path that does not exist
        map.repair(1, 4, &source).unwrap_err();
    }
}
