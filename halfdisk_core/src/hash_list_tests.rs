#[cfg(test)]
mod tests {
    use byteorder::{LittleEndian, WriteBytesExt};
    use std::io::Write;

    use crate::hash_list::{HashList, HashListConfig, HASH_SIZE_BYTES};
    use crate::long_index::FILE_FORMAT_VERSION_V1;

    fn small_config() -> HashListConfig {
        HashListConfig {
            hashes_per_buffer: 8,
        }
    }

    fn hash_of(seed: u8) -> [u8; HASH_SIZE_BYTES] {
        let mut hash = [0u8; HASH_SIZE_BYTES];
        for (i, byte) in hash.iter_mut().enumerate() {
            *byte = seed.wrapping_add(i as u8);
        }
        hash
    }

    #[test]
    fn test_put_and_get() {
        let list = HashList::new(100, &small_config());
        assert_eq!(list.size(), 0);
        assert_eq!(list.capacity(), 100);
        assert_eq!(list.get(0), None);

        // Spans several buffers with an 8-hash buffer size
        for i in 0..30u8 {
            list.put(i as u64, &hash_of(i));
        }
        assert_eq!(list.size(), 30);
        for i in 0..30u8 {
            assert_eq!(list.get(i as u64), Some(hash_of(i)), "index {i}");
        }
        // Indices past the size read as absent
        assert_eq!(list.get(30), None);
        assert_eq!(list.get(99), None);
    }

    #[test]
    fn test_sparse_put_reads_zero_hashes_below_size() {
        let list = HashList::new(100, &small_config());
        list.put(20, &hash_of(9));
        assert_eq!(list.size(), 21);
        // Slots below the high-water mark exist but were never written
        assert_eq!(list.get(3), Some([0u8; HASH_SIZE_BYTES]));
        assert_eq!(list.get(20), Some(hash_of(9)));
    }

    #[test]
    fn test_overwrite() {
        let list = HashList::new(10, &small_config());
        list.put(4, &hash_of(1));
        list.put(4, &hash_of(2));
        assert_eq!(list.get(4), Some(hash_of(2)));
        assert_eq!(list.size(), 5);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_put_out_of_range_panics() {
        let list = HashList::new(10, &small_config());
        list.put(10, &hash_of(0));
    }

    #[test]
    fn test_file_round_trip() {
        let config = small_config();
        let list = HashList::new(64, &config);
        for i in 0..20u8 {
            list.put(i as u64, &hash_of(i.wrapping_mul(3)));
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hashes.hl");
        list.write_to_file(&path).unwrap();

        let loaded = HashList::from_file(&path, 64, &config).unwrap();
        assert_eq!(loaded.size(), 20);
        assert_eq!(loaded.capacity(), 64);
        for i in 0..20u8 {
            assert_eq!(loaded.get(i as u64), Some(hash_of(i.wrapping_mul(3))));
        }
        assert_eq!(loaded.get(20), None);
    }

    #[test]
    fn test_load_capacity_mismatch_fails() {
        let config = small_config();
        let list = HashList::new(64, &config);
        list.put(0, &hash_of(1));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hashes.hl");
        list.write_to_file(&path).unwrap();

        HashList::from_file(&path, 65, &config).unwrap_err();
    }

    #[test]
    fn test_load_legacy_v1_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.hl");
        let mut file = std::fs::File::create(&path).unwrap();
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(FILE_FORMAT_VERSION_V1).unwrap();
        buf.write_u32::<LittleEndian>(1024).unwrap(); // hashes per buffer
        buf.write_u64::<LittleEndian>(5000).unwrap(); // max hashes
        buf.write_u8(0).unwrap(); // on-heap flag
        buf.write_u64::<LittleEndian>(777).unwrap(); // max index
        buf.write_u64::<LittleEndian>(2).unwrap(); // size
        buf.write_u32::<LittleEndian>(1).unwrap(); // num buffers
        buf.write_all(&hash_of(50)).unwrap();
        buf.write_all(&hash_of(51)).unwrap();
        file.write_all(&buf).unwrap();

        let loaded = HashList::from_file(&path, 100, &small_config()).unwrap();
        assert_eq!(loaded.size(), 2);
        assert_eq!(loaded.get(0), Some(hash_of(50)));
        assert_eq!(loaded.get(1), Some(hash_of(51)));
        assert_eq!(loaded.get(2), None);
    }

    #[test]
    fn test_load_unsupported_version_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.hl");
        let mut file = std::fs::File::create(&path).unwrap();
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(7).unwrap();
        file.write_all(&buf).unwrap();

        HashList::from_file(&path, 100, &small_config()).unwrap_err();
    }
}
