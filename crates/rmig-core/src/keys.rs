/// Number of low bits holding the partition-local part of a key.
pub const KEY_BITS: u32 = 51;
/// Partition reserved for keys minted by the migrator. Target partitions never reach it.
pub const MIGRATOR_PARTITION: i64 = 99;

const LOCAL_KEY_MASK: i64 = (1 << KEY_BITS) - 1;

pub fn encode_key(partition: i64, local_key: i64) -> i64 {
    (partition << KEY_BITS) + local_key
}

pub fn partition_of(key: i64) -> i64 {
    key >> KEY_BITS
}

pub fn local_key_of(key: i64) -> i64 {
    key & LOCAL_KEY_MASK
}

pub fn is_migrator_key(key: i64) -> bool {
    partition_of(key) == MIGRATOR_PARTITION
}

/// Hands out strictly increasing keys inside one partition.
///
/// Instance, element and job keys of migrated instances are assigned by the target engine, so a
/// target connector allocates them in its own partition with [`KeyAllocator::for_partition`].
/// [`KeyAllocator::new`] is reserved for ids the migrator mints itself, which land in
/// [`MIGRATOR_PARTITION`] and can be told apart with [`is_migrator_key`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyAllocator {
    partition: i64,
    next_local: i64,
}

impl Default for KeyAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyAllocator {
    pub fn new() -> Self {
        Self::for_partition(MIGRATOR_PARTITION)
    }

    pub fn for_partition(partition: i64) -> Self {
        Self {
            partition,
            next_local: 1,
        }
    }

    pub fn partition(&self) -> i64 {
        self.partition
    }

    /// Never hand out `key` or anything below it again. Keys of other partitions are ignored.
    pub fn resume_after(&mut self, key: i64) {
        if partition_of(key) != self.partition {
            return;
        }
        let local = local_key_of(key);
        if local >= self.next_local {
            self.next_local = local + 1;
        }
    }

    /// `None` once the partition's local key space is used up.
    pub fn next_key(&mut self) -> Option<i64> {
        if self.next_local > LOCAL_KEY_MASK {
            return None;
        }
        let key = encode_key(self.partition, self.next_local);
        self.next_local += 1;
        Some(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_carry_the_migrator_partition() {
        let mut allocator = KeyAllocator::new();
        let first = allocator.next_key().expect("key");
        let second = allocator.next_key().expect("key");

        assert!(second > first);
        assert!(is_migrator_key(first));
        assert_eq!(partition_of(first), MIGRATOR_PARTITION);
        assert_eq!(local_key_of(first), 1);
        assert_eq!(first, 99 * (1_i64 << 51) + 1);
    }

    #[test]
    fn resume_skips_past_previously_issued_keys_only_in_own_partition() {
        let mut allocator = KeyAllocator::new();
        allocator.resume_after(encode_key(MIGRATOR_PARTITION, 41));
        allocator.resume_after(encode_key(MIGRATOR_PARTITION, 12));
        allocator.resume_after(encode_key(1, 5_000));

        let key = allocator.next_key().expect("key");
        assert_eq!(local_key_of(key), 42);
    }

    #[test]
    fn target_engine_keys_are_not_migrator_keys() {
        assert!(!is_migrator_key(encode_key(1, 2_251_799_813_685_249)));
        assert!(!is_migrator_key(2_251_799_813_685_249));
    }

    #[test]
    fn exhausted_partition_stops_issuing_keys() {
        let mut allocator = KeyAllocator::for_partition(3);
        allocator.resume_after(encode_key(3, LOCAL_KEY_MASK));
        assert_eq!(allocator.next_key(), None);
        assert_eq!(allocator.partition(), 3);
    }
}
