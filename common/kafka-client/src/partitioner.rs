//! Client-side key to partition mapping.
//!
//! Producers written against librdkafka, the Java client and Filebeat place keyed
//! messages with different hash functions. Reproducing them bit-for-bit lets a Rust
//! service compute the partition a message *will* land on (or pin it explicitly) and
//! stay consistent with the other writers and readers of the topic.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use thiserror::Error;

use crate::message::PARTITION_ANY;

const MURMUR2_SEED: u32 = 0x9747_b28c;
const MURMUR2_M: u32 = 0x5bd1_e995;
const MURMUR2_R: u32 = 24;

const FNV32_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;

// Bucket used for absent keys by the deterministic algorithms
const NULL_KEY_INDEX: usize = 0;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PartitionError {
    #[error("cannot pick a partition from an empty partition list")]
    NoPartitions,
    #[error("unknown partition algorithm: {0}")]
    UnknownAlgorithm(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionAlgorithm {
    /// Uniformly random for every message, keyed or not
    Random,
    /// CRC32 of the key
    Consistent,
    /// CRC32 of the key, random for absent keys
    ConsistentRandom,
    /// Java client compatible murmur2
    Murmur2,
    /// murmur2, random for absent keys
    Murmur2Random,
    Fnv1a,
    Fnv1aRandom,
    /// Filebeat's FNV-1 based placement
    Filebeat,
}

impl PartitionAlgorithm {
    /// Name of the equivalent librdkafka `partitioner` setting, if there is one
    pub fn librdkafka_name(&self) -> Option<&'static str> {
        match self {
            PartitionAlgorithm::Random => Some("random"),
            PartitionAlgorithm::Consistent => Some("consistent"),
            PartitionAlgorithm::ConsistentRandom => Some("consistent_random"),
            PartitionAlgorithm::Murmur2 => Some("murmur2"),
            PartitionAlgorithm::Murmur2Random => Some("murmur2_random"),
            PartitionAlgorithm::Fnv1a => Some("fnv1a"),
            PartitionAlgorithm::Fnv1aRandom => Some("fnv1a_random"),
            PartitionAlgorithm::Filebeat => None,
        }
    }

    fn name(&self) -> &'static str {
        self.librdkafka_name().unwrap_or("filebeat")
    }

    fn is_random_for_null_keys(&self) -> bool {
        matches!(
            self,
            PartitionAlgorithm::Random
                | PartitionAlgorithm::ConsistentRandom
                | PartitionAlgorithm::Murmur2Random
                | PartitionAlgorithm::Fnv1aRandom
        )
    }

    fn hash(&self, key: &[u8]) -> u32 {
        match self {
            PartitionAlgorithm::Consistent | PartitionAlgorithm::ConsistentRandom => {
                crc32fast::hash(key)
            }
            PartitionAlgorithm::Murmur2 | PartitionAlgorithm::Murmur2Random => {
                murmur2(key) & 0x7fff_ffff
            }
            PartitionAlgorithm::Fnv1a | PartitionAlgorithm::Fnv1aRandom => fnv1a(key),
            PartitionAlgorithm::Filebeat => fnv1(key),
            // Never hashed, handled before we get here
            PartitionAlgorithm::Random => 0,
        }
    }
}

impl FromStr for PartitionAlgorithm {
    type Err = PartitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "random" => Ok(PartitionAlgorithm::Random),
            "consistent" => Ok(PartitionAlgorithm::Consistent),
            "consistent_random" => Ok(PartitionAlgorithm::ConsistentRandom),
            "murmur2" => Ok(PartitionAlgorithm::Murmur2),
            "murmur2_random" => Ok(PartitionAlgorithm::Murmur2Random),
            "fnv1a" => Ok(PartitionAlgorithm::Fnv1a),
            "fnv1a_random" => Ok(PartitionAlgorithm::Fnv1aRandom),
            "filebeat" => Ok(PartitionAlgorithm::Filebeat),
            _ => Err(PartitionError::UnknownAlgorithm(s.to_string())),
        }
    }
}

impl fmt::Display for PartitionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Picks the partition for `key` out of `partitions`.
///
/// `None` and `Some(&[])` are different keys: an absent key goes to a fixed bucket
/// (or a random one for the `*_random` algorithms) while an empty key is hashed.
/// Returns [`PARTITION_ANY`] for an empty partition list, see [`try_get_partition`]
/// for the fallible version.
pub fn get_partition(key: Option<&[u8]>, partitions: &[i32], algorithm: PartitionAlgorithm) -> i32 {
    try_get_partition(key, partitions, algorithm).unwrap_or(PARTITION_ANY)
}

pub fn try_get_partition(
    key: Option<&[u8]>,
    partitions: &[i32],
    algorithm: PartitionAlgorithm,
) -> Result<i32, PartitionError> {
    if partitions.is_empty() {
        return Err(PartitionError::NoPartitions);
    }

    let index = match key {
        _ if algorithm == PartitionAlgorithm::Random => random_index(partitions.len()),
        None if algorithm.is_random_for_null_keys() => random_index(partitions.len()),
        None => NULL_KEY_INDEX,
        Some(key) => algorithm.hash(key) as usize % partitions.len(),
    };

    Ok(partitions[index])
}

fn random_index(count: usize) -> usize {
    rand::thread_rng().gen_range(0..count)
}

/// 32-bit murmur2 as implemented by the Java client's `Utils.murmur2`
pub fn murmur2(data: &[u8]) -> u32 {
    let length = data.len();
    let mut h = MURMUR2_SEED ^ (length as u32);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(MURMUR2_M);
        k ^= k >> MURMUR2_R;
        k = k.wrapping_mul(MURMUR2_M);
        h = h.wrapping_mul(MURMUR2_M);
        h ^= k;
    }

    // Java falls through from the 3-byte case down to the 1-byte case
    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        h ^= u32::from(tail[1]) << 8;
    }
    if !tail.is_empty() {
        h ^= u32::from(tail[0]);
        h = h.wrapping_mul(MURMUR2_M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(MURMUR2_M);
    h ^= h >> 15;
    h
}

pub fn fnv1a(data: &[u8]) -> u32 {
    data.iter().fold(FNV32_OFFSET_BASIS, |h, b| {
        (h ^ u32::from(*b)).wrapping_mul(FNV32_PRIME)
    })
}

pub fn fnv1(data: &[u8]) -> u32 {
    data.iter().fold(FNV32_OFFSET_BASIS, |h, b| {
        h.wrapping_mul(FNV32_PRIME) ^ u32::from(*b)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [PartitionAlgorithm; 8] = [
        PartitionAlgorithm::Random,
        PartitionAlgorithm::Consistent,
        PartitionAlgorithm::ConsistentRandom,
        PartitionAlgorithm::Murmur2,
        PartitionAlgorithm::Murmur2Random,
        PartitionAlgorithm::Fnv1a,
        PartitionAlgorithm::Fnv1aRandom,
        PartitionAlgorithm::Filebeat,
    ];

    fn partitions(count: i32) -> Vec<i32> {
        (0..count).collect()
    }

    #[test]
    fn test_reference_vectors() {
        let key = Some(b"kafka".as_slice());

        assert_eq!(get_partition(key, &partitions(8), PartitionAlgorithm::Murmur2), 4);
        assert_eq!(get_partition(key, &partitions(3), PartitionAlgorithm::Fnv1a), 2);
        assert_eq!(get_partition(key, &partitions(3), PartitionAlgorithm::Filebeat), 0);
    }

    #[test]
    fn test_murmur2_matches_java_client() {
        // (key, partition count, expected partition)
        let cases: [(&[u8], i32, i32); 12] = [
            (b"a", 3, 1),
            (b"a", 8, 4),
            (b"ab", 8, 2),
            (b"abc", 10, 7),
            (b"hello", 8, 5),
            (b"hello", 10, 9),
            (b"foobar", 8, 6),
            (b"21", 17, 13),
            (b"kafka", 3, 1),
            (b"kafka", 17, 14),
            (b"", 8, 1),
            (b"", 17, 11),
        ];

        for (key, count, expected) in cases {
            assert_eq!(
                get_partition(Some(key), &partitions(count), PartitionAlgorithm::Murmur2),
                expected,
                "murmur2 of {:?} over {count} partitions",
                String::from_utf8_lossy(key)
            );
        }
    }

    #[test]
    fn test_fnv_families() {
        let cases: [(&[u8], i32, i32, i32); 6] = [
            // (key, count, fnv1a, filebeat)
            (b"a", 8, 4, 6),
            (b"ab", 10, 6, 2),
            (b"abc", 3, 2, 0),
            (b"hello", 10, 3, 3),
            (b"foobar", 3, 1, 1),
            (b"kafka", 10, 5, 9),
        ];

        for (key, count, fnv1a_expected, filebeat_expected) in cases {
            let key = Some(key);
            assert_eq!(
                get_partition(key, &partitions(count), PartitionAlgorithm::Fnv1a),
                fnv1a_expected
            );
            assert_eq!(
                get_partition(key, &partitions(count), PartitionAlgorithm::Filebeat),
                filebeat_expected
            );
        }
    }

    #[test]
    fn test_consistent_is_crc32() {
        assert_eq!(crc32fast::hash(b"kafka"), 0x5bbc_7517);
        assert_eq!(
            get_partition(Some(b"kafka".as_slice()), &partitions(8), PartitionAlgorithm::Consistent),
            7
        );
        assert_eq!(
            get_partition(Some(b"abc".as_slice()), &partitions(10), PartitionAlgorithm::ConsistentRandom),
            8
        );
    }

    #[test]
    fn test_raw_hashes() {
        assert_eq!(murmur2(b"kafka"), 0xd067_cf64);
        assert_eq!(murmur2(b""), 275_646_681);
        assert_eq!(fnv1a(b"kafka"), 0x0d33_c4e1);
        assert_eq!(fnv1(b"kafka"), 0x86cc_f529);
        assert_eq!(fnv1a(b""), FNV32_OFFSET_BASIS);
    }

    #[test]
    fn test_returns_partition_ids_not_indexes() {
        let ids = [10, 20, 30, 40, 50, 60, 70, 80];
        assert_eq!(get_partition(Some(b"kafka".as_slice()), &ids, PartitionAlgorithm::Murmur2), 50);
    }

    #[test]
    fn test_deterministic_algorithms_are_stable() {
        let keys: [Option<&[u8]>; 4] = [None, Some(b"".as_slice()), Some(b"user-42".as_slice()), Some(b"\x00\xff\x10".as_slice())];
        for algorithm in ALL {
            if algorithm.is_random_for_null_keys() {
                continue;
            }
            for count in [1, 2, 7, 64] {
                for key in keys {
                    let first = get_partition(key, &partitions(count), algorithm);
                    for _ in 0..10 {
                        assert_eq!(get_partition(key, &partitions(count), algorithm), first);
                    }
                }
            }
        }
    }

    #[test]
    fn test_null_and_empty_keys_differ_for_murmur2() {
        let two = partitions(2);
        let null = get_partition(None, &two, PartitionAlgorithm::Murmur2);
        let empty = get_partition(Some(b"".as_slice()), &two, PartitionAlgorithm::Murmur2);

        assert_eq!(null, 0);
        assert_eq!(empty, 1);
        assert_ne!(null, empty);
    }

    #[test]
    fn test_random_paths_stay_in_range() {
        let ids = [3, 5, 7];
        for _ in 0..200 {
            assert!(ids.contains(&get_partition(None, &ids, PartitionAlgorithm::Random)));
            assert!(ids.contains(&get_partition(
                Some(b"kafka".as_slice()),
                &ids,
                PartitionAlgorithm::Random
            )));
            assert!(ids.contains(&get_partition(None, &ids, PartitionAlgorithm::Murmur2Random)));
            assert!(ids.contains(&get_partition(None, &ids, PartitionAlgorithm::Fnv1aRandom)));
        }

        // Keyed messages on the *_random variants are still hashed
        assert_eq!(
            get_partition(Some(b"kafka".as_slice()), &partitions(8), PartitionAlgorithm::Murmur2Random),
            4
        );
    }

    #[test]
    fn test_empty_partition_list() {
        assert_eq!(
            try_get_partition(Some(b"kafka".as_slice()), &[], PartitionAlgorithm::Murmur2),
            Err(PartitionError::NoPartitions)
        );
        assert_eq!(
            get_partition(Some(b"kafka".as_slice()), &[], PartitionAlgorithm::Murmur2),
            PARTITION_ANY
        );
    }

    #[test]
    fn test_algorithm_names_round_trip() {
        for algorithm in ALL {
            assert_eq!(algorithm.to_string().parse::<PartitionAlgorithm>(), Ok(algorithm));
        }
        assert_eq!("MURMUR2".parse::<PartitionAlgorithm>(), Ok(PartitionAlgorithm::Murmur2));
        assert_eq!(
            "sticky".parse::<PartitionAlgorithm>(),
            Err(PartitionError::UnknownAlgorithm("sticky".to_string()))
        );
    }
}
