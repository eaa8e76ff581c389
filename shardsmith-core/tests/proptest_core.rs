//! Property-based tests for version resolution and split writing.

use proptest::prelude::*;

use shardsmith_core::config::WriterSettings;
use shardsmith_core::example::example;
use shardsmith_core::records::RecordReader;
use shardsmith_core::writer::{SplitWriter, shard_lengths};
use shardsmith_core::{
    DatasetError, EXPERIMENTAL_LATEST, ExampleKey, Feature, JsonCodec, Version, VersionSet,
};

fn version() -> impl Strategy<Value = Version> {
    (0u32..4, 0u32..4, 0u32..4).prop_map(|(a, b, c)| Version::new(a, b, c))
}

fn version_set() -> impl Strategy<Value = VersionSet> {
    (version(), prop::collection::vec(version(), 0..5))
        .prop_map(|(canonical, supported)| VersionSet::new("d", canonical, supported))
}

// --- Version resolution ---

proptest! {
    #[test]
    fn resolve_exact_returns_first_listed_match(set in version_set(), wanted in version()) {
        let candidates: Vec<Version> = set.candidates().cloned().collect();
        match set.resolve(Some(&wanted.to_string())) {
            Ok(v) => {
                prop_assert_eq!(&v, &wanted);
                prop_assert!(candidates.contains(&wanted));
            }
            Err(DatasetError::VersionResolution { available, .. }) => {
                prop_assert!(!candidates.contains(&wanted));
                let listed: Vec<String> = candidates.iter().map(|v| v.to_string()).collect();
                prop_assert_eq!(available, listed);
            }
            Err(other) => prop_assert!(false, "unexpected error {}", other),
        }
    }

    #[test]
    fn resolve_wildcard_patch_picks_first_candidate(set in version_set(), major in 0u32..4, minor in 0u32..4) {
        let request = format!("{major}.{minor}.*");
        let expected = set
            .candidates()
            .find(|v| v.major == major && v.minor == minor)
            .cloned();
        match (set.resolve(Some(&request)), expected) {
            (Ok(v), Some(e)) => prop_assert_eq!(v, e),
            (Err(DatasetError::VersionResolution { .. }), None) => {}
            (got, want) => prop_assert!(false, "got {:?}, want {:?}", got.map(|v| v.to_string()), want),
        }
    }

    #[test]
    fn experimental_latest_is_the_maximum(set in version_set()) {
        let max = set.candidates().max().cloned().unwrap();
        prop_assert_eq!(set.resolve(Some(EXPERIMENTAL_LATEST)).unwrap(), max);
    }

    #[test]
    fn unset_request_is_canonical(set in version_set()) {
        prop_assert_eq!(&set.resolve(None).unwrap(), set.canonical());
    }

    #[test]
    fn version_order_matches_tuple_order(a in version(), b in version()) {
        let ta = (a.major, a.minor, a.patch);
        let tb = (b.major, b.minor, b.patch);
        prop_assert_eq!(a.cmp(&b), ta.cmp(&tb));
    }
}

// --- Split writing ---

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn shard_lengths_partition_exactly(n in 0u64..10_000, count in 1u64..64) {
        let lengths = shard_lengths(n, count);
        prop_assert_eq!(lengths.len() as u64, count);
        prop_assert_eq!(lengths.iter().sum::<u64>(), n);
        let (lo, hi) = (lengths.iter().min().unwrap(), lengths.iter().max().unwrap());
        prop_assert!(hi - lo <= 1);
    }

    #[test]
    fn shard_contents_do_not_depend_on_input_order(
        keys in prop::collection::btree_set(-1_000i64..1_000, 1..120),
        seed in any::<u64>(),
    ) {
        use rand::SeedableRng;
        use rand::seq::SliceRandom;

        let settings = WriterSettings {
            min_shard_bytes: 64,
            max_shard_bytes: 512,
            max_shards: 4,
            shuffle_memory_bytes: 512,
        };
        let ordered: Vec<i64> = keys.into_iter().collect();
        let mut shuffled = ordered.clone();
        shuffled.shuffle(&mut rand::rngs::StdRng::seed_from_u64(seed));

        let write = |keys: &[i64]| {
            let dir = tempfile::TempDir::new().unwrap();
            let items = keys
                .iter()
                .map(|&k| Ok((ExampleKey::Int(k), example([("k", Feature::Int(k))]))))
                .collect::<Vec<_>>();
            let outcome = SplitWriter::new("d", "train", dir.path(), &settings)
                .write_all(items, &JsonCodec)
                .unwrap();
            let contents: Vec<Vec<Vec<u8>>> = outcome
                .files
                .iter()
                .map(|f| RecordReader::open(f).unwrap().map(|r| r.unwrap()).collect())
                .collect();
            (outcome.shard_lengths, contents)
        };

        prop_assert_eq!(write(&ordered), write(&shuffled));
    }
}
