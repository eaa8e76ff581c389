//! Split writer: turns `(key, example)` pairs into sharded record files.
//!
//! The writer owns every decision about shard topology. Callers hand it
//! keyed, encoded examples; it orders them by key hash, picks a shard count
//! from the total volume, writes the shards and reports per-shard lengths
//! and the encoded byte total. Nothing is visible under the final shard
//! names until every shard of the split has been written.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::WriterSettings;
use crate::error::{DatasetError, Result};
use crate::example::{Example, ExampleCodec, ExampleKey};
use crate::records::RecordWriter;
use crate::shuffle::Shuffler;

/// Per-record overhead added to the payload total when sizing shards.
const RECORD_OVERHEAD: u64 = 16;
const PARTIAL_SUFFIX: &str = ".partial";

/// File name of shard `index` out of `count` for one split.
pub fn shard_filename(dataset: &str, split: &str, index: usize, count: usize) -> String {
    format!("{dataset}-{split}.{index:05}-of-{count:05}")
}

/// All shard file names of a split, in shard-index order.
pub fn shard_filenames(dataset: &str, split: &str, count: usize) -> Vec<String> {
    (0..count)
        .map(|i| shard_filename(dataset, split, i, count))
        .collect()
}

/// Pick a shard count for `num_examples` records totalling `payload_bytes`.
///
/// Shards stay between the configured minimum and maximum size where
/// possible, prefer the configured shard count, then powers of two below
/// it, and never hold fewer than one example each.
pub fn shard_count(payload_bytes: u64, num_examples: u64, settings: &WriterSettings) -> u64 {
    if num_examples == 0 {
        return 1;
    }
    let total = payload_bytes + num_examples * RECORD_OVERHEAD;
    let most = total / settings.min_shard_bytes.max(1);
    let least = total / settings.max_shard_bytes.max(1);
    let preferred = settings.max_shards.max(1);

    if least <= preferred && preferred <= most && num_examples >= preferred {
        return preferred;
    }
    if least > preferred {
        let mut n = preferred * 2;
        while n <= num_examples {
            if n >= least {
                return n;
            }
            n += preferred;
        }
        return num_examples;
    }
    let mut n = preferred / 2;
    while n >= 2 {
        if least <= n && n <= most && num_examples >= n {
            return n;
        }
        n /= 2;
    }
    1
}

/// Example counts per shard; consecutive shards differ by at most one.
pub fn shard_lengths(num_examples: u64, count: u64) -> Vec<u64> {
    let mut lengths = Vec::with_capacity(count as usize);
    let mut start = 0u64;
    for i in 1..=count {
        let end = (u128::from(num_examples) * u128::from(i) / u128::from(count)) as u64;
        lengths.push(end - start);
        start = end;
    }
    lengths
}

/// What a finalized split looks like on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitOutcome {
    pub shard_lengths: Vec<u64>,
    pub num_bytes: u64,
    pub files: Vec<PathBuf>,
}

/// Writes one split of one dataset into `data_dir`.
pub struct SplitWriter {
    dataset: String,
    split: String,
    data_dir: PathBuf,
    settings: WriterSettings,
    shuffler: Shuffler,
}

impl SplitWriter {
    pub fn new(dataset: &str, split: &str, data_dir: &Path, settings: &WriterSettings) -> Self {
        let spill_dir = data_dir.join(format!(
            ".shuffle-{split}-{}",
            uuid::Uuid::new_v4().simple()
        ));
        Self {
            dataset: dataset.to_string(),
            split: split.to_string(),
            data_dir: data_dir.to_path_buf(),
            settings: settings.clone(),
            shuffler: Shuffler::new(split, spill_dir, settings.shuffle_memory_bytes),
        }
    }

    pub fn split(&self) -> &str {
        &self.split
    }

    /// Add one encoded example.
    pub fn write(&mut self, key: &ExampleKey, payload: Vec<u8>) -> Result<()> {
        self.shuffler.add(key, payload)
    }

    /// Encode and write every pair from `examples`, then finalize.
    pub fn write_all<I>(mut self, examples: I, codec: &dyn ExampleCodec) -> Result<SplitOutcome>
    where
        I: IntoIterator<Item = Result<(ExampleKey, Example)>>,
    {
        for item in examples {
            let (key, example) = item?;
            let payload = codec.encode(&example)?;
            self.write(&key, payload)?;
        }
        self.finalize()
    }

    /// Write the shards and return their lengths and the encoded byte size.
    ///
    /// On error (a duplicate key, an I/O failure) every shard file of this
    /// split written so far is removed.
    pub fn finalize(self) -> Result<SplitOutcome> {
        let num_examples = self.shuffler.num_examples();
        let num_bytes = self.shuffler.payload_bytes();
        let count = shard_count(num_bytes, num_examples, &self.settings);
        let lengths = shard_lengths(num_examples, count);
        let names = shard_filenames(&self.dataset, &self.split, count as usize);
        let finals: Vec<PathBuf> = names.iter().map(|n| self.data_dir.join(n)).collect();
        let partials: Vec<PathBuf> = names
            .iter()
            .map(|n| self.data_dir.join(format!("{n}{PARTIAL_SUFFIX}")))
            .collect();

        tracing::debug!(
            split = %self.split,
            num_examples,
            num_bytes,
            shards = count,
            "finalizing split"
        );

        let records = self.shuffler.finish()?;
        if let Err(e) = write_shards(records, &lengths, &partials) {
            for partial in &partials {
                let _ = fs::remove_file(partial);
            }
            return Err(e);
        }
        for (partial, path) in partials.iter().zip(&finals) {
            fs::rename(partial, path)?;
        }

        Ok(SplitOutcome {
            shard_lengths: lengths,
            num_bytes,
            files: finals,
        })
    }
}

fn write_shards(
    mut records: crate::shuffle::SortedRecords,
    lengths: &[u64],
    paths: &[PathBuf],
) -> Result<()> {
    for (length, path) in lengths.iter().zip(paths) {
        let mut shard = RecordWriter::create(path)?;
        for _ in 0..*length {
            let record = records.next().ok_or_else(|| {
                DatasetError::corrupt(path, "shuffler yielded fewer records than counted")
            })??;
            shard.write(&record.payload)?;
        }
        shard.finish()?;
    }
    // Drain so a duplicate among the trailing records still surfaces.
    if let Some(extra) = records.next() {
        extra?;
        return Err(DatasetError::corrupt(
            paths.last().cloned().unwrap_or_default(),
            "shuffler yielded more records than counted",
        ));
    }
    Ok(())
}

/// A split writer shared between worker threads.
///
/// Placement is still a pure function of the key, so the result does not
/// depend on how many workers fed it or in what order.
pub struct ConcurrentSplitWriter {
    split: String,
    inner: Mutex<Option<SplitWriter>>,
}

impl ConcurrentSplitWriter {
    pub fn new(writer: SplitWriter) -> Self {
        Self {
            split: writer.split().to_string(),
            inner: Mutex::new(Some(writer)),
        }
    }

    pub fn split(&self) -> &str {
        &self.split
    }

    pub fn write(&self, key: &ExampleKey, payload: Vec<u8>) -> Result<()> {
        let mut guard = self.lock()?;
        match guard.as_mut() {
            Some(writer) => writer.write(key, payload),
            None => Err(DatasetError::engine(format!(
                "split '{}' written after finalize",
                self.split
            ))),
        }
    }

    pub fn finalize(&self) -> Result<SplitOutcome> {
        let writer = self.lock()?.take().ok_or_else(|| {
            DatasetError::engine(format!("split '{}' finalized twice", self.split))
        })?;
        writer.finalize()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<SplitWriter>>> {
        self.inner
            .lock()
            .map_err(|_| DatasetError::engine(format!("writer for '{}' poisoned", self.split)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::example::{Feature, JsonCodec, example};
    use crate::records::RecordReader;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn small_shards() -> WriterSettings {
        WriterSettings {
            min_shard_bytes: 64,
            max_shard_bytes: 256,
            max_shards: 4,
            shuffle_memory_bytes: u64::MAX,
        }
    }

    fn pairs(keys: impl Iterator<Item = i64>) -> Vec<Result<(ExampleKey, Example)>> {
        keys.map(|k| Ok((ExampleKey::Int(k), example([("id", Feature::Int(k))]))))
            .collect()
    }

    fn read_all(files: &[PathBuf]) -> Vec<Vec<Vec<u8>>> {
        files
            .iter()
            .map(|f| {
                RecordReader::open(f)
                    .unwrap()
                    .collect::<Result<Vec<_>>>()
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_shard_count_defaults_to_one_for_small_data() {
        let settings = WriterSettings::default();
        assert_eq!(shard_count(1000, 10, &settings), 1);
        assert_eq!(shard_count(0, 0, &settings), 1);
    }

    #[test]
    fn test_shard_count_prefers_configured_count() {
        let settings = small_shards();
        // 40 examples * (10 + 16) = 1040 bytes: between 4 and 16 shards allowed.
        assert_eq!(shard_count(400, 40, &settings), 4);
    }

    #[test]
    fn test_shard_count_never_exceeds_examples() {
        let settings = small_shards();
        assert!(shard_count(10_000, 3, &settings) <= 3);
    }

    #[test]
    fn test_shard_lengths_even_and_complete() {
        assert_eq!(shard_lengths(10, 4), vec![2, 3, 2, 3]);
        assert_eq!(shard_lengths(3, 1), vec![3]);
        assert_eq!(shard_lengths(0, 1), vec![0]);
    }

    #[test]
    fn test_shard_filename_scheme() {
        assert_eq!(shard_filename("mnist", "train", 1, 4), "mnist-train.00001-of-00004");
    }

    #[test]
    fn test_write_is_deterministic_by_key() {
        let dir = TempDir::new().unwrap();
        let a_dir = dir.path().join("a");
        let b_dir = dir.path().join("b");
        fs::create_dir_all(&a_dir).unwrap();
        fs::create_dir_all(&b_dir).unwrap();

        let a = SplitWriter::new("d", "train", &a_dir, &small_shards())
            .write_all(pairs(0..40), &JsonCodec)
            .unwrap();
        let b = SplitWriter::new("d", "train", &b_dir, &small_shards())
            .write_all(pairs((0..40).rev()), &JsonCodec)
            .unwrap();

        assert_eq!(a.shard_lengths, b.shard_lengths);
        assert_eq!(a.shard_lengths.iter().sum::<u64>(), 40);
        assert!(a.shard_lengths.len() > 1);
        assert_eq!(read_all(&a.files), read_all(&b.files));
    }

    #[test]
    fn test_duplicate_key_leaves_no_shards() {
        let dir = TempDir::new().unwrap();
        let mut items = pairs(0..10);
        items.push(Ok((ExampleKey::Int(4), example([("id", Feature::Int(99))]))));

        let err = SplitWriter::new("d", "train", dir.path(), &small_shards())
            .write_all(items, &JsonCodec)
            .unwrap_err();
        assert!(matches!(err, DatasetError::DuplicateKey { .. }));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_generator_error_propagates() {
        let dir = TempDir::new().unwrap();
        let items = vec![
            Ok((ExampleKey::Int(1), Example::new())),
            Err(DatasetError::download("source vanished")),
        ];
        let err = SplitWriter::new("d", "train", dir.path(), &small_shards())
            .write_all(items, &JsonCodec)
            .unwrap_err();
        assert!(matches!(err, DatasetError::Download(_)));
    }

    #[test]
    fn test_concurrent_writer_matches_sequential() {
        let dir = TempDir::new().unwrap();
        let seq_dir = dir.path().join("seq");
        let par_dir = dir.path().join("par");
        fs::create_dir_all(&seq_dir).unwrap();
        fs::create_dir_all(&par_dir).unwrap();

        let seq = SplitWriter::new("d", "train", &seq_dir, &small_shards())
            .write_all(pairs(0..30), &JsonCodec)
            .unwrap();

        let shared = ConcurrentSplitWriter::new(SplitWriter::new(
            "d",
            "train",
            &par_dir,
            &small_shards(),
        ));
        std::thread::scope(|s| {
            for worker in 0..3i64 {
                let shared = &shared;
                s.spawn(move || {
                    for k in (0..30i64).filter(|k| k % 3 == worker) {
                        let ex = example([("id", Feature::Int(k))]);
                        shared
                            .write(&ExampleKey::Int(k), JsonCodec.encode(&ex).unwrap())
                            .unwrap();
                    }
                });
            }
        });
        let par = shared.finalize().unwrap();

        assert_eq!(seq.shard_lengths, par.shard_lengths);
        assert_eq!(read_all(&seq.files), read_all(&par.files));
        assert!(shared.finalize().is_err());
    }
}
