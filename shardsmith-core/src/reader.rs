//! Read composition over committed shards.
//!
//! [`ReadComposer`] turns a dataset's persisted split catalog into lazy
//! example streams. Per split it asks the dataset for a base source (by
//! default [`ShardSource`], which reads the shard files), then decides on
//! in-memory caching, batching with padding, supervised projection, and a
//! background prefetch stage that always runs last.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::catalog::{ALL_SPLITS, DatasetInfo};
use crate::config::{MIB, ReadConfig, ReaderSettings};
use crate::dataset::Dataset;
use crate::error::{DatasetError, Result};
use crate::example::{Example, ExampleCodec, Feature};
use crate::records::RecordReader;

/// Datasets up to this size are cached in memory when read.
pub const AUTOCACHE_MAX_BYTES: u64 = 250 * MIB;

/// Batch size used by [`BatchSize::Full`] when the example count is unknown.
const UNBOUNDED_BATCH: usize = 1 << 40;

/// A lazy stream of decoded examples.
pub type ExampleStream = Box<dyn Iterator<Item = Result<Example>> + Send>;

/// Base, unbatched examples of one split.
pub trait SplitSource: Send + Sync {
    fn num_shards(&self) -> usize;

    /// A fresh pass over the split. `epoch` counts passes, starting at 0.
    fn open(&self, epoch: u64) -> Result<ExampleStream>;
}

/// Everything a dataset needs to build the base source of one split.
pub struct SplitRead<'a> {
    pub info: &'a DatasetInfo,
    /// Split name, or `all`.
    pub split: &'a str,
    pub shard_files: Vec<PathBuf>,
    pub codec: Arc<dyn ExampleCodec>,
    pub shuffle_files: bool,
    pub config: &'a ReadConfig,
    pub settings: &'a ReaderSettings,
}

/// Reads shard files, optionally in a shuffled order.
pub struct ShardSource {
    files: Vec<PathBuf>,
    codec: Arc<dyn ExampleCodec>,
    shuffle_seed: Option<u64>,
    reshuffle_each_iteration: bool,
    deterministic: bool,
    parallel_reads: usize,
}

impl ShardSource {
    pub fn new(request: SplitRead<'_>) -> Self {
        let shuffle_seed = request
            .shuffle_files
            .then(|| request.config.shuffle_seed.unwrap_or_else(rand::random));
        Self {
            files: request.shard_files,
            codec: request.codec,
            shuffle_seed,
            reshuffle_each_iteration: request.config.reshuffle_each_iteration.unwrap_or(true),
            deterministic: is_deterministic(request.shuffle_files, request.config),
            parallel_reads: request
                .config
                .num_parallel_reads
                .unwrap_or(request.settings.num_parallel_reads)
                .max(1),
        }
    }

    /// Shard visiting order for pass `epoch`.
    pub fn shard_order(&self, epoch: u64) -> Vec<PathBuf> {
        let mut files = self.files.clone();
        if let Some(seed) = self.shuffle_seed {
            let seed = if self.reshuffle_each_iteration {
                seed.wrapping_add(epoch.wrapping_mul(0x9E37_79B9_7F4A_7C15))
            } else {
                seed
            };
            files.shuffle(&mut StdRng::seed_from_u64(seed));
        }
        files
    }
}

impl SplitSource for ShardSource {
    fn num_shards(&self) -> usize {
        self.files.len()
    }

    fn open(&self, epoch: u64) -> Result<ExampleStream> {
        let order = self.shard_order(epoch);
        if !self.deterministic && self.parallel_reads > 1 && order.len() > 1 {
            return Ok(Box::new(interleave(order, Arc::clone(&self.codec), self.parallel_reads)?));
        }
        Ok(Box::new(ShardIter::new(order, Arc::clone(&self.codec))))
    }
}

/// Sequential pass over shard files.
struct ShardIter {
    files: std::vec::IntoIter<PathBuf>,
    current: Option<RecordReader>,
    codec: Arc<dyn ExampleCodec>,
    failed: bool,
}

impl ShardIter {
    fn new(files: Vec<PathBuf>, codec: Arc<dyn ExampleCodec>) -> Self {
        Self {
            files: files.into_iter(),
            current: None,
            codec,
            failed: false,
        }
    }
}

impl Iterator for ShardIter {
    type Item = Result<Example>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(reader) = self.current.as_mut() {
                match reader.next() {
                    Some(Ok(bytes)) => return Some(self.codec.decode(&bytes)),
                    Some(Err(e)) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                    None => self.current = None,
                }
            }
            let path = self.files.next()?;
            match RecordReader::open(&path) {
                Ok(reader) => self.current = Some(reader),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Read shards on `workers` threads and merge records as they arrive.
fn interleave(
    files: Vec<PathBuf>,
    codec: Arc<dyn ExampleCodec>,
    workers: usize,
) -> Result<Merged> {
    let (tx, rx) = channel::bounded(workers * 4);
    let stop = Arc::new(AtomicBool::new(false));
    let mut threads = Vec::new();
    for worker in 0..workers.min(files.len()) {
        let assigned: Vec<PathBuf> = files.iter().skip(worker).step_by(workers).cloned().collect();
        let tx = tx.clone();
        let stop = Arc::clone(&stop);
        let codec = Arc::clone(&codec);
        threads.push(
            thread::Builder::new()
                .name(format!("shardsmith-read-{worker}"))
                .spawn(move || {
                    for item in ShardIter::new(assigned, codec) {
                        if stop.load(Ordering::Relaxed) || tx.send(item).is_err() {
                            break;
                        }
                    }
                })?,
        );
    }
    Ok(Merged { rx, stop, threads })
}

struct Merged {
    rx: Receiver<Result<Example>>,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl Iterator for Merged {
    type Item = Result<Example>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

impl Drop for Merged {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // Unblock senders waiting on a full channel.
        while self.rx.try_recv().is_ok() {}
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}

/// Whether a read must keep a reproducible order.
///
/// Shuffled reads with neither a seed nor an explicit determinism request
/// may trade order for throughput.
pub fn is_deterministic(shuffle_files: bool, config: &ReadConfig) -> bool {
    match config.deterministic {
        Some(d) => d,
        None => !(shuffle_files && config.shuffle_seed.is_none()),
    }
}

/// Auto-cache policy for one split.
///
/// `dataset_bytes` is the size of the whole dataset; `None` or zero means
/// unknown. Splits read in a reshuffled multi-shard order are never cached,
/// since a cached pass would freeze one order.
pub fn should_autocache(
    dataset_bytes: Option<u64>,
    num_shards: usize,
    shuffle_files: bool,
    config: &ReadConfig,
) -> bool {
    if !config.try_autocache {
        return false;
    }
    let Some(size) = dataset_bytes.filter(|s| *s > 0) else {
        return false;
    };
    if size > AUTOCACHE_MAX_BYTES {
        return false;
    }
    let reshuffles = shuffle_files && config.reshuffle_each_iteration != Some(false);
    !(reshuffles && num_shards > 1)
}

/// How to group examples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchSize {
    Examples(usize),
    /// The whole split as one padded block.
    Full,
}

/// Options of one `as_dataset` call.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub shuffle_files: bool,
    pub batch_size: Option<BatchSize>,
    pub as_supervised: bool,
    pub config: ReadConfig,
}

/// Which splits to read. `None` at the call site means every split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitSelector {
    One(String),
    Many(Vec<String>),
}

impl From<&str> for SplitSelector {
    fn from(name: &str) -> Self {
        SplitSelector::One(name.to_string())
    }
}

impl From<Vec<&str>> for SplitSelector {
    fn from(names: Vec<&str>) -> Self {
        SplitSelector::Many(names.into_iter().map(str::to_string).collect())
    }
}

/// One item of a composed stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    /// A feature dictionary; with batching, every feature is `Stacked`.
    Example(Example),
    /// Supervised projection of an example or batch.
    Pair { input: Feature, label: Feature },
}

/// Result of composing a read.
pub enum ReadOutput {
    One(SplitDataset),
    Many(Vec<SplitDataset>),
    All(BTreeMap<String, SplitDataset>),
}

impl ReadOutput {
    pub fn into_single(self) -> Option<SplitDataset> {
        match self {
            ReadOutput::One(ds) => Some(ds),
            _ => None,
        }
    }

    pub fn into_map(self) -> BTreeMap<String, SplitDataset> {
        match self {
            ReadOutput::One(ds) => BTreeMap::from([(ds.name.clone(), ds)]),
            ReadOutput::Many(list) => list.into_iter().map(|ds| (ds.name.clone(), ds)).collect(),
            ReadOutput::All(map) => map,
        }
    }
}

/// Composed, re-iterable stream over one split.
pub struct SplitDataset {
    name: String,
    source: Box<dyn SplitSource>,
    num_examples: u64,
    batch: Option<usize>,
    supervised: Option<(String, String)>,
    prefetch: usize,
    deterministic: bool,
    cache: Option<Arc<Mutex<Option<Arc<Vec<Example>>>>>>,
    epoch: AtomicU64,
}

impl SplitDataset {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_examples(&self) -> u64 {
        self.num_examples
    }

    pub fn num_shards(&self) -> usize {
        self.source.num_shards()
    }

    pub fn is_cached(&self) -> bool {
        self.cache.is_some()
    }

    pub fn is_deterministic(&self) -> bool {
        self.deterministic
    }

    /// Start a new pass.
    pub fn iter(&self) -> Result<ElementIter> {
        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed);
        let examples: ExampleStream = match &self.cache {
            Some(slot) => {
                let filled = slot
                    .lock()
                    .map_err(|_| DatasetError::engine("read cache poisoned"))?
                    .clone();
                match filled {
                    Some(cached) => Box::new(CachedIter { data: cached, pos: 0 }),
                    None => Box::new(Filling {
                        inner: self.source.open(epoch)?,
                        seen: Vec::new(),
                        slot: Arc::clone(slot),
                        failed: false,
                    }),
                }
            }
            None => self.source.open(epoch)?,
        };

        let mut stream: Box<dyn Iterator<Item = Result<Element>> + Send> = match self.batch {
            Some(size) => Box::new(Batched {
                inner: examples,
                size,
                done: false,
            }),
            None => Box::new(examples.map(|r| r.map(Element::Example))),
        };
        if let Some((input, label)) = self.supervised.clone() {
            stream = Box::new(stream.map(move |r| r.and_then(|e| project(e, &input, &label))));
        }
        ElementIter::prefetching(stream, self.prefetch)
    }

    /// Every element of one pass.
    pub fn collect_elements(&self) -> Result<Vec<Element>> {
        self.iter()?.collect()
    }

    /// The single element of a full-split batch.
    pub fn single_element(&self) -> Result<Element> {
        match self.iter()?.next() {
            Some(element) => element,
            None => Ok(Element::Example(Example::new())),
        }
    }
}

struct CachedIter {
    data: Arc<Vec<Example>>,
    pos: usize,
}

impl Iterator for CachedIter {
    type Item = Result<Example>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.data.get(self.pos)?.clone();
        self.pos += 1;
        Some(Ok(item))
    }
}

/// First pass of a cached split: records what it yields and stores it once
/// the pass completes without error.
struct Filling {
    inner: ExampleStream,
    seen: Vec<Example>,
    slot: Arc<Mutex<Option<Arc<Vec<Example>>>>>,
    failed: bool,
}

impl Iterator for Filling {
    type Item = Result<Example>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.next() {
            Some(Ok(example)) => {
                self.seen.push(example.clone());
                Some(Ok(example))
            }
            Some(Err(e)) => {
                self.failed = true;
                Some(Err(e))
            }
            None => {
                if !self.failed {
                    if let Ok(mut slot) = self.slot.lock() {
                        slot.get_or_insert_with(|| Arc::new(std::mem::take(&mut self.seen)));
                    }
                }
                None
            }
        }
    }
}

struct Batched {
    inner: ExampleStream,
    size: usize,
    done: bool,
}

impl Iterator for Batched {
    type Item = Result<Element>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut rows = Vec::with_capacity(self.size.min(1024));
        while rows.len() < self.size {
            match self.inner.next() {
                Some(Ok(example)) => rows.push(example),
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }
        if rows.is_empty() {
            return None;
        }
        Some(stack(rows).map(Element::Example))
    }
}

/// Pad list features to the longest row and stack every feature.
pub fn stack(rows: Vec<Example>) -> Result<Example> {
    let Some(first) = rows.first() else {
        return Ok(Example::new());
    };
    let names: Vec<String> = first.keys().cloned().collect();
    let mut out = Example::new();
    for name in names {
        let column: Vec<Feature> = rows
            .iter()
            .map(|row| {
                row.get(&name).cloned().ok_or_else(|| {
                    DatasetError::codec(format!("feature '{name}' is missing from part of a batch"))
                })
            })
            .collect::<Result<_>>()?;
        let width = column.iter().filter_map(Feature::list_len).max();
        let column = match width {
            Some(width) => column.into_iter().map(|f| f.padded(width)).collect(),
            None => column,
        };
        out.insert(name, Feature::Stacked(column));
    }
    Ok(out)
}

fn project(element: Element, input: &str, label: &str) -> Result<Element> {
    let mut example = match element {
        Element::Example(example) => example,
        pair @ Element::Pair { .. } => return Ok(pair),
    };
    let mut take = |key: &str| {
        example
            .remove(key)
            .ok_or_else(|| DatasetError::codec(format!("supervised key '{key}' missing from example")))
    };
    let input = take(input)?;
    let label = take(label)?;
    Ok(Element::Pair { input, label })
}

/// Consumer end of the prefetch stage.
pub struct ElementIter {
    rx: Receiver<Result<Element>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl ElementIter {
    fn prefetching(
        stream: Box<dyn Iterator<Item = Result<Element>> + Send>,
        buffer: usize,
    ) -> Result<Self> {
        let (tx, rx) = channel::bounded(buffer.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let worker = thread::Builder::new()
            .name("shardsmith-prefetch".into())
            .spawn(move || {
                for item in stream {
                    let failed = item.is_err();
                    if flag.load(Ordering::Relaxed) || tx.send(item).is_err() || failed {
                        break;
                    }
                }
            })?;
        Ok(Self {
            rx,
            stop,
            worker: Some(worker),
        })
    }
}

impl Iterator for ElementIter {
    type Item = Result<Element>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

impl Drop for ElementIter {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        while self.rx.try_recv().is_ok() {}
        if let Some(worker) = self.worker.take() {
            // A producer blocked on a full channel wakes once drained; keep
            // draining until it exits.
            while !worker.is_finished() {
                while self.rx.try_recv().is_ok() {}
                thread::yield_now();
            }
            let _ = worker.join();
        }
    }
}

/// Composes read pipelines for one prepared dataset version.
pub struct ReadComposer<'a> {
    dataset: &'a dyn Dataset,
    info: &'a DatasetInfo,
    data_dir: &'a Path,
    settings: &'a ReaderSettings,
}

impl<'a> ReadComposer<'a> {
    pub fn new(
        dataset: &'a dyn Dataset,
        info: &'a DatasetInfo,
        data_dir: &'a Path,
        settings: &'a ReaderSettings,
    ) -> Self {
        Self {
            dataset,
            info,
            data_dir,
            settings,
        }
    }

    pub fn compose(&self, selector: Option<SplitSelector>, options: &ReadOptions) -> Result<ReadOutput> {
        if options.as_supervised && self.info.supervised_keys.is_none() {
            return Err(DatasetError::NotSupervised {
                dataset: self.info.full_name(),
            });
        }
        match selector {
            None => {
                let mut all = BTreeMap::new();
                for name in self.info.splits.names() {
                    let ds = self.split(&name, options)?;
                    all.insert(name, ds);
                }
                Ok(ReadOutput::All(all))
            }
            Some(SplitSelector::One(name)) => Ok(ReadOutput::One(self.split(&name, options)?)),
            Some(SplitSelector::Many(names)) => Ok(ReadOutput::Many(
                names
                    .iter()
                    .map(|n| self.split(n, options))
                    .collect::<Result<_>>()?,
            )),
        }
    }

    /// Compose one split (`all` reads every split in catalog order).
    pub fn split(&self, name: &str, options: &ReadOptions) -> Result<SplitDataset> {
        let catalog = &self.info.splits;
        let (shard_files, num_examples) = if name == ALL_SPLITS {
            (
                catalog
                    .iter()
                    .flat_map(|s| s.shard_paths(&self.info.name, self.data_dir))
                    .collect::<Vec<_>>(),
                catalog.total_num_examples(),
            )
        } else {
            let split = catalog.require(name)?;
            (
                split.shard_paths(&self.info.name, self.data_dir),
                split.num_examples(),
            )
        };

        let config = &options.config;
        let source = self.dataset.read_split(SplitRead {
            info: self.info,
            split: name,
            shard_files,
            codec: self.dataset.codec(),
            shuffle_files: options.shuffle_files,
            config,
            settings: self.settings,
        })?;

        let cache = should_autocache(
            Some(self.info.dataset_size()),
            source.num_shards(),
            options.shuffle_files,
            config,
        );
        let batch = options.batch_size.map(|b| match b {
            BatchSize::Examples(n) => n.max(1),
            BatchSize::Full => match usize::try_from(num_examples) {
                Ok(0) | Err(_) => UNBOUNDED_BATCH,
                Ok(n) => n,
            },
        });
        let deterministic = is_deterministic(options.shuffle_files, config);
        tracing::debug!(
            dataset = %self.info.full_name(),
            split = name,
            shards = source.num_shards(),
            cache,
            deterministic,
            "composed split reader"
        );

        Ok(SplitDataset {
            name: name.to_string(),
            source,
            num_examples,
            batch,
            supervised: if options.as_supervised {
                self.info.supervised_keys.clone()
            } else {
                None
            },
            prefetch: config.prefetch_buffer.unwrap_or(self.settings.prefetch_buffer),
            deterministic,
            cache: cache.then(|| Arc::new(Mutex::new(None))),
            epoch: AtomicU64::new(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::example::example;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_should_autocache_rules() {
        let cfg = ReadConfig::default();
        assert!(!should_autocache(None, 1, false, &cfg));
        assert!(!should_autocache(Some(0), 1, false, &cfg));
        assert!(!should_autocache(Some(300 * MIB), 1, false, &cfg));
        assert!(!should_autocache(Some(10 * MIB), 2, true, &cfg));
        assert!(should_autocache(Some(10 * MIB), 1, true, &cfg));
        assert!(should_autocache(Some(10 * MIB), 2, false, &cfg));

        let frozen = ReadConfig {
            reshuffle_each_iteration: Some(false),
            ..ReadConfig::default()
        };
        assert!(should_autocache(Some(10 * MIB), 8, true, &frozen));

        let disabled = ReadConfig {
            try_autocache: false,
            ..ReadConfig::default()
        };
        assert!(!should_autocache(Some(10 * MIB), 1, false, &disabled));
    }

    #[test]
    fn test_nondeterminism_only_when_unconstrained() {
        let cfg = ReadConfig::default();
        assert!(!is_deterministic(true, &cfg));
        assert!(is_deterministic(false, &cfg));

        let seeded = ReadConfig {
            shuffle_seed: Some(7),
            ..ReadConfig::default()
        };
        assert!(is_deterministic(true, &seeded));

        let explicit = ReadConfig {
            deterministic: Some(true),
            ..ReadConfig::default()
        };
        assert!(is_deterministic(true, &explicit));
    }

    #[test]
    fn test_stack_pads_lists() {
        let rows = vec![
            example([("ids", Feature::IntList(vec![1])), ("y", Feature::Int(0))]),
            example([("ids", Feature::IntList(vec![2, 3, 4])), ("y", Feature::Int(1))]),
        ];
        let batch = stack(rows).unwrap();
        assert_eq!(
            batch["ids"],
            Feature::Stacked(vec![
                Feature::IntList(vec![1, 0, 0]),
                Feature::IntList(vec![2, 3, 4]),
            ])
        );
        assert_eq!(
            batch["y"],
            Feature::Stacked(vec![Feature::Int(0), Feature::Int(1)])
        );
    }

    #[test]
    fn test_project_requires_keys() {
        let ex = Element::Example(example([("x", Feature::Int(1)), ("y", Feature::Int(2))]));
        assert_eq!(
            project(ex.clone(), "x", "y").unwrap(),
            Element::Pair {
                input: Feature::Int(1),
                label: Feature::Int(2)
            }
        );
        assert!(project(ex, "x", "label").is_err());
    }

    #[test]
    fn test_seeded_shard_order_is_stable_and_reshuffles() {
        let files: Vec<PathBuf> = (0..8).map(|i| PathBuf::from(format!("s{i}"))).collect();
        let source = |reshuffle: bool| ShardSource {
            files: files.clone(),
            codec: Arc::new(crate::example::JsonCodec),
            shuffle_seed: Some(42),
            reshuffle_each_iteration: reshuffle,
            deterministic: true,
            parallel_reads: 1,
        };
        let a = source(true);
        let b = source(true);
        assert_eq!(a.shard_order(0), b.shard_order(0));
        assert_ne!(a.shard_order(0), a.shard_order(1));

        let frozen = source(false);
        assert_eq!(frozen.shard_order(0), frozen.shard_order(5));

        let mut sorted = a.shard_order(3);
        sorted.sort();
        assert_eq!(sorted, files);
    }
}
