//! Deterministic key-ordered shuffling of encoded examples.
//!
//! Every example is placed by a salted hash of its key, never by arrival
//! order, so two runs over the same keys produce the same sequence no matter
//! how the generator (or a pool of workers) emitted them. Records are kept
//! in memory up to a byte budget; past that they are spilled into hash-range
//! buckets on disk and each bucket is sorted on its own when read back.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{DatasetError, Result};
use crate::example::ExampleKey;
use crate::records::{RecordReader, RecordWriter};

/// Number of on-disk buckets once the shuffler spills; a power of two.
const SPILL_BUCKETS: usize = 256;
const BUCKET_SHIFT: u32 = 128 - SPILL_BUCKETS.trailing_zeros();
/// Rough per-entry bookkeeping overhead counted against the memory budget.
const ENTRY_OVERHEAD: u64 = 48;

/// Hash `key` under `salt` (the split name) into the placement space.
pub fn key_hash(salt: &str, key: &ExampleKey) -> u128 {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update([0u8]);
    hasher.update(key.to_string().as_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 16];
    head.copy_from_slice(&digest[..16]);
    u128::from_be_bytes(head)
}

/// One encoded example with its placement hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShuffledRecord {
    pub hash: u128,
    pub key: String,
    pub payload: Vec<u8>,
}

impl ShuffledRecord {
    fn size(&self) -> u64 {
        (self.payload.len() + self.key.len()) as u64 + ENTRY_OVERHEAD
    }

    fn to_bucket_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + 4 + self.key.len() + self.payload.len());
        out.extend_from_slice(&self.hash.to_be_bytes());
        out.extend_from_slice(&(self.key.len() as u32).to_be_bytes());
        out.extend_from_slice(self.key.as_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    fn from_bucket_bytes(path: &Path, bytes: &[u8]) -> Result<Self> {
        let corrupt = || DatasetError::corrupt(path, "malformed shuffle bucket entry");
        if bytes.len() < 20 {
            return Err(corrupt());
        }
        let mut hash = [0u8; 16];
        hash.copy_from_slice(&bytes[..16]);
        let mut key_len = [0u8; 4];
        key_len.copy_from_slice(&bytes[16..20]);
        let key_end = 20 + u32::from_be_bytes(key_len) as usize;
        if key_end > bytes.len() {
            return Err(corrupt());
        }
        let key = String::from_utf8(bytes[20..key_end].to_vec()).map_err(|_| corrupt())?;
        Ok(Self {
            hash: u128::from_be_bytes(hash),
            key,
            payload: bytes[key_end..].to_vec(),
        })
    }
}

/// Accumulates records and yields them ordered by key hash.
pub struct Shuffler {
    salt: String,
    memory_limit: u64,
    spill_dir: PathBuf,
    memory: Vec<ShuffledRecord>,
    memory_bytes: u64,
    buckets: Option<Vec<RecordWriter>>,
    num_examples: u64,
    payload_bytes: u64,
}

impl Shuffler {
    /// `spill_dir` is created only if the memory budget is exceeded.
    pub fn new(salt: impl Into<String>, spill_dir: PathBuf, memory_limit: u64) -> Self {
        Self {
            salt: salt.into(),
            memory_limit,
            spill_dir,
            memory: Vec::new(),
            memory_bytes: 0,
            buckets: None,
            num_examples: 0,
            payload_bytes: 0,
        }
    }

    pub fn num_examples(&self) -> u64 {
        self.num_examples
    }

    /// Sum of encoded payload sizes added so far.
    pub fn payload_bytes(&self) -> u64 {
        self.payload_bytes
    }

    pub fn has_spilled(&self) -> bool {
        self.buckets.is_some()
    }

    pub fn add(&mut self, key: &ExampleKey, payload: Vec<u8>) -> Result<()> {
        let record = ShuffledRecord {
            hash: key_hash(&self.salt, key),
            key: key.to_string(),
            payload,
        };
        self.num_examples += 1;
        self.payload_bytes += record.payload.len() as u64;

        if let Some(buckets) = self.buckets.as_mut() {
            return write_to_bucket(buckets, &record);
        }
        self.memory_bytes += record.size();
        self.memory.push(record);
        if self.memory_bytes > self.memory_limit {
            self.spill()?;
        }
        Ok(())
    }

    fn spill(&mut self) -> Result<()> {
        tracing::debug!(
            dir = %self.spill_dir.display(),
            buffered = self.memory.len(),
            "shuffle buffer full, spilling to disk"
        );
        fs::create_dir_all(&self.spill_dir)?;
        let mut buckets = Vec::with_capacity(SPILL_BUCKETS);
        for index in 0..SPILL_BUCKETS {
            buckets.push(RecordWriter::create(&bucket_path(&self.spill_dir, index))?);
        }
        for record in self.memory.drain(..) {
            write_to_bucket(&mut buckets, &record)?;
        }
        self.memory_bytes = 0;
        self.buckets = Some(buckets);
        Ok(())
    }

    /// Stop accepting records and return them in hash order.
    pub fn finish(self) -> Result<SortedRecords> {
        let source = match self.buckets {
            None => {
                let mut memory = self.memory;
                memory.sort_unstable_by_key(|r| r.hash);
                Source::Memory(memory.into_iter())
            }
            Some(buckets) => {
                for bucket in buckets {
                    bucket.finish()?;
                }
                let pending = (0..SPILL_BUCKETS)
                    .map(|i| bucket_path(&self.spill_dir, i))
                    .collect();
                Source::Spilled {
                    pending,
                    current: Vec::new().into_iter(),
                }
            }
        };
        Ok(SortedRecords {
            split: self.salt,
            source,
            spill_dir: self.spill_dir,
            previous: None,
            failed: false,
        })
    }
}

fn bucket_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("bucket-{index:04}"))
}

fn write_to_bucket(buckets: &mut [RecordWriter], record: &ShuffledRecord) -> Result<()> {
    let index = (record.hash >> BUCKET_SHIFT) as usize;
    buckets[index].write(&record.to_bucket_bytes())
}

enum Source {
    Memory(std::vec::IntoIter<ShuffledRecord>),
    Spilled {
        pending: VecDeque<PathBuf>,
        current: std::vec::IntoIter<ShuffledRecord>,
    },
}

/// Hash-ordered records; yields `DuplicateKey` on the first hash collision.
///
/// Spill files are removed when this iterator is dropped.
pub struct SortedRecords {
    split: String,
    source: Source,
    spill_dir: PathBuf,
    previous: Option<u128>,
    failed: bool,
}

impl SortedRecords {
    fn next_raw(&mut self) -> Result<Option<ShuffledRecord>> {
        match &mut self.source {
            Source::Memory(iter) => Ok(iter.next()),
            Source::Spilled { pending, current } => loop {
                if let Some(record) = current.next() {
                    return Ok(Some(record));
                }
                let Some(path) = pending.pop_front() else {
                    return Ok(None);
                };
                let mut bucket = Vec::new();
                for raw in RecordReader::open(&path)? {
                    bucket.push(ShuffledRecord::from_bucket_bytes(&path, &raw?)?);
                }
                fs::remove_file(&path)?;
                bucket.sort_unstable_by_key(|r| r.hash);
                *current = bucket.into_iter();
            },
        }
    }
}

impl Iterator for SortedRecords {
    type Item = Result<ShuffledRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let record = match self.next_raw() {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };
        if self.previous == Some(record.hash) {
            self.failed = true;
            return Some(Err(DatasetError::DuplicateKey {
                split: self.split.clone(),
                key: record.key,
            }));
        }
        self.previous = Some(record.hash);
        Some(Ok(record))
    }
}

impl Drop for SortedRecords {
    fn drop(&mut self) {
        if matches!(self.source, Source::Spilled { .. }) {
            let _ = fs::remove_dir_all(&self.spill_dir);
        }
    }
}
