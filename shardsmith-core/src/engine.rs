//! Parallel execution boundary.
//!
//! Datasets that produce examples in parallel describe their work as a list
//! of partitions plus a per-partition transform. The builder collects one
//! stage per split into a single [`ExecutionPlan`] covering every split of
//! the version and hands it to an [`ExecutionEngine`]; the engine decides how
//! work is scheduled. The core only supplies each stage's sink, a
//! [`ConcurrentSplitWriter`], and waits on the returned handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam::channel;

use crate::error::{DatasetError, Result};
use crate::example::{Example, ExampleCodec, ExampleKey};
use crate::writer::ConcurrentSplitWriter;

/// Transform from one partition descriptor to the keyed examples it holds.
pub type PartitionFn = Arc<dyn Fn(&str) -> Result<Vec<(ExampleKey, Example)>> + Send + Sync>;

/// Declarative description of a parallel split: inputs plus a transform.
#[derive(Clone)]
pub struct PartitionedSource {
    pub partitions: Vec<String>,
    pub transform: PartitionFn,
}

impl PartitionedSource {
    pub fn new<F>(partitions: Vec<String>, transform: F) -> Self
    where
        F: Fn(&str) -> Result<Vec<(ExampleKey, Example)>> + Send + Sync + 'static,
    {
        Self {
            partitions,
            transform: Arc::new(transform),
        }
    }
}

/// One split's sub-pipeline within a plan.
pub struct SplitStage {
    pub split: String,
    pub source: PartitionedSource,
    pub codec: Arc<dyn ExampleCodec>,
    pub sink: Arc<ConcurrentSplitWriter>,
}

impl SplitStage {
    /// Run the transform over one partition and feed the sink.
    pub fn run_partition(&self, index: usize) -> Result<()> {
        let partition = self.source.partitions.get(index).ok_or_else(|| {
            DatasetError::engine(format!(
                "split '{}' has no partition {index}",
                self.split
            ))
        })?;
        for (key, example) in (self.source.transform)(partition)? {
            let payload = self.codec.encode(&example)?;
            self.sink.write(&key, payload)?;
        }
        Ok(())
    }
}

/// Every stage of one dataset version, submitted as a unit.
#[derive(Default)]
pub struct ExecutionPlan {
    pub stages: Vec<SplitStage>,
}

impl ExecutionPlan {
    /// `(stage, partition)` pairs covering the whole plan.
    pub fn tasks(&self) -> Vec<(usize, usize)> {
        self.stages
            .iter()
            .enumerate()
            .flat_map(|(s, stage)| (0..stage.source.partitions.len()).map(move |p| (s, p)))
            .collect()
    }
}

/// External engine that runs a plan.
pub trait ExecutionEngine: Send + Sync {
    fn name(&self) -> &str;

    fn submit(&self, plan: ExecutionPlan) -> Result<Box<dyn ExecutionHandle>>;
}

/// Completion handle for a submitted plan.
pub trait ExecutionHandle: Send {
    /// Block until every task finished; returns the first failure.
    fn wait(self: Box<Self>) -> Result<()>;
}

/// In-process engine: a fixed pool of threads draining a shared task queue.
#[derive(Debug, Clone)]
pub struct ThreadPoolEngine {
    workers: usize,
}

impl ThreadPoolEngine {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }
}

impl Default for ThreadPoolEngine {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::new(workers)
    }
}

impl ExecutionEngine for ThreadPoolEngine {
    fn name(&self) -> &str {
        "thread-pool"
    }

    fn submit(&self, plan: ExecutionPlan) -> Result<Box<dyn ExecutionHandle>> {
        let tasks = plan.tasks();
        tracing::info!(
            workers = self.workers,
            stages = plan.stages.len(),
            tasks = tasks.len(),
            "submitting execution plan"
        );

        let (tx, rx) = channel::unbounded();
        for task in tasks {
            tx.send(task)
                .map_err(|e| DatasetError::engine(e.to_string()))?;
        }
        drop(tx);

        let plan = Arc::new(plan);
        let cancelled = Arc::new(AtomicBool::new(false));
        let first_error = Arc::new(Mutex::new(None));
        let mut threads = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            let rx = rx.clone();
            let plan = Arc::clone(&plan);
            let cancelled = Arc::clone(&cancelled);
            let first_error = Arc::clone(&first_error);
            let handle = std::thread::Builder::new()
                .name(format!("shardsmith-worker-{worker}"))
                .spawn(move || {
                    for (stage, partition) in rx.iter() {
                        if cancelled.load(Ordering::Relaxed) {
                            break;
                        }
                        if let Err(e) = plan.stages[stage].run_partition(partition) {
                            cancelled.store(true, Ordering::Relaxed);
                            if let Ok(mut slot) = first_error.lock() {
                                slot.get_or_insert(e);
                            }
                            break;
                        }
                    }
                })?;
            threads.push(handle);
        }

        Ok(Box::new(ThreadPoolHandle {
            threads,
            first_error,
        }))
    }
}

struct ThreadPoolHandle {
    threads: Vec<JoinHandle<()>>,
    first_error: Arc<Mutex<Option<DatasetError>>>,
}

impl ExecutionHandle for ThreadPoolHandle {
    fn wait(self: Box<Self>) -> Result<()> {
        let mut panicked = false;
        for thread in self.threads {
            panicked |= thread.join().is_err();
        }
        let error = self
            .first_error
            .lock()
            .map_err(|_| DatasetError::engine("error slot poisoned"))?
            .take();
        if let Some(e) = error {
            return Err(e);
        }
        if panicked {
            return Err(DatasetError::engine("a worker thread panicked"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WriterSettings;
    use crate::example::{Feature, JsonCodec, example};
    use crate::writer::SplitWriter;
    use tempfile::TempDir;

    fn stage(dir: &std::path::Path, split: &str, partitions: usize) -> SplitStage {
        let writer = SplitWriter::new("d", split, dir, &WriterSettings::default());
        SplitStage {
            split: split.to_string(),
            source: PartitionedSource::new(
                (0..partitions).map(|p| p.to_string()).collect(),
                |part| {
                    let base: i64 = part.parse().unwrap_or(0) * 10;
                    Ok((base..base + 10)
                        .map(|k| (ExampleKey::Int(k), example([("id", Feature::Int(k))])))
                        .collect())
                },
            ),
            codec: Arc::new(JsonCodec),
            sink: Arc::new(ConcurrentSplitWriter::new(writer)),
        }
    }

    #[test]
    fn test_thread_pool_runs_every_partition() {
        let dir = TempDir::new().unwrap();
        let train = stage(dir.path(), "train", 4);
        let test = stage(dir.path(), "test", 2);
        let sinks = [Arc::clone(&train.sink), Arc::clone(&test.sink)];
        let plan = ExecutionPlan {
            stages: vec![train, test],
        };
        assert_eq!(plan.tasks().len(), 6);

        ThreadPoolEngine::new(3).submit(plan).unwrap().wait().unwrap();

        let train = sinks[0].finalize().unwrap();
        let test = sinks[1].finalize().unwrap();
        assert_eq!(train.shard_lengths.iter().sum::<u64>(), 40);
        assert_eq!(test.shard_lengths.iter().sum::<u64>(), 20);
    }

    #[test]
    fn test_worker_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let writer = SplitWriter::new("d", "train", dir.path(), &WriterSettings::default());
        let plan = ExecutionPlan {
            stages: vec![SplitStage {
                split: "train".into(),
                source: PartitionedSource::new(vec!["ok".into(), "bad".into()], |part| {
                    if part == "bad" {
                        Err(DatasetError::download("partition unreadable"))
                    } else {
                        Ok(Vec::new())
                    }
                }),
                codec: Arc::new(JsonCodec),
                sink: Arc::new(ConcurrentSplitWriter::new(writer)),
            }],
        };

        let err = ThreadPoolEngine::new(2)
            .submit(plan)
            .unwrap()
            .wait()
            .unwrap_err();
        assert!(matches!(err, DatasetError::Download(_)));
    }
}
