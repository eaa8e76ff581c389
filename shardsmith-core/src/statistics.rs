//! Per-split statistics computed from the written shards.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::catalog::SplitInfo;
use crate::error::Result;
use crate::example::ExampleCodec;
use crate::records::RecordReader;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureStatistics {
    /// Examples in which the feature is present.
    pub num_present: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl FeatureStatistics {
    fn observe(&mut self, values: &[f64]) {
        self.num_present += 1;
        for &v in values {
            self.min = Some(self.min.map_or(v, |m| m.min(v)));
            self.max = Some(self.max.map_or(v, |m| m.max(v)));
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SplitStatistics {
    pub num_examples: u64,
    #[serde(default)]
    pub features: BTreeMap<String, FeatureStatistics>,
}

/// Decode every record of `split` under `data_dir` and summarize it.
pub fn compute_split_statistics(
    dataset: &str,
    split: &SplitInfo,
    data_dir: &Path,
    codec: &dyn ExampleCodec,
) -> Result<SplitStatistics> {
    let mut stats = SplitStatistics::default();
    for path in split.shard_paths(dataset, data_dir) {
        for record in RecordReader::open(&path)? {
            let example = codec.decode(&record?)?;
            stats.num_examples += 1;
            for (name, feature) in &example {
                stats
                    .features
                    .entry(name.clone())
                    .or_default()
                    .observe(&feature.as_f64_values());
            }
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WriterSettings;
    use crate::example::{ExampleKey, Feature, JsonCodec, example};
    use crate::writer::SplitWriter;
    use tempfile::TempDir;

    #[test]
    fn test_statistics_over_written_split() {
        let dir = TempDir::new().unwrap();
        let items = (0..5i64).map(|k| {
            let mut ex = example([("label", Feature::Int(k * 2))]);
            if k % 2 == 0 {
                ex.insert("caption".into(), Feature::Text(format!("item {k}")));
            }
            Ok((ExampleKey::Int(k), ex))
        });
        let outcome = SplitWriter::new("d", "train", dir.path(), &WriterSettings::default())
            .write_all(items, &JsonCodec)
            .unwrap();
        let mut split = SplitInfo::new("train");
        split.shard_lengths = outcome.shard_lengths;

        let stats = compute_split_statistics("d", &split, dir.path(), &JsonCodec).unwrap();
        assert_eq!(stats.num_examples, 5);
        let label = &stats.features["label"];
        assert_eq!(label.num_present, 5);
        assert_eq!(label.min, Some(0.0));
        assert_eq!(label.max, Some(8.0));
        let caption = &stats.features["caption"];
        assert_eq!(caption.num_present, 3);
        assert_eq!(caption.min, None);
    }
}
