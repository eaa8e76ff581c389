//! Dataset registry.
//!
//! Datasets are registered explicitly at startup and looked up by name.
//! A dataset spec string `name[/config][:version]` names a dataset, an
//! optional config and an optional version request in one go.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crate::builder::{BuilderOptions, DatasetBuilder};
use crate::config::Settings;
use crate::dataset::{ConfigChoice, Dataset};
use crate::error::{DatasetError, Result};

/// Parsed `name[/config][:version]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSpec {
    pub name: String,
    pub config: Option<String>,
    pub version: Option<String>,
}

impl FromStr for DatasetSpec {
    type Err = DatasetError;

    fn from_str(input: &str) -> Result<Self> {
        let invalid = |reason: &str| DatasetError::InvalidSpec {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let (path, version) = match input.split_once(':') {
            Some((path, version)) => {
                if version.is_empty() {
                    return Err(invalid("empty version after ':'"));
                }
                (path, Some(version.to_string()))
            }
            None => (input, None),
        };
        let (name, config) = match path.split_once('/') {
            Some((name, config)) => {
                if config.is_empty() || config.contains('/') {
                    return Err(invalid("expected at most one config after the name"));
                }
                (name, Some(config.to_string()))
            }
            None => (path, None),
        };
        if name.is_empty() {
            return Err(invalid("missing dataset name"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(invalid("dataset names use letters, digits, '_' and '-'"));
        }
        Ok(Self {
            name: name.to_string(),
            config,
            version,
        })
    }
}

impl fmt::Display for DatasetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if let Some(config) = &self.config {
            write!(f, "/{config}")?;
        }
        if let Some(version) = &self.version {
            write!(f, ":{version}")?;
        }
        Ok(())
    }
}

/// Name → dataset definition.
#[derive(Default)]
pub struct DatasetRegistry {
    datasets: BTreeMap<String, Arc<dyn Dataset>>,
}

impl DatasetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dataset. Fails if the name is taken.
    pub fn register(&mut self, dataset: Arc<dyn Dataset>) -> Result<()> {
        let name = dataset.name().to_string();
        if self.datasets.contains_key(&name) {
            return Err(DatasetError::AlreadyRegistered { name });
        }
        tracing::debug!(dataset = %name, "registering dataset");
        self.datasets.insert(name, dataset);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Dataset>> {
        self.datasets
            .get(name)
            .cloned()
            .ok_or_else(|| DatasetError::UnknownDataset {
                name: name.to_string(),
                available: self.names(),
            })
    }

    pub fn names(&self) -> Vec<String> {
        self.datasets.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    /// Builder for a spec string such as `wiki/en:1.*`.
    pub fn builder(
        &self,
        spec: &str,
        settings: Settings,
        data_dir: Option<PathBuf>,
    ) -> Result<DatasetBuilder> {
        let spec: DatasetSpec = spec.parse()?;
        let dataset = self.get(&spec.name)?;
        DatasetBuilder::new(
            dataset,
            BuilderOptions {
                config: spec.config.map(ConfigChoice::Named),
                version: spec.version,
                data_dir,
                settings,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DatasetInfo;
    use crate::dataset::{BuilderConfig, GenerationContext, SplitGenerator};
    use crate::version::Version;
    use pretty_assertions::assert_eq;

    struct Wiki;

    impl Dataset for Wiki {
        fn name(&self) -> &str {
            "wiki"
        }

        fn builder_configs(&self) -> Vec<BuilderConfig> {
            ["en", "de"]
                .into_iter()
                .map(|lang| {
                    BuilderConfig::new(lang)
                        .with_version(Version::new(1, 1, 0))
                        .with_supported_versions(vec![Version::new(1, 0, 0)])
                        .with_description(format!("{lang} articles"))
                })
                .collect()
        }

        fn produce_info(&self, _config: Option<&BuilderConfig>) -> DatasetInfo {
            DatasetInfo::new("wiki", Version::new(0, 0, 0))
        }

        fn build_splits(&self, _ctx: &GenerationContext<'_>) -> Result<Vec<SplitGenerator>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_parse_spec_forms() {
        let full: DatasetSpec = "wiki/en:1.0.0".parse().unwrap();
        assert_eq!(
            full,
            DatasetSpec {
                name: "wiki".into(),
                config: Some("en".into()),
                version: Some("1.0.0".into()),
            }
        );
        assert_eq!(full.to_string(), "wiki/en:1.0.0");

        let bare: DatasetSpec = "mnist".parse().unwrap();
        assert_eq!(bare.config, None);
        assert_eq!(bare.version, None);

        let versioned: DatasetSpec = "mnist:experimental_latest".parse().unwrap();
        assert_eq!(versioned.version.as_deref(), Some("experimental_latest"));
    }

    #[test]
    fn test_parse_spec_rejects_malformed() {
        for bad in ["", "/en", "wiki/", "wiki:", "wiki/en/x", "wi ki"] {
            assert!(
                matches!(bad.parse::<DatasetSpec>(), Err(DatasetError::InvalidSpec { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = DatasetRegistry::new();
        registry.register(Arc::new(Wiki)).unwrap();
        assert!(matches!(
            registry.register(Arc::new(Wiki)),
            Err(DatasetError::AlreadyRegistered { .. })
        ));
        assert_eq!(registry.names(), vec!["wiki".to_string()]);

        match registry.get("imdb") {
            Err(DatasetError::UnknownDataset { available, .. }) => {
                assert_eq!(available, vec!["wiki".to_string()]);
            }
            other => panic!("unexpected: {:?}", other.map(|d| d.name().to_string())),
        }
    }

    #[test]
    fn test_builder_from_spec() {
        let root = tempfile::TempDir::new().unwrap();
        let mut registry = DatasetRegistry::new();
        registry.register(Arc::new(Wiki)).unwrap();

        let b = registry
            .builder("wiki/de:1.0.*", Settings::default(), Some(root.path().to_path_buf()))
            .unwrap();
        assert_eq!(b.config().unwrap().name, "de");
        assert_eq!(b.version(), &Version::new(1, 0, 0));
        assert_eq!(b.data_dir(), root.path().join("wiki").join("de").join("1.0.0"));

        let latest = registry
            .builder("wiki", Settings::default(), Some(root.path().to_path_buf()))
            .unwrap();
        assert_eq!(latest.config().unwrap().name, "en");
        assert_eq!(latest.version(), &Version::new(1, 1, 0));
    }
}
