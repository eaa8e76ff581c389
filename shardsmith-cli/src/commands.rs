//! CLI subcommand handlers.

use std::io::Write;
use std::path::Path;

use anyhow::Context;
use shardsmith_core::catalog::is_complete_version_dir;
use shardsmith_core::location::list_version_dirs;
use shardsmith_core::records::RecordReader;
use shardsmith_core::{
    DatasetIdentity, DatasetInfo, DatasetSpec, LocationResolver, Settings, Version,
    sweep_staging_dirs,
};

use crate::Commands;

/// Handle a CLI subcommand, writing its report to `out`.
pub fn handle_command(command: Commands, settings: &Settings, out: &mut dyn Write) -> anyhow::Result<()> {
    match command {
        Commands::Inspect { path, json } => handle_inspect(&path, json, out),
        Commands::Locate { spec } => handle_locate(&spec, settings, out),
        Commands::Verify { path } => handle_verify(&path, out),
        Commands::Sweep => handle_sweep(settings, out),
        Commands::Settings => {
            writeln!(out, "{}", serde_json::to_string_pretty(settings)?)?;
            Ok(())
        }
    }
}

fn handle_inspect(path: &Path, json: bool, out: &mut dyn Write) -> anyhow::Result<()> {
    let info = DatasetInfo::read_from_directory(path)
        .with_context(|| format!("reading metadata in {}", path.display()))?;
    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&info)?)?;
        return Ok(());
    }

    writeln!(out, "{}", info.full_name())?;
    if !info.description.is_empty() {
        writeln!(out, "  {}", info.description)?;
    }
    if let Some((input, label)) = &info.supervised_keys {
        writeln!(out, "  supervised keys: ({input}, {label})")?;
    }
    writeln!(out, "  download size: {} bytes", info.download_size)?;
    writeln!(out, "  dataset size:  {} bytes", info.dataset_size())?;
    if let Some(created) = info.created_at {
        writeln!(out, "  created:       {}", created.to_rfc3339())?;
    }
    writeln!(out, "  splits:")?;
    for split in info.splits.iter() {
        writeln!(
            out,
            "    {:<12} {:>10} examples {:>5} shards {:>12} bytes",
            split.name,
            split.num_examples(),
            split.num_shards(),
            split.num_bytes
        )?;
    }
    Ok(())
}

fn handle_locate(spec: &str, settings: &Settings, out: &mut dyn Write) -> anyhow::Result<()> {
    let spec: DatasetSpec = spec.parse()?;
    let resolver = LocationResolver::from_settings(settings);

    let Some(version) = &spec.version else {
        let mut found = 0;
        for root in settings.candidate_roots() {
            let mut dir = root.join(&spec.name);
            if let Some(config) = &spec.config {
                dir.push(config);
            }
            for path in list_version_dirs(&dir) {
                writeln!(out, "{}", path.display())?;
                found += 1;
            }
        }
        if found == 0 {
            anyhow::bail!("no prepared versions of {spec} found");
        }
        return Ok(());
    };

    let version: Version = version
        .parse()
        .context("locate needs an exact X.Y.Z version")?;
    let identity = DatasetIdentity::new(spec.name.clone(), spec.config.clone(), version);
    let location = resolver.locate(&identity, None)?;
    if !location.exists {
        anyhow::bail!(
            "{spec} is not prepared; it would be built at {}",
            location.path.display()
        );
    }
    writeln!(out, "{}", location.path.display())?;
    Ok(())
}

fn handle_verify(path: &Path, out: &mut dyn Write) -> anyhow::Result<()> {
    let info = DatasetInfo::read_from_directory(path)
        .with_context(|| format!("reading metadata in {}", path.display()))?;
    if !is_complete_version_dir(path) {
        anyhow::bail!("{} is missing shard files", path.display());
    }

    let mut problems = Vec::new();
    for split in info.splits.iter() {
        let shards = split.shard_paths(&info.name, path);
        for (shard, expected) in shards.iter().zip(&split.shard_lengths) {
            let mut count = 0u64;
            for record in RecordReader::open(shard)? {
                if let Err(e) = record {
                    problems.push(e.to_string());
                    break;
                }
                count += 1;
            }
            if count != *expected {
                problems.push(format!(
                    "{}: {count} records, metadata says {expected}",
                    shard.display()
                ));
            }
        }
        writeln!(
            out,
            "{}: {} shards, {} examples",
            split.name,
            split.num_shards(),
            split.num_examples()
        )?;
    }

    if !problems.is_empty() {
        anyhow::bail!("verification failed:\n  {}", problems.join("\n  "));
    }
    writeln!(out, "{} is complete", info.full_name())?;
    Ok(())
}

fn handle_sweep(settings: &Settings, out: &mut dyn Write) -> anyhow::Result<()> {
    let mut total = 0;
    for root in settings.candidate_roots() {
        for removed in sweep_staging_dirs(&root)? {
            writeln!(out, "removed {}", removed.display())?;
            total += 1;
        }
    }
    tracing::info!(removed = total, "sweep finished");
    writeln!(out, "{total} staging directories removed")?;
    Ok(())
}
