//! Dataset directory inspection and validation.

use std::path::{Path, PathBuf};

use super::streaming::TrainExample;

/// Summary produced by [`inspect_dataset`].
#[derive(Debug, Default)]
pub struct DatasetReport {
    pub files: usize,
    pub examples: usize,
    pub skipped: usize,
    pub empty_rationales: usize,
}

/// All `.jsonl` shards in a dataset directory, sorted for determinism.
pub fn dataset_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        anyhow::bail!(
            "dataset directory does not exist: {} (expected a directory of .jsonl shards)",
            dir.display()
        );
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("jsonl"))
        .collect();
    files.sort();

    if files.is_empty() {
        anyhow::bail!("no .jsonl files found in {}", dir.display());
    }

    Ok(files)
}

/// Parse every line of every shard and report counts. Used by the
/// `validate` subcommand before a long training run.
pub fn inspect_dataset(dir: &Path) -> anyhow::Result<DatasetReport> {
    let files = dataset_files(dir)?;
    let mut report = DatasetReport {
        files: files.len(),
        ..Default::default()
    };

    for path in &files {
        let content = std::fs::read_to_string(path)?;
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TrainExample>(line) {
                Ok(example) => {
                    report.examples += 1;
                    if example.rationale.trim().is_empty() {
                        report.empty_rationales += 1;
                    }
                }
                Err(_) => report.skipped += 1,
            }
        }
    }

    Ok(report)
}
