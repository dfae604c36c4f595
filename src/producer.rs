//! Batch producer: walk → filter → partition → publish
//!
//! Walks a source tree with gitignore-style filtering plus explicit
//! exclusion of build-output directories at every depth, filters by allowed
//! extensions, and emits files in sorted order so repeated submissions of an
//! unchanged tree produce identical batches. Files are partitioned into
//! fixed-size batches, each published as one durable stream entry keyed by
//! job id and batch index.
//!
//! The producer never reads stream depth; the stream itself bounds memory
//! and operators watch consumer lag through the metrics surfaces.

use std::path::{Path, PathBuf};

use thiserror::Error;
use uuid::Uuid;

use crate::store::{Store, StoreError};
use crate::stream::{BatchPayload, StreamClient, StreamError};

/// Directory names excluded from scanning at every depth.
const EXCLUDED_DIRS: &[&str] = &[
    "dist",
    "build",
    "out",
    "node_modules",
    ".git",
    "coverage",
    ".next",
    "target",
    "__pycache__",
    "vendor",
];

#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("failed to scan {path}: {source}")]
    Scan {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Response returned to the submitter.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BatchIndexingResponse {
    pub job_id: Uuid,
    pub total_batches: usize,
    pub total_files: usize,
}

/// Scan a root for indexable files.
///
/// Respects .gitignore, skips hidden files, excluded build-output
/// directories at any depth, and files over `max_file_size`. Extensions may
/// be given with or without a leading dot. Returns repository-relative
/// paths with forward slashes, sorted for reproducibility.
pub fn scan_files(
    root: &Path,
    extensions: &[String],
    max_file_size: u64,
) -> Result<Vec<String>, ProducerError> {
    let root = root
        .canonicalize()
        .map_err(|source| ProducerError::Scan {
            path: root.to_path_buf(),
            source,
        })?;

    let wanted: Vec<&str> = extensions
        .iter()
        .map(|e| e.trim_start_matches('.'))
        .collect();

    let walker = ignore::WalkBuilder::new(&root)
        .git_ignore(true)
        .git_global(true)
        .git_exclude(true)
        .hidden(true)
        .follow_links(false)
        .filter_entry(|entry| {
            // Build-output directories are pruned regardless of gitignore
            let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
            if is_dir {
                let name = entry.file_name().to_string_lossy();
                if EXCLUDED_DIRS.contains(&name.as_ref()) {
                    return false;
                }
            }
            true
        })
        .build();

    let mut files: Vec<String> = walker
        .filter_map(|entry| {
            entry
                .map_err(|err| {
                    tracing::debug!(error = %err, "Skipping unreadable entry during walk");
                })
                .ok()
        })
        .filter(|e| e.file_type().is_some_and(|ft| ft.is_file()))
        .filter(|e| {
            e.metadata()
                .map(|m| m.len() <= max_file_size)
                .unwrap_or(false)
        })
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| wanted.contains(&ext))
                .unwrap_or(false)
        })
        .filter_map(|e| {
            e.path()
                .strip_prefix(&root)
                .ok()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
        })
        .collect();

    files.sort();
    tracing::info!(file_count = files.len(), root = %root.display(), "Scan complete");
    Ok(files)
}

/// Partition files into fixed-size batches: ⌈N/B⌉ batches, the last one
/// holding the remainder.
pub fn create_batches(files: Vec<String>, batch_size: usize) -> Vec<Vec<String>> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(files.len().div_ceil(batch_size));
    let mut current = Vec::with_capacity(batch_size);
    for file in files {
        current.push(file);
        if current.len() == batch_size {
            batches.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Producer over the durable stream plus the job control table.
pub struct Producer {
    store: Store,
    stream: StreamClient,
    max_file_size: u64,
}

impl Producer {
    pub fn new(store: Store, stream: StreamClient, max_file_size: u64) -> Self {
        Self {
            store,
            stream,
            max_file_size,
        }
    }

    /// Scan, partition and publish one indexing job.
    pub async fn submit(
        &self,
        repository: &str,
        root: &Path,
        extensions: &[String],
        batch_size: usize,
    ) -> Result<BatchIndexingResponse, ProducerError> {
        let _span = tracing::info_span!("submit_job", repository).entered();

        let files = scan_files(root, extensions, self.max_file_size)?;
        let total_files = files.len();
        let batches = create_batches(files, batch_size);
        let job_id = Uuid::new_v4();

        self.store
            .create_job(job_id, repository, batches.len() as i32, total_files as i32)
            .await?;

        if batches.is_empty() {
            self.store.complete_empty_job(job_id).await?;
            tracing::info!(%job_id, "No indexable files found, job completed empty");
            return Ok(BatchIndexingResponse {
                job_id,
                total_batches: 0,
                total_files: 0,
            });
        }

        for (batch_index, files) in batches.iter().enumerate() {
            self.stream
                .publish(&BatchPayload {
                    job_id: job_id.to_string(),
                    batch_index: batch_index as u32,
                    repository: repository.to_string(),
                    files: files.clone(),
                    attempt: 1,
                })
                .await?;
            self.store.record_batch_submitted(job_id).await?;
        }

        tracing::info!(
            %job_id,
            total_batches = batches.len(),
            total_files,
            "Job submitted"
        );
        Ok(BatchIndexingResponse {
            job_id,
            total_batches: batches.len(),
            total_files,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: u64 = 1_048_576;

    fn exts() -> Vec<String> {
        vec![".ts".to_string(), ".js".to_string()]
    }

    fn touch(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_create_batches_with_remainder() {
        let files: Vec<String> = (0..100).map(|i| format!("file{i}.ts")).collect();
        let batches = create_batches(files, 40);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 40);
        assert_eq!(batches[1].len(), 40);
        assert_eq!(batches[2].len(), 20);
    }

    #[test]
    fn test_create_batches_exact_multiple() {
        let files: Vec<String> = (0..80).map(|i| format!("file{i}.ts")).collect();
        let batches = create_batches(files, 40);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 40);
        assert_eq!(batches[1].len(), 40);
    }

    #[test]
    fn test_create_batches_empty() {
        assert!(create_batches(Vec::new(), 40).is_empty());
    }

    #[test]
    fn test_scan_filters_by_extension() {
        let dir = tempfile::TempDir::new().unwrap();
        touch(&dir.path().join("test1.ts"), "export const a = 1;");
        touch(&dir.path().join("test2.js"), "const b = 2;");
        touch(&dir.path().join("test3.py"), "c = 3");
        touch(&dir.path().join("README.md"), "# readme");

        let files = scan_files(dir.path(), &exts(), MAX).unwrap();
        assert_eq!(files, vec!["test1.ts", "test2.js"]);
    }

    #[test]
    fn test_scan_sorts_for_reproducibility() {
        let dir = tempfile::TempDir::new().unwrap();
        touch(&dir.path().join("zebra.ts"), "z");
        touch(&dir.path().join("alpha.ts"), "a");
        touch(&dir.path().join("beta.ts"), "b");

        let files = scan_files(dir.path(), &exts(), MAX).unwrap();
        assert_eq!(files, vec!["alpha.ts", "beta.ts", "zebra.ts"]);
    }

    #[test]
    fn test_scan_excludes_dist_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        touch(&dir.path().join("src/app.ts"), "export const app = 1;");
        touch(&dir.path().join("dist/app.js"), "export const app = 1;");
        touch(&dir.path().join("dist/app.d.ts"), "export declare const app;");

        let files = scan_files(dir.path(), &exts(), MAX).unwrap();
        assert_eq!(files, vec!["src/app.ts"]);
    }

    #[test]
    fn test_scan_excludes_nested_dist_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        touch(&dir.path().join("packages/core/index.ts"), "export const core = 1;");
        touch(&dir.path().join("packages/core/dist/index.js"), "built");

        let files = scan_files(dir.path(), &exts(), MAX).unwrap();
        assert_eq!(files, vec!["packages/core/index.ts"]);
        assert!(!files.iter().any(|f| f.contains("dist")));
    }

    #[test]
    fn test_scan_excludes_node_modules_and_git() {
        let dir = tempfile::TempDir::new().unwrap();
        touch(&dir.path().join("src/a.ts"), "a");
        touch(&dir.path().join("node_modules/x/index.ts"), "x");
        touch(&dir.path().join(".git/hooks/pre-commit.js"), "hook");

        let files = scan_files(dir.path(), &exts(), MAX).unwrap();
        assert_eq!(files, vec!["src/a.ts"]);
    }

    #[test]
    fn test_scan_skips_oversize_files() {
        let dir = tempfile::TempDir::new().unwrap();
        touch(&dir.path().join("small.ts"), "ok");
        touch(&dir.path().join("big.ts"), &"x".repeat(64));

        let files = scan_files(dir.path(), &exts(), 32).unwrap();
        assert_eq!(files, vec!["small.ts"]);
    }

    #[test]
    fn test_scan_accepts_extensions_without_dot() {
        let dir = tempfile::TempDir::new().unwrap();
        touch(&dir.path().join("a.ts"), "a");
        let files = scan_files(dir.path(), &["ts".to_string()], MAX).unwrap();
        assert_eq!(files, vec!["a.ts"]);
    }
}
