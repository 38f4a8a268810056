//! CompressInactive: gzip cold files in place

use async_trait::async_trait;
use btrmind_core::{Action, ExecutionError};
use flate2::{write::GzEncoder, Compression};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use super::{existing_roots, scan_roots};
use crate::executor::{ActionHandler, ExecutionContext, Plan, StepError};
use crate::journal::{FileAttrs, JournalEntry};

/// Replaces cold files with `<name>.gz`. Fully reversible.
#[derive(Debug, Clone)]
pub struct Compressor {
    patterns: Vec<PathBuf>,
    min_age: Duration,
    min_bytes: u64,
}

impl Compressor {
    /// Handler over `patterns`
    #[must_use]
    pub fn new(patterns: Vec<PathBuf>, min_age: Duration, min_bytes: u64) -> Self {
        Self {
            patterns,
            min_age,
            min_bytes,
        }
    }
}

fn gz_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".gz");
    PathBuf::from(name)
}

/// A file replaced by its gzip copy
#[derive(Debug)]
struct Replacement {
    compressed: PathBuf,
    bytes_saved: u64,
    attrs: FileAttrs,
}

/// Compress one file, or return `None` when compression would not save space
fn compress_file(path: &Path) -> io::Result<Option<Replacement>> {
    let compressed = gz_path(path);
    if compressed.exists() {
        return Ok(None);
    }
    let meta = std::fs::metadata(path)?;
    let original_len = meta.len();
    let attrs = FileAttrs::from(&meta);

    let write = || -> io::Result<u64> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut encoder = GzEncoder::new(BufWriter::new(File::create(&compressed)?), Compression::default());
        io::copy(&mut reader, &mut encoder)?;
        let mut writer = encoder.finish()?;
        writer.flush()?;
        let file = writer.into_inner().map_err(io::IntoInnerError::into_error)?;
        file.sync_all()?;
        Ok(file.metadata()?.len())
    };

    match write() {
        Ok(compressed_len) if compressed_len < original_len => {
            std::fs::remove_file(path)?;
            Ok(Some(Replacement {
                compressed,
                bytes_saved: original_len - compressed_len,
                attrs,
            }))
        }
        Ok(_) => {
            std::fs::remove_file(&compressed)?;
            Ok(None)
        }
        Err(err) => {
            if let Err(cleanup) = std::fs::remove_file(&compressed) {
                debug!(path = %compressed.display(), error = %cleanup, "Partial archive not removed");
            }
            Err(err)
        }
    }
}

#[async_trait]
impl ActionHandler for Compressor {
    fn action(&self) -> Action {
        Action::CompressInactive
    }

    async fn plan(&self) -> Result<Plan, ExecutionError> {
        let roots = existing_roots(self.action(), &self.patterns)?;
        let mut items = scan_roots(self.action(), roots, self.min_age, false).await?;
        items.retain(|item| {
            item.bytes >= self.min_bytes
                && item.path.extension().map_or(true, |ext| ext != "gz")
        });
        Ok(Plan::new(
            items,
            format!("gzip files unmodified for {}d", self.min_age.as_secs() / 86_400),
        ))
    }

    async fn run(&self, plan: Plan, ctx: &mut ExecutionContext) -> Result<(), StepError> {
        for item in plan.items {
            ctx.checkpoint()?;
            let path = item.path.clone();
            let outcome = tokio::task::spawn_blocking(move || compress_file(&path))
                .await
                .map_err(|e| StepError::Failed(e.to_string()))?;
            match outcome {
                Ok(Some(replacement)) => {
                    ctx.journal_mut().record(JournalEntry::Compressed {
                        original: item.path,
                        compressed: replacement.compressed,
                        bytes_saved: replacement.bytes_saved,
                        attrs: Some(replacement.attrs),
                    });
                }
                Ok(None) => debug!(path = %item.path.display(), "Not worth compressing"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(StepError::io(&item.path, &err)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Executor, ExecutorConfig};

    fn executor(dir: &Path) -> Executor {
        Executor::new(ExecutorConfig {
            cold_paths: vec![dir.to_path_buf()],
            cold_age: Duration::ZERO,
            compress_min_bytes: 64,
            ..ExecutorConfig::default()
        })
    }

    #[tokio::test]
    async fn test_compresses_compressible_files() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("app.log");
        std::fs::write(&log, "line of repetitive text\n".repeat(500)).unwrap();
        std::fs::write(dir.path().join("tiny"), b"x").unwrap();

        let result = executor(dir.path()).execute(Action::CompressInactive, false).await.unwrap();
        assert!(result.success);
        assert!(result.bytes_reclaimed > 0);
        assert!(!log.exists());
        assert!(dir.path().join("app.log.gz").exists());
        assert!(dir.path().join("tiny").exists());
    }

    #[test]
    fn test_incompressible_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("random.bin");
        // A short pseudo-random byte sequence does not shrink under gzip
        let data: Vec<u8> = (0u32..128).map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8).collect();
        std::fs::write(&path, &data).unwrap();
        assert!(compress_file(&path).unwrap().is_none());
        assert!(path.exists());
        assert!(!gz_path(&path).exists());
    }

    #[tokio::test]
    async fn test_compression_is_reversible() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..3 {
            std::fs::write(dir.path().join(format!("{i}.log")), "abc".repeat(1000)).unwrap();
        }
        let compressor = Compressor::new(vec![dir.path().to_path_buf()], Duration::ZERO, 0);
        let plan = compressor.plan().await.unwrap();
        assert_eq!(plan.items.len(), 3);

        // Compress one file inside a context, then undo it
        let mut ctx = ExecutionContext::new(Action::CompressInactive, Duration::from_secs(60));
        let first = plan.items[0].path.clone();
        let modified_before = std::fs::metadata(&first).unwrap().modified().unwrap();
        let replacement = compress_file(&first).unwrap().unwrap();
        let compressed = replacement.compressed.clone();
        ctx.journal_mut().record(JournalEntry::Compressed {
            original: first.clone(),
            compressed: replacement.compressed,
            bytes_saved: replacement.bytes_saved,
            attrs: Some(replacement.attrs),
        });
        assert!(ctx.journal_mut().rollback());
        assert_eq!(std::fs::read_to_string(&first).unwrap(), "abc".repeat(1000));
        assert_eq!(std::fs::metadata(&first).unwrap().modified().unwrap(), modified_before);
        assert!(!compressed.exists());
    }
}
