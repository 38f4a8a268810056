//! Rollback journal for reversible sub-steps

use flate2::read::GzDecoder;
use std::fs::File;
use std::io;
use std::fs::{Metadata, Permissions};
use std::path::PathBuf;
use std::time::SystemTime;
use tracing::{debug, warn};

/// File attributes restored when a replaced file is brought back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttrs {
    /// Mode bits
    pub permissions: Permissions,
    /// Modification time, when the platform reports one
    pub modified: Option<SystemTime>,
}

impl From<&Metadata> for FileAttrs {
    fn from(meta: &Metadata) -> Self {
        Self {
            permissions: meta.permissions(),
            modified: meta.modified().ok(),
        }
    }
}

/// One reversible sub-step that has completed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    /// A file was moved aside into a staging area
    Staged {
        /// Original location
        original: PathBuf,
        /// Staged location
        staged: PathBuf,
        /// File size
        bytes: u64,
    },
    /// A file was replaced by a gzip copy
    Compressed {
        /// Removed original
        original: PathBuf,
        /// Compressed replacement
        compressed: PathBuf,
        /// Bytes saved by the replacement
        bytes_saved: u64,
        /// Attributes of the original
        attrs: Option<FileAttrs>,
    },
}

impl JournalEntry {
    /// Bytes this step freed (zero for staging, which frees nothing yet)
    #[must_use]
    pub fn bytes_freed(&self) -> u64 {
        match self {
            Self::Staged { .. } => 0,
            Self::Compressed { bytes_saved, .. } => *bytes_saved,
        }
    }

    fn undo(&self) -> io::Result<()> {
        match self {
            Self::Staged {
                original, staged, ..
            } => std::fs::rename(staged, original),
            Self::Compressed {
                original,
                compressed,
                attrs,
                ..
            } => {
                let mut decoder = GzDecoder::new(File::open(compressed)?);
                let mut restored = File::create(original)?;
                io::copy(&mut decoder, &mut restored)?;
                if let Some(attrs) = attrs {
                    if let Some(modified) = attrs.modified {
                        restored.set_modified(modified)?;
                    }
                    restored.set_permissions(attrs.permissions.clone())?;
                }
                restored.sync_all()?;
                std::fs::remove_file(compressed)
            }
        }
    }
}

/// Completed reversible steps of the current action, in order
#[derive(Debug, Default, Clone)]
pub struct Journal {
    entries: Vec<JournalEntry>,
}

impl Journal {
    /// Empty journal
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed step
    pub fn record(&mut self, entry: JournalEntry) {
        self.entries.push(entry);
    }

    /// Forget all entries; their effects become permanent
    pub fn commit(&mut self) -> Vec<JournalEntry> {
        std::mem::take(&mut self.entries)
    }

    /// Entries recorded so far
    #[must_use]
    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    /// Check if nothing is recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Undo entries newest first. Returns true if every entry was undone.
    ///
    /// Blocking; call from a blocking context.
    pub fn rollback(&mut self) -> bool {
        let mut complete = true;
        while let Some(entry) = self.entries.pop() {
            match entry.undo() {
                Ok(()) => debug!(?entry, "Rolled back"),
                Err(err) => {
                    warn!(?entry, error = %err, "Rollback step failed");
                    complete = false;
                }
            }
        }
        complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;

    #[test]
    fn test_rollback_restores_staged_and_compressed() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("a.log");
        let staged = dir.path().join("staged-a.log");
        std::fs::write(&staged, b"staged").unwrap();

        let plain = dir.path().join("b.dat");
        let gz = dir.path().join("b.dat.gz");
        let mut encoder = GzEncoder::new(File::create(&gz).unwrap(), Compression::default());
        encoder.write_all(b"cold data").unwrap();
        encoder.finish().unwrap();

        let mut journal = Journal::new();
        journal.record(JournalEntry::Staged {
            original: original.clone(),
            staged: staged.clone(),
            bytes: 6,
        });
        journal.record(JournalEntry::Compressed {
            original: plain.clone(),
            compressed: gz.clone(),
            bytes_saved: 1,
            attrs: None,
        });
        assert!(journal.rollback());
        assert!(journal.is_empty());
        assert_eq!(std::fs::read(&original).unwrap(), b"staged");
        assert!(!staged.exists());
        assert_eq!(std::fs::read(&plain).unwrap(), b"cold data");
        assert!(!gz.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_compressed_undo_restores_mode_and_mtime() {
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("c.log");
        let gz = dir.path().join("c.log.gz");
        let mut encoder = GzEncoder::new(File::create(&gz).unwrap(), Compression::default());
        encoder.write_all(b"archived").unwrap();
        encoder.finish().unwrap();

        let modified = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        let mut journal = Journal::new();
        journal.record(JournalEntry::Compressed {
            original: plain.clone(),
            compressed: gz.clone(),
            bytes_saved: 1,
            attrs: Some(FileAttrs {
                permissions: Permissions::from_mode(0o640),
                modified: Some(modified),
            }),
        });
        assert!(journal.rollback());

        let meta = std::fs::metadata(&plain).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o640);
        assert_eq!(meta.modified().unwrap(), modified);
        assert_eq!(std::fs::read(&plain).unwrap(), b"archived");
    }

    #[test]
    fn test_commit_clears() {
        let mut journal = Journal::new();
        journal.record(JournalEntry::Compressed {
            original: PathBuf::from("/x"),
            compressed: PathBuf::from("/x.gz"),
            bytes_saved: 10,
            attrs: None,
        });
        let committed = journal.commit();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].bytes_freed(), 10);
        assert!(journal.rollback());
    }
}
