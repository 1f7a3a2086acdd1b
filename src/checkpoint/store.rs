//! Driver-side persistence: a directory of named snapshots, each a set
//! of five record files. Saving is all-or-nothing — a snapshot missing
//! any record must never be offered for restore — and loading consumes
//! the records.
//!
//! Two drivers capturing under the same name would interleave record
//! writes; serializing same-name saves is the caller's obligation.

use std::fs;
use std::path::{Path, PathBuf};

use super::image::RecordKind;
use super::Snapshot;
use crate::error::{KernelError, Result};

pub struct SnapshotDir {
    root: PathBuf,
}

impl SnapshotDir {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(SnapshotDir { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    fn snapshot_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Persist all five records under `name`. Any write failure removes
    /// the partial snapshot before reporting the error.
    pub fn save(&self, name: &str, snap: &Snapshot) -> Result<()> {
        let dir = self.snapshot_path(name);
        fs::create_dir_all(&dir)?;
        let records = [
            (RecordKind::Descriptor, snap.descriptor_record()),
            (RecordKind::Frame, snap.frame_record()),
            (RecordKind::Context, snap.context_record()),
            (RecordKind::PageTable, snap.page_table_record()),
            (RecordKind::Pages, snap.pages_record()),
        ];
        for (kind, bytes) in &records {
            if let Err(e) = fs::write(dir.join(kind.file_name()), bytes) {
                let _ = fs::remove_dir_all(&dir);
                return Err(KernelError::Io(e));
            }
        }
        log::info!("snapshot '{name}' saved ({} pages)", snap.page_count());
        Ok(())
    }

    /// Read all five records back, validate them as a set, and unlink
    /// them. A snapshot with any record missing is unusable and left
    /// untouched.
    pub fn load(&self, name: &str) -> Result<Snapshot> {
        let dir = self.snapshot_path(name);
        let read = |kind: RecordKind| -> Result<Vec<u8>> {
            fs::read(dir.join(kind.file_name()))
                .map_err(|_| KernelError::MissingRecord(kind.file_name()))
        };
        let descriptor = read(RecordKind::Descriptor)?;
        let frame = read(RecordKind::Frame)?;
        let context = read(RecordKind::Context)?;
        let page_table = read(RecordKind::PageTable)?;
        let pages = read(RecordKind::Pages)?;

        let snap = Snapshot::from_records(&descriptor, &frame, &context, &page_table, &pages)?;
        fs::remove_dir_all(&dir)?;
        log::info!("snapshot '{name}' loaded and unlinked");
        Ok(snap)
    }

    /// Whether a complete snapshot is stored under `name`.
    pub fn contains(&self, name: &str) -> bool {
        let dir = self.snapshot_path(name);
        RecordKind::ALL
            .iter()
            .all(|kind| dir.join(kind.file_name()).is_file())
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        fs::remove_dir_all(self.snapshot_path(name))?;
        Ok(())
    }
}
