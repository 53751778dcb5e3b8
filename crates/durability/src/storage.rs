//! Partition state directories
//!
//! ```text
//! <runtime>/                        -- live database files
//! <snapshots>/<position>/           -- valid snapshot
//! <snapshots>/<name>-tmp/           -- snapshot being written, or abandoned
//! ```
//!
//! Anything else under the snapshots root is ignored and never touched.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use partstate_core::{is_valid_position, Position};

/// Suffix marking an uncommitted snapshot directory.
pub const TMP_SNAPSHOT_SUFFIX: &str = "-tmp";

/// Kind of an entry under the snapshots root, decided by its name only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotEntry {
    /// Committed snapshot named by its position
    Valid(Position),
    /// `-tmp` suffixed directory
    Temporary(String),
    /// Not ours
    Foreign(String),
}

impl SnapshotEntry {
    /// Classify a directory name.
    pub fn classify(name: &str) -> SnapshotEntry {
        if name.ends_with(TMP_SNAPSHOT_SUFFIX) {
            return SnapshotEntry::Temporary(name.to_string());
        }
        // Strict decimal only: "+5" or "05" would alias another snapshot.
        let canonical = !name.is_empty()
            && name.bytes().all(|b| b.is_ascii_digit())
            && (name == "0" || !name.starts_with('0'));
        match name.parse::<Position>() {
            Ok(position) if canonical && is_valid_position(position) => SnapshotEntry::Valid(position),
            _ => SnapshotEntry::Foreign(name.to_string()),
        }
    }
}

/// The runtime and snapshots roots of one partition.
#[derive(Debug, Clone)]
pub struct StateStorage {
    runtime_dir: PathBuf,
    snapshots_dir: PathBuf,
}

impl StateStorage {
    /// Use the given roots, creating both if absent.
    pub fn new(runtime_dir: impl Into<PathBuf>, snapshots_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let storage = StateStorage {
            runtime_dir: runtime_dir.into(),
            snapshots_dir: snapshots_dir.into(),
        };
        fs::create_dir_all(&storage.runtime_dir)?;
        fs::create_dir_all(&storage.snapshots_dir)?;
        Ok(storage)
    }

    /// `<root>/runtime` and `<root>/snapshots`.
    pub fn from_root(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref();
        Self::new(root.join("runtime"), root.join("snapshots"))
    }

    /// Live database directory.
    pub fn runtime_directory(&self) -> &Path {
        &self.runtime_dir
    }

    /// Snapshot root.
    pub fn snapshots_directory(&self) -> &Path {
        &self.snapshots_dir
    }

    /// Directory of the valid snapshot at `position`. No disk access.
    pub fn snapshot_directory_for(&self, position: Position) -> PathBuf {
        self.snapshots_dir.join(position.to_string())
    }

    /// Temporary directory `<name>-tmp`. No disk access.
    pub fn tmp_snapshot_directory_for(&self, name: &str) -> PathBuf {
        self.snapshots_dir
            .join(format!("{}{}", name, TMP_SNAPSHOT_SUFFIX))
    }

    /// Every directory under the snapshot root, unordered.
    pub fn list(&self) -> io::Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&self.snapshots_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                dirs.push(entry.path());
            }
        }
        Ok(dirs)
    }

    /// Positions of valid snapshots, ascending.
    pub fn list_valid(&self) -> io::Result<Vec<Position>> {
        let mut positions: Vec<Position> = self
            .entries()?
            .into_iter()
            .filter_map(|entry| match entry {
                SnapshotEntry::Valid(position) => Some(position),
                _ => None,
            })
            .collect();
        positions.sort_unstable();
        Ok(positions)
    }

    /// Temporary snapshot directories, unordered.
    pub fn list_temporary(&self) -> io::Result<Vec<PathBuf>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter_map(|entry| match entry {
                SnapshotEntry::Temporary(name) => Some(self.snapshots_dir.join(name)),
                _ => None,
            })
            .collect())
    }

    fn entries(&self) -> io::Result<Vec<SnapshotEntry>> {
        Ok(self
            .list()?
            .iter()
            .filter_map(|path| path.file_name().and_then(|n| n.to_str()))
            .map(SnapshotEntry::classify)
            .collect())
    }

    /// Remove everything in the runtime directory, leaving it empty.
    pub fn wipe_runtime(&self) -> io::Result<()> {
        if self.runtime_dir.exists() {
            fs::remove_dir_all(&self.runtime_dir)?;
        }
        fs::create_dir_all(&self.runtime_dir)
    }

    /// Copy the files of `snapshot` into the (empty) runtime directory.
    pub fn seed_runtime_from(&self, snapshot: &Path) -> io::Result<()> {
        for entry in fs::read_dir(snapshot)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::copy(entry.path(), self.runtime_dir.join(entry.file_name()))?;
            }
        }
        fs::File::open(&self.runtime_dir)?.sync_all()
    }

    /// Number of files in a snapshot directory.
    pub fn count_files(dir: &Path) -> io::Result<usize> {
        let mut count = 0;
        for entry in fs::read_dir(dir)? {
            if entry?.file_type()?.is_file() {
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_classify() {
        assert_eq!(SnapshotEntry::classify("2322"), SnapshotEntry::Valid(2322));
        assert_eq!(SnapshotEntry::classify("0"), SnapshotEntry::Valid(0));
        assert_eq!(
            SnapshotEntry::classify("132-tmp"),
            SnapshotEntry::Temporary("132-tmp".to_string())
        );
        let too_high = (u64::MAX).to_string();
        for foreign in ["", "007", "+5", "abc", "12a", "-1", too_high.as_str()] {
            assert_eq!(
                SnapshotEntry::classify(foreign),
                SnapshotEntry::Foreign(foreign.to_string())
            );
        }
    }

    #[test]
    fn test_paths_are_pure() {
        let storage = StateStorage {
            runtime_dir: PathBuf::from("/data/runtime"),
            snapshots_dir: PathBuf::from("/data/snapshots"),
        };
        assert_eq!(
            storage.snapshot_directory_for(45),
            PathBuf::from("/data/snapshots/45")
        );
        assert_eq!(
            storage.tmp_snapshot_directory_for("45"),
            PathBuf::from("/data/snapshots/45-tmp")
        );
    }

    #[test]
    fn test_listing() {
        let dir = tempdir().unwrap();
        let storage = StateStorage::from_root(dir.path()).unwrap();
        for name in ["3", "1", "2-tmp", "notes"] {
            fs::create_dir(storage.snapshots_directory().join(name)).unwrap();
        }
        fs::write(storage.snapshots_directory().join("7"), b"file, not dir").unwrap();

        assert_eq!(storage.list().unwrap().len(), 4);
        assert_eq!(storage.list_valid().unwrap(), vec![1, 3]);
        assert_eq!(
            storage.list_temporary().unwrap(),
            vec![storage.tmp_snapshot_directory_for("2")]
        );
    }

    #[test]
    fn test_wipe_and_seed_runtime() {
        let dir = tempdir().unwrap();
        let storage = StateStorage::from_root(dir.path()).unwrap();
        fs::write(storage.runtime_directory().join("stale"), b"x").unwrap();

        let snapshot = storage.snapshot_directory_for(1);
        fs::create_dir(&snapshot).unwrap();
        fs::write(snapshot.join("a"), b"1").unwrap();
        fs::write(snapshot.join("b"), b"2").unwrap();

        storage.wipe_runtime().unwrap();
        assert_eq!(StateStorage::count_files(storage.runtime_directory()).unwrap(), 0);
        storage.seed_runtime_from(&snapshot).unwrap();
        assert_eq!(StateStorage::count_files(storage.runtime_directory()).unwrap(), 2);
        assert_eq!(StateStorage::count_files(&snapshot).unwrap(), 2);
    }
}
