//! Test helpers shared by the partition test suites

use std::fs;
use std::path::Path;

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber honouring `RUST_LOG`, once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Overwrite the newest table file of a snapshot directory with garbage.
///
/// Returns false if the directory holds no table.
pub fn corrupt_snapshot(snapshot_dir: &Path) -> std::io::Result<bool> {
    let mut tables: Vec<_> = fs::read_dir(snapshot_dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().map_or(false, |ext| ext == "sst"))
        .collect();
    tables.sort();
    match tables.pop() {
        Some(newest) => {
            fs::write(newest, "<--corrupted-->")?;
            Ok(true)
        }
        None => Ok(false),
    }
}
