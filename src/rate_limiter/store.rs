//! Persisted quota state.
//!
//! Lets a restarted process pick up the windows it had already spent
//! instead of assuming a fresh quota and getting throttled by the server.
//!
//! ```text
//!     QuotaTracker ──snapshot()──► [WindowState] ──save()──► quota.json
//!     QuotaTracker ◄─restore()──── [WindowState] ◄─load()─── quota.json
//! ```

use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// One endpoint's window as written to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowState {
    /// Endpoint the window belongs to.
    pub endpoint_id: String,
    /// Window start, epoch milliseconds.
    pub window_start: u64,
    /// Window length in milliseconds.
    pub window_duration_ms: u64,
    /// Calls already spent in the window.
    pub used: u64,
}

impl WindowState {
    /// Epoch milliseconds at which this window resets.
    pub fn resets_at_ms(&self) -> u64 {
        self.window_start.saturating_add(self.window_duration_ms)
    }
}

/// Keyed store of quota windows.
///
/// A store that has never been written must load as empty, not as an error.
pub trait QuotaStore: Send + Sync + fmt::Debug {
    /// Reads every persisted window.
    fn load(&self) -> Result<Vec<WindowState>, StoreError>;

    /// Replaces the persisted windows.
    fn save(&self, windows: &[WindowState]) -> Result<(), StoreError>;
}

/// JSON file store, written atomically through a sibling temp file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Store backed by `path`. Nothing is touched until the first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File the store reads and writes.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl QuotaStore for JsonFileStore {
    fn load(&self) -> Result<Vec<WindowState>, StoreError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == IoErrorKind::NotFound => {
                debug!("No quota state at {}, starting empty", self.path.display());
                return Ok(Vec::new());
            }
            Err(err) => return Err(err.into()),
        };
        let windows: Vec<WindowState> = serde_json::from_reader(BufReader::new(file))?;
        debug!("Loaded {} quota windows from {}", windows.len(), self.path.display());
        Ok(windows)
    }

    fn save(&self, windows: &[WindowState]) -> Result<(), StoreError> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;

        // Each save gets its own temp file so concurrent saves never share one.
        let mut temp = NamedTempFile::new_in(parent)?;
        {
            let mut writer = BufWriter::new(temp.as_file_mut());
            serde_json::to_writer_pretty(&mut writer, windows)?;
            writer.flush()?;
        }
        temp.persist(&self.path).map_err(|err| err.error)?;
        debug!("Saved {} quota windows to {}", windows.len(), self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn state(endpoint: &str, used: u64) -> WindowState {
        WindowState {
            endpoint_id: endpoint.to_string(),
            window_start: 1_000,
            window_duration_ms: 60_000,
            used,
        }
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("absent.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested").join("quota.json"));

        let windows = vec![state("search", 3), state("timeline", 0)];
        store.save(&windows).unwrap();
        assert_eq!(store.load().unwrap(), windows);
        assert_eq!(fs::read_dir(dir.path().join("nested")).unwrap().count(), 1);

        store.save(&windows[..1]).unwrap();
        assert_eq!(store.load().unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_saves_leave_a_whole_file() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(JsonFileStore::new(dir.path().join("quota.json")));

        let handles: Vec<_> = (0..8u64)
            .map(|i| {
                let store = store.clone();
                thread::spawn(move || {
                    let windows: Vec<WindowState> =
                        (0..50).map(|n| state(&format!("endpoint-{}", n), i)).collect();
                    for _ in 0..10 {
                        store.save(&windows).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 50);
        let used = loaded[0].used;
        assert!(loaded.iter().all(|w| w.used == used));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_corrupt_file_is_format_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("quota.json");
        fs::write(&path, b"not json").unwrap();

        let err = JsonFileStore::new(&path).load().unwrap_err();
        assert!(matches!(err, StoreError::Format(_)));
    }

    #[test]
    fn test_resets_at() {
        assert_eq!(state("x", 0).resets_at_ms(), 61_000);
    }
}
