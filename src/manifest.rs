//! Dump manifest: the window bounds and per-collection counts of one dump.
//!
//! Written as `manifest.toml` next to the dump artifacts once everything else
//! is durable, never before.  The restorer reads it to validate expectations;
//! a mismatch is a warning, correctness comes from the artifacts themselves.

use crate::error::{BackupError, Result};
use crate::MANIFEST_FILE_NAME;
use bson::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// A position in the cluster oplog, the comparable form of a bson timestamp.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OplogPosition {
    /// seconds since epoch, cluster-assigned.
    pub time: u32,
    /// ordinal of the operation within that second.
    pub increment: u32,
}

impl From<Timestamp> for OplogPosition {
    fn from(ts: Timestamp) -> Self {
        OplogPosition {
            time: ts.time,
            increment: ts.increment,
        }
    }
}

impl From<OplogPosition> for Timestamp {
    fn from(pos: OplogPosition) -> Self {
        Timestamp {
            time: pos.time,
            increment: pos.increment,
        }
    }
}

/// The captured oplog window of one dump, immutable once finalized.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowBounds {
    start: OplogPosition,
    end: OplogPosition,
}

impl WindowBounds {
    /// Finalize a window; the start position can never be later than the end.
    pub fn new(start: Timestamp, end: Timestamp) -> Result<WindowBounds> {
        let (start, end) = (OplogPosition::from(start), OplogPosition::from(end));
        if start > end {
            return Err(BackupError::InvalidWindow { start, end });
        }
        Ok(WindowBounds { start, end })
    }

    /// Oplog position recorded just before the snapshot began.
    pub fn start(&self) -> OplogPosition {
        self.start
    }

    /// Oplog position recorded once every collection finished dumping.
    pub fn end(&self) -> OplogPosition {
        self.end
    }
}

/// Manifest of one dump invocation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DumpManifest {
    db: String,
    success: bool,
    window: Option<WindowBounds>,
    collections: BTreeMap<String, u64>,
}

impl DumpManifest {
    /// Build a manifest for a completed dump of `db`.
    ///
    /// `window` is `None` for a snapshot-only dump.
    pub fn new(
        db: String,
        window: Option<WindowBounds>,
        collections: BTreeMap<String, u64>,
    ) -> DumpManifest {
        DumpManifest {
            db,
            success: true,
            window,
            collections,
        }
    }

    /// Database the dump covers.
    pub fn db(&self) -> &str {
        &self.db
    }

    /// Whether the dump ran to completion.  A manifest is only ever written on
    /// success, the flag exists so a hand-inspected artifact says so itself.
    pub fn success(&self) -> bool {
        self.success
    }

    /// Captured oplog window, if the dump tailed the oplog.
    pub fn window(&self) -> Option<&WindowBounds> {
        self.window.as_ref()
    }

    /// Documents dumped per collection.
    pub fn collections(&self) -> &BTreeMap<String, u64> {
        &self.collections
    }

    /// Write the manifest into dump directory `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| BackupError::ManifestError {
            detail: e.to_string(),
        })?;
        fs::write(dir.join(MANIFEST_FILE_NAME), content)?;
        Ok(())
    }

    /// Read a manifest back from dump directory `dir`, `Ok(None)` when the
    /// directory holds none.
    pub fn load(dir: &Path) -> Result<Option<DumpManifest>> {
        let path = dir.join(MANIFEST_FILE_NAME);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        let manifest = toml::from_str(&content).map_err(|e| BackupError::ManifestError {
            detail: e.to_string(),
        })?;
        Ok(Some(manifest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(time: u32, increment: u32) -> Timestamp {
        Timestamp { time, increment }
    }

    #[test]
    fn test_window_rejects_start_after_end() {
        let result = WindowBounds::new(ts(10, 2), ts(10, 1));
        assert!(matches!(result, Err(BackupError::InvalidWindow { .. })));
    }

    #[test]
    fn test_window_accepts_equal_bounds() {
        let window = WindowBounds::new(ts(10, 1), ts(10, 1)).unwrap();
        assert_eq!(window.start(), window.end());
    }

    #[test]
    fn test_position_order_follows_time_then_increment() {
        let a = OplogPosition::from(ts(10, 5));
        let b = OplogPosition::from(ts(11, 0));
        let c = OplogPosition::from(ts(11, 1));
        assert!(a < b && b < c);
    }

    #[test]
    fn test_manifest_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut collections = BTreeMap::new();
        collections.insert("bar".to_string(), 1042);

        let window = WindowBounds::new(ts(100, 1), ts(120, 3)).unwrap();
        let manifest = DumpManifest::new("foo".to_string(), Some(window), collections);
        manifest.save(dir.path()).unwrap();

        let loaded = DumpManifest::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, manifest);
        assert_eq!(loaded.collections()["bar"], 1042);
        assert_eq!(loaded.window().unwrap().start(), OplogPosition::from(ts(100, 1)));
    }

    #[test]
    fn test_manifest_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(DumpManifest::load(dir.path()).unwrap().is_none());
    }
}
