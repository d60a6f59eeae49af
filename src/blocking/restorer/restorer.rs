use super::loader;
use super::replayer::OplogReplayer;
use crate::blocking::connection::Connection;
use crate::config::RestoreConfig;
use crate::error::Result;
use crate::manifest::DumpManifest;
use crate::{DUMP_FILE_EXTENSION, OPLOG_ARTIFACT_NAME};
use bson::Document;
use std::fs;
use std::io;
use std::path::Path;
use tracing::{info, warn};

/// Running counters of one restore invocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct RestoreStats {
    /// documents loaded from the snapshot files.
    pub loaded: u64,
    /// documents skipped because the target already held their key.
    pub skipped: u64,
    /// oplog operations applied on top of the loaded data.
    pub applied: u64,
}

/// Restores a dump directory into a target cluster.
///
/// Loading is strictly single-phase: every snapshot file is loaded to
/// completion first, and only then, if the dump captured an oplog window, the
/// artifact is replayed.  Replay semantics assume snapshot state as the base,
/// never a partially loaded one.
pub struct MongoRestorer<'a> {
    conf: &'a RestoreConfig,
    conn: Connection,
}

impl<'a> MongoRestorer<'a> {
    /// Create a restorer for `conf`.
    pub fn new(conf: &'a RestoreConfig) -> Result<MongoRestorer<'a>> {
        let conn = Connection::new(conf.get_target_uri())?;
        Ok(MongoRestorer { conf, conn })
    }

    /// Run the restore, returning the counters on success.
    ///
    /// A dump without an oplog artifact restores snapshot-only.  Failures
    /// surface with the partial progress made, a restore may be retried.
    pub fn restore(&self) -> Result<RestoreStats> {
        let source = self.conf.get_source();
        if !source.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("dump directory {:?} does not exist", source),
            )
            .into());
        }

        let manifest = DumpManifest::load(source)?;
        if let Some(manifest) = &manifest {
            info!(db = manifest.db(), success = manifest.success(), "Found dump manifest.");
        }

        let mut stats = RestoreStats::default();
        self.load_snapshot(source, manifest.as_ref(), &mut stats)?;

        let oplog_path = source.join(OPLOG_ARTIFACT_NAME);
        if oplog_path.exists() {
            info!("Oplog artifact present, begin replay on top of loaded data.");
            let replayer = OplogReplayer::new(self.conn.client().clone());
            let replay = replayer.replay(&oplog_path)?;
            stats.applied = replay.applied;
        } else {
            info!("No oplog artifact, snapshot-only restore.");
        }

        info!(
            loaded = stats.loaded,
            skipped = stats.skipped,
            applied = stats.applied,
            "Restore complete."
        );
        Ok(stats)
    }

    fn load_snapshot(
        &self,
        source: &Path,
        manifest: Option<&DumpManifest>,
        stats: &mut RestoreStats,
    ) -> Result<()> {
        for entry in fs::read_dir(source)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let db_name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            let db = self.conn.database(&db_name);

            for file in fs::read_dir(entry.path())? {
                let path = file?.path();
                if path.extension().and_then(|e| e.to_str()) != Some(DUMP_FILE_EXTENSION) {
                    continue;
                }
                let coll_name = match path.file_stem().and_then(|s| s.to_str()) {
                    Some(name) => name.to_string(),
                    None => continue,
                };

                let target_coll = db.collection::<Document>(&coll_name);
                let load = loader::load_collection_file(
                    &target_coll,
                    &path,
                    self.conf.get_duplicate_policy(),
                )?;
                info!(
                    db = %db_name,
                    coll = %coll_name,
                    loaded = load.loaded,
                    skipped = load.skipped,
                    "Collection loaded."
                );
                self.check_expectation(manifest, &db_name, &coll_name, load.loaded + load.skipped);
                stats.loaded += load.loaded;
                stats.skipped += load.skipped;
            }
        }
        Ok(())
    }

    // manifest counts are expectations, not a correctness gate.
    fn check_expectation(
        &self,
        manifest: Option<&DumpManifest>,
        db_name: &str,
        coll_name: &str,
        found: u64,
    ) {
        if let Some(manifest) = manifest {
            if manifest.db() == db_name {
                if let Some(expected) = manifest.collections().get(coll_name) {
                    if *expected != found {
                        warn!(
                            coll = %coll_name,
                            expected, found,
                            "Dump file document count differs from manifest."
                        );
                    }
                }
            }
        }
    }
}
