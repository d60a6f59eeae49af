//! Dumper and restorer configuration.

use std::path::{Path, PathBuf};

/// How the restore loader treats a document which already exists on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Count the duplicate and keep loading; a restore may be retried.
    Skip,
    /// Fail the restore on the first duplicate.
    Abort,
}

impl Default for DuplicatePolicy {
    fn default() -> Self {
        DuplicatePolicy::Skip
    }
}

/// Configuration for one dump invocation.
#[derive(Debug)]
pub struct DumpConfig {
    src_uri: String,
    db: String,
    colls: Option<Vec<String>>,
    output: PathBuf,
    oplog: bool,
    collection_concurrent: usize,
    doc_concurrent: usize,
}

impl DumpConfig {
    /// Create a dump configuration.
    ///
    /// `colls` of `None` dumps every collection of `db`.  `oplog` requests
    /// oplog-window capture, which requires a replica set target.  The
    /// concurrency knobs default to the number of cpus.
    pub fn new(
        src_uri: String,
        db: String,
        colls: Option<Vec<String>>,
        output: PathBuf,
        oplog: bool,
        collection_concurrent: Option<usize>,
        doc_concurrent: Option<usize>,
    ) -> DumpConfig {
        DumpConfig {
            src_uri,
            db,
            colls,
            output,
            oplog,
            collection_concurrent: collection_concurrent.unwrap_or_else(num_cpus::get),
            doc_concurrent: doc_concurrent.unwrap_or_else(num_cpus::get),
        }
    }

    /// source mongodb uri.
    pub fn get_src_uri(&self) -> &str {
        &self.src_uri
    }

    /// database to dump.
    pub fn get_db(&self) -> &str {
        &self.db
    }

    /// collections to dump, `None` means all collections of the database.
    pub fn get_colls(&self) -> Option<&Vec<String>> {
        self.colls.as_ref()
    }

    /// dump output directory.
    pub fn get_output(&self) -> &Path {
        &self.output
    }

    /// whether to capture the oplog window alongside the data dump.
    pub fn get_oplog(&self) -> bool {
        self.oplog
    }

    /// how many collections to dump concurrently.
    pub fn get_collection_concurrent(&self) -> usize {
        self.collection_concurrent
    }

    /// how many reader threads to use inside one large collection.
    pub fn get_doc_concurrent(&self) -> usize {
        self.doc_concurrent
    }
}

/// Configuration for one restore invocation.
#[derive(Debug)]
pub struct RestoreConfig {
    target_uri: String,
    source: PathBuf,
    duplicate_policy: DuplicatePolicy,
}

impl RestoreConfig {
    /// Create a restore configuration reading artifacts from `source`.
    pub fn new(
        target_uri: String,
        source: PathBuf,
        duplicate_policy: Option<DuplicatePolicy>,
    ) -> RestoreConfig {
        RestoreConfig {
            target_uri,
            source,
            duplicate_policy: duplicate_policy.unwrap_or_default(),
        }
    }

    /// target mongodb uri.
    pub fn get_target_uri(&self) -> &str {
        &self.target_uri
    }

    /// dump directory to restore from.
    pub fn get_source(&self) -> &Path {
        &self.source
    }

    /// duplicate-key policy for the loader.
    pub fn get_duplicate_policy(&self) -> DuplicatePolicy {
        self.duplicate_policy
    }
}
