//! Point-in-time consistent backup and restore for live mongodb clusters.
//!
//! Provides one dumper: [MongoDumper], and one restorer: [MongoRestorer].
//!
//! [MongoDumper] streams the documents of selected collections into per-collection
//! dump files while the cluster keeps taking writes.  When oplog capture is requested
//! it concurrently tails the cluster oplog over the dump window, so the resulting
//! artifacts describe one consistent point in time.  [MongoRestorer] loads the dump
//! files back and, when an oplog artifact is present, replays the captured window
//! idempotently on top of the loaded data.
//!
//! Oplog capture is only offered against a replica set target.  Standalone nodes and
//! sharded routers don't expose a single totally ordered oplog, so the dumper refuses
//! before producing any artifact instead of writing a backup which can't be trusted.
//!
//! # MongoDumper example:
//! ```no_run
//! use mongo_backup::{DumpConfig, MongoDumper};
//!
//! let conf = DumpConfig::new(
//!     "mongodb://localhost:27017".to_string(),
//!     "foo".to_string(),
//!     None,
//!     "dump".into(),
//!     true,
//!     None,
//!     None,
//! );
//! let dumper = MongoDumper::new(&conf).unwrap();
//! let manifest = dumper.dump().unwrap();
//! println!("dumped {} collections", manifest.collections().len());
//! ```
//!
//! # MongoRestorer example:
//! ```no_run
//! use mongo_backup::{MongoRestorer, RestoreConfig};
//!
//! let conf = RestoreConfig::new("mongodb://localhost:27017".to_string(), "dump".into(), None);
//! let restorer = MongoRestorer::new(&conf).unwrap();
//! let stats = restorer.restore().unwrap();
//! println!("loaded {} documents, replayed {} operations", stats.loaded, stats.applied);
//! ```

#![warn(missing_docs)]

#[doc(hidden)]
pub mod blocking;
pub mod cmd_oplog;
mod config;
mod error;
mod manifest;
pub mod oplog;
pub mod topology;

/// mongodb internal database for admin.
const ADMIN_DB_NAME: &str = "admin";
/// mongodb internal database which saves oplogs.
const OPLOG_DB: &str = "local";
/// mongodb internal collection which saves oplogs.
const OPLOG_COLL: &str = "oplog.rs";

/// oplog namespace key name.
const NAMESPACE_KEY: &str = "ns";
/// oplog timestamp key name.
const TIMESTAMP_KEY: &str = "ts";
/// oplog operation key name.
const OP_KEY: &str = "op";

/// file name of the captured oplog window inside a dump directory.
const OPLOG_ARTIFACT_NAME: &str = "oplog.bson";
/// file name of the dump manifest inside a dump directory.
const MANIFEST_FILE_NAME: &str = "manifest.toml";
/// extension of per-collection dump files.
const DUMP_FILE_EXTENSION: &str = "bson";

pub use blocking::{Connection, MongoDumper, MongoRestorer, RestoreStats};
pub use config::{DumpConfig, DuplicatePolicy, RestoreConfig};
pub use error::{BackupError, Result};
pub use manifest::{DumpManifest, OplogPosition, WindowBounds};
