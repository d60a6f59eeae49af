use crate::manifest::OplogPosition;
use mongodb::error::Error as MongoError;
use std::result::Result as StdResult;
use thiserror::Error;

/// Errors produced by the dump and restore paths.
///
/// Dump-path failures abort the whole dump and leave no manifest behind.
/// Restore-path failures carry the partial progress made so far, since a
/// restore can legitimately be retried.
#[derive(Error, Debug)]
pub enum BackupError {
    /// Mongodb driver error.
    #[error("Mongodb connection error")]
    MongoError(#[from] MongoError),
    /// A bson document misses a key we rely on, or the key has a wrong type.
    #[error("Bson document access error")]
    BsonAccessError(#[from] bson::document::ValueAccessError),
    /// A dump artifact contains bytes which don't decode as bson.
    #[error("Bson deserialize error")]
    BsonDeserializeError(#[from] bson::de::Error),
    /// A document failed to serialize into a dump artifact.
    #[error("Bson serialize error")]
    BsonSerializeError(#[from] bson::ser::Error),
    /// Artifact file I/O error.
    #[error("Dump artifact io error")]
    IoError(#[from] std::io::Error),
    /// The target can't be queried at all, so it can't even be classified.
    #[error("Target {uri:?} is unreachable, detailed: {detail:?}")]
    UnreachableTarget {
        /// connection string of the unreachable target.
        uri: String,
        /// underlying driver error.
        detail: MongoError,
    },
    /// Oplog capture was requested against a topology which can't provide a
    /// consistent oplog window.  Raised before any artifact is produced.
    #[error("Oplog capture refused: {reason}")]
    TopologyIncapable {
        /// why the topology can't support oplog capture.
        reason: String,
    },
    /// The snapshot stopped early because an oplog capture task failed; the
    /// capture task's own error is the one worth reporting.
    #[error("Snapshot aborted, an oplog capture task failed")]
    CaptureAborted,
    /// The oplog rotated past our resume position, the captured window can no
    /// longer claim to be complete.
    #[error("Oplog window lost, can no longer resume from {resume_point:?}")]
    WindowLost {
        /// last position acknowledged before the window was lost.
        resume_point: OplogPosition,
    },
    /// A captured operation failed to apply during replay for a reason other
    /// than the tolerated duplicate/missing-target cases.
    #[error("Oplog replay failed after {applied} applied operations: {detail}")]
    ReplayApply {
        /// operations applied before the failure.
        applied: u64,
        /// description of the failing entry or target-side error.
        detail: String,
    },
    /// The target's oplog holds no entries, no window position can be read.
    #[error("Target oplog is empty, can't read a change-log position")]
    EmptyOplog,
    /// Start of a dump window was recorded after its end.
    #[error("Invalid oplog window: start {start:?} is later than end {end:?}")]
    InvalidWindow {
        /// recorded window start.
        start: OplogPosition,
        /// recorded window end.
        end: OplogPosition,
    },
    /// The dump manifest failed to serialize or parse.
    #[error("Dump manifest error: {detail}")]
    ManifestError {
        /// underlying toml error description.
        detail: String,
    },
}

/// Crate-wide result alias.
pub type Result<T> = StdResult<T, BackupError>;
