use crate::cmd_oplog::CommandEntry;
use crate::error::{BackupError, Result};
use crate::oplog::{OpKind, OplogEntry};
use bson::document::ValueAccessError;
use bson::{doc, Document};
use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use mongodb::options::ReplaceOptions;
use mongodb::sync::{Client, Collection};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{debug, info};

const DUPLICATE_KEY_CODE: i32 = 11000;

/// Outcome of replaying one oplog artifact.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplayStats {
    /// operations whose effect was applied by this replay.
    pub applied: u64,
    /// operations found already applied (or not replayable) and skipped.
    pub skipped: u64,
}

enum ApplyOutcome {
    Applied,
    AlreadyApplied,
}

/// Replays a captured oplog artifact against restored collections.
///
/// Entries apply strictly in stored order, which is capture order, which is
/// timestamp order; reordering would break causality between operations on the
/// same document.  Application is idempotent: the snapshot and the oplog
/// window deliberately overlap, so inserting an existing key, or updating or
/// deleting a missing document, means the entry's effect is already present
/// and the entry is skipped, not failed.
pub struct OplogReplayer {
    client: Client,
}

impl OplogReplayer {
    /// Create a replayer against `client`.
    pub fn new(client: Client) -> OplogReplayer {
        OplogReplayer { client }
    }

    /// Replay every entry of the artifact at `path`.
    ///
    /// Any failure outside the tolerated idempotent cases stops the replay and
    /// reports the partial applied count in [BackupError::ReplayApply].
    pub fn replay(&self, path: &Path) -> Result<ReplayStats> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut stats = ReplayStats::default();

        loop {
            let entry = match OplogEntry::from_reader(&mut reader) {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => return Err(self.fatal(stats.applied, e)),
            };
            match self.apply_entry(&entry) {
                Ok(ApplyOutcome::Applied) => stats.applied += 1,
                Ok(ApplyOutcome::AlreadyApplied) => {
                    debug!(ts = ?entry.timestamp(), ns = entry.namespace(), "Entry already applied, skipped.");
                    stats.skipped += 1;
                }
                Err(e) => return Err(self.fatal(stats.applied, e)),
            }
        }
        info!(applied = stats.applied, skipped = stats.skipped, "Oplog replay finished.");
        Ok(stats)
    }

    fn fatal(&self, applied: u64, e: BackupError) -> BackupError {
        BackupError::ReplayApply {
            applied,
            detail: e.to_string(),
        }
    }

    fn apply_entry(&self, entry: &OplogEntry) -> Result<ApplyOutcome> {
        match entry.kind() {
            OpKind::Insert => self.apply_insert(entry),
            OpKind::Update => self.apply_update(entry),
            OpKind::Delete => self.apply_delete(entry),
            OpKind::Command => self.apply_command(entry),
            // heartbeats and unknown kinds have no replayable effect.
            OpKind::Noop | OpKind::Other => Ok(ApplyOutcome::AlreadyApplied),
        }
    }

    fn apply_insert(&self, entry: &OplogEntry) -> Result<ApplyOutcome> {
        let coll = self.target_coll(entry)?;
        match coll.insert_one(entry.payload()?.clone(), None) {
            Ok(_) => Ok(ApplyOutcome::Applied),
            Err(e) if is_duplicate_key(&e) => Ok(ApplyOutcome::AlreadyApplied),
            Err(e) => Err(e.into()),
        }
    }

    fn apply_update(&self, entry: &OplogEntry) -> Result<ApplyOutcome> {
        let coll = self.target_coll(entry)?;
        let filter = id_filter(entry.target()?)?;
        let mut spec = entry.payload()?.clone();

        let is_operator_update = spec.keys().any(|k| k.starts_with('$'));
        if is_operator_update {
            // $v is mongodb internal versioning, never send it back to a server.
            spec.remove("$v");
            let result = coll.update_one(filter, spec, None)?;
            if result.matched_count == 0 {
                Ok(ApplyOutcome::AlreadyApplied)
            } else {
                Ok(ApplyOutcome::Applied)
            }
        } else {
            // full-document replacement carries the complete new state, so
            // upsert: the target document may only exist on the oplog side of
            // the snapshot/oplog overlap.
            let options = ReplaceOptions::builder().upsert(true).build();
            coll.replace_one(filter, spec, options)?;
            Ok(ApplyOutcome::Applied)
        }
    }

    fn apply_delete(&self, entry: &OplogEntry) -> Result<ApplyOutcome> {
        let coll = self.target_coll(entry)?;
        let filter = id_filter(entry.payload()?)?;
        let result = coll.delete_one(filter, None)?;
        if result.deleted_count == 0 {
            Ok(ApplyOutcome::AlreadyApplied)
        } else {
            Ok(ApplyOutcome::Applied)
        }
    }

    fn apply_command(&self, entry: &OplogEntry) -> Result<ApplyOutcome> {
        match CommandEntry::from_oplog_doc(entry.raw())? {
            Some(cmd) => {
                info!(?cmd, "Applying command oplog entry.");
                cmd.apply(&self.client)?;
                Ok(ApplyOutcome::Applied)
            }
            None => Ok(ApplyOutcome::AlreadyApplied),
        }
    }

    fn target_coll(&self, entry: &OplogEntry) -> Result<Collection<Document>> {
        let (db, coll) = entry
            .namespace_parts()
            .ok_or(BackupError::BsonAccessError(ValueAccessError::NotPresent))?;
        Ok(self.client.database(db).collection(coll))
    }
}

// a structurally valid CRUD entry always carries the `_id` of its target.
fn id_filter(key_doc: &Document) -> Result<Document> {
    let id = key_doc
        .get("_id")
        .cloned()
        .ok_or(BackupError::BsonAccessError(ValueAccessError::NotPresent))?;
    Ok(doc! {"_id": id})
}

fn is_duplicate_key(error: &MongoError) -> bool {
    match error.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(we)) => we.code == DUPLICATE_KEY_CODE,
        _ => false,
    }
}
