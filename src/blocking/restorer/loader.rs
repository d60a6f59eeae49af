use crate::config::DuplicatePolicy;
use crate::error::Result;
use crate::oplog::read_next_document;
use bson::Document;
use mongodb::error::{Error as MongoError, ErrorKind};
use mongodb::options::InsertManyOptions;
use mongodb::sync::Collection;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::debug;

const INSERT_BATCH: usize = 1000;
const DUPLICATE_KEY_CODE: i32 = 11000;

/// Outcome of loading one collection dump file.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoadStats {
    /// documents inserted into the target collection.
    pub loaded: u64,
    /// documents skipped because the target already held their key.
    pub skipped: u64,
}

/// Stream the documents of one dump file into `target_coll`.
///
/// Inserts run unordered in batches.  Under [DuplicatePolicy::Skip] (the
/// default) duplicate-key failures are counted and loading continues, since a
/// restore may be retried over a partially restored target; any other write
/// failure, or any duplicate under [DuplicatePolicy::Abort], fails the load.
pub fn load_collection_file(
    target_coll: &Collection<Document>,
    path: &Path,
    policy: DuplicatePolicy,
) -> Result<LoadStats> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut stats = LoadStats::default();
    let mut batch: Vec<Document> = Vec::with_capacity(INSERT_BATCH);

    while let Some(doc) = read_next_document(&mut reader)? {
        batch.push(doc);
        if batch.len() == INSERT_BATCH {
            let mut to_insert = Vec::with_capacity(INSERT_BATCH);
            std::mem::swap(&mut batch, &mut to_insert);
            insert_batch(target_coll, to_insert, policy, &mut stats)?;
        }
    }
    if !batch.is_empty() {
        insert_batch(target_coll, batch, policy, &mut stats)?;
    }
    Ok(stats)
}

fn insert_batch(
    target_coll: &Collection<Document>,
    batch: Vec<Document>,
    policy: DuplicatePolicy,
    stats: &mut LoadStats,
) -> Result<()> {
    let batch_len = batch.len() as u64;
    let options = InsertManyOptions::builder().ordered(false).build();
    match target_coll.insert_many(batch, options) {
        Ok(_) => {
            stats.loaded += batch_len;
            Ok(())
        }
        Err(e) => match duplicate_key_failures(&e) {
            Some(duplicates) if policy == DuplicatePolicy::Skip => {
                debug!(duplicates, "Skipped documents already present on the target.");
                stats.skipped += duplicates;
                stats.loaded += batch_len - duplicates;
                Ok(())
            }
            _ => Err(e.into()),
        },
    }
}

// Some(n) when the failure consists of nothing but duplicate-key write errors;
// the remaining documents of an unordered batch were still inserted.
fn duplicate_key_failures(error: &MongoError) -> Option<u64> {
    match error.kind.as_ref() {
        ErrorKind::BulkWrite(failure) => {
            if failure.write_concern_error.is_some() {
                return None;
            }
            let write_errors = failure.write_errors.as_ref()?;
            if write_errors.iter().all(|w| w.code == DUPLICATE_KEY_CODE) {
                Some(write_errors.len() as u64)
            } else {
                None
            }
        }
        _ => None,
    }
}
