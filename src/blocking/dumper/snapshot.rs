use crate::error::{BackupError, Result};
use bson::oid::ObjectId;
use bson::{doc, Document};
use crossbeam::channel;
use mongodb::options::{FindOneOptions, FindOptions};
use mongodb::sync::Collection;
use rayon::ThreadPool;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

const BUF_DOCS: usize = 10000;

/// Per-collection dump outcome reported back to the window coordinator.
pub enum DumpTableStatus {
    /// collection dumped completely, with its document count.
    Done {
        /// collection name.
        coll: String,
        /// documents written to the dump file.
        count: u64,
    },
    /// collection dump failed, the whole dump must abort.
    Failed(BackupError),
}

/// Dump one collection serially into `path`, returning the document count.
///
/// The cursor reads document batches as of dump start; writes happening behind
/// the cursor within the same collection don't affect documents already read.
pub fn dump_one_serial(source_coll: Collection<Document>, path: &Path) -> Result<u64> {
    let mut writer = BufWriter::new(File::create(path)?);
    let mut count = 0u64;
    let cursor = source_coll.find(
        None,
        FindOptions::builder().batch_size(BUF_DOCS as u32).build(),
    )?;
    for doc in cursor {
        doc?.to_writer(&mut writer)?;
        count += 1;
    }
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(count)
}

enum ChunkStatus {
    Data { bytes: Vec<u8>, count: u64 },
    Done,
    Failed(BackupError),
}

/// Dump one large collection into `path` with `doc_concurrent` reader threads.
///
/// Readers split the collection by ObjectId range, serialize their documents
/// into chunks and hand them to the calling thread, which is the only writer
/// of the file.  A collection that can't be split this way, because it has
/// shrunk below the reader count since the routing estimate or because its
/// `_id` values are not ObjectId, is dumped serially instead.
pub fn dump_one_concurrent(
    source_coll: Collection<Document>,
    path: &Path,
    doc_concurrent: usize,
    pool: Arc<ThreadPool>,
) -> Result<u64> {
    // the routing estimate is metadata based and can be stale; recount
    // before splitting.
    let count = source_coll.count_documents(None, None)? as usize;
    if count < doc_concurrent {
        return dump_one_serial(source_coll, path);
    }
    let id_ranges: Vec<(ObjectId, ObjectId)> = match split_ids(&source_coll, doc_concurrent, count)
    {
        Ok(ranges) => ranges,
        // `_id` values outside ObjectId can't be range split.
        Err(BackupError::BsonAccessError(_)) => return dump_one_serial(source_coll, path),
        Err(e) => return Err(e),
    };
    let (sender, receiver) = channel::bounded(doc_concurrent);
    for (id_min, id_max) in id_ranges {
        let source_coll = source_coll.clone();
        let sender = sender.clone();
        pool.spawn(move || {
            let res = read_range(&source_coll, id_min, id_max, &sender);
            match res {
                Err(e) => {
                    let _ = sender.send(ChunkStatus::Failed(e));
                }
                Ok(_) => {
                    let _ = sender.send(ChunkStatus::Done);
                }
            };
        })
    }
    drop(sender);

    let mut writer = BufWriter::new(File::create(path)?);
    let mut count = 0u64;
    let mut workers_done = 0;
    while let Ok(status) = receiver.recv() {
        match status {
            ChunkStatus::Failed(e) => return Err(e),
            ChunkStatus::Data {
                bytes,
                count: chunk_count,
            } => {
                writer.write_all(&bytes)?;
                count += chunk_count;
            }
            ChunkStatus::Done => {
                workers_done += 1;
                if workers_done == doc_concurrent {
                    break;
                }
            }
        }
    }
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(count)
}

fn read_range(
    source_coll: &Collection<Document>,
    id_min: ObjectId,
    id_max: ObjectId,
    sender: &channel::Sender<ChunkStatus>,
) -> Result<()> {
    let cursor = source_coll.find(
        Some(doc! {"_id": {"$gte": id_min, "$lte": id_max}}),
        FindOptions::builder().batch_size(BUF_DOCS as u32).build(),
    )?;

    let mut bytes: Vec<u8> = Vec::new();
    let mut count = 0u64;
    for doc in cursor {
        doc?.to_writer(&mut bytes)?;
        count += 1;
        if count as usize == BUF_DOCS {
            let mut chunk = Vec::new();
            std::mem::swap(&mut bytes, &mut chunk);
            if sender.send(ChunkStatus::Data { bytes: chunk, count }).is_err() {
                // writer side failed and hung up, nothing left to do here.
                return Ok(());
            }
            count = 0;
        }
    }
    if count > 0 {
        let _ = sender.send(ChunkStatus::Data { bytes, count });
    }
    Ok(())
}

/// split `count` documents into ObjectId range pairs, one per reader.
///
/// `count` must be at least `doc_concurrent`, so every reader covers at
/// least one document.
pub fn split_ids(
    coll: &Collection<Document>,
    doc_concurrent: usize,
    count: usize,
) -> Result<Vec<(ObjectId, ObjectId)>> {
    let mut id_ranges: Vec<(ObjectId, ObjectId)> = Vec::with_capacity(doc_concurrent);
    let docs_per_worker = count / doc_concurrent;
    for i in 0..doc_concurrent - 1 {
        let min_id = id_at(coll, (i * docs_per_worker) as u64)?;
        let max_id = id_at(coll, ((i + 1) * docs_per_worker) as u64 - 1)?;
        id_ranges.push((min_id, max_id));
    }

    // last worker gets the remaining ids.
    let last_min_id = id_at(coll, ((doc_concurrent - 1) * docs_per_worker) as u64)?;
    let last_max_id = coll
        .find_one(
            None,
            FindOneOptions::builder().sort(doc! {"_id": -1}).build(),
        )?
        .ok_or(BackupError::BsonAccessError(
            bson::document::ValueAccessError::NotPresent,
        ))?
        .get_object_id("_id")?;
    id_ranges.push((last_min_id, last_max_id));
    Ok(id_ranges)
}

// the _id found `skip` documents into the ascending _id order.
fn id_at(coll: &Collection<Document>, skip: u64) -> Result<ObjectId> {
    let doc = coll
        .find_one(
            None,
            FindOneOptions::builder()
                .sort(doc! {"_id": 1})
                .skip(skip)
                .build(),
        )?
        .ok_or(BackupError::BsonAccessError(
            bson::document::ValueAccessError::NotPresent,
        ))?;
    Ok(doc.get_object_id("_id")?)
}
