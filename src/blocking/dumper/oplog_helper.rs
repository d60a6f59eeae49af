use crate::{BackupError, Result, TIMESTAMP_KEY};
use bson::{doc, Document, Timestamp};
use mongodb::options::{FindOneOptions, FindOptions};
use mongodb::sync::Collection;

enum Natural {
    Earliest,
    Latest,
}

/// Timestamp of the oldest entry still present in the (capped) oplog.
pub fn get_earliest_ts(coll: &Collection<Document>) -> Result<Timestamp> {
    get_one_oplog_ts(coll, Natural::Earliest)
}

/// Timestamp of the newest oplog entry, the cluster's current change-log position.
pub fn get_latest_ts(coll: &Collection<Document>) -> Result<Timestamp> {
    get_one_oplog_ts(coll, Natural::Latest)
}

fn get_one_oplog_ts(coll: &Collection<Document>, natural: Natural) -> Result<Timestamp> {
    let sorted_doc = match natural {
        Natural::Earliest => doc! {"$natural": 1},
        Natural::Latest => doc! {"$natural": -1},
    };

    coll.find_one(None, FindOneOptions::builder().sort(sorted_doc).build())?
        .map(|d| {
            d.get_timestamp(TIMESTAMP_KEY)
                .map_err(BackupError::BsonAccessError)
        })
        .unwrap_or(Err(BackupError::EmptyOplog))
}

/// Fetch up to `batch_size` oplog entries at or after `from`, in timestamp order.
pub fn get_batch_from(
    coll: &Collection<Document>,
    from: Timestamp,
    batch_size: i64,
) -> Result<Vec<Document>> {
    fetch_ordered(coll, doc! {TIMESTAMP_KEY: {"$gte": from}}, batch_size)
}

/// Fetch up to `batch_size` oplog entries strictly after `after`, optionally
/// bounded by `upper` (inclusive), in timestamp order.
pub fn get_next_batch(
    coll: &Collection<Document>,
    after: Timestamp,
    upper: Option<Timestamp>,
    batch_size: i64,
) -> Result<Vec<Document>> {
    let filter = match upper {
        None => doc! {TIMESTAMP_KEY: {"$gt": after}},
        Some(upper) => doc! {TIMESTAMP_KEY: {"$gt": after, "$lte": upper}},
    };
    fetch_ordered(coll, filter, batch_size)
}

fn fetch_ordered(
    coll: &Collection<Document>,
    filter: Document,
    batch_size: i64,
) -> Result<Vec<Document>> {
    let cursor = coll.find(
        filter,
        FindOptions::builder()
            .sort(doc! {TIMESTAMP_KEY: 1})
            .limit(batch_size)
            .build(),
    )?;

    let mut result = vec![];
    for doc in cursor {
        result.push(doc?);
    }
    Ok(result)
}
