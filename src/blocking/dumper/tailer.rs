use super::oplog_helper;
use crate::error::{BackupError, Result};
use crate::oplog::OplogEntry;
use bson::{Document, Timestamp};
use crossbeam::channel::{Receiver, Sender};
use mongodb::sync::Collection;
use std::time::Duration;
use tracing::{debug, warn};

/// how many oplog entries one fetch asks for.
const FETCH_BATCH: i64 = 1000;
/// sleep between polls when the feed is quiet.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// transient fetch failures tolerated before giving up.
const MAX_FETCH_RETRIES: u32 = 5;
/// sleep before retrying a failed fetch.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Control messages from the window coordinator to the tailer.
#[derive(Debug, Clone, Copy)]
pub enum TailerControl {
    /// The snapshot finished; consume up to and including this position, then stop.
    DrainUpTo(Timestamp),
    /// The other sub-task failed; stop immediately.
    Abort,
}

/// Ordered pages of the change feed, as the tailer consumes them.
pub trait OplogFeed {
    /// Up to `limit` entries at or after `from`, in timestamp order.
    fn batch_from(&self, from: Timestamp, limit: i64) -> Result<Vec<Document>>;
    /// Up to `limit` entries strictly after `after`, optionally bounded by
    /// `upper` (inclusive), in timestamp order.
    fn batch_after(&self, after: Timestamp, upper: Option<Timestamp>, limit: i64)
        -> Result<Vec<Document>>;
    /// Timestamp of the oldest entry the feed still holds.
    fn earliest_ts(&self) -> Result<Timestamp>;
}

/// The live `local.oplog.rs` collection as a feed.
pub struct CollectionFeed {
    coll: Collection<Document>,
}

impl OplogFeed for CollectionFeed {
    fn batch_from(&self, from: Timestamp, limit: i64) -> Result<Vec<Document>> {
        oplog_helper::get_batch_from(&self.coll, from, limit)
    }

    fn batch_after(
        &self,
        after: Timestamp,
        upper: Option<Timestamp>,
        limit: i64,
    ) -> Result<Vec<Document>> {
        oplog_helper::get_next_batch(&self.coll, after, upper, limit)
    }

    fn earliest_ts(&self) -> Result<Timestamp> {
        oplog_helper::get_earliest_ts(&self.coll)
    }
}

/// Tails the cluster oplog from a start position and feeds captured entries
/// into a bounded channel, preserving source order.
///
/// The tailer is restartable from its last acknowledged timestamp only: on a
/// transient fetch failure it re-reads from that position, and if the capped
/// oplog has already rotated past it the whole window is lost and the tailer
/// fails with [BackupError::WindowLost].
pub struct OplogTailer<F: OplogFeed = CollectionFeed> {
    feed: F,
    db_name: String,
}

impl OplogTailer<CollectionFeed> {
    /// Create a tailer capturing operations against database `db_name`.
    pub fn new(oplog_coll: Collection<Document>, db_name: String) -> OplogTailer {
        OplogTailer {
            feed: CollectionFeed { coll: oplog_coll },
            db_name,
        }
    }
}

impl<F: OplogFeed> OplogTailer<F> {
    /// Run until drained or aborted; returns the last position read from the
    /// feed (acknowledged position), `None` if nothing was read at all.
    ///
    /// The first fetch is inclusive of the entry at `start` itself, so the
    /// captured window covers `[start, end]` entirely; every later fetch is
    /// strictly after the acknowledged position, so no entry is ever sunk
    /// twice.
    pub fn run(
        self,
        start: Timestamp,
        entries: Sender<OplogEntry>,
        control: Receiver<TailerControl>,
    ) -> Result<Option<Timestamp>> {
        let mut last: Option<Timestamp> = None;
        let mut drain_to: Option<Timestamp> = None;
        let mut retries = 0u32;

        loop {
            while let Ok(ctl) = control.try_recv() {
                match ctl {
                    TailerControl::DrainUpTo(end) => {
                        debug!(?end, "Tailer received drain signal.");
                        drain_to = Some(end);
                    }
                    TailerControl::Abort => {
                        debug!("Tailer received abort signal.");
                        return Ok(last);
                    }
                }
            }

            if let Some(end) = drain_to {
                // The entry at `end` exists in the feed (its position was read
                // from the feed itself), so this is always reached.
                if last.map_or(false, |l| l >= end) {
                    return Ok(last);
                }
            }

            let fetch_result = match last {
                None => self.feed.batch_from(start, FETCH_BATCH),
                Some(l) => self.feed.batch_after(l, drain_to, FETCH_BATCH),
            };

            let batch = match fetch_result {
                Ok(batch) => {
                    retries = 0;
                    batch
                }
                Err(e) => {
                    retries += 1;
                    if retries > MAX_FETCH_RETRIES {
                        return Err(e);
                    }
                    let resume = last.unwrap_or(start);
                    warn!(?e, retries, ?resume, "Oplog fetch failed, retrying from last acknowledged position.");
                    std::thread::sleep(RETRY_DELAY);
                    if let Ok(earliest) = self.feed.earliest_ts() {
                        if earliest > resume {
                            return Err(BackupError::WindowLost {
                                resume_point: resume.into(),
                            });
                        }
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }

            for doc in batch {
                let entry = OplogEntry::from_doc(doc)?;
                // The acknowledged position advances over every feed entry,
                // filtered ones included; a trailing entry for some other
                // database must still close the window.
                last = Some(entry.timestamp());
                if self.wanted(&entry) && entries.send(entry).is_err() {
                    // Sink side is gone; its owner decides the artifact's fate.
                    return Ok(last);
                }
            }
        }
    }

    fn wanted(&self, entry: &OplogEntry) -> bool {
        !entry.is_internal() && entry.database() == Some(self.db_name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use crossbeam::channel;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    // Replays a fixed sequence of fetch outcomes; once the script is used up
    // the feed reads as quiet.
    struct ScriptedFeed {
        pages: RefCell<VecDeque<Result<Vec<Document>>>>,
        earliest: Timestamp,
    }

    impl ScriptedFeed {
        fn new(pages: Vec<Result<Vec<Document>>>, earliest: Timestamp) -> ScriptedFeed {
            ScriptedFeed {
                pages: RefCell::new(pages.into_iter().collect()),
                earliest,
            }
        }

        fn next_page(&self) -> Result<Vec<Document>> {
            self.pages
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Ok(vec![]))
        }
    }

    impl OplogFeed for ScriptedFeed {
        fn batch_from(&self, _from: Timestamp, _limit: i64) -> Result<Vec<Document>> {
            self.next_page()
        }

        fn batch_after(
            &self,
            _after: Timestamp,
            _upper: Option<Timestamp>,
            _limit: i64,
        ) -> Result<Vec<Document>> {
            self.next_page()
        }

        fn earliest_ts(&self) -> Result<Timestamp> {
            Ok(self.earliest)
        }
    }

    fn ts(time: u32) -> Timestamp {
        Timestamp { time, increment: 0 }
    }

    fn insert_doc(time: u32, ns: &str) -> Document {
        doc! {"ts": ts(time), "op": "i", "ns": ns, "o": {"_id": time}}
    }

    fn fetch_error() -> BackupError {
        BackupError::IoError(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset",
        ))
    }

    fn run_tailer(
        feed: ScriptedFeed,
        start: Timestamp,
        pre_control: Vec<TailerControl>,
    ) -> (Result<Option<Timestamp>>, Vec<OplogEntry>) {
        let tailer = OplogTailer {
            feed,
            db_name: "blog".to_string(),
        };
        let (entry_tx, entry_rx) = channel::bounded::<OplogEntry>(16);
        let (control_tx, control_rx) = channel::bounded::<TailerControl>(pre_control.len().max(1));
        for msg in pre_control {
            control_tx.send(msg).unwrap();
        }
        let result = tailer.run(start, entry_tx, control_rx);
        (result, entry_rx.try_iter().collect())
    }

    #[test]
    fn test_tailer_reports_window_lost_when_feed_rotates_past_resume_position() {
        // first fetch fails, and by retry time the feed's oldest entry is
        // already past the start position: the window can't be complete.
        let feed = ScriptedFeed::new(vec![Err(fetch_error())], ts(100));
        let (result, captured) = run_tailer(feed, ts(10), vec![]);

        match result {
            Err(BackupError::WindowLost { resume_point }) => {
                assert_eq!(Timestamp::from(resume_point), ts(10));
            }
            other => panic!("expected WindowLost, got {:?}", other),
        }
        assert!(captured.is_empty());
    }

    #[test]
    fn test_tailer_resumes_after_transient_fetch_failure() {
        // first fetch fails, but the feed still holds the resume position, so
        // the tailer retries from it and drains normally.
        let feed = ScriptedFeed::new(
            vec![Err(fetch_error()), Ok(vec![insert_doc(10, "blog.posts")])],
            ts(1),
        );
        let (result, captured) =
            run_tailer(feed, ts(10), vec![TailerControl::DrainUpTo(ts(10))]);

        assert_eq!(result.unwrap(), Some(ts(10)));
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].namespace(), "blog.posts");
    }

    #[test]
    fn test_tailer_drains_past_trailing_entry_for_other_database() {
        // the entry closing the window belongs to another database: it is
        // filtered out of the capture but still advances the acknowledged
        // position, so the drain completes.
        let feed = ScriptedFeed::new(
            vec![Ok(vec![
                insert_doc(10, "blog.posts"),
                insert_doc(11, "inventory.items"),
            ])],
            ts(1),
        );
        let (result, captured) =
            run_tailer(feed, ts(10), vec![TailerControl::DrainUpTo(ts(11))]);

        assert_eq!(result.unwrap(), Some(ts(11)));
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].namespace(), "blog.posts");
    }

    #[test]
    fn test_tailer_stops_on_abort() {
        let feed = ScriptedFeed::new(vec![Ok(vec![insert_doc(10, "blog.posts")])], ts(1));
        let (result, captured) = run_tailer(feed, ts(10), vec![TailerControl::Abort]);

        assert_eq!(result.unwrap(), None);
        assert!(captured.is_empty());
    }
}
