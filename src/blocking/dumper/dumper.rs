use super::snapshot::{self, DumpTableStatus};
use super::sink::OplogSink;
use super::tailer::{OplogTailer, TailerControl};
use super::{oplog_helper, time_helper};
use crate::blocking::connection::Connection;
use crate::config::DumpConfig;
use crate::error::{BackupError, Result};
use crate::manifest::{DumpManifest, WindowBounds};
use crate::oplog::OplogEntry;
use crate::topology::{authorize_oplog_capture, Authorization};
use crate::{DUMP_FILE_EXTENSION, MANIFEST_FILE_NAME, OPLOG_ARTIFACT_NAME};
use bson::Document;
use crossbeam::channel::{self, Receiver};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};

/// a collection above this estimated size is split over several reader threads.
const LARGE_COLL_SIZE: usize = 10000;
/// bounded capacity of the tailer-to-sink entry channel; when the sink lags
/// this far behind, the tailer blocks instead of buffering without limit.
const OPLOG_BUFFER_SIZE: usize = 1024;

/// Dumps the collections of one database to per-collection files, optionally
/// capturing the oplog window covering the dump.
///
/// With oplog capture the dump window works like this: the current oplog
/// position is recorded, the oplog tailer and the snapshot readers then run
/// concurrently, and once every collection has finished dumping the position
/// is read again and the tailer drains up to it.  Every write committed inside
/// the window ends up in the snapshot or in the oplog artifact at least once;
/// replay-side dedup turns that into exactly-once effect.
pub struct MongoDumper<'a> {
    conf: &'a DumpConfig,
    conn: Connection,
    pool: ThreadPool,
    coll_sync_pool: Arc<ThreadPool>,
}

impl<'a> MongoDumper<'a> {
    /// Create a dumper for `conf`.
    pub fn new(conf: &'a DumpConfig) -> Result<MongoDumper<'a>> {
        let conn = Connection::new(conf.get_src_uri())?;
        Ok(MongoDumper {
            conf,
            conn,
            coll_sync_pool: Arc::new(
                ThreadPoolBuilder::new()
                    .num_threads(conf.get_doc_concurrent())
                    .build()
                    .unwrap(),
            ),
            pool: ThreadPoolBuilder::new()
                .num_threads(conf.get_collection_concurrent())
                .build()
                .unwrap(),
        })
    }

    /// Run the dump, returning the manifest written next to the artifacts.
    ///
    /// With oplog capture requested, the consistency gate runs first: an
    /// incapable topology fails the dump before any artifact exists on disk.
    /// Any sub-task failure aborts the others, partial artifacts are removed
    /// and no manifest is written.
    pub fn dump(&self) -> Result<DumpManifest> {
        let db_name = self.conf.get_db();
        if self.conf.get_oplog() {
            let topology = self.conn.classify()?;
            match authorize_oplog_capture(&topology) {
                Authorization::Deny { reason } => {
                    return Err(BackupError::TopologyIncapable { reason });
                }
                Authorization::Allow => {
                    info!(?topology, "Consistency gate passed, oplog capture authorized.");
                }
            }
        }

        let coll_names = match self.conf.get_colls() {
            None => self.conn.database(db_name).list_collection_names(None)?,
            Some(colls) => colls.clone(),
        };

        let db_dir = self.conf.get_output().join(db_name);
        fs::create_dir_all(&db_dir)?;

        let result = if self.conf.get_oplog() {
            self.dump_with_oplog(&coll_names, &db_dir)
        } else {
            self.dump_snapshot_only(&coll_names, &db_dir)
        };

        let mut manifest_written = false;
        let result = result.and_then(|manifest| {
            manifest_written = true;
            manifest.save(self.conf.get_output())?;
            Ok(manifest)
        });
        match result {
            Ok(manifest) => {
                info!(db = db_name, "Dump complete, manifest written.");
                Ok(manifest)
            }
            Err(e) => {
                self.remove_partial_artifacts(&db_dir, manifest_written);
                Err(e)
            }
        }
    }

    fn dump_snapshot_only(&self, coll_names: &[String], db_dir: &Path) -> Result<DumpManifest> {
        let counts = self.dump_collections(coll_names, db_dir, None)?;
        Ok(DumpManifest::new(self.conf.get_db().to_string(), None, counts))
    }

    fn dump_with_oplog(&self, coll_names: &[String], db_dir: &Path) -> Result<DumpManifest> {
        let db_name = self.conf.get_db();
        let oplog_coll = self.conn.oplog_coll();

        // (a) window opens at the cluster's current change-log position.
        let start = oplog_helper::get_latest_ts(&oplog_coll)?;
        info!(start_time = %time_helper::to_datetime(&start), "Oplog window opened, begin snapshot.");

        let (entry_tx, entry_rx) = channel::bounded::<OplogEntry>(OPLOG_BUFFER_SIZE);
        let (control_tx, control_rx) = channel::bounded::<TailerControl>(1);
        let sink = OplogSink::new(self.conf.get_output().join(OPLOG_ARTIFACT_NAME))?;
        let tailer = OplogTailer::new(oplog_coll.clone(), db_name.to_string());

        // (b)+(c) tailer, sink and snapshot run concurrently.  A capture
        // failure is signalled on `fail_tx` so the snapshot loop stops early
        // instead of dumping every remaining collection for nothing; the
        // reverse direction is the stop handshake below.
        let (fail_tx, fail_rx) = channel::bounded::<()>(2);
        let tailer_fail = fail_tx.clone();
        let tailer_handle = thread::Builder::new()
            .name("oplog tailer".to_string())
            .spawn(move || {
                let res = tailer.run(start, entry_tx, control_rx);
                if res.is_err() {
                    let _ = tailer_fail.send(());
                }
                res
            })?;
        let sink_handle = thread::Builder::new()
            .name("oplog sink".to_string())
            .spawn(move || {
                let res = run_sink(sink, entry_rx);
                if res.is_err() {
                    let _ = fail_tx.send(());
                }
                res
            })?;

        let snapshot_result = self.dump_collections(coll_names, db_dir, Some(fail_rx));

        // (d) window closes at the position reached when the snapshot finished.
        let end_result = match snapshot_result {
            Ok(_) => oplog_helper::get_latest_ts(&oplog_coll),
            Err(_) => Err(BackupError::EmptyOplog), // unused, snapshot error wins below.
        };

        // (e) handshake: drain on success, abort on any failure.
        let control_msg = match (&snapshot_result, &end_result) {
            (Ok(_), Ok(end)) => TailerControl::DrainUpTo(*end),
            _ => TailerControl::Abort,
        };
        // the tailer may have stopped on its own already, that's fine.
        let _ = control_tx.send(control_msg);

        let tailer_result = tailer_handle.join().expect("oplog tailer thread panicked");
        let sink_result = sink_handle.join().expect("oplog sink thread panicked");

        let (counts, end) = match (snapshot_result, end_result, tailer_result) {
            (Ok(counts), Ok(end), Ok(_)) => (counts, end),
            (snapshot, end, tailer) => {
                let sink_outcome = match sink_result {
                    Ok(sink) => {
                        let _ = sink.discard();
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                // a snapshot aborted by a capture failure is a symptom;
                // surface the capture error that caused it instead.
                match snapshot {
                    Err(BackupError::CaptureAborted) => {
                        tailer?;
                        sink_outcome?;
                        return Err(BackupError::CaptureAborted);
                    }
                    other => {
                        other?;
                    }
                }
                // otherwise surface the first failure in pipeline order.
                end?;
                tailer?;
                unreachable!("at least one sub-task result is an error here");
            }
        };
        let sink = sink_result?; // a failed sink has already discarded its file.

        // the capped oplog must still contain the window start, otherwise
        // entries may have rotated away unseen and the window is incomplete.
        match oplog_helper::get_earliest_ts(&oplog_coll) {
            Ok(earliest) if earliest <= start => {}
            Ok(_) => {
                let _ = sink.discard();
                return Err(BackupError::WindowLost {
                    resume_point: start.into(),
                });
            }
            Err(e) => {
                let _ = sink.discard();
                return Err(e);
            }
        }

        // (f) finalize the artifact and the immutable window bounds.
        let artifact = sink.finalize()?;
        info!(
            entries = artifact.entries,
            end_time = %time_helper::to_datetime(&end),
            "Oplog window closed."
        );
        let window = WindowBounds::new(start, end)?;
        Ok(DumpManifest::new(db_name.to_string(), Some(window), counts))
    }

    fn dump_collections(
        &self,
        coll_names: &[String],
        db_dir: &Path,
        watch: Option<Receiver<()>>,
    ) -> Result<BTreeMap<String, u64>> {
        let doc_concurrent = self.conf.get_doc_concurrent();
        let (sender, receiver) = channel::bounded(self.conf.get_collection_concurrent());
        let src_db = self.conn.database(self.conf.get_db());

        let total = coll_names.len();
        for coll in coll_names.iter() {
            let sender = sender.clone();
            let source_coll = src_db.collection::<Document>(coll);
            let path = self.dump_file_path(db_dir, coll);
            let coll_name = coll.clone();
            let doc_count = source_coll.estimated_document_count(None)? as usize;

            if doc_count <= LARGE_COLL_SIZE || doc_concurrent < 2 {
                self.pool.spawn(move || {
                    let status = match snapshot::dump_one_serial(source_coll, &path) {
                        Ok(count) => DumpTableStatus::Done {
                            coll: coll_name,
                            count,
                        },
                        Err(e) => DumpTableStatus::Failed(e),
                    };
                    let _ = sender.send(status);
                })
            } else {
                let coll_pool = self.coll_sync_pool.clone();
                self.pool.spawn(move || {
                    let status = match snapshot::dump_one_concurrent(
                        source_coll,
                        &path,
                        doc_concurrent,
                        coll_pool,
                    ) {
                        Ok(count) => DumpTableStatus::Done {
                            coll: coll_name,
                            count,
                        },
                        Err(e) => DumpTableStatus::Failed(e),
                    };
                    let _ = sender.send(status);
                })
            }
        }
        drop(sender);

        let mut watch = watch;
        let mut counts = BTreeMap::new();
        loop {
            let event = match watch {
                Some(ref w) => match recv_watched(&receiver, w) {
                    WatchedRecv::Status(event) => event,
                    WatchedRecv::Finished => break,
                    // stop feeding the reader pool; the coordinator joins the
                    // failed capture thread and reports its error.
                    WatchedRecv::CaptureFailed => return Err(BackupError::CaptureAborted),
                    WatchedRecv::WatchClosed => {
                        watch = None;
                        continue;
                    }
                },
                None => match receiver.recv() {
                    Ok(event) => event,
                    Err(_) => break,
                },
            };
            match event {
                DumpTableStatus::Done { coll, count } => {
                    info!(%coll, count, "Collection dump complete.");
                    counts.insert(coll, count);
                    if counts.len() == total {
                        break;
                    }
                }
                DumpTableStatus::Failed(e) => {
                    return Err(e);
                }
            }
        }
        Ok(counts)
    }

    fn dump_file_path(&self, db_dir: &Path, coll: &str) -> PathBuf {
        db_dir.join(format!("{}.{}", coll, DUMP_FILE_EXTENSION))
    }

    // a failed dump leaves nothing of itself behind, but only what this
    // invocation created: a snapshot-only failure must not destroy the oplog
    // artifact or manifest an earlier dump left in the same output directory.
    fn remove_partial_artifacts(&self, db_dir: &Path, manifest_written: bool) {
        warn!("Dump failed, removing partial artifacts.");
        if let Err(e) = fs::remove_dir_all(db_dir) {
            warn!(?e, path = ?db_dir, "Failed to remove partial dump directory.");
        }
        let mut names = vec![];
        if self.conf.get_oplog() {
            names.push(OPLOG_ARTIFACT_NAME);
        }
        if manifest_written {
            names.push(MANIFEST_FILE_NAME);
        }
        for name in names {
            let path = self.conf.get_output().join(name);
            if path.exists() {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(?e, ?path, "Failed to remove partial dump artifact.");
                }
            }
        }
    }
}

enum WatchedRecv {
    /// a collection dump reported its status.
    Status(DumpTableStatus),
    /// all collection dumps hung up.
    Finished,
    /// a capture thread signalled failure.
    CaptureFailed,
    /// both capture threads hung up without failing.
    WatchClosed,
}

// One receive step of the snapshot status loop while a capture watch is
// active: whichever side becomes ready first wins.
fn recv_watched(statuses: &Receiver<DumpTableStatus>, watch: &Receiver<()>) -> WatchedRecv {
    crossbeam::select! {
        recv(statuses) -> event => match event {
            Ok(event) => WatchedRecv::Status(event),
            Err(_) => WatchedRecv::Finished,
        },
        recv(watch) -> signal => match signal {
            Ok(()) => WatchedRecv::CaptureFailed,
            Err(_) => WatchedRecv::WatchClosed,
        },
    }
}

// Drains captured entries into the sink in receipt order.  On a write failure
// the sink discards its partial artifact and the error surfaces to the
// coordinator, which aborts the tailer and the snapshot.
fn run_sink(mut sink: OplogSink, entries: Receiver<OplogEntry>) -> Result<OplogSink> {
    for entry in entries.iter() {
        if let Err(e) = sink.append(&entry) {
            let _ = sink.discard();
            return Err(e);
        }
    }
    Ok(sink)
}
