//! Dump and restore scenarios.  Most need a live deployment and are run with
//! `cargo test -- --ignored`.
//!
//! `BACKUP_TEST_RS_URI` must point at a replica set member (default
//! mongodb://localhost:27017), `BACKUP_TEST_STANDALONE_URI` at a plain
//! standalone mongod (default mongodb://localhost:27018).

use bson::{doc, Document};
use mongo_backup::blocking::dumper::snapshot;
use mongo_backup::oplog::read_next_document;
use mongo_backup::{BackupError, DumpConfig, MongoDumper, MongoRestorer, RestoreConfig};
use mongodb::sync::{Client, Collection, Database};
use rayon::ThreadPoolBuilder;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn rs_uri() -> &'static str {
    option_env!("BACKUP_TEST_RS_URI").unwrap_or("mongodb://localhost:27017")
}

fn standalone_uri() -> &'static str {
    option_env!("BACKUP_TEST_STANDALONE_URI").unwrap_or("mongodb://localhost:27018")
}

struct Context {
    pub client: Client,
    pub db: Database,
}

impl Context {
    fn new(uri: &str, db_name: &str) -> Self {
        let client = Client::with_uri_str(uri).unwrap();
        let db = client.database(db_name);
        db.drop(None).unwrap();
        Context { client, db }
    }

    fn coll(&self) -> Collection<Document> {
        self.db.collection("bar")
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.db.drop(None).unwrap();
    }
}

fn dump_conf(uri: &str, db: &str, output: &Path, oplog: bool) -> DumpConfig {
    DumpConfig::new(
        uri.to_string(),
        db.to_string(),
        None,
        output.to_path_buf(),
        oplog,
        Some(2),
        Some(2),
    )
}

fn restore_conf(uri: &str, source: &Path) -> RestoreConfig {
    RestoreConfig::new(uri.to_string(), source.to_path_buf(), None)
}

fn count_dump_file(path: &Path) -> u64 {
    let mut reader = BufReader::new(File::open(path).unwrap());
    let mut count = 0;
    while read_next_document(&mut reader).unwrap().is_some() {
        count += 1;
    }
    count
}

#[test]
#[ignore = "requires a running standalone mongod"]
fn test_oplog_dump_fails_fast_on_standalone() {
    let context = Context::new(standalone_uri(), "backup_test_standalone");
    for i in 0..100 {
        context.coll().insert_one(doc! {"x": i}, None).unwrap();
    }

    let dir = tempfile::tempdir().unwrap();
    let conf = dump_conf(standalone_uri(), "backup_test_standalone", dir.path(), true);
    let dumper = MongoDumper::new(&conf).unwrap();
    let result = dumper.dump();

    assert!(matches!(result, Err(BackupError::TopologyIncapable { .. })));
    // fail fast means zero artifacts: no data files, no oplog, no manifest.
    assert!(!dir.path().join("backup_test_standalone").exists());
    assert!(!dir.path().join("oplog.bson").exists());
    assert!(!dir.path().join("manifest.toml").exists());

    // a plain restore from the (empty) dump directory restores nothing.
    context.db.drop(None).unwrap();
    let conf = restore_conf(standalone_uri(), dir.path());
    let restorer = MongoRestorer::new(&conf).unwrap();
    let stats = restorer.restore().unwrap();
    assert_eq!(stats.loaded, 0);
    assert_eq!(context.coll().count_documents(None, None).unwrap(), 0);
}

#[test]
#[ignore = "requires a running replica set"]
fn test_oplog_dump_bounded_overshoot() {
    let context = Context::new(rs_uri(), "backup_test_overshoot");
    let docs: Vec<Document> = (0..1000).map(|i| doc! {"x": i}).collect();
    context.coll().insert_many(docs, None).unwrap();

    // concurrent inserter adding documents 1000..2000 while the dump runs.
    let inserter_client = context.client.clone();
    let inserter = std::thread::spawn(move || {
        let coll = inserter_client
            .database("backup_test_overshoot")
            .collection::<Document>("bar");
        for i in 1000..2000 {
            coll.insert_one(doc! {"x": i}, None).unwrap();
            std::thread::sleep(Duration::from_millis(1));
        }
    });
    // give the inserter some time to actually start before dumping.
    std::thread::sleep(Duration::from_millis(100));
    let count_before_dump = context.coll().count_documents(None, None).unwrap();
    assert!(count_before_dump > 1000);

    let dir = tempfile::tempdir().unwrap();
    let conf = dump_conf(rs_uri(), "backup_test_overshoot", dir.path(), true);
    let manifest = MongoDumper::new(&conf).unwrap().dump().unwrap();
    assert!(manifest.window().is_some());
    assert!(dir.path().join("oplog.bson").exists());

    inserter.join().unwrap();
    context.db.drop(None).unwrap();
    assert_eq!(context.coll().count_documents(None, None).unwrap(), 0);

    let rconf = restore_conf(rs_uri(), dir.path());
    let restorer = MongoRestorer::new(&rconf).unwrap();
    restorer.restore().unwrap();

    // the window closed somewhere inside the concurrent insert stream: the
    // restored count covers everything up to dump start, but not the inserts
    // landing after the window closed.
    let restored = context.coll().count_documents(None, None).unwrap();
    assert!(restored >= count_before_dump, "restored {} < {}", restored, count_before_dump);
    assert!(restored < 2000, "restored {} >= 2000", restored);
}

#[test]
#[ignore = "requires a running replica set"]
fn test_replay_is_idempotent() {
    let context = Context::new(rs_uri(), "backup_test_idempotent");
    for i in 0..500 {
        context.coll().insert_one(doc! {"_id": i, "x": i}, None).unwrap();
    }
    context
        .coll()
        .update_one(doc! {"_id": 42}, doc! {"$set": {"x": -1}}, None)
        .unwrap();
    context.coll().delete_one(doc! {"_id": 17}, None).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let conf = dump_conf(rs_uri(), "backup_test_idempotent", dir.path(), true);
    MongoDumper::new(&conf).unwrap().dump().unwrap();

    context.db.drop(None).unwrap();
    let rconf = restore_conf(rs_uri(), dir.path());
    let restorer = MongoRestorer::new(&rconf).unwrap();
    restorer.restore().unwrap();
    let count_once = context.coll().count_documents(None, None).unwrap();
    let doc_once = context.coll().find_one(doc! {"_id": 42}, None).unwrap();

    // restoring the same artifacts again over the restored state changes nothing.
    let stats = restorer.restore().unwrap();
    assert_eq!(context.coll().count_documents(None, None).unwrap(), count_once);
    assert_eq!(context.coll().find_one(doc! {"_id": 42}, None).unwrap(), doc_once);
    assert!(stats.skipped > 0);
}

#[test]
fn test_failed_dump_preserves_artifacts_of_earlier_dumps() {
    let dir = tempfile::tempdir().unwrap();
    // leftovers of an earlier, successful oplog dump into the same directory.
    std::fs::write(dir.path().join("oplog.bson"), b"earlier window").unwrap();
    std::fs::write(dir.path().join("manifest.toml"), b"db = \"blog\"").unwrap();

    // nothing listens on the discard port, so the snapshot fails once server
    // selection times out.
    let conf = DumpConfig::new(
        "mongodb://localhost:9/?serverSelectionTimeoutMS=1000&connectTimeoutMS=1000".to_string(),
        "blog".to_string(),
        Some(vec!["bar".to_string()]),
        dir.path().to_path_buf(),
        false,
        Some(1),
        Some(1),
    );
    let dumper = MongoDumper::new(&conf).unwrap();
    assert!(dumper.dump().is_err());

    // the failed snapshot-only dump cleans up only what it created itself.
    assert!(!dir.path().join("blog").exists());
    assert_eq!(
        std::fs::read(dir.path().join("oplog.bson")).unwrap(),
        b"earlier window"
    );
    assert!(dir.path().join("manifest.toml").exists());
}

#[test]
#[ignore = "requires a running replica set"]
fn test_concurrent_dump_of_shrunken_collection_falls_back_to_serial() {
    let context = Context::new(rs_uri(), "backup_test_small_split");
    for i in 0..5 {
        context.coll().insert_one(doc! {"x": i}, None).unwrap();
    }

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bar.bson");
    let pool = Arc::new(ThreadPoolBuilder::new().num_threads(8).build().unwrap());
    // more readers than documents: an ObjectId range split would be degenerate.
    let count = snapshot::dump_one_concurrent(context.coll(), &path, 8, pool).unwrap();

    assert_eq!(count, 5);
    assert_eq!(count_dump_file(&path), 5);
}

#[test]
#[ignore = "requires a running replica set"]
fn test_concurrent_dump_of_non_objectid_collection_falls_back_to_serial() {
    let context = Context::new(rs_uri(), "backup_test_string_ids");
    let docs: Vec<Document> = (0..50)
        .map(|i| doc! {"_id": format!("k{}", i), "x": i})
        .collect();
    context.coll().insert_many(docs, None).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bar.bson");
    let pool = Arc::new(ThreadPoolBuilder::new().num_threads(4).build().unwrap());
    let count = snapshot::dump_one_concurrent(context.coll(), &path, 4, pool).unwrap();

    assert_eq!(count, 50);
    assert_eq!(count_dump_file(&path), 50);
}

#[test]
#[ignore = "requires a running replica set"]
fn test_snapshot_only_dump_has_no_oplog_artifact() {
    let context = Context::new(rs_uri(), "backup_test_plain");
    for i in 0..100 {
        context.coll().insert_one(doc! {"x": i}, None).unwrap();
    }

    let dir = tempfile::tempdir().unwrap();
    let conf = dump_conf(rs_uri(), "backup_test_plain", dir.path(), false);
    let manifest = MongoDumper::new(&conf).unwrap().dump().unwrap();

    assert!(manifest.window().is_none());
    assert!(!dir.path().join("oplog.bson").exists());
    assert_eq!(manifest.collections()["bar"], 100);

    context.db.drop(None).unwrap();
    let rconf = restore_conf(rs_uri(), dir.path());
    let restorer = MongoRestorer::new(&rconf).unwrap();
    let stats = restorer.restore().unwrap();
    assert_eq!(stats.loaded, 100);
    assert_eq!(stats.applied, 0);
    assert_eq!(context.coll().count_documents(None, None).unwrap(), 100);
}
