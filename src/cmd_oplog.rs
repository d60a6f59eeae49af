//! Structured command-type oplog entries and their idempotent replay.
//!
//! Besides plain document writes, the oplog records admin commands: collection
//! creation, drops, renames and index changes.  During replay those have the
//! same at-least-once delivery as document writes, so applying one against a
//! target which already reflects it must succeed silently.

use bson::{doc, Document};
use mongodb::error::{Error as MongoError, ErrorKind, Result as MongoResult};
use mongodb::sync::Client as MongoClient;
use tracing::warn;

use crate::{BackupError, Result};

/// A `database` / `collection` namespace pair.
#[derive(Debug, PartialEq)]
pub struct CollNs<'a> {
    db_name: &'a str,
    coll_name: &'a str,
}

impl<'a> CollNs<'a> {
    /// construct a namespace from `db_name` and `coll_name`.
    pub fn new(db_name: &'a str, coll_name: &'a str) -> Self {
        CollNs { db_name, coll_name }
    }
}

/// A recognized command oplog entry.
///
/// Use [CommandEntry::from_oplog_doc] to parse a raw `op: "c"` oplog document,
/// then [apply](CommandEntry::apply) to replay it against a target.  Commands
/// the crate doesn't recognize parse to `None` and are skipped by the replayer.
#[derive(Debug, PartialEq)]
pub enum CommandEntry<'a> {
    /// rename collection command.
    RenameCollection {
        /// rename namespace from.
        from: CollNs<'a>,
        /// rename namespace to.
        to: CollNs<'a>,
    },
    /// drop collection command.
    DropCollection(CollNs<'a>),
    /// create collection command.
    CreateCollection(CollNs<'a>),
    /// drop index command.
    DropIndexes {
        /// namespace whose index is dropped.
        ns: CollNs<'a>,
        /// index name.
        name: &'a str,
    },
    /// create index command.
    CreateIndexes {
        /// namespace the index is created on.
        ns: CollNs<'a>,
        /// index key spec.
        key: &'a Document,
        /// index name.
        name: &'a str,
        /// unique index?
        unique: bool,
        /// partial index filter, see <https://docs.mongodb.com/manual/core/index-partial/>
        partial_filter_expression: Option<&'a Document>,
    },
}

fn invalid_entry(detail: String) -> BackupError {
    BackupError::ReplayApply { applied: 0, detail }
}

fn split_ns(ns: &str) -> Result<(&str, &str)> {
    ns.split_once('.')
        .ok_or_else(|| invalid_entry(format!("namespace {:?} is not split by '.'", ns)))
}

impl<'a> CommandEntry<'a> {
    /// Parse a command oplog document.
    ///
    /// Returns `Ok(None)` when the command isn't one this crate replays; a
    /// structurally broken document is an error.
    ///
    /// # Example
    /// ```
    /// use mongo_backup::cmd_oplog::{CommandEntry, CollNs};
    /// use bson::doc;
    /// let test_doc = doc! {"ns": "a.$cmd", "o": {"renameCollection": "a.b", "to": "a.c"}};
    /// let cmd = CommandEntry::from_oplog_doc(&test_doc).unwrap().unwrap();
    /// assert_eq!(
    ///     cmd,
    ///     CommandEntry::RenameCollection {
    ///         from: CollNs::new("a", "b"),
    ///         to: CollNs::new("a", "c")
    ///     }
    /// );
    /// ```
    pub fn from_oplog_doc(doc: &'a Document) -> Result<Option<Self>> {
        let obj = doc.get_document("o")?;
        let (db, _) = split_ns(doc.get_str("ns")?)?;

        if obj.contains_key("renameCollection") {
            // obj structure:
            // {"renameCollection": "ns", "to": "ns"}
            let (from_db, from_coll) = split_ns(obj.get_str("renameCollection")?)?;
            let (to_db, to_coll) = split_ns(obj.get_str("to")?)?;
            Ok(Some(CommandEntry::RenameCollection {
                from: CollNs::new(from_db, from_coll),
                to: CollNs::new(to_db, to_coll),
            }))
        } else if obj.contains_key("drop") {
            // obj structure:
            // { "drop": "coll" }
            Ok(Some(CommandEntry::DropCollection(CollNs::new(
                db,
                obj.get_str("drop")?,
            ))))
        } else if obj.contains_key("create") {
            // obj structure:
            // { "create": "coll" }
            Ok(Some(CommandEntry::CreateCollection(CollNs::new(
                db,
                obj.get_str("create")?,
            ))))
        } else if obj.contains_key("createIndexes") {
            Self::parse_create_indexes(db, obj)
        } else if obj.contains_key("dropIndexes") {
            Self::parse_drop_indexes(db, obj)
        } else {
            warn!(?doc, "Get a command which can't be handled, skipped.");
            Ok(None)
        }
    }

    // obj structure:
    // { "createIndexes": "coll", "key": {"x": 1}, "name": "index_name", "unique": true, "partialFilterExpression": {...}}
    // "unique" and "partialFilterExpression" are optional.
    fn parse_create_indexes(db: &'a str, obj: &'a Document) -> Result<Option<CommandEntry<'a>>> {
        let key = match obj.get_document("key") {
            Err(err) => {
                warn!(?obj, ?err, "Failed to access `key` field in createIndexes command oplog, so the command will be ignored.");
                return Ok(None);
            }
            Ok(doc) => doc,
        };
        let name = match obj.get_str("name") {
            Err(err) => {
                warn!(?obj, ?err, "Failed to access `name` field in createIndexes command oplog, so the command will be ignored.");
                return Ok(None);
            }
            Ok(name) => name,
        };

        let partial_filter_expression = if obj.contains_key("partialFilterExpression") {
            Some(obj.get_document("partialFilterExpression")?)
        } else {
            None
        };

        Ok(Some(CommandEntry::CreateIndexes {
            ns: CollNs::new(db, obj.get_str("createIndexes")?),
            key,
            name,
            unique: obj.get_bool("unique").unwrap_or(false),
            partial_filter_expression,
        }))
    }

    // obj structure:
    // { "dropIndexes": "coll", "index": "index_name"}
    fn parse_drop_indexes(db: &'a str, obj: &'a Document) -> Result<Option<CommandEntry<'a>>> {
        let name = match obj.get_str("index") {
            Err(err) => {
                warn!(?obj, ?err, "Failed to access `index` field in dropIndexes command oplog, so the command will be ignored.");
                return Ok(None);
            }
            Ok(n) => n,
        };

        Ok(Some(CommandEntry::DropIndexes {
            ns: CollNs::new(db, obj.get_str("dropIndexes")?),
            name,
        }))
    }

    /// Apply the command against `mongo_conn`.
    ///
    /// Already-done outcomes ("collection already exists", "namespace does not
    /// exist", "index not found") count as applied, a replayed command may have
    /// been observed by the snapshot too.
    pub fn apply(self, mongo_conn: &MongoClient) -> Result<()> {
        use CommandEntry::*;
        match self {
            DropCollection(ns) => {
                let coll = mongo_conn
                    .database(ns.db_name)
                    .collection::<Document>(ns.coll_name);
                coll.drop(None).map_err(BackupError::from)
            }
            CreateCollection(ns) => {
                let db = mongo_conn.database(ns.db_name);
                let result = db.create_collection(ns.coll_name, None).map(|_| ());

                if cmd_result_is_ok(&result, "already exist") {
                    Ok(())
                } else {
                    result.map_err(BackupError::from)
                }
            }
            RenameCollection { from, to } => {
                // No rename collection api in the driver, and the command only
                // runs against the admin database.
                let admin_db = mongo_conn.database(crate::ADMIN_DB_NAME);
                let result = admin_db
                    .run_command(
                        doc! {
                            "renameCollection": format!("{}.{}", from.db_name, from.coll_name),
                            "to": format!("{}.{}", to.db_name, to.coll_name),
                        },
                        None,
                    )
                    .map(|_| ());

                if cmd_result_is_ok(&result, "not exist") {
                    Ok(())
                } else {
                    result.map_err(BackupError::from)
                }
            }
            DropIndexes { ns, name } => {
                let db = mongo_conn.database(ns.db_name);
                let result = db
                    .run_command(
                        doc! {
                            "dropIndexes": ns.coll_name,
                            "index": name
                        },
                        None,
                    )
                    .map(|_| ());

                if cmd_result_is_ok(&result, "index not found") {
                    Ok(())
                } else {
                    result.map_err(BackupError::from)
                }
            }
            CreateIndexes {
                ns,
                key,
                name,
                unique,
                partial_filter_expression,
            } => {
                let mut index_info = doc! {
                    "key": key, "unique": unique, "name": name
                };
                if let Some(partial_filter_expression) = partial_filter_expression {
                    index_info.insert("partialFilterExpression", partial_filter_expression.clone());
                }
                let db = mongo_conn.database(ns.db_name);
                db.run_command(
                    doc! {
                        "createIndexes": ns.coll_name,
                        "indexes": [index_info]
                    },
                    None,
                )?;
                Ok(())
            }
        }
    }
}

fn cmd_result_is_ok<T>(result: &MongoResult<T>, valid_err_msg: &str) -> bool {
    match result {
        Ok(_) => true,
        Err(e) => cmd_err_msg_contains(e, valid_err_msg),
    }
}

fn cmd_err_msg_contains(error: &MongoError, msg: &str) -> bool {
    match error.kind.as_ref() {
        ErrorKind::Command(err) => err.message.to_lowercase().contains(msg),
        _ => false,
    }
}
