use crate::error::{BackupError, Result};
use crate::topology::{classify_hello, Topology};
use crate::{ADMIN_DB_NAME, OPLOG_COLL, OPLOG_DB};
use bson::{doc, Document};
use mongodb::sync::{Client, Collection, Database};

/// A simple abstraction around one mongodb target.
#[derive(Clone)]
pub struct Connection {
    client: Client,
    uri: String,
}

impl Connection {
    /// create a new connection against `uri`.
    pub fn new(uri: &str) -> Result<Connection> {
        let client = Client::with_uri_str(uri)?;
        Ok(Connection {
            client,
            uri: uri.to_string(),
        })
    }

    /// get the underlying mongodb client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// get a handle on database `name`.
    pub fn database(&self, name: &str) -> Database {
        self.client.database(name)
    }

    /// return the collection which holds the cluster oplog.
    pub fn oplog_coll(&self) -> Collection<Document> {
        self.client.database(OPLOG_DB).collection(OPLOG_COLL)
    }

    /// Run `hello` against the target, falling back to the legacy `isMaster`
    /// for old servers.  An unanswered target is [BackupError::UnreachableTarget],
    /// which is distinct from a reachable target classified as incapable.
    pub fn hello(&self) -> Result<Document> {
        let admin_db = self.client.database(ADMIN_DB_NAME);
        match admin_db.run_command(doc! {"hello": 1}, None) {
            Ok(reply) => Ok(reply),
            Err(_) => admin_db
                .run_command(doc! {"isMaster": 1}, None)
                .map_err(|detail| BackupError::UnreachableTarget {
                    uri: self.uri.clone(),
                    detail,
                }),
        }
    }

    /// Classify the target topology from its `hello` reply.
    pub fn classify(&self) -> Result<Topology> {
        Ok(classify_hello(&self.hello()?))
    }
}
