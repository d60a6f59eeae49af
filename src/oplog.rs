//! Captured change-operation ("oplog") entries and their on-disk codec.
//!
//! A dump with oplog capture writes one append-only artifact holding the raw
//! oplog documents of the captured window, in capture order.  Capture order is
//! the cluster's own timestamp order, and the replayer consumes the artifact in
//! exactly that order, so the three orders are always the same.
//!
//! The on-disk layout is a plain concatenation of bson documents, the same
//! layout the per-collection dump files use.

use crate::error::Result;
use crate::{NAMESPACE_KEY, OP_KEY, TIMESTAMP_KEY};
use bson::{Document, Timestamp};
use std::io::{BufRead, Write};

/// Kind of a captured write operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// document insert, oplog op `i`.
    Insert,
    /// document update or replacement, oplog op `u`.
    Update,
    /// document delete, oplog op `d`.
    Delete,
    /// admin command (create/drop collection, index changes...), oplog op `c`.
    Command,
    /// periodic no-op heartbeat, oplog op `n`.
    Noop,
    /// operation kind this crate doesn't know; captured, skipped at replay.
    Other,
}

impl OpKind {
    /// Map an oplog `op` field value to a kind.
    pub fn from_op(op: &str) -> OpKind {
        match op {
            "i" => OpKind::Insert,
            "u" => OpKind::Update,
            "d" => OpKind::Delete,
            "c" => OpKind::Command,
            "n" => OpKind::Noop,
            _ => OpKind::Other,
        }
    }
}

/// One captured write operation.
///
/// Wraps the raw oplog document unchanged (the sink must preserve the source's
/// exact field layout) together with the fields every consumer needs: the
/// cluster-assigned timestamp, the operation kind and the namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct OplogEntry {
    ts: Timestamp,
    kind: OpKind,
    ns: String,
    raw: Document,
}

impl OplogEntry {
    /// Parse a raw oplog document into an entry.
    ///
    /// The `ts` and `op` fields are mandatory; the namespace may be absent on
    /// some no-op entries and defaults to the empty string.
    pub fn from_doc(doc: Document) -> Result<OplogEntry> {
        let ts = doc.get_timestamp(TIMESTAMP_KEY)?;
        let kind = OpKind::from_op(doc.get_str(OP_KEY)?);
        let ns = doc.get_str(NAMESPACE_KEY).unwrap_or("").to_string();
        Ok(OplogEntry {
            ts,
            kind,
            ns,
            raw: doc,
        })
    }

    /// Cluster-assigned timestamp, the total order key of the oplog.
    pub fn timestamp(&self) -> Timestamp {
        self.ts
    }

    /// Kind of the captured operation.
    pub fn kind(&self) -> OpKind {
        self.kind
    }

    /// Full `database.collection` namespace the operation targets.
    pub fn namespace(&self) -> &str {
        &self.ns
    }

    /// Namespace split into `(database, collection)`.
    pub fn namespace_parts(&self) -> Option<(&str, &str)> {
        self.ns.split_once('.')
    }

    /// Database part of the namespace.
    pub fn database(&self) -> Option<&str> {
        self.namespace_parts().map(|(db, _)| db)
    }

    /// The operation payload: the inserted document, the update spec or the
    /// delete filter (oplog `o` field).
    pub fn payload(&self) -> Result<&Document> {
        Ok(self.raw.get_document("o")?)
    }

    /// The target document key of an update (oplog `o2` field).
    pub fn target(&self) -> Result<&Document> {
        Ok(self.raw.get_document("o2")?)
    }

    /// The raw oplog document this entry was parsed from.
    pub fn raw(&self) -> &Document {
        &self.raw
    }

    /// Whether the entry is mongodb internal traffic a backup never wants:
    /// no-op heartbeats and writes to the `admin`, `local` and `config`
    /// databases.
    pub fn is_internal(&self) -> bool {
        self.kind == OpKind::Noop
            || self.ns.starts_with("admin.")
            || self.ns.starts_with("local.")
            || self.ns.starts_with("config.")
    }

    /// Serialize the raw entry into `writer`, native bson framing.
    pub fn to_writer<W: Write>(&self, writer: W) -> Result<()> {
        self.raw.to_writer(writer)?;
        Ok(())
    }

    /// Read the next entry from `reader`, `Ok(None)` on clean end of stream.
    pub fn from_reader<R: BufRead>(reader: &mut R) -> Result<Option<OplogEntry>> {
        match read_next_document(reader)? {
            Some(doc) => Ok(Some(OplogEntry::from_doc(doc)?)),
            None => Ok(None),
        }
    }
}

/// Read the next bson document out of a concatenated-bson stream.
///
/// Returns `Ok(None)` on a clean end of stream; bytes which don't decode as a
/// document are an error, dump artifacts are never silently truncated.
pub fn read_next_document<R: BufRead>(reader: &mut R) -> Result<Option<Document>> {
    if reader.fill_buf()?.is_empty() {
        return Ok(None);
    }
    Ok(Some(Document::from_reader(reader)?))
}
