use crate::oplog::OplogEntry;
use crate::Result;
use bson::Timestamp;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

/// Append-only writer for the captured oplog window.
///
/// Entries land in the artifact in receipt order, which is the tailer's
/// observation order, which is the cluster's own timestamp order.  The sink
/// performs no dedup: the same logical write may reach the artifact and the
/// snapshot both, that overlap is expected and resolved at replay time.
pub struct OplogSink {
    path: PathBuf,
    writer: BufWriter<File>,
    entries: u64,
    first: Option<Timestamp>,
    last: Option<Timestamp>,
}

/// Handle of a finalized oplog artifact.
#[derive(Debug)]
pub struct OplogArtifact {
    /// artifact file path.
    pub path: PathBuf,
    /// number of captured entries.
    pub entries: u64,
    /// timestamp of the first captured entry.
    pub first: Option<Timestamp>,
    /// timestamp of the last captured entry.
    pub last: Option<Timestamp>,
}

impl OplogSink {
    /// Create the artifact file at `path`.
    pub fn new(path: PathBuf) -> Result<OplogSink> {
        let writer = BufWriter::new(File::create(&path)?);
        Ok(OplogSink {
            path,
            writer,
            entries: 0,
            first: None,
            last: None,
        })
    }

    /// Append one captured entry.
    pub fn append(&mut self, entry: &OplogEntry) -> Result<()> {
        entry.to_writer(&mut self.writer)?;
        self.entries += 1;
        if self.first.is_none() {
            self.first = Some(entry.timestamp());
        }
        self.last = Some(entry.timestamp());
        Ok(())
    }

    /// Flush everything to durable storage and hand back the artifact.
    pub fn finalize(mut self) -> Result<OplogArtifact> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(OplogArtifact {
            path: self.path,
            entries: self.entries,
            first: self.first,
            last: self.last,
        })
    }

    /// Drop the partial artifact.  Called on any dump-path failure; a file
    /// that doesn't cover its full window must not survive.
    pub fn discard(self) -> Result<()> {
        drop(self.writer);
        fs::remove_file(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog;
    use bson::doc;
    use std::io::BufReader;

    fn entry(time: u32, increment: u32, x: i32) -> OplogEntry {
        OplogEntry::from_doc(doc! {
            "ts": Timestamp { time, increment },
            "op": "i",
            "ns": "foo.bar",
            "o": {"_id": x, "x": x},
        })
        .unwrap()
    }

    #[test]
    fn test_sink_appends_in_receipt_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oplog.bson");
        let mut sink = OplogSink::new(path.clone()).unwrap();

        for i in 0..5 {
            sink.append(&entry(10, i, i as i32)).unwrap();
        }
        let artifact = sink.finalize().unwrap();
        assert_eq!(artifact.entries, 5);
        assert_eq!(artifact.first, Some(Timestamp { time: 10, increment: 0 }));
        assert_eq!(artifact.last, Some(Timestamp { time: 10, increment: 4 }));

        let mut reader = BufReader::new(File::open(&artifact.path).unwrap());
        let mut seen = 0u32;
        while let Some(doc) = oplog::read_next_document(&mut reader).unwrap() {
            assert_eq!(doc.get_timestamp("ts").unwrap().increment, seen);
            seen += 1;
        }
        assert_eq!(seen, 5);
    }

    #[test]
    fn test_sink_discard_removes_partial_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oplog.bson");
        let mut sink = OplogSink::new(path.clone()).unwrap();
        sink.append(&entry(10, 0, 1)).unwrap();

        sink.discard().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_empty_sink_finalizes_to_empty_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let sink = OplogSink::new(dir.path().join("oplog.bson")).unwrap();
        let artifact = sink.finalize().unwrap();
        assert_eq!(artifact.entries, 0);
        assert!(artifact.first.is_none());
    }
}
