//! Target topology classification and the oplog-capture consistency gate.
//!
//! A consistent oplog window only exists on a target with one totally ordered
//! oplog, which means a replica set member.  A standalone node has no oplog at
//! all, and a sharded router fronts several independent oplogs with no global
//! order between them.  The gate turns that classification into a hard
//! allow/deny before the dumper produces any artifact: a backup which silently
//! misses part of its window is worse than no backup.

use bson::Document;

/// Classified topology of a dump target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topology {
    /// A replica set member, its oplog is capturable.
    ReplicaSet {
        /// replica set name reported by the target.
        set_name: String,
    },
    /// A sharded cluster router (mongos).
    Sharded,
    /// A standalone mongod.
    Standalone,
}

/// Whether oplog capture is authorized against a classified topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    /// The topology provides a consistent oplog window.
    Allow,
    /// The topology can't, the dump must stop before producing anything.
    Deny {
        /// user-visible reason for the refusal.
        reason: String,
    },
}

/// Classify a target from its `hello` (formerly `isMaster`) command reply.
///
/// A replica set member reports its `setName`; a mongos identifies itself with
/// `msg: "isdbgrid"`; everything else is a standalone mongod.
pub fn classify_hello(reply: &Document) -> Topology {
    if let Ok(set_name) = reply.get_str("setName") {
        return Topology::ReplicaSet {
            set_name: set_name.to_string(),
        };
    }
    if matches!(reply.get_str("msg"), Ok("isdbgrid")) {
        return Topology::Sharded;
    }
    Topology::Standalone
}

/// Decide whether oplog capture may run against `topology`.
///
/// Deterministic: `Allow` iff the target is a replica set member.
pub fn authorize_oplog_capture(topology: &Topology) -> Authorization {
    match topology {
        Topology::ReplicaSet { .. } => Authorization::Allow,
        Topology::Sharded => Authorization::Deny {
            reason: "target is a sharded cluster router, there is no single oplog covering all shards".to_string(),
        },
        Topology::Standalone => Authorization::Deny {
            reason: "target is a standalone mongod without an oplog".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_classify_replica_set_member() {
        let reply = doc! {"ok": 1.0, "setName": "rs0", "isWritablePrimary": true};
        assert_eq!(
            classify_hello(&reply),
            Topology::ReplicaSet {
                set_name: "rs0".to_string()
            }
        );
    }

    #[test]
    fn test_classify_mongos() {
        let reply = doc! {"ok": 1.0, "msg": "isdbgrid"};
        assert_eq!(classify_hello(&reply), Topology::Sharded);
    }

    #[test]
    fn test_classify_standalone() {
        let reply = doc! {"ok": 1.0, "isWritablePrimary": true};
        assert_eq!(classify_hello(&reply), Topology::Standalone);
    }

    #[test]
    fn test_gate_allows_replica_set_only() {
        let allowed = authorize_oplog_capture(&Topology::ReplicaSet {
            set_name: "rs0".to_string(),
        });
        assert_eq!(allowed, Authorization::Allow);

        for topology in [Topology::Sharded, Topology::Standalone] {
            match authorize_oplog_capture(&topology) {
                Authorization::Deny { reason } => assert!(!reason.is_empty()),
                Authorization::Allow => panic!("{:?} must be denied", topology),
            }
        }
    }
}
