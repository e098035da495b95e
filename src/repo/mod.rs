//! Repository decoder: CAR archive → commit rev + record stream.
//!
//! `Repository::open` parses the archive, reads the root commit and walks the
//! Merkle search tree under it. `records()` yields `(collection, rkey,
//! record)` lazily in key order; a record whose block fails to CBOR-decode
//! surfaces as an error item in the stream, structural damage fails the whole
//! repository up front.

use std::collections::HashMap;

use ipld_core::cid::Cid;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_bytes::ByteBuf;

use crate::PinakesError;
use crate::Result;

mod car;

pub use car::CarArchive;

#[derive(Debug, Deserialize)]
struct Commit {
    did: String,
    #[allow(dead_code)]
    version: u64,
    data: Cid,
    rev: String,
    #[allow(dead_code)]
    prev: Option<Cid>,
    #[allow(dead_code)]
    sig: ByteBuf,
}

#[derive(Debug, Deserialize)]
struct MstNode {
    l: Option<Cid>,
    e: Vec<MstEntry>,
}

#[derive(Debug, Deserialize)]
struct MstEntry {
    /// Bytes shared with the previous key in this node.
    p: u64,
    /// Key suffix.
    k: ByteBuf,
    /// Record block.
    v: Cid,
    /// Subtree holding keys greater than this entry's.
    t: Option<Cid>,
}

/// One decoded record out of the repository.
#[derive(Debug, Clone)]
pub struct RepoEntry {
    pub collection: String,
    pub rkey: String,
    pub record: serde_json::Value,
}

#[derive(Debug)]
pub struct Repository {
    did: String,
    rev: String,
    entries: Vec<(String, Cid)>,
    blocks: HashMap<Cid, Vec<u8>>,
}

impl Repository {
    /// Decode a single-root CAR archive and index its record tree.
    pub fn open(bytes: &[u8]) -> Result<Self> {
        let archive = CarArchive::parse(bytes)?;
        if archive.roots.len() != 1 {
            return Err(PinakesError::MalformedRepo(format!(
                "expected exactly one root, found {}",
                archive.roots.len()
            )));
        }
        if archive.blocks.is_empty() {
            return Err(PinakesError::MalformedRepo("archive has no blocks".into()));
        }

        let commit: Commit = decode_block(&archive.blocks, &archive.roots[0])?;
        let mut entries = Vec::new();
        walk_mst(&archive.blocks, &commit.data, &mut entries)?;

        Ok(Self {
            did: commit.did,
            rev: commit.rev,
            entries,
            blocks: archive.blocks,
        })
    }

    /// DID the commit claims to belong to.
    #[must_use]
    pub fn did(&self) -> &str {
        &self.did
    }

    /// Commit revision.
    #[must_use]
    pub fn rev(&self) -> &str {
        &self.rev
    }

    /// Records in key order. Finite, not restartable across mutation; each
    /// item decodes its block on demand.
    pub fn records(&self) -> impl Iterator<Item = Result<RepoEntry>> + '_ {
        self.entries.iter().map(|(key, cid)| {
            let (collection, rkey) = key.split_once('/').ok_or_else(|| {
                PinakesError::MalformedRepo(format!("record key without collection: {key}"))
            })?;
            let bytes = self.blocks.get(cid).ok_or_else(|| {
                PinakesError::MalformedRepo(format!("missing record block for {key}"))
            })?;
            let ipld: ipld_core::ipld::Ipld = serde_ipld_dagcbor::from_slice(bytes)
                .map_err(|e| PinakesError::MalformedRecord(format!("{key}: {e}")))?;
            Ok(RepoEntry {
                collection: collection.to_string(),
                rkey: rkey.to_string(),
                record: ipld_to_json(ipld),
            })
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn decode_block<T: DeserializeOwned>(blocks: &HashMap<Cid, Vec<u8>>, cid: &Cid) -> Result<T> {
    let bytes = blocks
        .get(cid)
        .ok_or_else(|| PinakesError::MalformedRepo(format!("missing block {cid}")))?;
    serde_ipld_dagcbor::from_slice(bytes)
        .map_err(|e| PinakesError::MalformedRepo(format!("block {cid} decode: {e}")))
}

/// In-order MST walk: left subtree, then each entry followed by its subtree.
/// Keys are prefix-compressed against the previous key in the node.
fn walk_mst(
    blocks: &HashMap<Cid, Vec<u8>>,
    cid: &Cid,
    out: &mut Vec<(String, Cid)>,
) -> Result<()> {
    let node: MstNode = decode_block(blocks, cid)?;
    if let Some(left) = &node.l {
        walk_mst(blocks, left, out)?;
    }
    let mut prev_key: Vec<u8> = Vec::new();
    for entry in &node.e {
        let shared = usize::try_from(entry.p)
            .map_err(|_| PinakesError::MalformedRepo("key prefix length overflow".into()))?;
        if shared > prev_key.len() {
            return Err(PinakesError::MalformedRepo(format!(
                "key prefix {shared} exceeds previous key length {}",
                prev_key.len()
            )));
        }
        let mut key = prev_key[..shared].to_vec();
        key.extend_from_slice(&entry.k);
        let key_str = String::from_utf8(key.clone())
            .map_err(|_| PinakesError::MalformedRepo("non-UTF8 record key".into()))?;
        out.push((key_str, entry.v));
        if let Some(tree) = &entry.t {
            walk_mst(blocks, tree, out)?;
        }
        prev_key = key;
    }
    Ok(())
}

fn ipld_to_json(ipld: ipld_core::ipld::Ipld) -> serde_json::Value {
    use ipld_core::ipld::Ipld;
    use serde_json::Value;
    match ipld {
        Ipld::Null => Value::Null,
        Ipld::Bool(b) => Value::Bool(b),
        Ipld::Integer(i) => i64::try_from(i)
            .map(|n| Value::Number(n.into()))
            .unwrap_or_else(|_| Value::String(i.to_string())),
        Ipld::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Ipld::String(s) => Value::String(s),
        // Raw bytes only occur inside blob refs, which we never consume.
        Ipld::Bytes(_) => Value::Null,
        Ipld::List(items) => Value::Array(items.into_iter().map(ipld_to_json).collect()),
        Ipld::Map(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, ipld_to_json(v)))
                .collect(),
        ),
        Ipld::Link(cid) => Value::String(cid.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use ipld_core::cid::multihash::Multihash;
    use serde::Serialize;
    use serde_bytes::ByteBuf;

    use super::*;

    const DAG_CBOR: u64 = 0x71;

    fn test_cid(label: &[u8]) -> Cid {
        // Identity multihash keeps the fixtures free of real digests.
        Cid::new_v1(DAG_CBOR, Multihash::wrap(0x00, label).unwrap())
    }

    #[derive(Serialize)]
    struct TestHeader {
        roots: Vec<Cid>,
        version: u64,
    }

    #[derive(Serialize)]
    struct TestCommit {
        did: String,
        version: u64,
        data: Cid,
        rev: String,
        prev: Option<Cid>,
        sig: ByteBuf,
    }

    #[derive(Serialize)]
    struct TestNode {
        l: Option<Cid>,
        e: Vec<TestEntry>,
    }

    #[derive(Serialize)]
    struct TestEntry {
        p: u64,
        k: ByteBuf,
        v: Cid,
        t: Option<Cid>,
    }

    fn section(buf: &mut Vec<u8>, cid: &Cid, data: &[u8]) {
        let cid_bytes = cid.to_bytes();
        car::write_varint(buf, (cid_bytes.len() + data.len()) as u64);
        buf.extend_from_slice(&cid_bytes);
        buf.extend_from_slice(data);
    }

    fn post_record(text: &str) -> serde_json::Value {
        serde_json::json!({
            "$type": "app.bsky.feed.post",
            "text": text,
            "createdAt": "2024-03-01T12:00:00.000Z",
        })
    }

    /// Archive with one commit, one MST node and two prefix-compressed post
    /// records.
    fn build_archive(roots: &[Cid], broken_second_record: bool) -> Vec<u8> {
        let commit_cid = test_cid(b"commit");
        let node_cid = test_cid(b"node");
        let rec1_cid = test_cid(b"rec1");
        let rec2_cid = test_cid(b"rec2");

        let node = TestNode {
            l: None,
            e: vec![
                TestEntry {
                    p: 0,
                    k: ByteBuf::from(b"app.bsky.feed.post/3lk4aaa222222".to_vec()),
                    v: rec1_cid,
                    t: None,
                },
                TestEntry {
                    // Shares "app.bsky.feed.post/3lk4" with the previous key.
                    p: 23,
                    k: ByteBuf::from(b"zzz222222".to_vec()),
                    v: rec2_cid,
                    t: None,
                },
            ],
        };
        let commit = TestCommit {
            did: "did:plc:owner".into(),
            version: 3,
            data: node_cid,
            rev: "3lk4xyzabcdef".into(),
            prev: None,
            sig: ByteBuf::from(vec![0u8; 8]),
        };

        let mut buf = Vec::new();
        let header = serde_ipld_dagcbor::to_vec(&TestHeader {
            roots: roots.to_vec(),
            version: 1,
        })
        .unwrap();
        car::write_varint(&mut buf, header.len() as u64);
        buf.extend_from_slice(&header);

        section(
            &mut buf,
            &commit_cid,
            &serde_ipld_dagcbor::to_vec(&commit).unwrap(),
        );
        section(
            &mut buf,
            &node_cid,
            &serde_ipld_dagcbor::to_vec(&node).unwrap(),
        );
        section(
            &mut buf,
            &rec1_cid,
            &serde_ipld_dagcbor::to_vec(&post_record("first")).unwrap(),
        );
        if broken_second_record {
            section(&mut buf, &rec2_cid, &[0xff, 0x00, 0x13]);
        } else {
            section(
                &mut buf,
                &rec2_cid,
                &serde_ipld_dagcbor::to_vec(&post_record("second")).unwrap(),
            );
        }
        buf
    }

    #[test]
    fn decodes_commit_and_records_in_key_order() {
        let bytes = build_archive(&[test_cid(b"commit")], false);
        let repo = Repository::open(&bytes).unwrap();
        assert_eq!(repo.rev(), "3lk4xyzabcdef");
        assert_eq!(repo.did(), "did:plc:owner");
        assert_eq!(repo.len(), 2);

        let entries: Vec<_> = repo.records().collect::<Result<_>>().unwrap();
        assert_eq!(entries[0].collection, "app.bsky.feed.post");
        assert_eq!(entries[0].rkey, "3lk4aaa222222");
        assert_eq!(entries[0].record["text"], "first");
        assert_eq!(entries[1].rkey, "3lk4zzz222222");
        assert_eq!(entries[1].record["text"], "second");
    }

    #[test]
    fn record_decode_failure_is_a_stream_error_not_a_skip() {
        let bytes = build_archive(&[test_cid(b"commit")], true);
        let repo = Repository::open(&bytes).unwrap();
        let items: Vec<_> = repo.records().collect();
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(
            items[1].as_ref().unwrap_err(),
            PinakesError::MalformedRecord(_)
        ));
    }

    #[test]
    fn multiple_roots_fail_fast() {
        let bytes = build_archive(&[test_cid(b"commit"), test_cid(b"other")], false);
        assert!(matches!(
            Repository::open(&bytes).unwrap_err(),
            PinakesError::MalformedRepo(_)
        ));
    }

    #[test]
    fn missing_root_block_fails_fast() {
        let bytes = build_archive(&[test_cid(b"nonexistent")], false);
        assert!(Repository::open(&bytes).is_err());
    }
}
