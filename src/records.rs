//! Typed views over AT Protocol records.
//!
//! Records reach us two ways: DAG-CBOR blocks out of a repository archive
//! (converted to JSON values by the repo decoder) and JSON straight from the
//! AppView. Both funnel through the same serde types here, keyed by the
//! `$type` discriminator, so a record that fails to validate surfaces as a
//! structured error instead of a silent boolean.

use serde::Deserialize;

use crate::PinakesError;
use crate::Result;

pub const COLLECTION_POST: &str = "app.bsky.feed.post";
pub const COLLECTION_REPOST: &str = "app.bsky.feed.repost";
pub const COLLECTION_LIKE: &str = "app.bsky.feed.like";
pub const COLLECTION_FOLLOW: &str = "app.bsky.graph.follow";

/// A record from a repository, keyed by its `$type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "$type")]
pub enum RepoRecord {
    #[serde(rename = "app.bsky.feed.post")]
    Post(PostRecord),
    #[serde(rename = "app.bsky.feed.repost")]
    Repost(SubjectRecord),
    #[serde(rename = "app.bsky.feed.like")]
    Like(SubjectRecord),
    #[serde(rename = "app.bsky.graph.follow")]
    Follow(FollowRecord),
    #[serde(other)]
    Other,
}

impl RepoRecord {
    /// Decode a record, mapping validation failures to `MalformedRecord`.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| PinakesError::MalformedRecord(format!("record validation: {e}")))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostRecord {
    #[serde(default)]
    pub text: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(default)]
    pub reply: Option<ReplyRef>,
    #[serde(default)]
    pub embed: Option<EmbedRecord>,
}

impl PostRecord {
    /// `createdAt` as millisecond epoch. RFC 3339 per the lexicon; anything
    /// else is a malformed record.
    pub fn created_at_millis(&self) -> Result<i64> {
        chrono::DateTime::parse_from_rfc3339(&self.created_at)
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| {
                PinakesError::MalformedRecord(format!(
                    "unparseable createdAt {:?}: {e}",
                    self.created_at
                ))
            })
    }

    /// Concatenated image (and video) alt texts, newline-delimited.
    #[must_use]
    pub fn alt_text(&self) -> Option<String> {
        let alts = self.embed.as_ref()?.alt_texts();
        if alts.is_empty() {
            None
        } else {
            Some(alts.join("\n"))
        }
    }

    /// URI of a quoted record, when the post embeds one.
    #[must_use]
    pub fn quoted_uri(&self) -> Option<&str> {
        self.embed.as_ref()?.quoted_uri()
    }

    /// External link card, when present.
    #[must_use]
    pub fn external(&self) -> Option<&ExternalItem> {
        self.embed.as_ref()?.external()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplyRef {
    pub root: StrongRef,
    pub parent: StrongRef,
}

/// Reference to another record. The accompanying `cid` is not consumed.
#[derive(Debug, Clone, Deserialize)]
pub struct StrongRef {
    pub uri: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubjectRecord {
    pub subject: StrongRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FollowRecord {
    /// DID of the followed account.
    pub subject: String,
}

/// Embed union on a post record.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "$type")]
pub enum EmbedRecord {
    #[serde(rename = "app.bsky.embed.images")]
    Images(ImagesEmbed),
    #[serde(rename = "app.bsky.embed.video")]
    Video(VideoEmbed),
    #[serde(rename = "app.bsky.embed.external")]
    External(ExternalEmbed),
    #[serde(rename = "app.bsky.embed.record")]
    Record(RecordEmbed),
    #[serde(rename = "app.bsky.embed.recordWithMedia")]
    RecordWithMedia(RecordWithMediaEmbed),
    #[serde(other)]
    Other,
}

impl EmbedRecord {
    fn alt_texts(&self) -> Vec<String> {
        match self {
            Self::Images(images) => images
                .images
                .iter()
                .filter(|i| !i.alt.is_empty())
                .map(|i| i.alt.clone())
                .collect(),
            Self::Video(video) => video.alt.iter().filter(|a| !a.is_empty()).cloned().collect(),
            Self::RecordWithMedia(rwm) => rwm.media.alt_texts(),
            _ => Vec::new(),
        }
    }

    fn quoted_uri(&self) -> Option<&str> {
        match self {
            Self::Record(record) => Some(record.record.uri.as_str()),
            Self::RecordWithMedia(rwm) => Some(rwm.record.record.uri.as_str()),
            _ => None,
        }
    }

    fn external(&self) -> Option<&ExternalItem> {
        match self {
            Self::External(ext) => Some(&ext.external),
            Self::RecordWithMedia(rwm) => rwm.media.external(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImagesEmbed {
    #[serde(default)]
    pub images: Vec<ImageItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageItem {
    #[serde(default)]
    pub alt: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VideoEmbed {
    #[serde(default)]
    pub alt: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExternalEmbed {
    pub external: ExternalItem,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExternalItem {
    pub uri: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordEmbed {
    pub record: StrongRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordWithMediaEmbed {
    pub record: RecordEmbed,
    pub media: Box<EmbedRecord>,
}

/// Parsed `at://<did>/<collection>/<rkey>` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtUri {
    pub did: String,
    pub collection: String,
    pub rkey: String,
}

impl AtUri {
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix("at://")
            .ok_or_else(|| PinakesError::MalformedRecord(format!("not an at-uri: {uri}")))?;
        let mut parts = rest.splitn(3, '/');
        let did = parts.next().unwrap_or_default();
        let collection = parts.next().unwrap_or_default();
        let rkey = parts.next().unwrap_or_default();
        if did.is_empty() || collection.is_empty() || rkey.is_empty() || rkey.contains('/') {
            return Err(PinakesError::MalformedRecord(format!(
                "invalid at-uri: {uri}"
            )));
        }
        Ok(Self {
            did: did.to_string(),
            collection: collection.to_string(),
            rkey: rkey.to_string(),
        })
    }
}

impl std::fmt::Display for AtUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "at://{}/{}/{}", self.did, self.collection, self.rkey)
    }
}

const TID_CHARS: &str = "234567abcdefghijklmnopqrstuvwxyz";

/// Whether `s` is a valid TID (timestamp identifier). Record keys and commit
/// revs use this shape; lexicographic comparison of two TIDs follows time.
#[must_use]
pub fn is_tid(s: &str) -> bool {
    s.len() == 13 && s.chars().all(|c| TID_CHARS.contains(c))
}

/// Extract `(actor, rkey)` from a `https://bsky.app/profile/<actor>/post/<rkey>`
/// link. The actor may be a DID or a handle.
#[must_use]
pub fn parse_bsky_post_link(url: &str) -> Option<(String, String)> {
    let rest = url
        .strip_prefix("https://bsky.app/profile/")
        .or_else(|| url.strip_prefix("http://bsky.app/profile/"))?;
    let (actor, tail) = rest.split_once("/post/")?;
    let rkey = tail.split(['?', '#']).next().unwrap_or(tail);
    if actor.is_empty() || rkey.is_empty() {
        return None;
    }
    Some((actor.to_string(), rkey.trim_end_matches('/').to_string()))
}
