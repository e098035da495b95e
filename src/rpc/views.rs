//! AppView response shapes, keyed by their `$type` discriminators.

use serde::Deserialize;

/// One node of a `getPostThread` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "$type")]
pub enum ThreadNode {
    #[serde(rename = "app.bsky.feed.defs#threadViewPost")]
    Post(Box<ThreadViewPost>),
    #[serde(rename = "app.bsky.feed.defs#notFoundPost")]
    NotFound(NotFoundPost),
    #[serde(rename = "app.bsky.feed.defs#blockedPost")]
    Blocked(BlockedPost),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThreadViewPost {
    pub post: PostView,
    #[serde(default)]
    pub parent: Option<ThreadNode>,
    #[serde(default)]
    pub replies: Vec<ThreadNode>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostView {
    pub uri: String,
    pub author: AuthorView,
    /// The raw post record; decoded through `records::RepoRecord`.
    pub record: serde_json::Value,
    #[serde(default, rename = "replyCount")]
    pub reply_count: Option<i64>,
    #[serde(default)]
    pub embed: Option<ViewEmbed>,
}

impl PostView {
    /// The quoted record's view, when the post embeds one and the AppView
    /// inlined it.
    #[must_use]
    pub fn quoted_view(&self) -> Option<&ViewRecord> {
        match self.embed.as_ref()? {
            ViewEmbed::Record(embed) => embed.record.found(),
            ViewEmbed::RecordWithMedia(embed) => embed.record.record.found(),
            ViewEmbed::Other => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorView {
    pub did: String,
    #[serde(default)]
    pub handle: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotFoundPost {
    pub uri: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockedPost {
    pub uri: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "$type")]
pub enum ViewEmbed {
    #[serde(rename = "app.bsky.embed.record#view")]
    Record(RecordViewEmbed),
    #[serde(rename = "app.bsky.embed.recordWithMedia#view")]
    RecordWithMedia(RecordWithMediaViewEmbed),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordViewEmbed {
    pub record: RecordViewUnion,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "$type")]
pub enum RecordViewUnion {
    #[serde(rename = "app.bsky.embed.record#viewRecord")]
    Found(ViewRecord),
    #[serde(other)]
    Other,
}

impl RecordViewUnion {
    #[must_use]
    pub fn found(&self) -> Option<&ViewRecord> {
        match self {
            Self::Found(record) => Some(record),
            Self::Other => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordWithMediaViewEmbed {
    pub record: RecordViewEmbed,
}

/// The quoted record inlined by the AppView.
#[derive(Debug, Clone, Deserialize)]
pub struct ViewRecord {
    pub uri: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThreadResponse {
    pub thread: ThreadNode,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordResponse {
    pub uri: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileView {
    pub did: String,
    pub handle: String,
    #[serde(default, rename = "followsCount")]
    pub follows_count: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolveHandleResponse {
    pub did: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_thread_with_parent_and_replies() {
        let json = r#"{
            "thread": {
                "$type": "app.bsky.feed.defs#threadViewPost",
                "post": {
                    "uri": "at://did:plc:a/app.bsky.feed.post/3k1",
                    "author": {"did": "did:plc:a", "handle": "a.example"},
                    "record": {"$type": "app.bsky.feed.post", "text": "mid",
                               "createdAt": "2024-01-01T00:00:00Z"},
                    "replyCount": 1
                },
                "parent": {
                    "$type": "app.bsky.feed.defs#blockedPost",
                    "uri": "at://did:plc:b/app.bsky.feed.post/3k0",
                    "blocked": true
                },
                "replies": [
                    {
                        "$type": "app.bsky.feed.defs#threadViewPost",
                        "post": {
                            "uri": "at://did:plc:c/app.bsky.feed.post/3k2",
                            "author": {"did": "did:plc:c"},
                            "record": {"$type": "app.bsky.feed.post", "text": "reply",
                                       "createdAt": "2024-01-01T01:00:00Z"}
                        }
                    },
                    {"$type": "app.bsky.feed.defs#notFoundPost",
                     "uri": "at://did:plc:d/app.bsky.feed.post/3k3", "notFound": true}
                ]
            }
        }"#;
        let response: ThreadResponse = serde_json::from_str(json).unwrap();
        let ThreadNode::Post(thread) = response.thread else {
            panic!("expected thread view post");
        };
        assert_eq!(thread.post.uri, "at://did:plc:a/app.bsky.feed.post/3k1");
        assert!(matches!(thread.parent, Some(ThreadNode::Blocked(_))));
        assert_eq!(thread.replies.len(), 2);
        assert!(matches!(thread.replies[1], ThreadNode::NotFound(_)));
    }

    #[test]
    fn quoted_view_surfaces_inlined_record() {
        let json = r#"{
            "uri": "at://did:plc:a/app.bsky.feed.post/3k1",
            "author": {"did": "did:plc:a"},
            "record": {"$type": "app.bsky.feed.post", "text": "q",
                       "createdAt": "2024-01-01T00:00:00Z"},
            "embed": {
                "$type": "app.bsky.embed.record#view",
                "record": {
                    "$type": "app.bsky.embed.record#viewRecord",
                    "uri": "at://did:plc:q/app.bsky.feed.post/3k9",
                    "value": {"$type": "app.bsky.feed.post", "text": "quoted",
                              "createdAt": "2023-12-31T00:00:00Z"}
                }
            }
        }"#;
        let view: PostView = serde_json::from_str(json).unwrap();
        let quoted = view.quoted_view().unwrap();
        assert_eq!(quoted.uri, "at://did:plc:q/app.bsky.feed.post/3k9");
        assert_eq!(quoted.value["text"], "quoted");
    }
}
