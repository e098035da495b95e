//! Core data model: the indexed post and why it is in the index.

use serde::Deserialize;
use serde::Serialize;

/// Why a post was admitted into the index.
///
/// The wire form is the snake_case tag stored in `post.inclusion_reason`
/// (`self`, `liked_by_self`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InclusionReason {
    /// Authored by the indexed user.
    #[serde(rename = "self")]
    Own,
    LikedBySelf,
    RepostedBy,
    AncestorOf,
    DescendantOf,
    QuotedBy,
    LinkedBy,
    ByFollow,
}

impl InclusionReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Own => "self",
            Self::LikedBySelf => "liked_by_self",
            Self::RepostedBy => "reposted_by",
            Self::AncestorOf => "ancestor_of",
            Self::DescendantOf => "descendant_of",
            Self::QuotedBy => "quoted_by",
            Self::LinkedBy => "linked_by",
            Self::ByFollow => "by_follow",
        }
    }

    /// Parse the stored tag.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "self" => Some(Self::Own),
            "liked_by_self" => Some(Self::LikedBySelf),
            "reposted_by" => Some(Self::RepostedBy),
            "ancestor_of" => Some(Self::AncestorOf),
            "descendant_of" => Some(Self::DescendantOf),
            "quoted_by" => Some(Self::QuotedBy),
            "linked_by" => Some(Self::LinkedBy),
            "by_follow" => Some(Self::ByFollow),
            _ => None,
        }
    }

    /// Reasons that must carry an `inclusion_context`.
    #[must_use]
    pub const fn requires_context(self) -> bool {
        matches!(
            self,
            Self::RepostedBy
                | Self::AncestorOf
                | Self::DescendantOf
                | Self::QuotedBy
                | Self::LinkedBy
        )
    }
}

impl std::fmt::Display for InclusionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A post row as persisted in the `post` table.
#[derive(Debug, Clone)]
pub struct Post {
    pub creator_did: String,
    pub rkey: String,
    /// Millisecond epoch.
    pub created_at: i64,
    pub text: String,
    pub alt_text: Option<String>,
    /// 384-D normalized vector, filled lazily by the embedding side-channel.
    pub embedding: Option<Vec<f32>>,
    pub alt_text_embedding: Option<Vec<f32>>,
    pub reply_parent: Option<String>,
    pub reply_root: Option<String>,
    pub quoted: Option<String>,
    pub embed_title: Option<String>,
    pub embed_description: Option<String>,
    pub embed_url: Option<String>,
    pub inclusion_reason: InclusionReason,
    pub inclusion_context: Option<String>,
}

impl Post {
    /// Canonical `at://` URI of this post.
    #[must_use]
    pub fn uri(&self) -> String {
        format!(
            "at://{}/{}/{}",
            self.creator_did,
            crate::records::COLLECTION_POST,
            self.rkey
        )
    }
}
