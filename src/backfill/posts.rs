//! Post processing: dedup, fetch, persist, and the expansion policy.

use std::sync::Arc;

use futures::future::BoxFuture;

use super::EngineInner;
use super::PostTask;
use crate::config::FIRST_PARTY_SERVICE_DID;
use crate::models::InclusionReason;
use crate::models::Post;
use crate::records::parse_bsky_post_link;
use crate::records::AtUri;
use crate::records::PostRecord;
use crate::records::RepoRecord;
use crate::rpc::views::ThreadNode;
use crate::rpc::views::ThreadViewPost;
use crate::PinakesError;
use crate::Result;

/// Thread-view fetch shape: depth covers the largest fan-out bound, parent
/// height the deepest ancestor walk the budget allows.
const THREAD_FETCH_DEPTH: u32 = 20;
const THREAD_FETCH_PARENT_HEIGHT: u32 = 20;

pub(crate) async fn process_post(inner: &Arc<EngineInner>, task: PostTask) -> Result<()> {
    let uri = task.uri.clone();
    let result = process_post_inner(inner, task).await;
    if let Err(e) = &result {
        if e.is_cancellation() {
            // The queue will requeue these arguments; forget the URI so the
            // retry is not swallowed by the dedup check.
            inner.unmark_seen(&uri);
        }
    }
    result
}

async fn process_post_inner(inner: &Arc<EngineInner>, task: PostTask) -> Result<()> {
    // The ancestor-through-root pattern legitimately lands work at
    // max_depth + 1: the root bounced to at the budget edge still fans its
    // descendants out one step further, and those must insert. Their own
    // expansion pushes past the allowance and stops here.
    if task.depth > inner.max_depth() + 1 {
        return Ok(());
    }
    if !inner.mark_seen(&task.uri) {
        return Ok(());
    }

    let at_uri = match AtUri::parse(&task.uri) {
        Ok(at_uri) => at_uri,
        Err(e) => {
            tracing::warn!("dropping post with invalid uri: {e}");
            return Ok(());
        }
    };
    // Reply noise from the first-party service account.
    if at_uri.did == FIRST_PARTY_SERVICE_DID {
        return Ok(());
    }

    // Acquire the record, thread-view-first for the batching win.
    let mut thread: Option<Box<ThreadViewPost>> = None;
    let record = if let Some(record) = task.record.clone() {
        record
    } else {
        match fetch_thread(inner, &task.uri).await {
            Ok(Some(fetched)) => {
                let parsed = parse_post_record(&fetched.post.record);
                thread = Some(fetched);
                match parsed {
                    Some(record) => record,
                    None => {
                        tracing::warn!("dropping {}: thread view carried no post record", task.uri);
                        return Ok(());
                    }
                }
            }
            // Gone posts are the steady-state baseline; no log.
            Ok(None) => return Ok(()),
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e) => {
                tracing::debug!("thread view failed for {}, trying direct fetch: {e}", task.uri);
                match inner.rpc.get_record(&at_uri).await {
                    Ok(response) => match parse_post_record(&response.value) {
                        Some(record) => record,
                        None => {
                            tracing::warn!("dropping {}: record is not a post", task.uri);
                            return Ok(());
                        }
                    },
                    Err(PinakesError::RecordNotFound(_)) => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
        }
    };

    let created_at = match record.created_at_millis() {
        Ok(millis) => millis,
        Err(e) => {
            tracing::warn!("dropping {}: {e}", task.uri);
            return Ok(());
        }
    };

    let external = record.external().cloned();
    let post = Post {
        creator_did: at_uri.did.clone(),
        rkey: at_uri.rkey.clone(),
        created_at,
        text: record.text.clone(),
        alt_text: record.alt_text(),
        embedding: None,
        alt_text_embedding: None,
        reply_parent: record.reply.as_ref().map(|r| r.parent.uri.clone()),
        reply_root: record.reply.as_ref().map(|r| r.root.uri.clone()),
        quoted: record.quoted_uri().map(ToString::to_string),
        embed_title: external
            .as_ref()
            .map(|e| e.title.clone())
            .filter(|t| !t.is_empty()),
        embed_description: external
            .as_ref()
            .map(|e| e.description.clone())
            .filter(|d| !d.is_empty()),
        embed_url: external.as_ref().map(|e| e.uri.clone()),
        inclusion_reason: task.inclusion,
        inclusion_context: task.context.clone(),
    };
    inner.buffer_post(post).await;
    inner.progress.counter("posts").inc(1);

    // Quoted expansion: consume an inlined view quickly, fetch otherwise.
    if let Some(quoted_uri) = record.quoted_uri() {
        let inlined = thread
            .as_ref()
            .and_then(|t| t.post.quoted_view())
            .filter(|view| view.uri == quoted_uri)
            .and_then(|view| parse_post_record(&view.value));
        enqueue_post(
            inner,
            PostTask {
                uri: quoted_uri.to_string(),
                inclusion: InclusionReason::QuotedBy,
                context: Some(task.uri.clone()),
                record: inlined,
                depth: task.depth + 1,
            },
        )
        .await;
    }

    // Link cards pointing back into the network are worth indexing too.
    if let Some(external) = &external {
        if let Some((actor, rkey)) = parse_bsky_post_link(&external.uri) {
            let did = if actor.starts_with("did:") {
                Some(actor)
            } else {
                inner
                    .rpc
                    .resolve_handle(&inner.appview, &actor)
                    .await
                    .map_err(|e| tracing::debug!("linked actor {actor} did not resolve: {e}"))
                    .ok()
            };
            if let Some(did) = did {
                enqueue_post(
                    inner,
                    PostTask {
                        uri: format!("at://{did}/{}/{rkey}", crate::records::COLLECTION_POST),
                        inclusion: InclusionReason::LinkedBy,
                        context: Some(task.uri.clone()),
                        record: None,
                        depth: task.depth + 1,
                    },
                )
                .await;
            }
        }
    }

    // Ancestor/descendant expansion depends on how we got here.
    if task.inclusion == InclusionReason::DescendantOf {
        // The ancestor that queued us already fanned out siblings.
        return Ok(());
    }
    let is_reply = record.reply.is_some();
    if is_reply && task.inclusion == InclusionReason::AncestorOf {
        // Walking up; the root is already on its way.
        return Ok(());
    }
    if let Some(reply) = &record.reply {
        if task.depth + 1 <= inner.max_depth() {
            // Let the root fetch the thread and fan out descendants, which
            // covers every intermediate ancestor in one request.
            inner
                .queues()
                .post
                .add(PostTask {
                    uri: reply.root.uri.clone(),
                    inclusion: InclusionReason::AncestorOf,
                    context: Some(task.uri.clone()),
                    record: None,
                    depth: task.depth + 1,
                })
                .await;
            return Ok(());
        }
    }

    // Top-level post, or depth budget exhausted.
    if thread.is_none() {
        match fetch_thread(inner, &task.uri).await {
            Ok(fetched) => thread = fetched,
            Err(e) => {
                tracing::debug!("thread view unavailable for {}: {e}", task.uri);
            }
        }
    }
    let Some(thread) = thread else {
        // No thread view: enqueue the reply refs we know about.
        if let Some(reply) = &record.reply {
            enqueue_ancestor(inner, &reply.parent.uri, &task.uri, task.depth, None).await;
            if reply.root.uri != reply.parent.uri {
                enqueue_ancestor(inner, &reply.root.uri, &task.uri, task.depth, None).await;
            }
        }
        return Ok(());
    };

    walk_parents(inner, &thread, &task.uri, task.depth).await;

    let reply_count = thread
        .post
        .reply_count
        .unwrap_or_else(|| thread.replies.len() as i64);
    let max_levels = log_scale_depth(reply_count);
    walk_replies(inner, &thread.replies, &task.uri, 1, max_levels, task.depth + 1).await;

    Ok(())
}

async fn enqueue_post(inner: &Arc<EngineInner>, task: PostTask) {
    // Tasks carrying a decoded record jump the line so the record is
    // consumed instead of re-fetched later.
    if task.record.is_some() {
        inner.queues().post.prepend(task).await;
    } else {
        inner.queues().post.add(task).await;
    }
}

async fn enqueue_ancestor(
    inner: &Arc<EngineInner>,
    uri: &str,
    origin: &str,
    depth: u32,
    record: Option<PostRecord>,
) {
    enqueue_post(
        inner,
        PostTask {
            uri: uri.to_string(),
            inclusion: InclusionReason::AncestorOf,
            context: Some(origin.to_string()),
            record,
            depth,
        },
    )
    .await;
}

/// Walk up the inlined parent chain. Blocked parents are enqueued opaquely
/// and terminate the walk.
async fn walk_parents(inner: &Arc<EngineInner>, thread: &ThreadViewPost, origin: &str, depth: u32) {
    let mut node = thread.parent.as_ref();
    while let Some(current) = node {
        match current {
            ThreadNode::Post(parent) => {
                let record = parse_post_record(&parent.post.record);
                enqueue_ancestor(inner, &parent.post.uri, origin, depth, record).await;
                node = parent.parent.as_ref();
            }
            ThreadNode::Blocked(blocked) => {
                enqueue_ancestor(inner, &blocked.uri, origin, depth, None).await;
                break;
            }
            ThreadNode::NotFound(_) | ThreadNode::Other => break,
        }
    }
}

/// Walk down the reply tree, bounded by the log-scale level limit.
fn walk_replies<'a>(
    inner: &'a Arc<EngineInner>,
    nodes: &'a [ThreadNode],
    origin: &'a str,
    level: u32,
    max_levels: u32,
    depth: u32,
) -> BoxFuture<'a, ()> {
    Box::pin(async move {
        for node in nodes {
            let ThreadNode::Post(reply) = node else {
                continue;
            };
            let record = parse_post_record(&reply.post.record);
            enqueue_post(
                inner,
                PostTask {
                    uri: reply.post.uri.clone(),
                    inclusion: InclusionReason::DescendantOf,
                    context: Some(origin.to_string()),
                    record,
                    depth,
                },
            )
            .await;
            if level < max_levels && !reply.replies.is_empty() {
                walk_replies(inner, &reply.replies, origin, level + 1, max_levels, depth).await;
            }
        }
    })
}

async fn fetch_thread(
    inner: &Arc<EngineInner>,
    uri: &str,
) -> Result<Option<Box<ThreadViewPost>>> {
    match inner
        .rpc
        .get_post_thread(
            &inner.appview,
            uri,
            THREAD_FETCH_DEPTH,
            THREAD_FETCH_PARENT_HEIGHT,
        )
        .await
    {
        Ok(response) => Ok(match response.thread {
            ThreadNode::Post(thread) => Some(thread),
            // Gone or invisible: nothing to index here.
            ThreadNode::NotFound(_) | ThreadNode::Blocked(_) | ThreadNode::Other => None,
        }),
        Err(PinakesError::RecordNotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

fn parse_post_record(value: &serde_json::Value) -> Option<PostRecord> {
    match RepoRecord::from_value(value.clone()) {
        Ok(RepoRecord::Post(record)) => Some(record),
        _ => None,
    }
}

/// Thread traversal depth from a post's reply count: 5 replies allow 20
/// levels, 200 replies 3, interpolated on the log axis.
pub(crate) fn log_scale_depth(reply_count: i64) -> u32 {
    let n = reply_count.max(1) as f64;
    let t = ((n.ln() - 5f64.ln()) / (200f64.ln() - 5f64.ln())).clamp(0.0, 1.0);
    (20.0 + t * (3.0 - 20.0)).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_scale_endpoints_and_midpoint() {
        assert_eq!(log_scale_depth(1), 20);
        assert_eq!(log_scale_depth(5), 20);
        assert_eq!(log_scale_depth(50), 9);
        assert_eq!(log_scale_depth(200), 3);
        assert_eq!(log_scale_depth(100_000), 3);
    }

    #[test]
    fn log_scale_is_monotonic() {
        let mut last = u32::MAX;
        for n in [1i64, 5, 10, 25, 50, 100, 200, 500] {
            let depth = log_scale_depth(n);
            assert!(depth <= last, "depth must not grow with reply count");
            last = depth;
        }
    }

    #[test]
    fn parse_post_record_filters_non_posts() {
        let post: serde_json::Value = serde_json::json!({
            "$type": "app.bsky.feed.post",
            "text": "hi",
            "createdAt": "2024-01-01T00:00:00Z",
        });
        assert!(parse_post_record(&post).is_some());

        let like: serde_json::Value = serde_json::json!({
            "$type": "app.bsky.feed.like",
            "subject": {"uri": "at://did:plc:a/app.bsky.feed.post/3k1"},
        });
        assert!(parse_post_record(&like).is_none());

        assert!(parse_post_record(&serde_json::json!({"no": "type"})).is_none());
    }
}
