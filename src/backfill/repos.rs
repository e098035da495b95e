//! Repository crawling: fetch, rev skip, ingress inclusion tagging.

use std::sync::Arc;

use super::EngineInner;
use super::PostTask;
use super::RepoTask;
use crate::models::InclusionReason;
use crate::records;
use crate::records::is_tid;
use crate::records::RepoRecord;
use crate::repo::Repository;
use crate::Result;

pub(crate) async fn process_repo(inner: &Arc<EngineInner>, task: RepoTask) -> Result<()> {
    let bytes = inner.rpc.get_repo(&task.did).await?;
    ingest_repo_bytes(inner, &task, &bytes).await
}

/// Walk a repository's records, enqueueing discovered work. Records below
/// the stored rev are skipped (follows exempt: the followed account may have
/// new content even when our repo is unchanged). The new rev is written back
/// after a successful walk.
pub(crate) async fn ingest_repo_bytes(
    inner: &Arc<EngineInner>,
    task: &RepoTask,
    bytes: &[u8],
) -> Result<()> {
    let repo = Repository::open(bytes)?;
    tracing::debug!(
        "walking repo {} ({} records, rev {})",
        task.did,
        repo.len(),
        repo.rev()
    );

    let last_rev = if task.force {
        None
    } else {
        inner.store.get_repo_rev(&task.did).await?
    };
    // Lexicographic rkey comparison only means "older" when the stored rev
    // is a timestamp identifier.
    let skip_below = last_rev.filter(|rev| is_tid(rev));

    for entry in repo.records() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("{}: skipping malformed record: {e}", task.did);
                continue;
            }
        };

        let relevant = matches!(
            entry.collection.as_str(),
            records::COLLECTION_POST | records::COLLECTION_REPOST
        ) || (task.is_own
            && matches!(
                entry.collection.as_str(),
                records::COLLECTION_LIKE | records::COLLECTION_FOLLOW
            ));
        if !relevant {
            continue;
        }

        if let Some(rev) = &skip_below {
            if entry.rkey.as_str() < rev.as_str()
                && entry.collection != records::COLLECTION_FOLLOW
            {
                continue;
            }
        }

        let record = match RepoRecord::from_value(entry.record) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("{}/{}/{}: {e}", task.did, entry.collection, entry.rkey);
                continue;
            }
        };

        match record {
            RepoRecord::Post(post) => {
                let inclusion = if task.is_own {
                    InclusionReason::Own
                } else {
                    InclusionReason::ByFollow
                };
                let uri = format!(
                    "at://{}/{}/{}",
                    task.did,
                    records::COLLECTION_POST,
                    entry.rkey
                );
                // The record is already decoded: prepend, so it is consumed
                // before newer additions push it out.
                inner
                    .queues()
                    .post
                    .prepend(PostTask {
                        uri,
                        inclusion,
                        context: None,
                        record: Some(post),
                        depth: 0,
                    })
                    .await;
            }
            RepoRecord::Repost(repost) => {
                inner.progress.counter("reposts").inc(1);
                inner
                    .queues()
                    .post
                    .add(PostTask {
                        uri: repost.subject.uri,
                        inclusion: InclusionReason::RepostedBy,
                        context: Some(task.did.clone()),
                        record: None,
                        depth: 0,
                    })
                    .await;
            }
            RepoRecord::Like(like) => {
                inner.progress.counter("likes").inc(1);
                inner
                    .queues()
                    .post
                    .add(PostTask {
                        uri: like.subject.uri,
                        inclusion: InclusionReason::LikedBySelf,
                        context: None,
                        record: None,
                        depth: 0,
                    })
                    .await;
            }
            RepoRecord::Follow(follow) => {
                inner.progress.counter("follows").inc(1);
                inner
                    .queues()
                    .repo
                    .add(RepoTask {
                        did: follow.subject,
                        is_own: false,
                        force: false,
                    })
                    .await;
            }
            RepoRecord::Other => {}
        }
    }

    inner.store.set_repo_rev(&task.did, repo.rev()).await?;
    inner.progress.counter("repos").inc(1);
    Ok(())
}
