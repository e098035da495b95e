//! Backfill engine: bounded-concurrency graph traversal over repos, posts
//! and embeddings.
//!
//! The engine owns three queues. Repo tasks fetch and walk repositories,
//! fanning records out onto the post queue (and follows back onto the repo
//! queue). Post tasks fetch missing records thread-view-first, persist in
//! batches and expand into quotes, ancestors and descendants. Flushed
//! batches are handed to the embeddings queue, which re-upserts vectors by
//! position; re-writing a row twice is cheaper than blocking ingest on
//! inference.

use std::collections::HashSet;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::Weak;
use std::time::Duration;

use crate::embedder::Embedder;
use crate::models::InclusionReason;
use crate::models::Post;
use crate::progress::ProgressTracker;
use crate::queue::QueueConfig;
use crate::queue::TaskQueue;
use crate::records::PostRecord;
use crate::rpc::RpcManager;
use crate::store::Store;
use crate::Result;

mod posts;
mod repos;

/// Pending writes are flushed at this size.
const WRITE_POSTS_BATCH_SIZE: usize = 20;

const DEFAULT_MAX_DEPTH: u32 = 5;
const REDUCED_MAX_DEPTH: u32 = 2;
/// Accounts following more than this many repos get the reduced depth.
const FOLLOWS_REDUCTION_THRESHOLD: i64 = 250;

const REPO_SOFT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct BackfillOptions {
    /// Explicit depth budget; `None` means default with auto-reduction.
    pub depth: Option<u32>,
    pub appview: String,
}

/// Arguments for one repository crawl.
#[derive(Debug, Clone)]
pub(crate) struct RepoTask {
    pub did: String,
    /// Own repo processes {post, repost, like, follow}; discovered repos
    /// {post, repost} only.
    pub is_own: bool,
    /// Ignore the stored rev and re-walk everything.
    pub force: bool,
}

/// Arguments for one post-processing step.
#[derive(Debug, Clone)]
pub(crate) struct PostTask {
    pub uri: String,
    pub inclusion: InclusionReason,
    pub context: Option<String>,
    /// Already-decoded record, when the discovery path carried one.
    pub record: Option<PostRecord>,
    pub depth: u32,
}

pub(crate) struct Queues {
    pub repo: TaskQueue<RepoTask>,
    pub post: TaskQueue<PostTask>,
    pub embed: TaskQueue<Vec<Post>>,
}

pub(crate) struct EngineInner {
    pub store: Store,
    pub rpc: Arc<RpcManager>,
    pub embedder: Option<Arc<Embedder>>,
    pub progress: ProgressTracker,
    pub user_did: String,
    pub appview: String,
    max_depth: AtomicU32,
    depth_overridden: bool,
    seen_posts: Mutex<HashSet<u32>>,
    pending: Mutex<Vec<Post>>,
    queues: OnceLock<Queues>,
}

impl EngineInner {
    pub(crate) fn queues(&self) -> &Queues {
        self.queues.get().expect("queues wired before use")
    }

    pub(crate) fn max_depth(&self) -> u32 {
        self.max_depth.load(Ordering::Relaxed)
    }

    /// Record the URI hash; false when it was already seen. Hashing the URI
    /// (not the record) is what breaks quote cycles.
    pub(crate) fn mark_seen(&self, uri: &str) -> bool {
        self.seen_posts
            .lock()
            .unwrap()
            .insert(crc32fast::hash(uri.as_bytes()))
    }

    /// Forget a URI so a requeued task can run again after a cancellation.
    pub(crate) fn unmark_seen(&self, uri: &str) {
        self.seen_posts
            .lock()
            .unwrap()
            .remove(&crc32fast::hash(uri.as_bytes()));
    }

    pub(crate) async fn buffer_post(&self, post: Post) {
        let full_batch = {
            let mut pending = self.pending.lock().unwrap();
            pending.push(post);
            if pending.len() >= WRITE_POSTS_BATCH_SIZE {
                Some(std::mem::take(&mut *pending))
            } else {
                None
            }
        };
        if let Some(batch) = full_batch {
            self.flush_batch(batch).await;
        }
    }

    pub(crate) async fn flush_pending(&self) {
        let batch = std::mem::take(&mut *self.pending.lock().unwrap());
        if !batch.is_empty() {
            self.flush_batch(batch).await;
        }
    }

    /// Persist a batch and hand it to the embedding side-channel. Write
    /// errors are logged and the batch dropped; re-observations are common
    /// enough to heal them.
    async fn flush_batch(&self, batch: Vec<Post>) {
        if let Err(e) = self.store.insert_posts(&batch).await {
            tracing::warn!("failed to persist batch of {} posts: {e}", batch.len());
            return;
        }
        if self.embedder.is_some() {
            self.queues().embed.add(batch).await;
        }
    }
}

pub struct BackfillEngine {
    inner: Arc<EngineInner>,
}

impl BackfillEngine {
    #[must_use]
    pub fn new(
        store: Store,
        rpc: Arc<RpcManager>,
        embedder: Option<Arc<Embedder>>,
        progress: ProgressTracker,
        user_did: String,
        options: &BackfillOptions,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                rpc,
                embedder,
                progress,
                user_did,
                appview: options.appview.clone(),
                max_depth: AtomicU32::new(options.depth.unwrap_or(DEFAULT_MAX_DEPTH)),
                depth_overridden: options.depth.is_some(),
                seen_posts: Mutex::new(HashSet::new()),
                pending: Mutex::new(Vec::new()),
                queues: OnceLock::new(),
            }),
        }
    }

    /// Crawl the configured user's view of the network.
    pub async fn run(&self) -> Result<()> {
        self.reduce_depth_for_large_follow_graphs().await;
        self.wire_queues();

        let user_did = self.inner.user_did.clone();
        self.inner
            .queues()
            .repo
            .add(RepoTask {
                did: user_did,
                is_own: true,
                force: false,
            })
            .await;

        self.drain().await;
        Ok(())
    }

    /// Import a single repository as a crawl root: from CAR bytes when
    /// given, otherwise fetched from the DID's PDS.
    pub async fn run_import(&self, did: &str, car: Option<Vec<u8>>, force: bool) -> Result<()> {
        self.wire_queues();
        let task = RepoTask {
            did: did.to_string(),
            is_own: true,
            force,
        };
        match car {
            Some(bytes) => repos::ingest_repo_bytes(&self.inner, &task, &bytes).await?,
            None => self.inner.queues().repo.add(task).await,
        }
        self.drain().await;
        Ok(())
    }

    /// Default depth is too expensive for accounts following thousands of
    /// repos; profile lookup failures keep the default.
    async fn reduce_depth_for_large_follow_graphs(&self) {
        if self.inner.depth_overridden {
            return;
        }
        match self
            .inner
            .rpc
            .get_profile(&self.inner.appview, &self.inner.user_did)
            .await
        {
            Ok(profile) => {
                let follows = profile.follows_count.unwrap_or(0);
                if follows > FOLLOWS_REDUCTION_THRESHOLD {
                    tracing::info!(
                        "account follows {follows} repos, reducing depth {DEFAULT_MAX_DEPTH} -> {REDUCED_MAX_DEPTH}"
                    );
                    self.inner
                        .max_depth
                        .store(REDUCED_MAX_DEPTH, Ordering::Relaxed);
                }
            }
            Err(e) => tracing::debug!("profile lookup failed, keeping default depth: {e}"),
        }
    }

    fn wire_queues(&self) {
        let inner = &self.inner;
        inner.queues.get_or_init(|| {
            let errors = inner.progress.counter("errors");

            let repo_weak = Arc::downgrade(inner);
            let repo = TaskQueue::new(
                "repos",
                QueueConfig {
                    hard_concurrency: 20,
                    soft_concurrency: Some(10),
                    max_queue_size: Some(1_000),
                    soft_timeout: REPO_SOFT_TIMEOUT,
                },
                move |task: RepoTask| run_repo_task(repo_weak.clone(), task),
            );

            let post_weak = Arc::downgrade(inner);
            let post = TaskQueue::new(
                "posts",
                QueueConfig {
                    hard_concurrency: 100,
                    soft_concurrency: Some(25),
                    max_queue_size: Some(100_000),
                    ..QueueConfig::default()
                },
                move |task: PostTask| run_post_task(post_weak.clone(), task),
            );

            // Batches serialize through the model.
            let embed_weak = Arc::downgrade(inner);
            let embed = TaskQueue::new(
                "embeddings",
                QueueConfig {
                    hard_concurrency: 1,
                    ..QueueConfig::default()
                },
                move |batch: Vec<Post>| run_embed_task(embed_weak.clone(), batch),
            );

            let repo_errors = errors.clone();
            repo.set_observer(move |event| {
                if event == crate::queue::QueueEvent::Errored {
                    repo_errors.inc(1);
                }
            });
            let post_errors = errors;
            post.set_observer(move |event| {
                if event == crate::queue::QueueEvent::Errored {
                    post_errors.inc(1);
                }
            });

            Queues { repo, post, embed }
        });
    }

    /// Poll the queues until all are idle; draining one queue can re-enqueue
    /// on another, so a single pass is never enough.
    async fn drain(&self) {
        let queues = self.inner.queues();
        loop {
            queues.repo.process_all().await;
            queues.post.process_all().await;
            queues.embed.process_all().await;
            if queues.repo.is_idle() && queues.post.is_idle() {
                self.inner.flush_pending().await;
                queues.embed.process_all().await;
                if queues.repo.is_idle() && queues.post.is_idle() && queues.embed.is_idle() {
                    break;
                }
            }
        }
    }
}

async fn run_repo_task(weak: Weak<EngineInner>, task: RepoTask) -> Result<()> {
    let Some(inner) = weak.upgrade() else {
        return Ok(());
    };
    repos::process_repo(&inner, task).await
}

async fn run_post_task(weak: Weak<EngineInner>, task: PostTask) -> Result<()> {
    let Some(inner) = weak.upgrade() else {
        return Ok(());
    };
    posts::process_post(&inner, task).await
}

async fn run_embed_task(weak: Weak<EngineInner>, batch: Vec<Post>) -> Result<()> {
    let Some(inner) = weak.upgrade() else {
        return Ok(());
    };
    embed_batch(&inner, batch).await
}

/// Text and alt-text vectors in two parallel batched calls, assigned back by
/// position and re-upserted.
async fn embed_batch(inner: &Arc<EngineInner>, batch: Vec<Post>) -> Result<()> {
    let Some(embedder) = inner.embedder.as_ref() else {
        return Ok(());
    };

    let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();
    let alt_indexed: Vec<(usize, String)> = batch
        .iter()
        .enumerate()
        .filter_map(|(i, p)| p.alt_text.clone().map(|alt| (i, alt)))
        .collect();
    let alt_texts: Vec<String> = alt_indexed.iter().map(|(_, alt)| alt.clone()).collect();

    let (text_vectors, alt_vectors) = tokio::join!(
        embedder.embed_batch(texts),
        embedder.embed_batch(alt_texts)
    );
    let text_vectors = text_vectors?;
    let alt_vectors = alt_vectors?;

    let mut alt_by_index: std::collections::HashMap<usize, Vec<f32>> = alt_indexed
        .iter()
        .map(|(i, _)| *i)
        .zip(alt_vectors)
        .collect();

    let rows: Vec<(String, String, Option<Vec<f32>>, Option<Vec<f32>>)> = batch
        .iter()
        .enumerate()
        .map(|(i, post)| {
            (
                post.creator_did.clone(),
                post.rkey.clone(),
                text_vectors.get(i).cloned(),
                alt_by_index.remove(&i),
            )
        })
        .collect();

    let count = rows.len() as u64;
    inner.store.update_post_embeddings(&rows).await?;
    inner.progress.counter("embeddings").inc(count);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogRouter;

    fn engine(store: Store, depth: Option<u32>) -> BackfillEngine {
        BackfillEngine::new(
            store,
            Arc::new(RpcManager::new().unwrap()),
            None,
            ProgressTracker::start(LogRouter::new()),
            "did:plc:me".into(),
            &BackfillOptions {
                depth,
                appview: "https://appview.invalid".into(),
            },
        )
    }

    #[tokio::test]
    async fn seen_posts_dedup_is_by_uri_hash() {
        let store = Store::open_in_memory().await.unwrap();
        let engine = engine(store, Some(5));
        let uri = "at://did:plc:a/app.bsky.feed.post/3lk4aaa222222";
        assert!(engine.inner.mark_seen(uri));
        assert!(!engine.inner.mark_seen(uri));
        engine.inner.unmark_seen(uri);
        assert!(engine.inner.mark_seen(uri));
    }

    #[tokio::test]
    async fn pending_writes_flush_at_batch_size() {
        let store = Store::open_in_memory().await.unwrap();
        let engine = engine(store.clone(), Some(5));
        engine.wire_queues();

        for i in 0..WRITE_POSTS_BATCH_SIZE {
            let rkey = format!("3lk4aaa2222{i:02}");
            engine
                .inner
                .buffer_post(crate::store::sample_post("did:plc:a", &rkey, i as i64))
                .await;
        }
        // The 20th push crossed the threshold and flushed synchronously.
        let stored = store
            .search_posts_text("", &crate::store::SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(stored.len(), WRITE_POSTS_BATCH_SIZE);
        assert!(engine.inner.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn flush_pending_writes_partial_buffers() {
        let store = Store::open_in_memory().await.unwrap();
        let engine = engine(store.clone(), Some(5));
        engine.wire_queues();
        engine
            .inner
            .buffer_post(crate::store::sample_post("did:plc:a", "3lk4aaa222222", 1))
            .await;
        engine.inner.flush_pending().await;
        assert!(store
            .get_post("did:plc:a", "3lk4aaa222222")
            .await
            .unwrap()
            .is_some());
    }
}
