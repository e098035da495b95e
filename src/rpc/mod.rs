//! Retrying, rate-limited RPC management.
//!
//! One [`ServiceClient`] per host, shared behind the manager; `query` wraps
//! an operation in the retry ladder, `query_by_did` resolves the repo's PDS
//! first. Per-attempt timeouts surface as cancellation errors, which the
//! retry ladder deliberately does not absorb: the task queue owns requeue
//! for those.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use crate::records::AtUri;
use crate::PinakesError;
use crate::Result;

mod client;
mod identity;
pub mod views;

pub use client::ServiceClient;
pub use identity::IdentityResolver;
pub use identity::ResolvedDid;

use views::ProfileView;
use views::RecordResponse;
use views::ResolveHandleResponse;
use views::ThreadResponse;

/// Additional attempts after the first failure.
const MAX_RETRIES: u32 = 5;

const THREAD_VIEW_TIMEOUT: Duration = Duration::from_secs(10);
const RECORD_TIMEOUT: Duration = Duration::from_secs(15);

pub struct RpcManager {
    http: reqwest::Client,
    services: Mutex<HashMap<String, Arc<ServiceClient>>>,
    identity: IdentityResolver,
}

impl RpcManager {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("pinakes/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            identity: IdentityResolver::new(http.clone()),
            services: Mutex::new(HashMap::new()),
            http,
        })
    }

    /// Client for a service base URL, created on first use.
    pub fn service(&self, base: &str) -> Arc<ServiceClient> {
        let mut services = self.services.lock().unwrap();
        Arc::clone(
            services
                .entry(base.trim_end_matches('/').to_string())
                .or_insert_with(|| Arc::new(ServiceClient::new(base, self.http.clone()))),
        )
    }

    /// Run `op` against `service` with retries.
    pub async fn query<T, F, Fut>(&self, service: &str, op: F) -> Result<T>
    where
        F: Fn(Arc<ServiceClient>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let client = self.service(service);
        let mut attempt: u32 = 0;
        loop {
            let err = match op(Arc::clone(&client)).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            // Cancellation belongs to the task queue's requeue policy.
            if err.is_cancellation() {
                return Err(err);
            }

            if let PinakesError::Xrpc {
                ratelimit_reset: Some(reset),
                ..
            } = &err
            {
                if attempt < MAX_RETRIES {
                    let now = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_secs();
                    let wait = reset.saturating_sub(now);
                    tracing::debug!("rate limited by {service}, sleeping {wait}s until reset");
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                    attempt += 1;
                    continue;
                }
            }

            let retryable_status = matches!(
                err.status(),
                Some(408 | 429 | 500 | 502 | 503 | 504)
            );
            if (retryable_status || has_transient_marker(&err)) && attempt < MAX_RETRIES {
                let backoff = 3u64.pow(attempt + 1);
                tracing::debug!(
                    "retrying {service} after {backoff}s (attempt {}): {err}",
                    attempt + 1
                );
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                attempt += 1;
                continue;
            }

            return Err(err);
        }
    }

    /// Run `op` once; the caller's orchestration supersedes retries.
    pub async fn query_no_retry<T, F, Fut>(&self, service: &str, op: F) -> Result<T>
    where
        F: Fn(Arc<ServiceClient>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let client = self.service(service);
        op(client).await
    }

    /// Resolve `did` to its PDS and run `op` there.
    pub async fn query_by_did<T, F, Fut>(&self, did: &str, op: F) -> Result<T>
    where
        F: Fn(Arc<ServiceClient>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let resolved = self.identity.resolve(did).await?;
        self.query(&resolved.pds, op).await
    }

    pub async fn resolve_did(&self, did: &str) -> Result<ResolvedDid> {
        self.identity.resolve(did).await
    }

    /// Full repository CAR for `did`, fetched from its PDS.
    pub async fn get_repo(&self, did: &str) -> Result<Vec<u8>> {
        let did_param = did.to_string();
        self.query_by_did(did, |client| {
            let did = did_param.clone();
            async move {
                client
                    .get_bytes("com.atproto.sync.getRepo", &[("did", did)])
                    .await
            }
        })
        .await
    }

    /// Direct record fetch from the owner's PDS.
    pub async fn get_record(&self, at_uri: &AtUri) -> Result<RecordResponse> {
        let uri = at_uri.clone();
        self.query_by_did(&at_uri.did, |client| {
            let uri = uri.clone();
            async move {
                tokio::time::timeout(
                    RECORD_TIMEOUT,
                    client.get_json::<RecordResponse>(
                        "com.atproto.repo.getRecord",
                        &[
                            ("repo", uri.did.clone()),
                            ("collection", uri.collection.clone()),
                            ("rkey", uri.rkey.clone()),
                        ],
                    ),
                )
                .await?
            }
        })
        .await
    }

    /// Thread view for `uri` from the AppView.
    pub async fn get_post_thread(
        &self,
        appview: &str,
        uri: &str,
        depth: u32,
        parent_height: u32,
    ) -> Result<ThreadResponse> {
        let uri = uri.to_string();
        self.query(appview, |client| {
            let uri = uri.clone();
            async move {
                tokio::time::timeout(
                    THREAD_VIEW_TIMEOUT,
                    client.get_json::<ThreadResponse>(
                        "app.bsky.feed.getPostThread",
                        &[
                            ("uri", uri),
                            ("depth", depth.to_string()),
                            ("parentHeight", parent_height.to_string()),
                        ],
                    ),
                )
                .await?
            }
        })
        .await
    }

    /// Profile view (handle, follows count) from the AppView.
    pub async fn get_profile(&self, appview: &str, actor: &str) -> Result<ProfileView> {
        let actor = actor.to_string();
        self.query(appview, |client| {
            let actor = actor.clone();
            async move {
                client
                    .get_json::<ProfileView>("app.bsky.actor.getProfile", &[("actor", actor)])
                    .await
            }
        })
        .await
    }

    /// Resolve a handle to its DID via the AppView.
    pub async fn resolve_handle(&self, appview: &str, handle: &str) -> Result<String> {
        let handle = handle.to_string();
        let response = self
            .query(appview, |client| {
                let handle = handle.clone();
                async move {
                    client
                        .get_json::<ResolveHandleResponse>(
                            "com.atproto.identity.resolveHandle",
                            &[("handle", handle)],
                        )
                        .await
                }
            })
            .await?;
        Ok(response.did)
    }
}

fn has_transient_marker(err: &PinakesError) -> bool {
    let message = err.to_string().to_lowercase();
    ["tcp", "network", "dns"]
        .iter()
        .any(|marker| message.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_markers_match() {
        assert!(has_transient_marker(&PinakesError::Custom(
            "error sending request: dns error".into()
        )));
        assert!(has_transient_marker(&PinakesError::Custom(
            "TCP connect error".into()
        )));
        assert!(!has_transient_marker(&PinakesError::Custom(
            "record validation failed".into()
        )));
    }

    #[test]
    fn retryable_statuses() {
        for status in [408u16, 429, 500, 502, 503, 504] {
            let err = PinakesError::Xrpc {
                status,
                message: "upstream".into(),
                ratelimit_reset: None,
            };
            assert!(matches!(
                err.status(),
                Some(408 | 429 | 500 | 502 | 503 | 504)
            ));
        }
        let err = PinakesError::Xrpc {
            status: 403,
            message: "forbidden".into(),
            ratelimit_reset: None,
        };
        assert!(!matches!(
            err.status(),
            Some(408 | 429 | 500 | 502 | 503 | 504)
        ));
    }
}
