//! Rate-limited XRPC client for a single service host.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;

use crate::PinakesError;
use crate::Result;

/// In-flight requests per host.
const DEFAULT_CONCURRENCY: usize = 10;
/// Requests admitted per window.
const DEFAULT_INTERVAL_CAP: usize = 3000;
const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);

/// Error body an XRPC endpoint returns alongside a non-2xx status.
#[derive(Debug, serde::Deserialize)]
struct XrpcErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

struct RateWindow {
    cap: usize,
    interval: Duration,
    stamps: VecDeque<Instant>,
}

impl RateWindow {
    /// Time to wait before the next request may go out, or `None` if it can
    /// go now (in which case the slot is taken).
    fn admit(&mut self) -> Option<Duration> {
        let now = Instant::now();
        while self
            .stamps
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.interval)
        {
            self.stamps.pop_front();
        }
        if self.stamps.len() < self.cap {
            self.stamps.push_back(now);
            return None;
        }
        let oldest = *self.stamps.front().expect("cap is non-zero");
        Some(self.interval.saturating_sub(now.duration_since(oldest)))
    }
}

/// HTTP client bound to one service base URL, enforcing that host's
/// concurrency cap and request-rate window.
pub struct ServiceClient {
    base: String,
    http: reqwest::Client,
    limiter: Arc<Semaphore>,
    window: Mutex<RateWindow>,
}

impl ServiceClient {
    #[must_use]
    pub fn new(base: &str, http: reqwest::Client) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            http,
            limiter: Arc::new(Semaphore::new(DEFAULT_CONCURRENCY)),
            window: Mutex::new(RateWindow {
                cap: DEFAULT_INTERVAL_CAP,
                interval: DEFAULT_INTERVAL,
                stamps: VecDeque::new(),
            }),
        }
    }

    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    async fn throttle(&self) -> tokio::sync::OwnedSemaphorePermit {
        let permit = Arc::clone(&self.limiter)
            .acquire_owned()
            .await
            .expect("limiter is never closed");
        loop {
            let wait = self.window.lock().unwrap().admit();
            match wait {
                None => return permit,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }

    /// GET an XRPC query endpoint, decoding the JSON response.
    pub async fn get_json<O: DeserializeOwned>(
        &self,
        nsid: &str,
        params: &[(&str, String)],
    ) -> Result<O> {
        // Hold the concurrency permit across the body read too.
        let _permit = self.throttle().await;
        let response = self.request(nsid, params).await?;
        Ok(response.json().await?)
    }

    /// GET an XRPC query endpoint returning raw bytes (CAR downloads).
    pub async fn get_bytes(&self, nsid: &str, params: &[(&str, String)]) -> Result<Vec<u8>> {
        let _permit = self.throttle().await;
        let response = self.request(nsid, params).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn request(&self, nsid: &str, params: &[(&str, String)]) -> Result<reqwest::Response> {
        let url = format!("{}/xrpc/{nsid}", self.base);
        let response = self.http.get(&url).query(params).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let ratelimit_reset = response
            .headers()
            .get("ratelimit-reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body: XrpcErrorBody = response.json().await.unwrap_or(XrpcErrorBody {
            error: String::new(),
            message: String::new(),
        });

        // Missing records are terminal for the caller, not a transport fault.
        if matches!(body.error.as_str(), "NotFound" | "RecordNotFound") {
            return Err(PinakesError::RecordNotFound(format!(
                "{nsid}: {}",
                body.message
            )));
        }

        Err(PinakesError::Xrpc {
            status: status.as_u16(),
            message: if body.message.is_empty() {
                body.error
            } else {
                format!("{}: {}", body.error, body.message)
            },
            ratelimit_reset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_admits_up_to_cap() {
        let mut window = RateWindow {
            cap: 3,
            interval: Duration::from_secs(300),
            stamps: VecDeque::new(),
        };
        assert!(window.admit().is_none());
        assert!(window.admit().is_none());
        assert!(window.admit().is_none());
        let wait = window.admit().expect("fourth request must wait");
        assert!(wait <= Duration::from_secs(300));
        assert!(wait > Duration::from_secs(299));
    }
}
