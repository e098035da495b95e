//! DID → service resolution with a bounded cache.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use serde::Deserialize;

use crate::config::PLC_DIRECTORY;
use crate::PinakesError;
use crate::Result;

/// Resolution results kept in memory. Misses are cached as `None` so a dead
/// DID is not re-resolved on every discovery path.
const CACHE_SIZE: usize = 100_000;

#[derive(Debug, Clone)]
pub struct ResolvedDid {
    /// Base URL of the personal data server hosting the repo.
    pub pds: String,
    pub handle: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DidDocument {
    #[serde(default, rename = "alsoKnownAs")]
    also_known_as: Vec<String>,
    #[serde(default)]
    service: Vec<DidService>,
}

#[derive(Debug, Deserialize)]
struct DidService {
    #[serde(default)]
    id: String,
    #[serde(default, rename = "type")]
    service_type: String,
    /// Kept as a raw value: hostile documents put objects here.
    #[serde(default, rename = "serviceEndpoint")]
    service_endpoint: serde_json::Value,
}

pub struct IdentityResolver {
    http: reqwest::Client,
    cache: Mutex<LruCache<String, Option<ResolvedDid>>>,
}

impl IdentityResolver {
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_SIZE).expect("non-zero cache size"),
            )),
        }
    }

    /// Resolve a DID to its PDS service URL and handle.
    ///
    /// # Errors
    /// `DidNotFound` when the directory has no document (cached negatively),
    /// `InvalidDidDocument` when the document exists but carries no usable
    /// `#atproto_pds` endpoint.
    pub async fn resolve(&self, did: &str) -> Result<ResolvedDid> {
        if let Some(cached) = self.cache.lock().unwrap().get(did).cloned() {
            return cached.ok_or_else(|| PinakesError::DidNotFound(did.to_string()));
        }

        let resolved = self.fetch(did).await;
        match resolved {
            Ok(resolved) => {
                self.cache
                    .lock()
                    .unwrap()
                    .put(did.to_string(), Some(resolved.clone()));
                Ok(resolved)
            }
            Err(PinakesError::DidNotFound(d)) => {
                self.cache.lock().unwrap().put(did.to_string(), None);
                Err(PinakesError::DidNotFound(d))
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch(&self, did: &str) -> Result<ResolvedDid> {
        let url = if did.starts_with("did:plc:") {
            format!("{PLC_DIRECTORY}/{did}")
        } else if let Some(domain) = did.strip_prefix("did:web:") {
            if domain.is_empty() || domain.contains('/') {
                return Err(PinakesError::InvalidDidDocument(
                    did.to_string(),
                    "unsupported did:web form".into(),
                ));
            }
            format!("https://{domain}/.well-known/did.json")
        } else {
            return Err(PinakesError::InvalidDidDocument(
                did.to_string(),
                "unsupported DID method".into(),
            ));
        };

        let response = self.http.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(PinakesError::DidNotFound(did.to_string()));
        }
        let response = response.error_for_status()?;
        let doc: DidDocument = response.json().await?;
        Self::extract(did, &doc)
    }

    fn extract(did: &str, doc: &DidDocument) -> Result<ResolvedDid> {
        let service = doc
            .service
            .iter()
            .find(|s| {
                s.id.ends_with("#atproto_pds") || s.service_type == "AtprotoPersonalDataServer"
            })
            .ok_or_else(|| {
                PinakesError::InvalidDidDocument(did.to_string(), "no #atproto_pds service".into())
            })?;

        let endpoint = service.service_endpoint.as_str().ok_or_else(|| {
            PinakesError::InvalidDidDocument(
                did.to_string(),
                "serviceEndpoint is not a string".into(),
            )
        })?;
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(PinakesError::InvalidDidDocument(
                did.to_string(),
                format!("invalid serviceEndpoint: {endpoint}"),
            ));
        }

        let handle = doc
            .also_known_as
            .iter()
            .find_map(|aka| aka.strip_prefix("at://"))
            .map(ToString::to_string);

        Ok(ResolvedDid {
            pds: endpoint.trim_end_matches('/').to_string(),
            handle,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(json: &str) -> DidDocument {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn extracts_pds_and_handle() {
        let document = doc(
            r##"{
                "alsoKnownAs": ["at://alice.example.com"],
                "service": [
                    {"id": "#other", "type": "SomethingElse", "serviceEndpoint": "https://x"},
                    {"id": "#atproto_pds", "type": "AtprotoPersonalDataServer",
                     "serviceEndpoint": "https://pds.example.com/"}
                ]
            }"##,
        );
        let resolved = IdentityResolver::extract("did:plc:abc", &document).unwrap();
        assert_eq!(resolved.pds, "https://pds.example.com");
        assert_eq!(resolved.handle.as_deref(), Some("alice.example.com"));
    }

    #[test]
    fn non_string_endpoint_is_an_error() {
        let document = doc(
            r##"{"service": [{"id": "#atproto_pds", "type": "AtprotoPersonalDataServer",
                "serviceEndpoint": {"nested": true}}]}"##,
        );
        let err = IdentityResolver::extract("did:plc:abc", &document).unwrap_err();
        assert!(matches!(err, PinakesError::InvalidDidDocument(..)));
    }

    #[test]
    fn missing_pds_service_is_an_error() {
        let document = doc(r#"{"service": []}"#);
        assert!(IdentityResolver::extract("did:plc:abc", &document).is_err());
    }
}
