//! Search surface: identifier resolution and delegation to the store.

use std::sync::Arc;

use crate::embedder::Embedder;
use crate::models::Post;
use crate::rpc::RpcManager;
use crate::store::SearchOptions;
use crate::store::SortOrder;
use crate::store::Store;
use crate::store::VectorHit;
use crate::PinakesError;
use crate::Result;

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    pub vector: bool,
    pub results: usize,
    /// DIDs or handles; handles are resolved once.
    pub creators: Vec<String>,
    pub parent_authors: Vec<String>,
    pub root_authors: Vec<String>,
    /// ISO timestamps or dates.
    pub before: Option<String>,
    pub after: Option<String>,
    pub order: SortOrder,
    pub threshold: Option<f32>,
    pub include_alt_text: bool,
}

pub enum SearchOutput {
    Text(Vec<Post>),
    Vector(Vec<VectorHit>),
}

pub async fn run_search(
    store: &Store,
    rpc: &RpcManager,
    embedder: &Arc<Embedder>,
    appview: &str,
    request: &SearchRequest,
) -> Result<SearchOutput> {
    let options = SearchOptions {
        creators: resolve_identifiers(rpc, appview, &request.creators).await?,
        parent_authors: resolve_identifiers(rpc, appview, &request.parent_authors).await?,
        root_authors: resolve_identifiers(rpc, appview, &request.root_authors).await?,
        before: request.before.as_deref().map(parse_time).transpose()?,
        after: request.after.as_deref().map(parse_time).transpose()?,
        include_alt_text: request.include_alt_text,
        order: request.order,
        results: request.results,
        threshold: request.threshold,
    };

    if request.vector {
        let mut vectors = embedder.embed_batch(vec![request.query.clone()]).await?;
        let query_vec = vectors.pop().ok_or_else(|| {
            PinakesError::EmbeddingError("no vector produced for query".into())
        })?;
        let hits = store.search_posts_vector(&query_vec, &options).await?;
        Ok(SearchOutput::Vector(hits))
    } else {
        let posts = store.search_posts_text(&request.query, &options).await?;
        Ok(SearchOutput::Text(posts))
    }
}

/// DIDs pass through; anything else resolves as a handle.
async fn resolve_identifiers(
    rpc: &RpcManager,
    appview: &str,
    identifiers: &[String],
) -> Result<Vec<String>> {
    let mut resolved = Vec::with_capacity(identifiers.len());
    for identifier in identifiers {
        if identifier.starts_with("did:") {
            resolved.push(identifier.clone());
        } else {
            resolved.push(rpc.resolve_handle(appview, identifier).await?);
        }
    }
    Ok(resolved)
}

/// Millisecond epoch from an RFC 3339 timestamp or a plain date.
pub fn parse_time(input: &str) -> Result<i64> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(input) {
        return Ok(dt.timestamp_millis());
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        let midnight = date.and_hms_opt(0, 0, 0).expect("midnight is valid");
        return Ok(midnight.and_utc().timestamp_millis());
    }
    Err(PinakesError::ConfigError(format!(
        "unparseable time {input:?}; use RFC 3339 or YYYY-MM-DD"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3339_and_dates() {
        assert_eq!(parse_time("1970-01-01T00:00:01Z").unwrap(), 1000);
        assert_eq!(parse_time("1970-01-02").unwrap(), 86_400_000);
        assert!(parse_time("last tuesday").is_err());
    }
}
