//! Search queries: shared scalar filters, substring matching and
//! cosine-distance ranking.

use super::posts::post_from_row;
use super::Store;
use crate::models::Post;
use crate::Result;

/// Applied when a vector search is run without an explicit threshold.
pub const DEFAULT_VECTOR_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Restrict to these creators (DIDs).
    pub creators: Vec<String>,
    /// Restrict to replies whose parent is authored by one of these DIDs.
    pub parent_authors: Vec<String>,
    /// Restrict to replies whose thread root is authored by one of these DIDs.
    pub root_authors: Vec<String>,
    /// `created_at < before` (millis).
    pub before: Option<i64>,
    /// `created_at > after` (millis).
    pub after: Option<i64>,
    pub include_alt_text: bool,
    pub order: SortOrder,
    pub results: usize,
    pub threshold: Option<f32>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            creators: Vec::new(),
            parent_authors: Vec::new(),
            root_authors: Vec::new(),
            before: None,
            after: None,
            include_alt_text: false,
            order: SortOrder::default(),
            results: 25,
            threshold: None,
        }
    }
}

/// A vector search result with its best cosine distance.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub post: Post,
    pub distance: f32,
}

enum Arg {
    Text(String),
    Int(i64),
}

/// Scalar predicates shared by both search paths.
fn build_filters(opts: &SearchOptions) -> (Vec<String>, Vec<Arg>) {
    let mut conditions = Vec::new();
    let mut args = Vec::new();

    if !opts.creators.is_empty() {
        let placeholders = vec!["?"; opts.creators.len()].join(", ");
        conditions.push(format!("creator IN ({placeholders})"));
        for creator in &opts.creators {
            args.push(Arg::Text(creator.clone()));
        }
    }
    if !opts.parent_authors.is_empty() {
        let clauses = vec!["reply_parent LIKE ?"; opts.parent_authors.len()].join(" OR ");
        conditions.push(format!("({clauses})"));
        for author in &opts.parent_authors {
            args.push(Arg::Text(format!("at://{author}%")));
        }
    }
    if !opts.root_authors.is_empty() {
        let clauses = vec!["reply_root LIKE ?"; opts.root_authors.len()].join(" OR ");
        conditions.push(format!("({clauses})"));
        for author in &opts.root_authors {
            args.push(Arg::Text(format!("at://{author}%")));
        }
    }
    if let Some(before) = opts.before {
        conditions.push("created_at < ?".to_string());
        args.push(Arg::Int(before));
    }
    if let Some(after) = opts.after {
        conditions.push("created_at > ?".to_string());
        args.push(Arg::Int(after));
    }

    (conditions, args)
}

fn bind_args<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    args: &'q [Arg],
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for arg in args {
        query = match arg {
            Arg::Text(value) => query.bind(value),
            Arg::Int(value) => query.bind(value),
        };
    }
    query
}

impl Store {
    /// Substring search. An empty query returns whatever the filters alone
    /// select.
    pub async fn search_posts_text(&self, query: &str, opts: &SearchOptions) -> Result<Vec<Post>> {
        let (mut conditions, mut args) = build_filters(opts);
        if !query.is_empty() {
            let pattern = format!("%{query}%");
            if opts.include_alt_text {
                conditions.push("(text LIKE ? OR alt_text LIKE ?)".to_string());
                args.push(Arg::Text(pattern.clone()));
                args.push(Arg::Text(pattern));
            } else {
                conditions.push("text LIKE ?".to_string());
                args.push(Arg::Text(pattern));
            }
        }

        let where_clause = if conditions.is_empty() {
            "1=1".to_string()
        } else {
            conditions.join(" AND ")
        };
        let direction = match opts.order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        let sql = format!(
            "SELECT * FROM post WHERE {where_clause} ORDER BY created_at {direction} LIMIT ?"
        );

        let rows = bind_args(sqlx::query(&sql), &args)
            .bind(opts.results as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(post_from_row).collect()
    }

    /// Cosine-distance search over embedded posts. Scalar filters run in
    /// SQL; distance ranking and thresholding run over the filtered
    /// candidates.
    pub async fn search_posts_vector(
        &self,
        query_vec: &[f32],
        opts: &SearchOptions,
    ) -> Result<Vec<VectorHit>> {
        let (mut conditions, args) = build_filters(opts);
        conditions.push("embedding IS NOT NULL".to_string());
        let where_clause = conditions.join(" AND ");
        let sql = format!("SELECT * FROM post WHERE {where_clause}");

        let rows = bind_args(sqlx::query(&sql), &args)
            .fetch_all(&self.pool)
            .await?;

        let threshold = opts.threshold.unwrap_or(DEFAULT_VECTOR_THRESHOLD);
        let mut hits = Vec::new();
        for row in &rows {
            let post = post_from_row(row)?;
            let Some(d_text) = post
                .embedding
                .as_deref()
                .and_then(|e| cosine_distance(e, query_vec))
            else {
                continue;
            };
            let d_alt = if opts.include_alt_text {
                post.alt_text_embedding
                    .as_deref()
                    .and_then(|e| cosine_distance(e, query_vec))
            } else {
                None
            };
            let distance = match d_alt {
                Some(d_alt) => d_text.min(d_alt),
                None => d_text,
            };
            if distance <= threshold {
                hits.push(VectorHit { post, distance });
            }
        }

        hits.sort_by(|a, b| {
            let ordering = a.distance.total_cmp(&b.distance);
            match opts.order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });
        hits.truncate(opts.results);
        Ok(hits)
    }
}

/// `1 - cos(a, b)`. `None` for mismatched dimensions or zero vectors.
fn cosine_distance(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some((1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())) as f32)
}

#[cfg(test)]
mod tests {
    use super::super::posts::sample_post;
    use super::*;

    const DAY: i64 = 86_400_000;

    #[tokio::test]
    async fn time_window_filters_alone_select_the_set() {
        let store = Store::open_in_memory().await.unwrap();
        let t = 10 * DAY;
        let mut early = sample_post("did:plc:a", "3lk4aaa222222", t - DAY);
        early.text = "early".into();
        let mut mid = sample_post("did:plc:a", "3lk4bbb222222", t);
        mid.text = "mid".into();
        let mut late = sample_post("did:plc:a", "3lk4ccc222222", t + DAY);
        late.text = "late".into();
        store.insert_posts(&[early, mid, late]).await.unwrap();

        let opts = SearchOptions {
            before: Some(t),
            after: Some(t - 2 * DAY),
            ..SearchOptions::default()
        };
        let results = store.search_posts_text("", &opts).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].text, "early");
    }

    #[tokio::test]
    async fn substring_match_and_alt_text_opt_in() {
        let store = Store::open_in_memory().await.unwrap();
        let mut plain = sample_post("did:plc:a", "3lk4aaa222222", 1000);
        plain.text = "rust is nice".into();
        let mut pictured = sample_post("did:plc:a", "3lk4bbb222222", 2000);
        pictured.text = "look at this".into();
        pictured.alt_text = Some("a rusty bridge".into());
        store.insert_posts(&[plain, pictured]).await.unwrap();

        let results = store
            .search_posts_text("rust", &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].text, "rust is nice");

        let opts = SearchOptions {
            include_alt_text: true,
            ..SearchOptions::default()
        };
        let results = store.search_posts_text("rust", &opts).await.unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn creator_and_parent_author_filters() {
        let store = Store::open_in_memory().await.unwrap();
        let by_a = sample_post("did:plc:a", "3lk4aaa222222", 1000);
        let mut by_b = sample_post("did:plc:b", "3lk4bbb222222", 2000);
        by_b.reply_parent = Some("at://did:plc:a/app.bsky.feed.post/3lk4aaa222222".into());
        store.insert_posts(&[by_a, by_b]).await.unwrap();

        let opts = SearchOptions {
            creators: vec!["did:plc:a".into()],
            ..SearchOptions::default()
        };
        let results = store.search_posts_text("", &opts).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].creator_did, "did:plc:a");

        let opts = SearchOptions {
            parent_authors: vec!["did:plc:a".into()],
            ..SearchOptions::default()
        };
        let results = store.search_posts_text("", &opts).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].creator_did, "did:plc:b");
    }

    #[tokio::test]
    async fn ordering_and_limit() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .insert_posts(&[
                sample_post("did:plc:a", "3lk4aaa222222", 1000),
                sample_post("did:plc:a", "3lk4bbb222222", 2000),
                sample_post("did:plc:a", "3lk4ccc222222", 3000),
            ])
            .await
            .unwrap();

        let results = store
            .search_posts_text("", &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(results[0].created_at, 3000); // desc default

        let opts = SearchOptions {
            order: SortOrder::Asc,
            results: 2,
            ..SearchOptions::default()
        };
        let results = store.search_posts_text("", &opts).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].created_at, 1000);
    }

    #[tokio::test]
    async fn vector_threshold_keeps_close_posts_only() {
        let store = Store::open_in_memory().await.unwrap();
        // cos distance to [1, 0]: 0.3 and 0.7 respectively.
        let mut close = sample_post("did:plc:a", "3lk4aaa222222", 1000);
        close.embedding = Some(vec![0.7, (1.0f32 - 0.49).sqrt()]);
        let mut far = sample_post("did:plc:a", "3lk4bbb222222", 2000);
        far.embedding = Some(vec![0.3, (1.0f32 - 0.09).sqrt()]);
        let unembedded = sample_post("did:plc:a", "3lk4ccc222222", 3000);
        store.insert_posts(&[close, far, unembedded]).await.unwrap();

        let hits = store
            .search_posts_vector(&[1.0, 0.0], &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].post.rkey, "3lk4aaa222222");
        assert!((hits[0].distance - 0.3).abs() < 1e-5);

        let opts = SearchOptions {
            threshold: Some(0.9),
            ..SearchOptions::default()
        };
        let hits = store.search_posts_vector(&[1.0, 0.0], &opts).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].distance < hits[1].distance); // asc default
    }

    #[tokio::test]
    async fn vector_search_uses_best_of_text_and_alt() {
        let store = Store::open_in_memory().await.unwrap();
        let mut post = sample_post("did:plc:a", "3lk4aaa222222", 1000);
        post.embedding = Some(vec![0.0, 1.0]); // distance 1.0 to query
        post.alt_text_embedding = Some(vec![1.0, 0.0]); // distance 0.0
        store.insert_posts(&[post]).await.unwrap();

        // Without alt text the post misses the default threshold.
        let hits = store
            .search_posts_vector(&[1.0, 0.0], &SearchOptions::default())
            .await
            .unwrap();
        assert!(hits.is_empty());

        let opts = SearchOptions {
            include_alt_text: true,
            ..SearchOptions::default()
        };
        let hits = store.search_posts_vector(&[1.0, 0.0], &opts).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].distance < 1e-5);
    }

    #[test]
    fn cosine_distance_basics() {
        assert!(cosine_distance(&[1.0, 0.0], &[1.0, 0.0]).unwrap() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[0.0, 1.0]).unwrap() - 1.0).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[-1.0, 0.0]).unwrap() - 2.0).abs() < 1e-6);
        assert!(cosine_distance(&[1.0], &[1.0, 2.0]).is_none());
        assert!(cosine_distance(&[0.0, 0.0], &[1.0, 0.0]).is_none());
    }
}
