#![allow(clippy::cast_possible_truncation)] // batch sizes stay far below u32::MAX

use std::collections::HashMap;

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::decode_vector;
use super::encode_vector;
use super::Store;
use crate::models::InclusionReason;
use crate::models::Post;
use crate::Result;

// SQLite bind-parameter budget for bulk inserts.
const MAX_PARAMS: usize = 32_000;
const POST_PARAMS_PER_ROW: usize = 15;
const POST_CHUNK_SIZE: usize = MAX_PARAMS / POST_PARAMS_PER_ROW;

impl Store {
    /// Batched upsert. Non-key columns are last-writer-wins except the two
    /// embedding columns, which keep a stored non-null vector when the
    /// incoming row carries null (embeddings are filled lazily and must
    /// survive re-observation).
    pub async fn insert_posts(&self, posts: &[Post]) -> Result<()> {
        if posts.is_empty() {
            return Ok(());
        }

        // Dedup within the batch, last occurrence wins.
        let mut index: HashMap<(&str, &str), usize> = HashMap::new();
        let mut deduped: Vec<&Post> = Vec::with_capacity(posts.len());
        for post in posts {
            let key = (post.creator_did.as_str(), post.rkey.as_str());
            if let Some(at) = index.get(&key) {
                deduped[*at] = post;
            } else {
                index.insert(key, deduped.len());
                deduped.push(post);
            }
        }

        for chunk in deduped.chunks(POST_CHUNK_SIZE) {
            let mut sql = String::with_capacity(400 + chunk.len() * 36);
            sql.push_str(
                "INSERT INTO post (creator, rkey, created_at, text, embedding, alt_text, \
                 alt_text_embedding, reply_parent, reply_root, quoted, embed_title, \
                 embed_description, embed_url, inclusion_reason, inclusion_context) VALUES ",
            );
            for i in 0..chunk.len() {
                if i > 0 {
                    sql.push_str(", ");
                }
                sql.push_str("(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)");
            }
            sql.push_str(
                " ON CONFLICT (creator, rkey) DO UPDATE SET \
                 created_at = excluded.created_at, \
                 text = excluded.text, \
                 embedding = COALESCE(excluded.embedding, post.embedding), \
                 alt_text = excluded.alt_text, \
                 alt_text_embedding = COALESCE(excluded.alt_text_embedding, post.alt_text_embedding), \
                 reply_parent = excluded.reply_parent, \
                 reply_root = excluded.reply_root, \
                 quoted = excluded.quoted, \
                 embed_title = excluded.embed_title, \
                 embed_description = excluded.embed_description, \
                 embed_url = excluded.embed_url, \
                 inclusion_reason = excluded.inclusion_reason, \
                 inclusion_context = excluded.inclusion_context",
            );

            let mut query = sqlx::query(&sql);
            for post in chunk {
                query = query
                    .bind(&post.creator_did)
                    .bind(&post.rkey)
                    .bind(post.created_at)
                    .bind(&post.text)
                    .bind(post.embedding.as_deref().map(encode_vector))
                    .bind(&post.alt_text)
                    .bind(post.alt_text_embedding.as_deref().map(encode_vector))
                    .bind(&post.reply_parent)
                    .bind(&post.reply_root)
                    .bind(&post.quoted)
                    .bind(&post.embed_title)
                    .bind(&post.embed_description)
                    .bind(&post.embed_url)
                    .bind(post.inclusion_reason.as_str())
                    .bind(&post.inclusion_context);
            }
            query.execute(&self.pool).await?;
        }

        tracing::trace!("upserted {} posts", deduped.len());
        Ok(())
    }

    pub async fn get_post(&self, creator: &str, rkey: &str) -> Result<Option<Post>> {
        let row = sqlx::query("SELECT * FROM post WHERE creator = ? AND rkey = ?")
            .bind(creator)
            .bind(rkey)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| post_from_row(&r)).transpose()
    }

    /// Write back lazily computed vectors. Null inputs leave the stored
    /// column untouched.
    pub async fn update_post_embeddings(
        &self,
        rows: &[(String, String, Option<Vec<f32>>, Option<Vec<f32>>)],
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for (creator, rkey, embedding, alt_embedding) in rows {
            sqlx::query(
                "UPDATE post SET \
                 embedding = COALESCE(?, embedding), \
                 alt_text_embedding = COALESCE(?, alt_text_embedding) \
                 WHERE creator = ? AND rkey = ?",
            )
            .bind(embedding.as_deref().map(encode_vector))
            .bind(alt_embedding.as_deref().map(encode_vector))
            .bind(creator)
            .bind(rkey)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Posts whose text embedding has not been computed (all posts under
    /// `force`), oldest first so reruns make forward progress.
    pub async fn posts_missing_embeddings(
        &self,
        force: bool,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Post>> {
        let sql = if force {
            "SELECT * FROM post ORDER BY created_at ASC LIMIT ? OFFSET ?"
        } else {
            "SELECT * FROM post WHERE embedding IS NULL ORDER BY created_at ASC LIMIT ? OFFSET ?"
        };
        let rows = sqlx::query(sql)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(post_from_row).collect()
    }

    pub async fn count_posts_missing_embeddings(&self, force: bool) -> Result<i64> {
        let sql = if force {
            "SELECT COUNT(*) FROM post"
        } else {
            "SELECT COUNT(*) FROM post WHERE embedding IS NULL"
        };
        let count = sqlx::query_scalar::<_, i64>(sql).fetch_one(&self.pool).await?;
        Ok(count)
    }
}

/// Map a `SELECT * FROM post` row.
pub(super) fn post_from_row(row: &SqliteRow) -> Result<Post> {
    let reason_tag: String = row.get("inclusion_reason");
    // Only this crate writes the column; an unknown tag is a programmer
    // error, not recoverable state.
    let inclusion_reason = InclusionReason::parse(&reason_tag)
        .unwrap_or_else(|| panic!("impossible inclusion_reason in store: {reason_tag}"));
    Ok(Post {
        creator_did: row.get("creator"),
        rkey: row.get("rkey"),
        created_at: row.get("created_at"),
        text: row.get("text"),
        alt_text: row.get("alt_text"),
        embedding: row
            .get::<Option<Vec<u8>>, _>("embedding")
            .as_deref()
            .map(decode_vector)
            .transpose()?,
        alt_text_embedding: row
            .get::<Option<Vec<u8>>, _>("alt_text_embedding")
            .as_deref()
            .map(decode_vector)
            .transpose()?,
        reply_parent: row.get("reply_parent"),
        reply_root: row.get("reply_root"),
        quoted: row.get("quoted"),
        embed_title: row.get("embed_title"),
        embed_description: row.get("embed_description"),
        embed_url: row.get("embed_url"),
        inclusion_reason,
        inclusion_context: row.get("inclusion_context"),
    })
}

#[cfg(test)]
pub(crate) fn sample_post(creator: &str, rkey: &str, created_at: i64) -> Post {
    Post {
        creator_did: creator.to_string(),
        rkey: rkey.to_string(),
        created_at,
        text: format!("post {rkey}"),
        alt_text: None,
        embedding: None,
        alt_text_embedding: None,
        reply_parent: None,
        reply_root: None,
        quoted: None,
        embed_title: None,
        embed_description: None,
        embed_url: None,
        inclusion_reason: InclusionReason::Own,
        inclusion_context: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_and_get_roundtrip() {
        let store = Store::open_in_memory().await.unwrap();
        let mut post = sample_post("did:plc:a", "3lk4aaa222222", 1000);
        post.alt_text = Some("a cat".into());
        post.quoted = Some("at://did:plc:q/app.bsky.feed.post/3lk4qqq222222".into());
        store.insert_posts(&[post.clone()]).await.unwrap();

        let stored = store
            .get_post("did:plc:a", "3lk4aaa222222")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.text, post.text);
        assert_eq!(stored.alt_text.as_deref(), Some("a cat"));
        assert_eq!(stored.quoted, post.quoted);
        assert_eq!(stored.inclusion_reason, InclusionReason::Own);
    }

    #[tokio::test]
    async fn upsert_preserves_stored_embedding_across_null_reobservation() {
        let store = Store::open_in_memory().await.unwrap();
        let mut post = sample_post("did:plc:a", "3lk4aaa222222", 1000);
        post.embedding = Some(vec![0.5f32; 4]);
        store.insert_posts(&[post.clone()]).await.unwrap();

        // Re-observation without a vector must not erase the stored one.
        post.embedding = None;
        post.text = "edited".into();
        store.insert_posts(&[post.clone()]).await.unwrap();

        let stored = store
            .get_post("did:plc:a", "3lk4aaa222222")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.text, "edited");
        assert_eq!(stored.embedding.as_deref(), Some(&[0.5f32; 4][..]));

        // An explicit new vector still wins.
        post.embedding = Some(vec![0.25f32; 4]);
        store.insert_posts(&[post]).await.unwrap();
        let stored = store
            .get_post("did:plc:a", "3lk4aaa222222")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.embedding.as_deref(), Some(&[0.25f32; 4][..]));
    }

    #[tokio::test]
    async fn batch_dedup_keeps_last_occurrence() {
        let store = Store::open_in_memory().await.unwrap();
        let first = sample_post("did:plc:a", "3lk4aaa222222", 1000);
        let mut second = first.clone();
        second.text = "winner".into();
        store.insert_posts(&[first, second]).await.unwrap();
        let stored = store
            .get_post("did:plc:a", "3lk4aaa222222")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.text, "winner");
    }

    #[tokio::test]
    async fn embedding_update_and_missing_scan() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .insert_posts(&[
                sample_post("did:plc:a", "3lk4aaa222222", 1000),
                sample_post("did:plc:a", "3lk4bbb222222", 2000),
            ])
            .await
            .unwrap();
        assert_eq!(store.count_posts_missing_embeddings(false).await.unwrap(), 2);

        store
            .update_post_embeddings(&[(
                "did:plc:a".into(),
                "3lk4aaa222222".into(),
                Some(vec![1.0f32; 4]),
                None,
            )])
            .await
            .unwrap();

        assert_eq!(store.count_posts_missing_embeddings(false).await.unwrap(), 1);
        let missing = store.posts_missing_embeddings(false, 10, 0).await.unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].rkey, "3lk4bbb222222");
        assert_eq!(store.count_posts_missing_embeddings(true).await.unwrap(), 2);
    }
}
