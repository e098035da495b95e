//! `embeddings` command: fill vectors for posts already in the index.

use std::sync::Arc;

use crate::embedder::Embedder;
use crate::embedder::EMBED_BATCH_SIZE;
use crate::store::Store;
use crate::Result;

pub async fn handle_embeddings(store: &Store, force: bool) -> Result<()> {
    let embedder = Arc::new(Embedder::new());
    let total = store.count_posts_missing_embeddings(force).await?;
    if total == 0 {
        println!("Nothing to embed");
        return Ok(());
    }
    println!("Generating embeddings for {total} posts...");

    let mut updated: u64 = 0;
    let mut offset: i64 = 0;
    loop {
        let batch = store
            .posts_missing_embeddings(force, EMBED_BATCH_SIZE as i64, offset)
            .await?;
        if batch.is_empty() {
            break;
        }

        // Same positional scheme as the backfill side-channel.
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
        store.update_post_embeddings(&rows).await?;

        updated += batch.len() as u64;
        // Without --force the updated rows leave the result set on their
        // own; with it we have to walk past them.
        if force {
            offset += batch.len() as i64;
        }
        tracing::info!("embedded {updated}/{total}");
    }

    println!("Updated {updated} posts");
    Ok(())
}
