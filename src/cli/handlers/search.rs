//! `search` and `explain` command output.

use std::sync::Arc;

use crate::cli::commands::OrderArg;
use crate::embedder::Embedder;
use crate::explain::explain;
use crate::models::Post;
use crate::rpc::RpcManager;
use crate::search::run_search;
use crate::search::SearchOutput;
use crate::search::SearchRequest;
use crate::store::Store;
use crate::Result;

#[allow(clippy::too_many_arguments)]
pub async fn handle_search(
    store: &Store,
    appview: &str,
    query: String,
    vector: bool,
    results: usize,
    creators: Vec<String>,
    parent_authors: Vec<String>,
    root_authors: Vec<String>,
    before: Option<String>,
    after: Option<String>,
    order: OrderArg,
    threshold: Option<f32>,
    include_alt: bool,
) -> Result<()> {
    let rpc = RpcManager::new()?;
    let embedder = Arc::new(Embedder::new());
    let request = SearchRequest {
        query,
        vector,
        results,
        creators,
        parent_authors,
        root_authors,
        before,
        after,
        order: order.into(),
        threshold,
        include_alt_text: include_alt,
    };

    match run_search(store, &rpc, &embedder, appview, &request).await? {
        SearchOutput::Text(posts) => {
            for post in &posts {
                print_post(post, None);
            }
            println!("{} results", posts.len());
        }
        SearchOutput::Vector(hits) => {
            for hit in &hits {
                print_post(&hit.post, Some(hit.distance));
            }
            println!("{} results", hits.len());
        }
    }
    Ok(())
}

fn print_post(post: &Post, distance: Option<f32>) {
    let when = chrono::DateTime::from_timestamp_millis(post.created_at)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| post.created_at.to_string());
    let mut text = post.text.replace('\n', " ");
    if text.len() > 120 {
        let cut = text
            .char_indices()
            .take_while(|(i, _)| *i < 117)
            .last()
            .map_or(0, |(i, c)| i + c.len_utf8());
        text.truncate(cut);
        text.push_str("...");
    }
    match distance {
        Some(distance) => println!("{distance:.3}  {when}  {}\n       {text}", post.uri()),
        None => println!("{when}  {}\n       {text}", post.uri()),
    }
}

pub async fn handle_explain(store: &Store, uri: &str) -> Result<()> {
    let tree = explain(store, uri).await?;
    print!("{tree}");
    Ok(())
}
