//! Explain why a post is in the index.

use std::collections::HashSet;

use futures::future::BoxFuture;

use crate::records::AtUri;
use crate::store::Store;
use crate::Result;

/// Render the inclusion tree for `uri`. Each level prints the post's
/// inclusion reason and recurses into its context when that context is
/// itself an indexed URI; cycles are labeled instead of followed.
pub async fn explain(store: &Store, uri: &str) -> Result<String> {
    let mut out = String::new();
    let mut path = HashSet::new();
    render(store, uri, 0, &mut path, &mut out).await?;
    Ok(out)
}

fn render<'a>(
    store: &'a Store,
    uri: &'a str,
    indent: usize,
    path: &'a mut HashSet<String>,
    out: &'a mut String,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let pad = "  ".repeat(indent);

        let Ok(at_uri) = AtUri::parse(uri) else {
            out.push_str(&format!("{pad}{uri} (not an at-uri)\n"));
            return Ok(());
        };
        let Some(post) = store.get_post(&at_uri.did, &at_uri.rkey).await? else {
            out.push_str(&format!("{pad}{uri} (not in index)\n"));
            return Ok(());
        };

        out.push_str(&format!("{pad}{uri} [{}]\n", post.inclusion_reason));

        if let Some(context) = &post.inclusion_context {
            if context.starts_with("at://") {
                if path.contains(context) {
                    out.push_str(&format!("{pad}  {context} (cycle)\n"));
                } else {
                    path.insert(uri.to_string());
                    render(store, context, indent + 1, path, out).await?;
                    path.remove(uri);
                }
            } else {
                // A DID (reposted_by): a leaf label, nothing to recurse into.
                out.push_str(&format!("{pad}  via {context}\n"));
            }
        }
        Ok(())
    })
}
