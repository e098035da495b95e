//! `backfill` and `import` commands.

use std::path::Path;
use std::sync::Arc;

use crate::backfill::BackfillEngine;
use crate::backfill::BackfillOptions;
use crate::config::DEFAULT_APPVIEW;
use crate::embedder::Embedder;
use crate::logging::LogRouter;
use crate::progress::ProgressTracker;
use crate::rpc::RpcManager;
use crate::store::Store;
use crate::PinakesError;
use crate::Result;

/// `--appview` flag > stored config > public AppView.
pub async fn resolve_appview(store: &Store, flag: Option<String>) -> Result<String> {
    if let Some(appview) = flag {
        return Ok(appview);
    }
    Ok(store
        .get_config("appview")
        .await?
        .unwrap_or_else(|| DEFAULT_APPVIEW.to_string()))
}

pub async fn handle_backfill(
    store: &Store,
    router: &LogRouter,
    depth: Option<u32>,
    embeddings: bool,
    appview: Option<String>,
) -> Result<()> {
    let did = store.get_config("did").await?.ok_or_else(|| {
        PinakesError::ConfigError(
            "no account configured; run `pinakes config set did <did>` first".into(),
        )
    })?;
    let appview = resolve_appview(store, appview).await?;

    let rpc = Arc::new(RpcManager::new()?);
    let embedder = embeddings.then(|| Arc::new(Embedder::new()));
    let progress = ProgressTracker::start(router.clone());
    let engine = BackfillEngine::new(
        store.clone(),
        rpc,
        embedder,
        progress.clone(),
        did,
        &BackfillOptions { depth, appview },
    );

    let result = engine.run().await;
    let elapsed = progress.elapsed();
    progress.finish();
    println!("Backfill completed in {:.1}s", elapsed.as_secs_f64());
    result
}

pub async fn handle_import(
    store: &Store,
    router: &LogRouter,
    source: String,
    did: Option<String>,
    depth: Option<u32>,
    force: bool,
) -> Result<()> {
    let appview = resolve_appview(store, None).await?;
    let rpc = Arc::new(RpcManager::new()?);

    // A file path is a CAR archive; otherwise the source names an account.
    let (target_did, car) = if Path::new(&source).exists() {
        let did = did.ok_or_else(|| {
            PinakesError::ConfigError("importing a CAR file requires --did".into())
        })?;
        (did, Some(std::fs::read(&source)?))
    } else if source.starts_with("did:") {
        (source, None)
    } else {
        (rpc.resolve_handle(&appview, &source).await?, None)
    };

    let progress = ProgressTracker::start(router.clone());
    let engine = BackfillEngine::new(
        store.clone(),
        Arc::clone(&rpc),
        None,
        progress.clone(),
        target_did.clone(),
        &BackfillOptions { depth, appview },
    );

    let result = engine.run_import(&target_did, car, force).await;
    let elapsed = progress.elapsed();
    progress.finish();
    println!("Import of {target_did} completed in {:.1}s", elapsed.as_secs_f64());
    result
}
