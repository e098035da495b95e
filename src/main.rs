use std::path::Path;

use clap::Parser;
use pinakes::cli::handlers;
use pinakes::cli::Cli;
use pinakes::cli::Commands;
use pinakes::config::DEFAULT_DB_FILE;
use pinakes::logging;
use pinakes::logging::LogRouter;
use pinakes::Result;
use pinakes::Store;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let router = LogRouter::new();
    logging::init_logging(cli.verbose, router.clone())?;

    let store = Store::open(Path::new(DEFAULT_DB_FILE)).await?;

    match cli.command {
        Commands::Config(config_command) => {
            handlers::handle_config_command(&store, config_command).await?;
        }
        Commands::Backfill {
            depth,
            embeddings,
            appview,
        } => {
            handlers::handle_backfill(&store, &router, depth, embeddings, appview).await?;
        }
        Commands::Import {
            source,
            did,
            depth,
            force,
        } => {
            handlers::handle_import(&store, &router, source, did, depth, force).await?;
        }
        Commands::Embeddings { force } => {
            handlers::handle_embeddings(&store, force).await?;
        }
        Commands::Search {
            query,
            vector,
            results,
            creators,
            parent_authors,
            root_authors,
            before,
            after,
            order,
            threshold,
            include_alt,
        } => {
            let appview = handlers::resolve_appview(&store, None).await?;
            handlers::handle_search(
                &store,
                &appview,
                query,
                vector,
                results,
                creators,
                parent_authors,
                root_authors,
                before,
                after,
                order,
                threshold,
                include_alt,
            )
            .await?;
        }
        Commands::Explain { uri } => {
            handlers::handle_explain(&store, &uri).await?;
        }
    }

    Ok(())
}
