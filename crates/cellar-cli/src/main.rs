use std::sync::Arc;

use anyhow::{bail, Context, Result};
use cellar_client::{CatalogClient, ClientConfig, SearchQuery};
use cellar_refresh::{
    evaluate_alerts, maybe_build_scheduler, LogNotifier, RefreshConfig, RefreshOrchestrator,
    StoreRegistry,
};
use cellar_store::{
    CatalogStore, FavoritesStore, JsonCatalogStore, JsonFavorites, JsonPriceHistory,
    PriceHistoryLedger,
};
use chrono::Utc;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "cellar-cli")]
#[command(about = "Cellarwatch catalog refresh and price-alert pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one refresh cycle and wait for persistence to finish.
    Refresh {
        /// Retail store id from stores.yaml to scope inventory fields.
        #[arg(long)]
        store: Option<String>,
        /// Free-text search narrowing the default listing query.
        #[arg(long)]
        query: Option<String>,
    },
    /// Evaluate low-price alerts for one user against current data.
    Alerts {
        #[arg(long)]
        user: String,
    },
    /// Manage a user's favorites set.
    Favorites {
        #[command(subcommand)]
        action: FavoritesAction,
    },
    /// Run the cron-scheduled refresh loop until interrupted.
    Watch,
}

#[derive(Debug, Subcommand)]
enum FavoritesAction {
    Add {
        #[arg(long)]
        user: String,
        #[arg(long)]
        id: String,
    },
    Remove {
        #[arg(long)]
        user: String,
        #[arg(long)]
        id: String,
    },
    List {
        #[arg(long)]
        user: String,
    },
}

struct Stores {
    catalog: Arc<JsonCatalogStore>,
    ledger: Arc<JsonPriceHistory>,
    favorites: Arc<JsonFavorites>,
}

fn open_stores(config: &RefreshConfig) -> Stores {
    Stores {
        catalog: Arc::new(JsonCatalogStore::with_chunk_size(
            config.data_dir.join("catalog.json"),
            config.chunk_size,
        )),
        ledger: Arc::new(JsonPriceHistory::new(
            config.data_dir.join("price_history.json"),
        )),
        favorites: Arc::new(JsonFavorites::new(config.data_dir.join("favorites.json"))),
    }
}

fn build_orchestrator(config: RefreshConfig, stores: &Stores) -> Result<RefreshOrchestrator> {
    let client = CatalogClient::new(ClientConfig::from_env()).context("building catalog client")?;
    Ok(RefreshOrchestrator::new(
        Arc::new(client),
        Arc::clone(&stores.catalog) as Arc<dyn CatalogStore>,
        Arc::clone(&stores.ledger) as Arc<dyn PriceHistoryLedger>,
        Arc::clone(&stores.favorites) as Arc<dyn FavoritesStore>,
        Arc::new(LogNotifier),
        config,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = RefreshConfig::from_env();
    let stores = open_stores(&config);

    match cli.command {
        Commands::Refresh { store, query } => {
            let context = match store {
                Some(store_id) => {
                    let registry = StoreRegistry::load("stores.yaml").await?;
                    Some(
                        registry
                            .context_for(&store_id)
                            .with_context(|| format!("unknown store id {store_id}"))?,
                    )
                }
                None => None,
            };

            let mut search = SearchQuery::default();
            if let Some(text) = query {
                search.text = text;
            }

            let orchestrator = build_orchestrator(config, &stores)?;
            let outcome = orchestrator.run_refresh(&search, context.as_ref()).await?;
            println!(
                "refresh complete: run_id={} records={} pages={}/{} skipped={}",
                outcome.run_id,
                outcome.records.len(),
                outcome.pages_fetched,
                outcome.pages_expected,
                outcome.skipped_items,
            );
            for gap in &outcome.gaps {
                println!("  gap at page {}: {}", gap.page_index, gap.reason);
            }

            // The pipeline contract is "ranked snapshot is ready"; the CLI
            // process still waits out the background step so it does not
            // exit with writes in flight.
            let report = outcome
                .background
                .await
                .context("background persistence task panicked")?;
            println!(
                "persisted: upserted={} failed_chunks={} ledger={} alerts={}",
                report.catalog.written,
                report.catalog.failed.len(),
                report.ledger_written,
                report.alerts_sent,
            );
        }
        Commands::Alerts { user } => {
            let items = evaluate_alerts(
                &user,
                stores.catalog.as_ref(),
                stores.ledger.as_ref(),
                stores.favorites.as_ref(),
            )
            .await?;
            if items.is_empty() {
                println!("no favorites at a new low for {user}");
            }
            for item in items {
                println!(
                    "{} — now ${:.2}, lowest ever ${:.2} ({})",
                    item.title, item.current_price, item.lowest_price, item.id
                );
            }
        }
        Commands::Favorites { action } => match action {
            FavoritesAction::Add { user, id } => {
                let added = stores.favorites.add(&user, &id, Utc::now()).await?;
                println!("{}", if added { "added" } else { "already a favorite" });
            }
            FavoritesAction::Remove { user, id } => {
                let removed = stores.favorites.remove(&user, &id).await?;
                println!("{}", if removed { "removed" } else { "not a favorite" });
            }
            FavoritesAction::List { user } => {
                for entry in stores.favorites.list(&user).await? {
                    println!("{}  (added {})", entry.id, entry.date_added.date_naive());
                }
            }
        },
        Commands::Watch => {
            if !config.scheduler_enabled {
                bail!("set CELLAR_SCHEDULER_ENABLED=1 to run the watch loop");
            }
            let orchestrator = Arc::new(build_orchestrator(config, &stores)?);
            let scheduler = maybe_build_scheduler(orchestrator, SearchQuery::default())
                .await?
                .expect("scheduler enabled by config check above");
            scheduler.start().await.context("starting scheduler")?;
            println!("watching; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        }
    }

    Ok(())
}
