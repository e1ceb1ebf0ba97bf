use anyhow::Result;
use clap::{Parser, Subcommand};
use issnsync_fetch::{build_client, CrossrefClient, HttpConfig, OpenAlexClient};
use issnsync_pipeline::{Pipeline, PipelineConfig};
use issnsync_store::{connect, DbConfig, FactStore, MIGRATOR};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "issnsync")]
#[command(about = "Reconciles the ISSN registry against Crossref and OpenAlex")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one full sync pass over the tracked identifiers.
    Run,
    /// Apply pending database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    let db_config = DbConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let pool = connect(&db_config).await?;
            let store = FactStore::new(pool);

            let http_config = HttpConfig::default();
            let client = build_client(&http_config)?;
            let journals = CrossrefClient::new(client.clone(), http_config.crossref_base.clone());
            let sources = OpenAlexClient::new(client, http_config.openalex_base.clone());

            let pipeline = Pipeline::new(store, journals, sources, PipelineConfig::default());
            let summary = pipeline.run().await?;
            println!(
                "sync complete: run_id={} identifiers={} batches={} inserted={} fetch_failures={}",
                summary.run_id,
                summary.identifiers,
                summary.batches,
                summary.inserted,
                summary.fetch_failures
            );
        }
        Commands::Migrate => {
            let pool = connect(&db_config).await?;
            MIGRATOR.run(&pool).await?;
            info!("migrations applied");
        }
    }

    Ok(())
}
