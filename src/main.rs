use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use erp_harvester::api;
use erp_harvester::config::{validate_batch_size, JobArgs, OdooArgs, ServeArgs, StorageArgs};
use erp_harvester::executor::HarvesterExecutor;
use erp_harvester::harvest::{CursorStore, EngineConfig};
use erp_harvester::logging;
use erp_harvester::odoo::OdooConnection;
use erp_harvester::storage::{gcs_store, ObjectStoreRegistry, ParquetSink};

#[derive(Parser)]
#[command(
    name = "erp-harvester",
    version,
    about = "Incremental Odoo extraction into Parquet on object storage"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    odoo: OdooArgs,

    #[command(flatten)]
    storage: StorageArgs,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API
    Serve(ServeArgs),
    /// Full refresh of every registered entity, then exit
    FullExtract(JobArgs),
    /// Refresh the entity registry from the ERP's model catalog
    UpdateModels(JobArgs),
}

async fn build_executor(cli: &Cli, batch_size: usize) -> anyhow::Result<HarvesterExecutor> {
    let settings = cli.odoo.settings().context("invalid ERP configuration")?;
    cli.storage.validate().context("invalid storage configuration")?;
    let page_size = validate_batch_size(batch_size)?;

    let store = gcs_store(&cli.storage.bucket).context("failed to build object store client")?;
    let base_path = cli.storage.base_path();

    let connection = OdooConnection::connect(settings)
        .await
        .context("failed to connect to the ERP")?;

    Ok(HarvesterExecutor::new(
        Arc::new(connection),
        Arc::new(ParquetSink::new(Arc::clone(&store), &cli.storage.bucket, base_path)),
        CursorStore::new(Arc::clone(&store), base_path),
        Arc::new(ObjectStoreRegistry::new(store, base_path)),
        EngineConfig {
            page_size,
            ..EngineConfig::default()
        },
    ))
}

async fn serve(cli: &Cli, args: &ServeArgs) -> anyhow::Result<()> {
    let executor = build_executor(cli, args.batch_size).await?;
    let app = api::router(Arc::new(executor));

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!(addr = %args.listen, "HTTP service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .context("HTTP server failed")
}

async fn full_extract(cli: &Cli, args: &JobArgs) -> anyhow::Result<()> {
    info!("Starting full extract job");
    let executor = build_executor(cli, args.batch_size).await?;
    let summary = executor.full_extract().await?;

    info!(
        total_entities = summary.total_entities,
        successful = summary.successful,
        empty = summary.empty,
        skipped = summary.skipped,
        failed = summary.failed,
        records = summary.total_records,
        "Full extract finished"
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn update_models(cli: &Cli, args: &JobArgs) -> anyhow::Result<()> {
    let executor = build_executor(cli, args.batch_size).await?;
    let count = executor.update_models().await?;
    info!(count, "Entity registry updated");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    logging::init(&cli.log_level, cli.log_json);

    let result = match &cli.command {
        Commands::Serve(args) => serve(&cli, args).await,
        Commands::FullExtract(args) => full_extract(&cli, args).await,
        Commands::UpdateModels(args) => update_models(&cli, args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
