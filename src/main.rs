use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use corpusflow::config::PipelineConfig;
use corpusflow::content_source::ContentSourceRegistry;
use corpusflow::contracts::parser::ParserRegistry;
use corpusflow::coordinator::ProcessingCoordinator;
use corpusflow::model::new_worker_id;
use corpusflow::ontology::{OntologyLoader, OntologyManager};
use corpusflow::queue::{DeadLetterQueue, PostgresWorkQueue};
use corpusflow::run_coordinator::{run_id_from_config, RunCoordinator};
use corpusflow::storage::PostgresStorage;
use corpusflow::worker::DocumentProcessor;
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "corpusflow", about = "Distributed document-processing pipeline", version)]
struct Cli {
    #[arg(long, global = true)]
    verbose: bool,

    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Coordinate a full processing run: discover, queue, wait, post-process.
    Run {
        #[arg(long, env = "CORPUSFLOW_CONFIG")]
        config: PathBuf,

        /// Directory of ontology documents (.yaml/.yml/.json) to load.
        #[arg(long)]
        ontology_dir: Option<PathBuf>,

        /// Domain names to activate for this run (repeatable).
        #[arg(long = "activate-domain")]
        active_domains: Vec<String>,
    },

    /// Run a worker loop against an existing run.
    Worker {
        #[arg(long, env = "CORPUSFLOW_CONFIG")]
        config: PathBuf,

        #[arg(long)]
        run_id: Option<String>,

        #[arg(long)]
        ontology_dir: Option<PathBuf>,

        #[arg(long = "activate-domain")]
        active_domains: Vec<String>,

        /// Stop after processing this many documents (default: run forever).
        #[arg(long)]
        max_documents: Option<u64>,
    },

    /// Print queue status counts for a run.
    Status {
        #[arg(long, env = "CORPUSFLOW_CONFIG")]
        config: PathBuf,

        #[arg(long)]
        run_id: String,
    },

    /// Load and validate ontology document(s) without running the pipeline.
    ValidateOntology {
        /// A single ontology file or a directory of them.
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    corpusflow::init_logging_with_level(cli.verbose, cli.quiet)?;

    match cli.command {
        Command::Run { config, ontology_dir, active_domains } => {
            run_command(config, ontology_dir, active_domains).await
        }
        Command::Worker { config, run_id, ontology_dir, active_domains, max_documents } => {
            worker_command(config, run_id, ontology_dir, active_domains, max_documents).await
        }
        Command::Status { config, run_id } => status_command(config, run_id).await,
        Command::ValidateOntology { path } => validate_ontology_command(path),
    }
}

async fn connect_pool(config: &PipelineConfig) -> Result<sqlx::PgPool> {
    let url = config.postgres_url().context("config.storage must specify a 'url' for the Postgres backend")?;
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(url)
        .await
        .context("failed to connect to Postgres")
}

fn build_ontology_manager(ontology_dir: Option<PathBuf>, active_domains: Vec<String>) -> Result<OntologyManager> {
    let mut loader = OntologyLoader::new();
    if let Some(dir) = ontology_dir {
        let loaded = loader.load_from_directory(&dir)?;
        info!(count = loaded.len(), "loaded ontology domains");
    }
    let mut manager = OntologyManager::new(loader);
    for domain in active_domains {
        manager.activate_domain(&domain)?;
    }
    Ok(manager)
}

async fn run_command(config_path: PathBuf, ontology_dir: Option<PathBuf>, active_domains: Vec<String>) -> Result<()> {
    let config = PipelineConfig::load_from_path(&config_path)?;
    let pool = connect_pool(&config).await?;

    let run_coordinator = RunCoordinator::new(pool.clone());
    let queue = Arc::new(PostgresWorkQueue::new(pool.clone()));
    let storage = Arc::new(PostgresStorage::new(pool));
    let content_sources = ContentSourceRegistry::new();
    let ontology = Arc::new(build_ontology_manager(ontology_dir, active_domains)?);

    let coordinator = ProcessingCoordinator::new(
        format!("coordinator-{}", new_worker_id()),
        run_coordinator,
        queue,
        storage,
        content_sources,
        ontology,
        None,
    );

    let stats = coordinator.coordinate_processing_run(&config).await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn worker_command(
    config_path: PathBuf,
    run_id: Option<String>,
    ontology_dir: Option<PathBuf>,
    active_domains: Vec<String>,
    max_documents: Option<u64>,
) -> Result<()> {
    let config = PipelineConfig::load_from_path(&config_path)?;
    let run_id = run_id.unwrap_or_else(|| run_id_from_config(&config));
    let pool = connect_pool(&config).await?;

    let run_coordinator = RunCoordinator::new(pool.clone());
    let worker_id = new_worker_id();
    let hostname = hostname_or_unknown();
    run_coordinator.ensure_run_exists(&run_id, &config).await?;
    run_coordinator.register_worker(&run_id, &worker_id, &hostname, None).await?;

    let queue = Arc::new(PostgresWorkQueue::new(pool.clone()));
    let dead_letter = DeadLetterQueue::new(pool.clone());
    let storage = Arc::new(PostgresStorage::new(pool));
    let content_sources = ContentSourceRegistry::new();
    let parsers = Arc::new(ParserRegistry::new());
    let ontology = Arc::new(build_ontology_manager(ontology_dir, active_domains)?);

    let processor = DocumentProcessor::new(
        run_id,
        worker_id,
        queue,
        dead_letter,
        storage,
        content_sources,
        parsers,
        ontology,
        None,
        config.worker.claim_timeout(),
    );

    processor.run(max_documents).await
}

async fn status_command(config_path: PathBuf, run_id: String) -> Result<()> {
    let config = PipelineConfig::load_from_path(&config_path)?;
    let pool = connect_pool(&config).await?;
    let queue = PostgresWorkQueue::new(pool);
    let status = corpusflow::queue::WorkQueue::get_queue_status(&queue, &run_id).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn validate_ontology_command(path: PathBuf) -> Result<()> {
    let mut loader = OntologyLoader::new();
    let names = if path.is_dir() {
        loader.load_from_directory(&path)?
    } else {
        vec![loader.load_from_file(&path)?.name.clone()]
    };

    let mut any_issues = false;
    for name in &names {
        let ontology = loader.get(name).expect("just loaded");
        let issues = ontology.validate();
        if issues.is_empty() {
            println!("{name}: OK");
        } else {
            any_issues = true;
            println!("{name}: {} issue(s)", issues.len());
            for issue in issues {
                println!("  - {issue}");
            }
        }
    }

    if any_issues {
        anyhow::bail!("one or more ontologies failed validation");
    }
    Ok(())
}

fn hostname_or_unknown() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}
