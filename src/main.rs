use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, warn};

use fda_sync::config::{self, Config};
use fda_sync::db::{self, Pool, RunRecord, SqliteSink, SqliteStateStore};
use fda_sync::model::RecordKind;
use fda_sync::openfda::OpenFdaClient;
use fda_sync::store::StateStore;
use fda_sync::sync::{SyncOptions, Syncer};

/// EX_TEMPFAIL: the scheduler should simply try again later.
const EXIT_RETRYABLE: u8 = 75;

#[derive(Debug, Parser)]
#[command(author, version, about = "Incrementally sync openFDA records into SQLite")]
struct Args {
    /// Path to YAML config file
    #[arg(long, global = true, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one sync invocation and exit
    Sync {
        /// Override `sync.record_kind`
        #[arg(long)]
        kind: Option<RecordKind>,
        /// Override `app.max_pages_per_run`
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        max_pages: Option<u32>,
    },
    /// Print destination table schemas as JSON
    Schema {
        #[arg(long)]
        kind: Option<RecordKind>,
    },
    /// Show stored sync state and the most recent runs
    State {
        #[arg(long, default_value = "10")]
        runs: i64,
    },
    /// Forget the stored cursor so the next sync cold-starts
    Reset {
        #[arg(long)]
        kind: RecordKind,
    },
    /// Print a complete example configuration
    ExampleConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(code) => code,
        Err(err) => {
            error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    match args.command {
        Command::ExampleConfig => {
            print!("{}", config::example());
            Ok(ExitCode::SUCCESS)
        }
        Command::Schema { kind } => {
            let schemas: Vec<_> = match kind {
                Some(kind) => vec![kind.schema()],
                None => RecordKind::ALL.iter().map(|k| k.schema()).collect(),
            };
            println!("{}", serde_json::to_string_pretty(&schemas)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Sync { kind, max_pages } => {
            let cfg = load_config(&args.config)?;
            let pool = open_db(&cfg).await?;
            sync(&cfg, &pool, kind, max_pages).await
        }
        Command::State { runs } => {
            let cfg = load_config(&args.config)?;
            let pool = open_db(&cfg).await?;
            let states = db::list_states(&pool).await?;
            let recent = db::recent_runs(&pool, runs).await?;
            let view = json!({ "states": states, "runs": recent });
            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Reset { kind } => {
            let cfg = load_config(&args.config)?;
            let pool = open_db(&cfg).await?;
            if SqliteStateStore::new(pool).reset(kind).await? {
                info!(record_kind = %kind, "sync state reset");
            } else {
                info!(record_kind = %kind, "no sync state stored");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(path: &Path) -> Result<Config> {
    let cfg = config::load(Some(path))
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    cfg.ensure_dirs()?;
    Ok(cfg)
}

async fn open_db(cfg: &Config) -> Result<Pool> {
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.app.database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;
    Ok(pool)
}

async fn sync(
    cfg: &Config,
    pool: &Pool,
    kind: Option<RecordKind>,
    max_pages: Option<u32>,
) -> Result<ExitCode> {
    let mut sync_cfg = cfg.sync.clone();
    if let Some(kind) = kind {
        sync_cfg.record_kind = kind;
    }
    let kind = sync_cfg.record_kind;
    let opts = SyncOptions::from_config(&sync_cfg, max_pages.unwrap_or(cfg.app.page_budget()));

    let fetcher = OpenFdaClient::from_settings(&cfg.openfda, cfg.api_key())?;
    let store = SqliteStateStore::new(pool.clone());
    let sink = SqliteSink::new(pool.clone());

    info!(record_kind = %kind, page_size = opts.page_size, max_pages = ?opts.max_pages, "starting sync");
    let outcome = Syncer::new(&fetcher, &store, &sink).run(kind, &opts).await;
    if let Err(err) = db::record_run(pool, &RunRecord::from_outcome(&outcome)).await {
        warn!(%err, "failed to record run");
    }

    match outcome {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(failure) => {
            error!(
                run_id = %failure.run_id,
                retryable = failure.is_retryable(),
                "{}: {}",
                failure,
                failure.error
            );
            if failure.is_retryable() {
                Ok(ExitCode::from(EXIT_RETRYABLE))
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
    }
}
