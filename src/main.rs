use std::path::PathBuf;
use std::process;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use printshop_sync::config::{Config, LocalPaths};
use printshop_sync::models::ProductionStatus;
use printshop_sync::orders::{self, NewOrder};
use printshop_sync::{db, diagnostics, storage, store, Service};

/// Offline order sync for the printshop POS.
#[derive(Parser)]
#[command(name = "printshop-sync", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync service until Ctrl-C
    Run,

    /// Run a single sync sweep and print its report
    SyncOnce,

    /// Print sync counts and build info
    Status,

    /// List orders that gave up syncing
    Failed {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Record a new order from a JSON file
    AddOrder {
        /// Path to the order JSON
        file: PathBuf,
    },

    /// Take a payment against an order
    Pay {
        local_id: i64,
        amount: f64,
        #[arg(long, default_value = "CASH")]
        method: String,
        #[arg(long)]
        received_by: String,
    },

    /// Move an order to a production stage (QUEUE, DESIGN, PRINTING, ...)
    SetStatus { local_id: i64, status: String },

    /// Save the current backend settings in the OS credential store
    Login,

    /// Remove stored backend settings
    Logout,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open_local_db(paths: &LocalPaths) -> anyhow::Result<db::DbState> {
    db::init(&paths.db_path)
        .with_context(|| format!("opening order store at {}", paths.db_path.display()))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let paths = LocalPaths::from_env();

    let guard = match printshop_sync::init_tracing(&paths.log_dir) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("warning: file logging disabled: {e}");
            None
        }
    };

    if let Err(e) = dispatch(cli.command, &paths).await {
        error!("{e:#}");
        eprintln!("error: {e:#}");
        drop(guard);
        process::exit(1);
    }
}

async fn dispatch(command: Commands, paths: &LocalPaths) -> anyhow::Result<()> {
    match command {
        Commands::Run => {
            let service = Service::open(Config::from_env()?)?;
            let shutdown = CancellationToken::new();
            let trigger = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    trigger.cancel();
                }
            });
            service.run_until(shutdown).await?;
            info!("printshop-sync stopped");
        }
        Commands::SyncOnce => {
            let service = Service::open(Config::from_env()?)?;
            let outcome = service.engine.sync_now().await;
            print_json(&outcome)?;
        }
        Commands::Status => {
            let db = open_local_db(paths)?;
            print_json(&diagnostics::status_report(&db)?)?;
        }
        Commands::Failed { limit } => {
            let db = open_local_db(paths)?;
            print_json(&store::failed_orders(&db, limit)?)?;
        }
        Commands::AddOrder { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let order: NewOrder = serde_json::from_str(&raw)?;
            let db = open_local_db(paths)?;
            print_json(&orders::create_local_order(&db, &order)?)?;
        }
        Commands::Pay {
            local_id,
            amount,
            method,
            received_by,
        } => {
            let db = open_local_db(paths)?;
            print_json(&orders::record_payment(
                &db,
                local_id,
                amount,
                &method,
                &received_by,
            )?)?;
        }
        Commands::SetStatus { local_id, status } => {
            let status: ProductionStatus = status.parse()?;
            let db = open_local_db(paths)?;
            print_json(&orders::set_production_status(&db, local_id, status)?)?;
        }
        Commands::Login => {
            let config = Config::from_env()?;
            config.persist_credentials()?;
            let db = open_local_db(paths)?;
            let conn = db.conn.lock().map_err(|_| anyhow::anyhow!("database lock poisoned"))?;
            let machine_id = db::ensure_machine_id(&conn, &config.machine_id)?;
            println!("Stored credentials for {} ({machine_id})", config.backend_url);
        }
        Commands::Logout => {
            storage::clear_credentials()?;
            println!("Stored credentials removed");
        }
    }
    Ok(())
}
