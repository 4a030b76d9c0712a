mod config;
mod serve_cmd;
mod status_cmd;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};

use corral_core::reconciler;
use corral_db::pool;

use config::CorralConfig;

#[derive(Parser)]
#[command(name = "corral", about = "Coordination server for AI orchestrator fleets")]
struct Cli {
    /// Database URL (overrides CORRAL_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a corral config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/corral")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the corral database (requires config file or env vars)
    DbInit,
    /// Run the coordination server
    Serve {
        /// Bind address (overrides the config file)
        #[arg(long)]
        bind: Option<String>,
        /// Port (overrides the config file)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run one lease-reconciliation sweep and exit
    Reconcile,
    /// Show queue counts and fleet status for a scope
    Status {
        /// Scope to inspect
        scope: String,
    },
}

/// Execute the `corral init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_owned(),
        },
        server: config::ServerSection::default(),
        engine: config::EngineSection::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `corral db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `corral db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> Result<()> {
    let resolved = CorralConfig::resolve(cli_db_url)?;

    println!("Initializing corral database...");

    pool::ensure_database_exists(&resolved.db_config).await?;

    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;

    println!("corral db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Serve { bind, port } => {
            let resolved = CorralConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let bind = bind.unwrap_or(resolved.server.bind);
            let port = port.unwrap_or(resolved.server.port);
            let result =
                serve_cmd::run_serve(db_pool.clone(), resolved.engine_config, &bind, port).await;
            db_pool.close().await;
            result?;
        }
        Commands::Reconcile => {
            let resolved = CorralConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let report =
                reconciler::run_once(&db_pool, &resolved.engine_config, Utc::now()).await;
            db_pool.close().await;
            let report = report?;
            println!(
                "Reconciled: {} lease(s) released, {} orchestrator(s) marked offline.",
                report.released.len(),
                report.offlined.len()
            );
        }
        Commands::Status { scope } => {
            let resolved = CorralConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = status_cmd::run_status(&db_pool, &scope).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}
