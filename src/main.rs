//! # parley
//!
//! Relay server binary — opens the database, wires the stores into the
//! server, and exposes small admin commands for credentials.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};

use parley_core::ids::AgentId;
use parley_server::{RelayDeps, ServerConfig};
use parley_store::keys::{KeyRepo, LinkRepo, SqliteCredentialValidator};
use parley_store::last_seen::LastSeenRepo;
use parley_store::messages::SqliteMessageStore;
use parley_store::Database;

/// Parley chat relay.
#[derive(Parser, Debug)]
#[command(name = "parley", about = "Customer-service chat relay server")]
struct Cli {
    /// Path to the `SQLite` database.
    #[arg(long)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay server.
    Serve {
        /// Port to bind (0 for auto-assign).
        #[arg(long, default_value = "9090")]
        port: u16,
    },
    /// Issue an access key for an agent.
    AddKey {
        /// Agent to issue the key for; a new agent id is minted if omitted.
        #[arg(long)]
        agent_id: Option<String>,
        /// Key lifetime in days; never expires if omitted.
        #[arg(long)]
        expires_in_days: Option<i64>,
    },
    /// Issue a share-link code visitors use to reach an agent.
    AddLink {
        #[arg(long)]
        agent_id: String,
        /// Link lifetime in days; never expires if omitted.
        #[arg(long)]
        expires_in_days: Option<i64>,
    },
}

impl Cli {
    fn default_db_path() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(home).join(".parley").join("parley.db")
    }
}

fn open_database(cli: &Cli) -> Result<Database> {
    let db_path = cli.db_path.clone().unwrap_or_else(Cli::default_db_path);
    Database::open(&db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))
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
    let db = open_database(&cli)?;

    match cli.command {
        Command::Serve { port } => serve(db, port).await,
        Command::AddKey {
            agent_id,
            expires_in_days,
        } => add_key(db, agent_id, expires_in_days),
        Command::AddLink {
            agent_id,
            expires_in_days,
        } => add_link(db, &agent_id, expires_in_days),
    }
}

async fn serve(db: Database, port: u16) -> Result<()> {
    let deps = RelayDeps::new(
        Arc::new(SqliteMessageStore::new(db.clone())),
        Arc::new(SqliteCredentialValidator::new(db.clone())),
        Arc::new(LastSeenRepo::new(db)),
    );
    let config = ServerConfig {
        port,
        ..Default::default()
    };

    let handle = parley_server::start(config, deps)
        .await
        .context("Failed to start server")?;
    tracing::info!(port = handle.port, "parley relay ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;
    tracing::info!("shutting down");
    Ok(())
}

fn add_key(db: Database, agent_id: Option<String>, expires_in_days: Option<i64>) -> Result<()> {
    let agent_id = agent_id.map_or_else(AgentId::new, AgentId::from_raw);
    let expires_at = expires_in_days.map(|d| Utc::now() + Duration::days(d));

    let key = KeyRepo::new(db)
        .issue(&agent_id, expires_at)
        .context("Failed to issue access key")?;

    println!("agent: {agent_id}");
    println!("key:   {}", key.key);
    if let Some(at) = expires_at {
        println!("expires: {}", at.to_rfc3339());
    }
    Ok(())
}

fn add_link(db: Database, agent_id: &str, expires_in_days: Option<i64>) -> Result<()> {
    let agent_id = AgentId::from_raw(agent_id);
    let expires_at = expires_in_days.map(|d| Utc::now() + Duration::days(d));

    let code = LinkRepo::new(db)
        .issue(&agent_id, expires_at)
        .context("Failed to issue share link")?;

    println!("agent: {agent_id}");
    println!("link:  {code}");
    if let Some(at) = expires_at {
        println!("expires: {}", at.to_rfc3339());
    }
    Ok(())
}
