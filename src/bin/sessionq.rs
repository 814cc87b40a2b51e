//! Maintenance CLI for sessionq journals.
//!
//! Lists the clients that still hold queued elements, decodes a client's queue
//! for inspection, purges a client's queue, and compacts the journal.

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use sessionq::core::store::{ListConn, ListStore};
use sessionq::{Config, Elem, JournalStore, MessageWithId};

/// Command-line interface for sessionq journals.
#[derive(Debug, Parser)]
#[command(
    name = "sessionq",
    version,
    about = "Inspect and maintain persistent client queues"
)]
pub struct Cli {
    /// Path to configuration file (TOML or YAML).
    #[arg(long)]
    pub config: Option<String>,

    /// Journal to operate on; overrides the configured path.
    #[arg(short, long)]
    pub journal: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Supported CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// List clients with queued elements
    Clients,

    /// Decode and print a client's queue
    Inspect {
        /// Client identifier
        #[arg(short, long)]
        client: String,
    },

    /// Permanently delete a client's queue
    Purge {
        /// Client identifier
        #[arg(short, long)]
        client: String,
    },

    /// Rewrite the journal to hold only live elements
    Compact,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    sessionq::logging::init_logging(&config.log_level)?;

    let path = cli.journal.unwrap_or_else(|| config.journal_path.clone());
    let store = JournalStore::open_with_config(&path, config.journal_config())
        .with_context(|| format!("failed to open journal {path}"))?;

    match cli.command {
        Command::Clients => {
            for key in store.keys() {
                let mut conn = store.checkout()?;
                println!("{key}\t{}", conn.len(&key)?);
            }
        }
        Command::Inspect { client } => inspect(&store, &client)?,
        Command::Purge { client } => {
            let mut conn = store.checkout()?;
            conn.delete(&client)?;
            store.sync()?;
            info!(client = %client, "queue purged");
        }
        Command::Compact => {
            store.compact()?;
        }
    }

    Ok(())
}

fn inspect(store: &JournalStore, client: &str) -> anyhow::Result<()> {
    let mut conn = store.checkout()?;
    let len = conn.len(client)?;
    if len == 0 {
        println!("{client}: empty");
        return Ok(());
    }

    for (index, raw) in conn.range(client, 0, len - 1)?.iter().enumerate() {
        let elem = Elem::decode(raw).with_context(|| format!("element {index} is corrupt"))?;
        let state = if elem.packet_id().is_assigned() {
            "dispatched"
        } else {
            "pending"
        };
        let expiry = elem
            .expiry
            .map_or_else(|| "-".to_string(), |ms| ms.to_string());

        match &elem.message {
            MessageWithId::Publish(publish) => println!(
                "{index:>5} {state:<10} id={:<5} publish qos={} topic={} bytes={} expiry={expiry}",
                publish.packet_id,
                publish.message.qos.as_u8(),
                publish.message.topic,
                publish.message.payload.len(),
            ),
            MessageWithId::Pubrel(pubrel) => {
                println!("{index:>5} {state:<10} id={:<5} pubrel", pubrel.packet_id)
            }
        }
    }
    Ok(())
}
