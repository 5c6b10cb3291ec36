//! Postern CLI
//!
//! Configuration tooling, identity generation and an in-memory demo of two
//! peers exchanging messages through the Postern core.

mod config;

use clap::{Parser, Subcommand};
use postern_core::loopback::{LoopbackNetwork, LoopbackSuite, spawn_inbox};
use postern_core::{
    CoreConfig, CoreEvent, EndpointConfig, EventReceiver, LocalIdentity, Messenger, PeerId,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use config::Config;

/// Postern - relay-based end-to-end encrypted messaging core
#[derive(Parser)]
#[command(name = "postern")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Exchange a message between two in-memory peers
    Demo {
        /// Message text
        #[arg(default_value = "hello")]
        message: String,

        /// Pad the message to this many bytes (exercises splitting)
        #[arg(long)]
        size: Option<usize>,

        /// Seconds to wait for delivery events
        #[arg(long, default_value_t = 10)]
        wait: u64,
    },

    /// Print the effective configuration
    Config {
        /// Only validate, print nothing on success
        #[arg(long)]
        check: bool,
    },

    /// Generate a new exportable identity
    Keygen {
        /// Decentralized identifier of the identity
        #[arg(required = true)]
        did: String,

        /// Output file for the exported identity (JSON)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load_or_default(&config_path)?;

    // RUST_LOG wins, then --verbose, then the configured level
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if cli.verbose { "debug" } else { config.logging.level.as_str() };
        tracing_subscriber::EnvFilter::new(level)
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    config.validate()?;

    match cli.command {
        Commands::Demo {
            message,
            size,
            wait,
        } => {
            run_demo(config.to_core_config(), message, size, Duration::from_secs(wait)).await?;
        }
        Commands::Config { check } => {
            if !check {
                print!("{}", config.to_toml()?);
            }
            tracing::info!("Configuration {} is valid", config_path.display());
        }
        Commands::Keygen { did, output } => {
            generate_identity(&did, output)?;
        }
    }

    Ok(())
}

struct DemoPeer {
    messenger: Messenger,
    events: EventReceiver,
    id: PeerId,
}

async fn start_peer(
    network: &Arc<LoopbackNetwork>,
    config: &CoreConfig,
    did: &str,
    relay: &str,
) -> anyhow::Result<DemoPeer> {
    let id = PeerId::new(did)?;
    let (messenger, events) = Messenger::new(
        config.clone(),
        LocalIdentity::generate(id.clone(), false),
        Arc::new(LoopbackSuite),
        network.clone(),
        network.clone(),
    )?;

    let (connector, inbox) = network.attach();
    messenger
        .endpoint_registry(Arc::new(connector), network.clone())
        .connect(EndpointConfig::new(relay))
        .await?;
    spawn_inbox(messenger.clone(), inbox);

    Ok(DemoPeer {
        messenger,
        events,
        id,
    })
}

/// Send one message from alice to bob over an in-memory relay network
async fn run_demo(
    config: CoreConfig,
    message: String,
    size: Option<usize>,
    wait: Duration,
) -> anyhow::Result<()> {
    let network = LoopbackNetwork::new();
    let mut alice = start_peer(&network, &config, "did:postern:alice", "loop://relay-a").await?;
    let mut bob = start_peer(&network, &config, "did:postern:bob", "loop://relay-b").await?;

    let mut body = message;
    if let Some(size) = size {
        while body.len() < size {
            body.push('.');
        }
    }

    println!("Alice: {}", alice.id);
    println!("Bob:   {}", bob.id);
    println!("Sending {} bytes", body.len());

    let id = alice
        .messenger
        .send(&bob.id, "text", serde_json::Value::String(body))
        .await?;
    println!("Queued {}", id.short());

    let received = tokio::time::timeout(wait, async {
        let mut got_message = false;
        let mut got_receipt = false;
        while !(got_message && got_receipt) {
            tokio::select! {
                Some(event) = bob.events.recv() => {
                    if let CoreEvent::Message { from, envelope } = event {
                        let len = envelope.data.as_str().map_or(0, str::len);
                        println!("Bob got {} ({} bytes) from {}", envelope.sha256.short(), len, from);
                        got_message = true;
                    }
                }
                Some(event) = alice.events.recv() => match event {
                    CoreEvent::Delivered { ids, .. } => {
                        println!("Alice: delivered to relay {}", short_ids(&ids));
                    }
                    CoreEvent::Received { ids, .. } => {
                        println!("Alice: received by bob {}", short_ids(&ids));
                        got_receipt |= ids.contains(&id);
                    }
                    CoreEvent::DeliveryFailed { error, .. } => {
                        println!("Alice: delivery failed: {error}");
                    }
                    _ => {}
                },
                else => break,
            }
        }
    })
    .await;

    if received.is_err() {
        tracing::warn!("Timed out after {:?} waiting for delivery", wait);
    }

    println!(
        "Relay sends: {} delivered, {} failed",
        network.delivered_sends(),
        network.failed_sends()
    );
    alice.messenger.shutdown().await;
    bob.messenger.shutdown().await;
    Ok(())
}

fn short_ids(ids: &[postern_core::Hash]) -> String {
    ids.iter().map(|id| id.short()).collect::<Vec<_>>().join(", ")
}

/// Generate a new identity and optionally save it
fn generate_identity(did: &str, output: Option<PathBuf>) -> anyhow::Result<()> {
    let identity = LocalIdentity::generate(PeerId::new(did)?, true);
    let document = identity.document();

    println!("Identity: {}", document.id);
    println!("Identity key: {}", document.identity_key.short());
    println!("{}", serde_json::to_string_pretty(&document)?);

    let Some(exported) = identity.export() else {
        anyhow::bail!("identity is not exportable");
    };

    if let Some(path) = output {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_vec_pretty(&exported)?)?;
        println!("Exported identity saved to: {}", path.display());
        println!("\nKeep this file secure! It contains private keys.");
    } else {
        println!("\nExported identity not saved (use --output to save)");
    }

    Ok(())
}
