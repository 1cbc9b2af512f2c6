//! Command-line interface — `serve` (default), `init`, `add-client`.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::rngs::OsRng;
use rand::RngCore;

use uplink_core::config::{ClientEntry, Config};

#[derive(Parser)]
#[command(name = "uplinkd", version, about = "Fleet-telemetry uplink server")]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, default_value = "config.yml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the server (default when no subcommand is given).
    Serve,
    /// Create a config file with a freshly generated API key.
    Init,
    /// Add a client to the config and print its connection snippet.
    AddClient(AddClientArgs),
}

#[derive(Args)]
pub struct AddClientArgs {
    /// Client identifier.
    #[arg(long)]
    pub identifier: String,
    /// Human-friendly name.
    #[arg(long, default_value = "")]
    pub name: String,
    /// Server WebSocket endpoint placed in the client snippet.
    #[arg(long)]
    pub endpoint: Option<String>,
}

/// 32 random bytes, hex-encoded.
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn init(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        bail!(
            "config file '{}' already exists; choose another path with --config",
            config_path.display()
        );
    }

    let api_key = generate_token();
    let mut config = Config::default();
    config.auth.api_key = api_key.clone();
    config
        .save(config_path)
        .with_context(|| format!("failed to write {}", config_path.display()))?;

    println!("✓ Created config file: {}", config_path.display());
    println!();
    println!("API key (save this securely):");
    println!();
    println!("  {api_key}");
    println!();
    println!("Use this key to authenticate web UI and REST API requests.");
    println!(
        "Add clients with: uplinkd add-client --identifier <id> --config {}",
        config_path.display()
    );
    Ok(())
}

pub fn add_client(config_path: &Path, args: &AddClientArgs) -> Result<()> {
    let mut config = Config::load(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    if config.auth.tokens.contains_key(&args.identifier) {
        bail!("identifier '{}' already exists in config", args.identifier);
    }

    let token = generate_token();
    config.auth.tokens.insert(
        args.identifier.clone(),
        ClientEntry {
            token: token.clone(),
            name: args.name.clone(),
        },
    );
    config
        .save(config_path)
        .with_context(|| format!("failed to write {}", config_path.display()))?;

    let endpoint = args
        .endpoint
        .clone()
        .unwrap_or_else(|| "ws://CHANGEME:8080/ws".to_string());
    let snippet = serde_yaml::to_string(&serde_json::json!({
        "uplink": {
            "identifier": args.identifier,
            "token": token,
            "endpoint": endpoint,
        }
    }))
    .context("failed to render client snippet")?;

    println!("✓ Added client '{}' to {}", args.identifier, config_path.display());
    println!();
    println!("Client configuration:");
    println!();
    print!("{snippet}");
    Ok(())
}
