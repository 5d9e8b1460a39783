use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nostr_sdk::prelude::{PublicKey, Timestamp};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use nwc_bridge::crypto::ServerIdentity;
use nwc_bridge::pairing::{self, PairingRequest};
use nwc_bridge::protocol::Method;
use nwc_bridge::{BridgeConfig, BudgetPeriod, ConnectionRegistry, FileStorage, Storage};

/// Default state directory, relative to the working directory
const DEFAULT_DATA_DIR: &str = ".nwc_state";

#[derive(Parser)]
#[command(name = "nwc-bridge")]
#[command(about = "Nostr Wallet Connect bridge: manage wallet connections", long_about = None)]
struct Cli {
    /// State directory (server identity and connections)
    #[arg(long, global = true, default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    /// Bridge config file (JSON); defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the server identity if needed and show its public key
    Init,

    /// Register a new connection and print its pairing URI
    AddConnection {
        /// Human-readable label
        #[arg(long)]
        name: String,

        /// Comma-separated methods (default: every enabled method)
        #[arg(long, value_delimiter = ',')]
        methods: Vec<Method>,

        /// Spending limit in msat per period
        #[arg(long)]
        budget_msat: Option<u64>,

        /// Budget period: daily, weekly, monthly, yearly, never
        #[arg(long, default_value = "daily")]
        period: BudgetPeriod,

        /// Connection lifetime in seconds
        #[arg(long)]
        expires_in: Option<u64>,

        /// Relay to advertise (repeatable; default: configured relays)
        #[arg(long)]
        relay: Vec<String>,

        /// Skip the terminal QR code
        #[arg(long, default_value = "false")]
        no_qr: bool,
    },

    /// List connections with their remaining budget
    ListConnections,

    /// Revoke a connection
    RemoveConnection {
        /// Client public key (hex)
        #[arg(long)]
        pubkey: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let store: Arc<dyn Storage> = Arc::new(
        FileStorage::new(&cli.data_dir)
            .with_context(|| format!("opening {}", cli.data_dir.display()))?,
    );

    match cli.command {
        Commands::Init => init(store.as_ref())?,
        Commands::AddConnection {
            name,
            methods,
            budget_msat,
            period,
            expires_in,
            relay,
            no_qr,
        } => {
            let relays = if relay.is_empty() {
                config.relays.clone()
            } else {
                relay
            };
            let methods = if methods.is_empty() {
                config.methods.iter().copied().collect()
            } else {
                methods
            };
            add_connection(
                store,
                &config,
                AddConnection {
                    name,
                    methods,
                    budget_msat,
                    period,
                    expires_in,
                    relays,
                    show_qr: !no_qr,
                },
            )
            .await?
        }
        Commands::ListConnections => list_connections(store).await?,
        Commands::RemoveConnection { pubkey } => remove_connection(store, &pubkey).await?,
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<BridgeConfig> {
    let config = match path {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn init(store: &dyn Storage) -> Result<()> {
    let identity = ServerIdentity::load_or_generate(store)?;
    println!("{}", json!({ "pubkey": identity.public_key().to_hex() }));
    Ok(())
}

struct AddConnection {
    name: String,
    methods: Vec<Method>,
    budget_msat: Option<u64>,
    period: BudgetPeriod,
    expires_in: Option<u64>,
    relays: Vec<String>,
    show_qr: bool,
}

async fn add_connection(
    store: Arc<dyn Storage>,
    config: &BridgeConfig,
    args: AddConnection,
) -> Result<()> {
    if let Some(m) = args.methods.iter().find(|m| !config.methods.contains(*m)) {
        bail!("{} is not enabled in the bridge config", m);
    }

    let now = Timestamp::now().as_u64();
    let identity = ServerIdentity::load_or_generate(store.as_ref())?;
    let registry = ConnectionRegistry::load(store, now)?;

    let mut request = PairingRequest::new(args.name, args.methods);
    if let Some(limit) = args.budget_msat {
        request = request.with_budget(limit, args.period);
    }
    if let Some(secs) = args.expires_in {
        request = request.with_expiry(now.saturating_add(secs));
    }

    let pairing = pairing::create_pairing(
        &registry,
        identity.public_key(),
        request,
        &args.relays,
        config.lud16.as_deref(),
        now,
    )
    .await?;

    let uri = pairing.uri.to_string();
    if args.show_qr {
        eprintln!("{}", pairing::render_qr(&uri)?);
    }
    println!(
        "{}",
        json!({
            "pubkey": pairing.connection.client_pubkey.to_hex(),
            "uri": uri,
        })
    );
    Ok(())
}

async fn list_connections(store: Arc<dyn Storage>) -> Result<()> {
    let now = Timestamp::now().as_u64();
    let registry = ConnectionRegistry::load(store, now)?;

    let listing: Vec<_> = registry
        .list()
        .await
        .into_iter()
        .map(|c| {
            let grant = c.grant(now);
            json!({
                "pubkey": c.client_pubkey.to_hex(),
                "name": c.label,
                "methods": c.permissions.iter().map(|m| m.as_str()).collect::<Vec<_>>(),
                "budget_msat": c.budget.as_ref().map(|b| b.limit_msat),
                "period": c.budget.as_ref().map(|b| b.period.to_string()),
                "remaining_msat": grant.remaining_budget,
                "renews_at": c.budget.clone().and_then(|mut b| {
                    b.roll_over(now);
                    b.renews_at()
                }),
                "created_at": c.created_at,
                "expires_at": c.expires_at,
            })
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&listing)?);
    Ok(())
}

async fn remove_connection(store: Arc<dyn Storage>, pubkey: &str) -> Result<()> {
    let pubkey = PublicKey::from_hex(pubkey).context("invalid public key")?;
    let registry = ConnectionRegistry::load(store, Timestamp::now().as_u64())?;
    if !registry.revoke(&pubkey).await? {
        bail!("no connection for {}", pubkey.to_hex());
    }
    println!("{}", json!({ "removed": pubkey.to_hex() }));
    Ok(())
}
