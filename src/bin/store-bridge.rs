//! `store-bridge` command line: run the gateway or talk to one.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::process::ExitCode;
use store_bridge::client::{page_of, BridgeClient, DEFAULT_GATEWAY_URL};
use store_bridge::server::{self, GatewayConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "store-bridge", version, about = "Bridge gateway for live page store state")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway
    Serve(ServeArgs),
    /// List every connected store
    List(Conn),
    /// List the stores of one page
    Stores {
        /// Page id
        page: String,
        #[command(flatten)]
        conn: Conn,
    },
    /// Resolve a page (and store key) to a store id
    Resolve {
        /// Page id
        page: String,
        /// Store key within the page
        #[arg(short, long)]
        key: Option<String>,
        #[command(flatten)]
        conn: Conn,
    },
    /// Print a store's state and version
    Get {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        conn: Conn,
    },
    /// Print state changes as they happen
    Watch {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        conn: Conn,
    },
    /// Replace a store's state
    Set {
        #[command(flatten)]
        target: Target,
        /// New state as JSON
        state: String,
        /// Only apply if the host is at this version
        #[arg(long)]
        expected_version: Option<u64>,
        #[command(flatten)]
        conn: Conn,
    },
    /// Dispatch an action to a store
    Dispatch {
        #[command(flatten)]
        target: Target,
        /// Action type
        action: String,
        /// Action payload as JSON
        payload: Option<String>,
        #[command(flatten)]
        conn: Conn,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Listen address
    #[arg(long, env = "STORE_BRIDGE_BIND")]
    bind: Option<SocketAddr>,
    /// WebSocket path
    #[arg(long, env = "STORE_BRIDGE_WS_PATH")]
    ws_path: Option<String>,
    /// Forward timeout in milliseconds
    #[arg(long, env = "STORE_BRIDGE_FORWARD_TIMEOUT_MS")]
    forward_timeout_ms: Option<u64>,
    /// Disable the REST facade
    #[arg(long)]
    no_rest: bool,
}

#[derive(Args, Debug)]
struct Conn {
    /// Gateway URL
    #[arg(short, long, env = "STORE_BRIDGE_URL", default_value = DEFAULT_GATEWAY_URL)]
    url: String,
}

#[derive(Args, Debug)]
struct Target {
    /// Store id (`page#suffix`) or page id
    store: String,
    /// Store key, when a page id is given
    #[arg(short, long)]
    key: Option<String>,
}

impl Target {
    async fn resolve(&self, client: &BridgeClient) -> Result<String> {
        if page_of(&self.store).is_some() {
            return Ok(self.store.clone());
        }
        client
            .resolve(&self.store, self.key.as_deref())
            .await
            .with_context(|| format!("resolving page '{}'", self.store))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "store_bridge=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::List(conn) => {
            let client = connect(&conn).await?;
            let stores = client.list_stores().await?;
            if stores.is_empty() {
                println!("No stores connected");
            }
            for store in stores {
                println!("{}", store.store_id);
                println!("  pageId:   {}", store.page_id);
                println!("  storeKey: {}", store.store_key.as_deref().unwrap_or("-"));
                println!("  version:  {}", store.version);
            }
            client.close().await;
            Ok(())
        }
        Command::Stores { page, conn } => {
            let client = connect(&conn).await?;
            for store in client.list_page_stores(&page).await? {
                println!(
                    "{}\t{}\tv{}",
                    store.store_id,
                    store.store_key.as_deref().unwrap_or("-"),
                    store.version
                );
            }
            client.close().await;
            Ok(())
        }
        Command::Resolve { page, key, conn } => {
            let client = connect(&conn).await?;
            println!("{}", client.resolve(&page, key.as_deref()).await?);
            client.close().await;
            Ok(())
        }
        Command::Get { target, conn } => {
            let client = connect(&conn).await?;
            let store_id = target.resolve(&client).await?;
            let snapshot = client.get_state(&store_id).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            client.close().await;
            Ok(())
        }
        Command::Watch { target, conn } => {
            let client = connect(&conn).await?;
            let store_id = target.resolve(&client).await?;
            let mut changes = client
                .notifications()
                .context("notification stream already taken")?;
            client.subscribe(&store_id).await?;
            eprintln!("Watching {}. Press Ctrl+C to exit.", store_id);

            loop {
                tokio::select! {
                    change = changes.next() => match change {
                        Some(change) => println!(
                            "[v{}] {} {}",
                            change.version,
                            change.store_id,
                            serde_json::to_string(&change.state)?
                        ),
                        None => anyhow::bail!("gateway closed the connection"),
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            client.close().await;
            Ok(())
        }
        Command::Set {
            target,
            state,
            expected_version,
            conn,
        } => {
            let state: Value = serde_json::from_str(&state).context("state is not valid JSON")?;
            let client = connect(&conn).await?;
            let store_id = target.resolve(&client).await?;
            let result = client.set_state(&store_id, state, expected_version).await?;
            println!("State set ({})", result);
            client.close().await;
            Ok(())
        }
        Command::Dispatch {
            target,
            action,
            payload,
            conn,
        } => {
            let mut action = json!({ "type": action });
            if let Some(payload) = payload {
                action["payload"] =
                    serde_json::from_str(&payload).context("payload is not valid JSON")?;
            }
            let client = connect(&conn).await?;
            let store_id = target.resolve(&client).await?;
            let result = client.dispatch(&store_id, action).await?;
            println!("Action dispatched ({})", result);
            client.close().await;
            Ok(())
        }
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut config = GatewayConfig::from_env()?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(ws_path) = args.ws_path {
        config.ws_path = ws_path;
    }
    if let Some(timeout) = args.forward_timeout_ms {
        config.forward_timeout_ms = timeout;
    }
    if args.no_rest {
        config.enable_rest = false;
    }
    server::serve(config).await?;
    Ok(())
}

async fn connect(conn: &Conn) -> Result<BridgeClient> {
    BridgeClient::connect(&conn.url)
        .await
        .with_context(|| format!("connecting to {}", conn.url))
}
