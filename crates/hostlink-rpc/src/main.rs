//! Hostlink RPC - host server and command-line client for the hostlink bus.
//!
//! `serve` runs a host over an in-memory demonstration scene. `call` and
//! `watch` act as the editor side: one-shot requests and event streaming
//! with automatic reconnection.

mod handlers;
mod scene;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use handlers::HostState;
use hostlink_core::{
    BusConfig, ClientConfig, ConnectionHandle, ConnectionManager, ConnectionState,
    ExponentialBackoff, FixedDelay, HostServer, Notification, NotificationHandler, ServerConfig,
};
use scene::Scene;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Event published by `serve --tick-ms`.
const TICK_EVENT: &str = "tick";

#[derive(Parser, Debug)]
#[command(name = "hostlink-rpc")]
#[command(about = "JSON-RPC bus between an editor client and a host process")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the host server
    Serve {
        /// Host to bind to
        #[arg(long, default_value = BusConfig::DEFAULT_HOST)]
        host: String,

        /// Port to listen on (0 = auto-assign)
        #[arg(short, long, default_value_t = BusConfig::DEFAULT_PORT)]
        port: u16,

        /// Publish a "tick" event at this interval
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        tick_ms: Option<u64>,
    },

    /// Send one request and print its result
    Call {
        /// Host WebSocket URL
        #[arg(long, default_value_t = BusConfig::default_url())]
        url: String,

        /// Method name, e.g. host.getSceneInfo
        method: String,

        /// Params as a JSON document
        params: Option<String>,

        /// Connect and request timeout
        #[arg(long, default_value = "10")]
        timeout_secs: u64,
    },

    /// Subscribe to events and print each one as a JSON line
    Watch {
        /// Host WebSocket URL
        #[arg(long, default_value_t = BusConfig::default_url())]
        url: String,

        /// Events to subscribe to
        #[arg(required = true)]
        events: Vec<String>,

        /// Delay between reconnect attempts
        #[arg(long, default_value = "5000")]
        reconnect_delay_ms: u64,

        /// Back off exponentially instead of using a fixed delay
        #[arg(long)]
        backoff: bool,
    },
}

/// Logs client notifications that are not event emissions.
struct LogNotifications;

impl NotificationHandler for LogNotifications {
    fn on_notification(&self, from: &Arc<ConnectionHandle>, notification: Notification) {
        debug!(
            connection_id = %from.id(),
            method = %notification.method,
            "Unhandled client notification"
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug, args.json_logs);

    match args.command {
        Command::Serve {
            host,
            port,
            tick_ms,
        } => serve(host, port, tick_ms).await,
        Command::Call {
            url,
            method,
            params,
            timeout_secs,
        } => call(url, method, params, Duration::from_secs(timeout_secs)).await,
        Command::Watch {
            url,
            events,
            reconnect_delay_ms,
            backoff,
        } => watch(url, events, Duration::from_millis(reconnect_delay_ms), backoff).await,
    }
}

/// Logs go to stderr; stdout carries `RPC_PORT=` and command output.
fn init_logging(debug: bool, json_logs: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json_logs {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

async fn serve(host: String, port: u16, tick_ms: Option<u64>) -> Result<()> {
    info!("Starting hostlink host");

    let mut server =
        HostServer::new(ServerConfig::new(host, port)).with_notification_handler(LogNotifications);
    let state = Arc::new(HostState::new(Scene::demo(), server.registry()));
    handlers::register(&mut server, state);

    let handle = server.start().await?;

    // Print port for the launching process to read (intentional stdout for IPC)
    println!("RPC_PORT={}", handle.port());
    info!(url = %handle.url(), "Host running");

    let ticker = tick_ms.map(|ms| {
        let registry = handle.registry();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(ms));
            let mut n: u64 = 0;
            loop {
                interval.tick().await;
                n += 1;
                let report = registry.publish(TICK_EVENT, json!({ "n": n }));
                debug!(n, delivered = report.delivered, "Tick");
            }
        })
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    if let Some(ticker) = ticker {
        ticker.abort();
    }
    handle.shutdown().await;
    Ok(())
}

async fn call(url: String, method: String, params: Option<String>, timeout: Duration) -> Result<()> {
    let params: Option<Value> = params
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .context("params must be a JSON document")?;

    let config = ClientConfig::new(url.clone())
        .with_connect_timeout(timeout)
        .with_request_timeout(Some(timeout));
    let manager = ConnectionManager::websocket(config);
    manager.connect();
    manager
        .wait_connected(timeout)
        .await
        .with_context(|| format!("could not reach host at {}", url))?;

    let result = manager.call(&method, params).await;
    manager.disconnect();

    let result = result.with_context(|| format!("{} failed", method))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn watch(url: String, events: Vec<String>, delay: Duration, backoff: bool) -> Result<()> {
    let config = ClientConfig::new(url);
    let config = if backoff {
        config.with_reconnect_policy(ExponentialBackoff::new().with_base_delay(delay))
    } else {
        config.with_reconnect_policy(FixedDelay::new(delay))
    };
    let manager = ConnectionManager::websocket(config);

    // Merge the per-event receivers into one stream.
    let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
    for event in &events {
        let mut inbox = manager.on_notification(event);
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(notification) = inbox.recv().await {
                if tx.send(notification).is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);

    let mut states = manager.state_changes();
    manager.connect();

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                info!(state = %state, "Connection state changed");

                // Subscriptions belong to a connection; renew them after every reconnect.
                if state == ConnectionState::Connected {
                    for event in &events {
                        if let Err(e) = manager.subscribe_to_event(event).await {
                            warn!(event = %event, error = %e, "Subscribe failed");
                        }
                    }
                }
            }
            Some(notification) = rx.recv() => {
                let line = json!({
                    "event": notification.method,
                    "data": notification.params.unwrap_or(Value::Null),
                });
                println!("{}", line);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, exiting");
                break;
            }
        }
    }

    manager.disconnect();
    Ok(())
}
