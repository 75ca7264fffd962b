//! relaybus CLI: operator interface to the coordination store.

use clap::{Parser, Subcommand};
use relaybus::CoordinationClient;
use relaybus::config::Config;
use relaybus::telemetry::{TelemetryConfig, init_telemetry};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "relaybus", about = "Queue and pub/sub coordination for distributed RL")]
struct Cli {
    /// TOML config file (defaults to environment variables)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Key-value operations
    Kv {
        #[command(subcommand)]
        action: KvAction,
    },
    /// Push a message onto a work queue
    Enqueue {
        queue: String,
        /// Message body (UTF-8)
        payload: String,
    },
    /// Drain a work queue, printing each message
    Dequeue {
        queue: String,
        /// Exit after this many messages
        #[arg(long)]
        count: Option<u64>,
    },
    /// Publish a message to a channel
    Publish {
        channel: String,
        /// Message body (UTF-8)
        payload: String,
    },
    /// Print messages arriving on a channel
    Subscribe {
        channel: String,
        /// Treat CHANNEL as a glob pattern
        #[arg(long)]
        pattern: bool,
        /// Exit after this many messages
        #[arg(long)]
        count: Option<u64>,
        /// Poll interval in milliseconds
        #[arg(long)]
        poll_ms: Option<u64>,
    },
}

#[derive(Subcommand)]
enum KvAction {
    /// Set a key
    Set { key: String, value: String },
    /// Get one or more keys
    Get {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Delete every key in the store
    Flush,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        log_level: config.log_level.clone(),
        export_logs: config.otel_export_logs,
        ..TelemetryConfig::default()
    })?;

    let client = CoordinationClient::connect(&config).await?;

    match cli.command {
        Command::Kv { action } => cmd_kv(&client, action).await,
        Command::Enqueue { queue, payload } => {
            client.enqueue(&queue, payload.as_bytes()).await?;
            println!("Enqueued {} bytes to {queue}", payload.len());
            Ok(())
        }
        Command::Dequeue { queue, count } => cmd_dequeue(&client, queue, count).await,
        Command::Publish { channel, payload } => {
            let receivers = client.publish(&channel, payload.as_bytes()).await?;
            println!("Published to {channel} ({receivers} receiver(s))");
            Ok(())
        }
        Command::Subscribe {
            channel,
            pattern,
            count,
            poll_ms,
        } => {
            cmd_subscribe(&client, channel, pattern, count, poll_ms.map(Duration::from_millis))
                .await
        }
    }
}

async fn cmd_kv(client: &CoordinationClient, action: KvAction) -> anyhow::Result<()> {
    match action {
        KvAction::Set { key, value } => {
            client.set(&key, value.as_bytes()).await?;
            println!("OK");
        }
        KvAction::Get { keys } => {
            let values = client.mget(&keys).await?;
            for (key, value) in keys.iter().zip(values) {
                match value {
                    Some(bytes) => println!("{key}: {}", String::from_utf8_lossy(&bytes)),
                    None => println!("{key}: (nil)"),
                }
            }
        }
        KvAction::Flush => {
            client.flush_all().await?;
            println!("Flushed");
        }
    }
    Ok(())
}

/// With `--count`, pop exactly that many messages on the caller's task so
/// nothing is taken that is not printed. Without it, run a worker that
/// prints from its handler until Ctrl-C.
async fn cmd_dequeue(
    client: &CoordinationClient,
    queue: String,
    count: Option<u64>,
) -> anyhow::Result<()> {
    if let Some(count) = count {
        let mut seen = 0_u64;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            result = client.dequeue_n(&queue, count, |payload, index| {
                println!("[{index}] {}", String::from_utf8_lossy(&payload));
                seen += 1;
                Ok(())
            }) => {
                result?;
            }
        }
        println!("\n{seen} message(s)");
        return Ok(());
    }

    let seen = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&seen);
    let handle = client
        .start_dequeue_worker(&queue, move |payload, index| {
            println!("[{index}] {}", String::from_utf8_lossy(&payload));
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .await?;

    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => if handle.is_finished() { break },
        }
    }

    if handle.is_finished() {
        // Failed on its own; join reports why.
        handle.join().await?;
    } else {
        client.stop_dequeue_worker(&queue).await?;
        // Parked on an empty queue; give up on it rather than wait for
        // another message.
        handle.abort();
    }
    println!("\n{} message(s)", seen.load(Ordering::Relaxed));
    Ok(())
}

async fn cmd_subscribe(
    client: &CoordinationClient,
    topic: String,
    pattern: bool,
    count: Option<u64>,
    poll_interval: Option<Duration>,
) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = if pattern {
        let tx = tx.clone();
        client
            .start_psubscribe_listener(
                &topic,
                move |channel, payload| {
                    tx.send((channel, payload))?;
                    Ok(())
                },
                poll_interval,
            )
            .await?
    } else {
        let channel = topic.clone();
        let tx = tx.clone();
        client
            .start_subscribe_listener(
                &topic,
                move |payload| {
                    tx.send((channel.clone(), payload))?;
                    Ok(())
                },
                poll_interval,
            )
            .await?
    };
    drop(tx);

    let mut seen = 0_u64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            msg = rx.recv() => match msg {
                Some((channel, payload)) => {
                    println!("{channel}: {}", String::from_utf8_lossy(&payload));
                    seen += 1;
                    if count.is_some_and(|n| seen >= n) {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    // NotFound means the listener already failed and reaped itself; join
    // reports why. Otherwise it exits within one poll interval.
    let _ = if pattern {
        client.stop_psubscribe_listener(&topic).await
    } else {
        client.stop_subscribe_listener(&topic).await
    };
    handle.join().await?;
    println!("\n{seen} message(s)");
    Ok(())
}
