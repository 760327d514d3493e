//! # Pool Benchmark Driver
//!
//! Purpose: Send one fixed request many times through a connection pool and
//! report how many succeeded and at what rate.
//!
//! ## Design Principles
//! 1. **Buffer First**: Every request is queued up front so the pool runs at
//!    its highwatermark.
//! 2. **Shared Tally**: Completion handlers only update a counter; progress
//!    logging happens at fixed intervals.
//! 3. **Clean Teardown**: Ctrl-C or SIGTERM closes the pool, which fails whatever is
//!    still outstanding instead of abandoning it.

mod tally;

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

use fkv_client::{ConnectionPool, ConnectionOptions, PoolConfig, Request};

use crate::tally::Tally;

/// Fetch-object request for bucket "b", key "k".
const MESSAGE: &[u8] = &[0x09, 0x0A, 0x01, 0x62, 0x12, 0x01, 0x6B];

/// Command-line arguments for the benchmark.
#[derive(Parser, Debug)]
#[command(name = "fkv-bench")]
#[command(version = "0.1.0")]
#[command(about = "Sends a lot of fetch requests to a store node using a connection pool", long_about = None)]
struct Args {
    /// Host name of the store node
    #[arg(short = 'n', long, default_value = "localhost")]
    hostname: String,

    /// Port to connect on
    #[arg(short, long, default_value_t = 10017)]
    port: u16,

    /// Number of I/O threads
    #[arg(short = 't', long, default_value_t = 2)]
    num_threads: usize,

    /// Number of sockets in the pool
    #[arg(short = 's', long, default_value_t = 256)]
    num_sockets: usize,

    /// Maximum buffered requests
    #[arg(short = 'k', long, default_value_t = 65_536)]
    highwatermark: usize,

    /// Number of messages to send
    #[arg(short = 'm', long, default_value_t = 1000)]
    nmsgs: u32,

    /// Milliseconds before timing out a request; negative for no deadline
    #[arg(short, long, default_value_t = 5000, allow_negative_numbers = true)]
    deadline: i64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(args.num_threads.max(1))
        .enable_all()
        .build()
        .context("failed to start I/O threads")?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    info!(
        host = %args.hostname,
        port = args.port,
        sockets = args.num_sockets,
        highwatermark = args.highwatermark,
        "creating connection pool"
    );
    let config = PoolConfig {
        connections: args.num_sockets,
        highwatermark: args.highwatermark,
        options: ConnectionOptions::default(),
    };
    let pool = ConnectionPool::connect(&args.hostname, args.port, config)
        .await
        .with_context(|| format!("failed to create pool for {}:{}", args.hostname, args.port))?;

    let tally = Arc::new(Tally::new(args.nmsgs));
    let buffer_log_every = tally.log_every() * 4;
    info!("buffering messages, don't interrupt until done");
    for index in 0..args.nmsgs {
        let tally = tally.clone();
        pool.submit(Request::new(Bytes::from_static(MESSAGE), args.deadline, move |result| {
            tally.record(index, result);
        }))
        .await;
        if index % buffer_log_every == 0 {
            info!(buffered = index + 1, "buffered messages");
        }
    }
    info!("buffered all the messages");

    let stopped = stop_signal()?;
    tokio::select! {
        _ = tally.finished() => info!("all messages sent"),
        result = stopped => {
            let signal = result?;
            warn!(signal, "interrupted");
        }
    }

    info!("closing connection pool and cancelling any remaining requests");
    pool.close().await;

    let summary = tally.summary();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "Done. {} out of {} messages successful ({:.0} messages/sec).",
            summary.succeeded, summary.completed, summary.messages_per_sec
        );
    }
    Ok(())
}

/// Registers for SIGINT and SIGTERM. The future names whichever arrives first.
#[cfg(unix)]
fn stop_signal() -> anyhow::Result<impl Future<Output = anyhow::Result<&'static str>>> {
    let mut terminate = signal(SignalKind::terminate()).context("failed to listen for SIGTERM")?;
    Ok(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("failed to listen for ctrl-c").map(|()| "SIGINT"),
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    })
}

#[cfg(not(unix))]
fn stop_signal() -> anyhow::Result<impl Future<Output = anyhow::Result<&'static str>>> {
    Ok(async {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")
            .map(|()| "ctrl-c")
    })
}
