//! slim2diretta — native Lyrion Music Server player with Diretta output.
//!
//! One process, four steady-state threads:
//! 1. **Main**: startup, signal handling, the reconnect loop.
//! 2. **Slimproto receive**: blocks on the control socket, dispatches
//!    server commands.
//! 3. **Audio** (per track): HTTP ingest -> decoder -> prebuffered pushes
//!    into the sink.
//! 4. **Sink worker**: drains the ring into the Diretta target at a fixed
//!    packet cycle.

mod cli;
mod config;
mod decode;
mod discovery;
mod diretta;
mod dsd;
mod format;
mod http_stream;
mod pipeline;
mod player;
mod ring;
mod sink;
mod slimproto;

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::sink::Sink;

/// Set by the SIGUSR1 handler; polled by the control loop.
static STATS_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigusr1(_signal: libc::c_int) {
    STATS_REQUESTED.store(true, Ordering::Relaxed);
}

fn main() -> ExitCode {
    let args = match cli::Args::try_parse() {
        Ok(args) => args,
        Err(e)
            if e.kind() == clap::error::ErrorKind::DisplayHelp
                || e.kind() == clap::error::ErrorKind::DisplayVersion =>
        {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(1);
        }
    };

    // Verbose mode routes log writes through a worker thread so formatting
    // and I/O never stall the audio path; the guard must outlive main.
    let default_level = if args.verbose {
        "debug"
    } else if args.quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("slim2diretta={default_level}")));
    let _log_guard = if args.verbose {
        let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    };

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn run(args: cli::Args) -> Result<()> {
    if args.list_targets {
        return list_targets();
    }

    let server = match args.server {
        Some(server) => server,
        None => discovery::discover().context("server auto-discovery")?,
    };
    let config = Config::from_args(&args, server)?;

    tracing::info!(
        server = %config.server,
        port = config.port,
        player = %config.player_name,
        target = config.diretta.target_index,
        max_rate = config.max_sample_rate,
        dsd = config.dsd_enabled,
        "starting"
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::Release);
        })
        .context("install signal handler")?;
    }
    install_stats_handler();

    let sink = Arc::new(Sink::enable(config.diretta.clone()).context("enable sink")?);

    player::run(&config, &sink, &shutdown, &STATS_REQUESTED);

    tracing::info!("shutting down");
    sink.disable();
    Ok(())
}

fn list_targets() -> Result<()> {
    let targets = diretta::list_targets()?;
    if targets.is_empty() {
        println!("No Diretta targets found.");
        return Ok(());
    }
    println!("Available Diretta targets:");
    for t in &targets {
        println!("  #{}  {}  (mtu {})", t.index, t.name, t.mtu);
    }
    println!("\nUse: slim2diretta -s <LMS_IP> --target <index>");
    Ok(())
}

fn install_stats_handler() {
    let handler: extern "C" fn(libc::c_int) = on_sigusr1;
    // Safety: the handler only stores a relaxed atomic flag.
    unsafe {
        libc::signal(libc::SIGUSR1, handler as usize);
    }
}
