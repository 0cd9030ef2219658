//! tierd — launch a tiergrid topology.
//!
//! Builds the entity tree described by a topology file, starts it in a
//! location, prints the live tree and waits for Enter or Ctrl-C before
//! stopping everything again.
//!
//! # Usage
//!
//! ```text
//! tierd launch --topology demos/web-cluster-database.toml --location localhost --port 8081+
//! tierd validate --topology demos/whirr-hadoop.toml
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tiergrid_launch::{Deployment, Launcher};
use tokio::sync::oneshot;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,tierd=debug,tiergrid=debug";

#[derive(Parser)]
#[command(name = "tierd", about = "tiergrid — declarative application topology launcher", version)]
struct Cli {
    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build and start a topology, print it, wait, then stop it.
    Launch {
        /// Topology file (TOML).
        #[arg(long)]
        topology: PathBuf,

        /// Where to provision, e.g. `localhost`. Overrides the topology.
        #[arg(long)]
        location: Option<String>,

        /// Management port range, e.g. `8081+`. Overrides the topology.
        #[arg(long)]
        port: Option<String>,

        /// How to print the tree once started.
        #[arg(long, value_enum, default_value_t = DumpFormat::Text)]
        dump: DumpFormat,

        /// Stop right after printing instead of waiting for Enter or Ctrl-C.
        #[arg(long)]
        no_wait: bool,
    },
    /// Parse and build a topology without starting it, then print it.
    Validate {
        /// Topology file (TOML).
        #[arg(long)]
        topology: PathBuf,

        #[arg(long, value_enum, default_value_t = DumpFormat::Text)]
        dump: DumpFormat,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum DumpFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Launch {
            topology,
            location,
            port,
            dump,
            no_wait,
        } => run_launch(topology, location, port, dump, no_wait).await,
        Command::Validate { topology, dump } => run_validate(topology, dump).await,
    }
}

// Logs go to stderr so a dump on stdout stays machine-readable.
fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run_launch(
    topology: PathBuf,
    location: Option<String>,
    port: Option<String>,
    dump: DumpFormat,
    no_wait: bool,
) -> anyhow::Result<()> {
    let mut launcher = Launcher::from_file(&topology)?;
    if let Some(location) = location {
        launcher = launcher.location(location);
    }
    if let Some(port) = port {
        launcher = launcher.port(port);
    }

    let deployment = launcher.launch().await?;
    print_tree(&deployment, dump)?;

    if !no_wait {
        info!("press return to shut down");
        wait_for_shutdown().await;
    }
    deployment.stop().await?;
    Ok(())
}

async fn run_validate(topology: PathBuf, dump: DumpFormat) -> anyhow::Result<()> {
    let deployment = Launcher::from_file(&topology)?.build()?;
    print_tree(&deployment, dump)?;
    info!(
        application = %deployment.name(),
        entities = deployment.snapshot().entity_count(),
        "topology is valid"
    );
    deployment.stop().await?;
    Ok(())
}

fn print_tree(deployment: &Deployment, format: DumpFormat) -> anyhow::Result<()> {
    match format {
        DumpFormat::Text => print!("{}", deployment.dump()),
        DumpFormat::Json => println!("{}", serde_json::to_string_pretty(&deployment.snapshot())?),
    }
    Ok(())
}

/// Resolves on Enter (or end of input) or Ctrl-C.
async fn wait_for_shutdown() {
    let (tx, rx) = oneshot::channel();
    // A plain thread: a blocked stdin read must not hold up runtime shutdown.
    std::thread::spawn(move || {
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
        let _ = tx.send(());
    });
    tokio::select! {
        _ = rx => info!("return pressed"),
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
    }
}
