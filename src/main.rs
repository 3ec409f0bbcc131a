use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use treesync::config::{Config, Mode, Overrides};

/// Keep a directory tree in sync with other parties over TCP
#[derive(Parser, Debug)]
#[command(name = "treesync")]
#[command(about, long_about = None, version)]
struct Cli {
    /// More logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Use a specific config file
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Wait for parties to connect
    Listen(Overrides),
    /// Connect to a listening party
    Connect(Overrides),
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "treesync=info",
        1 => "treesync=debug",
        _ => "treesync=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = Config::load(cli.config.as_deref())?;
    let (mode, overrides) = match cli.command {
        Commands::Listen(overrides) => (Mode::Listen, overrides),
        Commands::Connect(overrides) => (Mode::Connect, overrides),
    };
    config.mode = mode;
    overrides.apply(&mut config);

    treesync::node::run(config)
        .await
        .context("treesync stopped with an error")
}
