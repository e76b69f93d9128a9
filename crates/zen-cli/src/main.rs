mod app;
mod cmd;
mod output;
mod providers;
mod root;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use cmd::{
    cache::CacheSubcommand, config::ConfigSubcommand, conflicts::ConflictsSubcommand,
    providers::ProvidersSubcommand, sync::SyncSubcommand,
};
use zen_core::config::Config;
use zen_core::Context;

use crate::app::App;
use crate::output::{exit_code, print_error, OutputFormat};

#[derive(Parser)]
#[command(
    name = "zen",
    about = "Developer workspace with external task synchronization",
    version,
    propagate_version = true
)]
struct Cli {
    /// Debug logging (overrides log_level and RUST_LOG)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Disable ANSI colors (also honoured via NO_COLOR)
    #[arg(long, global = true)]
    no_color: bool,

    /// Output format (default: config `output`)
    #[arg(long, short = 'o', global = true, value_enum)]
    output: Option<OutputFormat>,

    /// Config file (default: <root>/.zen/config.yaml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Workspace root (default: auto-detect from .zen/ or .git/)
    #[arg(long, global = true, env = "ZEN_ROOT")]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a zen workspace in the current project
    Init,

    /// Synchronize tasks with the external task system
    Sync {
        #[command(subcommand)]
        subcommand: SyncSubcommand,
    },

    /// Review conflicts parked for manual resolution
    Conflicts {
        #[command(subcommand)]
        subcommand: ConflictsSubcommand,
    },

    /// Inspect task system and tool providers
    Providers {
        #[command(subcommand)]
        subcommand: ProvidersSubcommand,
    },

    /// Manage the local cache
    Cache {
        #[command(subcommand)]
        subcommand: CacheSubcommand,
    },

    /// Show or validate configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

impl Commands {
    /// Commands that must run without a valid workspace config.
    fn tolerates_bad_config(&self) -> bool {
        matches!(self, Commands::Init | Commands::Config { .. })
    }
}

/// Effective config: defaults, then the file, then `ZEN_*`, then flags.
fn load_config(cli: &Cli, root: &Path) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None if cli.command.tolerates_bad_config() => Config::load_or_default(root)?,
        None => Config::load(root)?,
    };
    config.apply_env(std::env::vars())?;
    if let Some(format) = cli.output {
        config.output = format.as_str().to_string();
    }
    if cli.verbose {
        config.log_level = "debug".to_string();
    }
    if !cli.command.tolerates_bad_config() {
        config.ensure_valid()?;
    }
    Ok(config)
}

fn init_logging(directive: &str, verbose: bool, color: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(color)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let color = !cli.no_color && std::env::var_os("NO_COLOR").map_or(true, |v| v.is_empty());
    let root = root::resolve_root(cli.root.as_deref());

    let config = match load_config(&cli, &root) {
        Ok(c) => c,
        Err(e) => {
            init_logging("warn", cli.verbose, color);
            print_error(cli.output.unwrap_or(OutputFormat::Text), color, &e);
            std::process::exit(exit_code(&e));
        }
    };
    init_logging(config.log_directive(), cli.verbose, color);
    let format = cli
        .output
        .unwrap_or_else(|| OutputFormat::from_config(&config.output));

    let ctx = Context::background();
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            interrupt.cancel();
        }
    });

    let app = App {
        root,
        config,
        format,
        ctx,
    };

    let result = match cli.command {
        Commands::Init => cmd::init::run(&app.root),
        Commands::Sync { subcommand } => cmd::sync::run(&app, subcommand).await,
        Commands::Conflicts { subcommand } => cmd::conflicts::run(&app, subcommand),
        Commands::Providers { subcommand } => cmd::providers::run(&app, subcommand).await,
        Commands::Cache { subcommand } => cmd::cache::run(&app, subcommand),
        Commands::Config { subcommand } => cmd::config::run(&app, subcommand),
    };

    if let Err(e) = result {
        print_error(format, color, &e);
        std::process::exit(exit_code(&e));
    }
}
