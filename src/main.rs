use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod cmd;

#[derive(Parser)]
#[command(name = "pluffy")]
#[command(version, about = "Turn a prompt into a generated project with a live preview")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to pluffy.toml
    #[arg(long, global = true, default_value = pluffy::config::DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Also write logs to a daily-rolling file in this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API and the job worker
    Serve {
        #[arg(short, long)]
        port: Option<u16>,

        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (CORS permissive for a separately served UI)
        #[arg(long)]
        dev: bool,

        /// Use the built-in stub agent instead of the model API
        #[arg(long)]
        offline: bool,
    },
    /// Create the config file and database
    Init {
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Submit a request from the command line
    Submit {
        value: String,

        /// Run this request's job in-process and print the result.
        /// Other queued jobs are left to `pluffy serve`.
        #[arg(long)]
        wait: bool,

        #[arg(long)]
        db_path: Option<PathBuf>,

        #[arg(long)]
        offline: bool,
    },
    /// Show a project, its messages and its latest fragment
    Show {
        id: String,

        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Print the tree of a JSON file collection ({"path": "content", ...})
    Tree {
        files: PathBuf,

        /// Merge single-child directory chains
        #[arg(long)]
        collapse: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

/// Overrides shared by the commands that touch the database or agent.
#[derive(Default)]
pub struct Overrides {
    pub port: Option<u16>,
    pub host: Option<String>,
    pub db_path: Option<PathBuf>,
    pub dev: bool,
    pub offline: bool,
}

fn init_tracing(
    verbose: bool,
    json: bool,
    log_dir: Option<&Path>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let default_filter = if verbose { "pluffy=debug" } else { "pluffy=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let json_layer = json.then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text_layer = (!json).then(|| fmt::layer().with_writer(std::io::stderr));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "pluffy.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to initialize logging")?;
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.verbose, cli.log_json, cli.log_dir.as_deref())?;

    match &cli.command {
        Commands::Serve {
            port,
            host,
            db_path,
            dev,
            offline,
        } => {
            let overrides = Overrides {
                port: *port,
                host: host.clone(),
                db_path: db_path.clone(),
                dev: *dev,
                offline: *offline,
            };
            cmd::cmd_serve(&cli.config, overrides).await?;
        }
        Commands::Init { db_path } => {
            cmd::cmd_init(&cli.config, db_path.clone())?;
        }
        Commands::Submit {
            value,
            wait,
            db_path,
            offline,
        } => {
            let overrides = Overrides {
                db_path: db_path.clone(),
                offline: *offline,
                ..Overrides::default()
            };
            cmd::cmd_submit(&cli.config, overrides, value, *wait).await?;
        }
        Commands::Show { id, db_path } => {
            let overrides = Overrides {
                db_path: db_path.clone(),
                ..Overrides::default()
            };
            cmd::cmd_show(&cli.config, overrides, id).await?;
        }
        Commands::Tree { files, collapse } => cmd::cmd_tree(files, *collapse)?,
        Commands::Config { command } => cmd::cmd_config(&cli.config, command.clone())?,
    }

    Ok(())
}
