mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::{env, path::PathBuf};

use classguard_core::config::get_data_dir;
use commands::{agent, check, config, init, manifest, rules};

#[derive(Parser)]
#[command(name = "classguard")]
#[command(about = "Classroom browser policy agent", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default config and create the data directory
    Init {
        /// Overwrite an existing config file
        #[arg(short, long)]
        force: bool,
    },
    /// Show the running agent's state
    Status,
    /// Stop the running agent
    Stop,
    /// Ask the running agent to resolve the student identity again
    Refresh,
    /// Print the redirect rules compiled from the persisted policy
    Rules,
    /// Dry-run one sync cycle against a policy file and a set of URLs
    Check {
        /// Policy document (JSON, as served by the backend)
        #[arg(short, long)]
        policy: PathBuf,
        /// Open session URL; repeat for more sessions
        #[arg(short, long = "url")]
        urls: Vec<String>,
        /// Student email used for the dry run
        #[arg(short, long, default_value = check::DEFAULT_STUDENT)]
        student: String,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Register the native-messaging host with the browser
    InstallManifest {
        /// Extension ID allowed to launch the host
        #[arg(short, long)]
        extension_id: String,
        /// Directory to write the manifest into instead of the browser default
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
    /// (Internal) Serve the browser over stdio
    #[command(hide = true)]
    Host,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Get a configuration value
    Get {
        /// Key in section.key form (e.g. backend.base_url)
        key: String,
    },
    /// Set a configuration value
    Set {
        /// Key in section.key form (e.g. loops.policy_interval_secs)
        key: String,
        /// Value to set
        value: String,
    },
    /// List all configuration values
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Browsers launch the host with the caller's origin as the first argument.
    if env::args()
        .nth(1)
        .is_some_and(|arg| arg.starts_with(manifest::EXTENSION_ORIGIN_PREFIX))
    {
        return agent::run_host_process().await;
    }

    let cli = Cli::parse();

    if !matches!(cli.command, Commands::Host) {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_secs()
            .init();
    }

    let data_dir = get_data_dir()?;

    match cli.command {
        Commands::Init { force } => init::init_command(force),
        Commands::Status => agent::show_status(&data_dir).await,
        Commands::Stop => agent::stop_agent(&data_dir).await,
        Commands::Refresh => agent::refresh_identity(&data_dir).await,
        Commands::Rules => rules::show_rules(&data_dir),
        Commands::Check {
            policy,
            urls,
            student,
        } => check::check_command(&policy, &urls, &student).await,
        Commands::Config { action } => match action {
            ConfigAction::Get { key } => config::handle_config_get(&key),
            ConfigAction::Set { key, value } => config::handle_config_set(&key, &value),
            ConfigAction::List => config::handle_config_list(),
        },
        Commands::InstallManifest { extension_id, dir } => {
            manifest::install_manifest(&extension_id, dir)
        }
        Commands::Host => agent::run_host_process().await,
    }
}
