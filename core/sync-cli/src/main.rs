//! plugin-sync: command line client for the plugin-sync daemon.
//!
//! ## Subcommands
//!
//! - `snapshot`, `get`: read authoritative state
//! - `install`, `activate`, `deactivate`, `refresh`: run an action, retrying
//!   transient failures unless `--no-retry` is given
//! - `reconcile`: correct stored state against the host registry
//! - `watch`: live view fed by the push channel
//! - `health`: daemon status

mod commands;
mod logging;
mod view_cache;
mod watch;

use clap::{Args, Parser, Subcommand};
use plugin_sync_client::Transport;
use plugin_sync_protocol::Method;

#[derive(Parser)]
#[command(name = "plugin-sync")]
#[command(about = "Plugin lifecycle client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ActionArgs {
    /// Repository id (owner/name)
    #[arg(value_name = "REPO")]
    repository: String,

    /// Report the first failure instead of retrying
    #[arg(long)]
    no_retry: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List every tracked repository
    Snapshot,

    /// Show one repository, with error guidance when it failed
    Get {
        #[arg(value_name = "REPO")]
        repository: String,
    },

    /// Install a plugin
    Install(ActionArgs),

    /// Activate an installed plugin
    Activate(ActionArgs),

    /// Deactivate an active plugin
    Deactivate(ActionArgs),

    /// Re-check whether a repository is a plugin
    Refresh(ActionArgs),

    /// Reconcile stored state against the host registry
    Reconcile {
        /// Only this repository (default: all)
        #[arg(value_name = "REPO")]
        repository: Option<String>,
    },

    /// Follow state changes as they happen
    Watch {
        /// Only show repositories whose id contains TERM
        #[arg(long, value_name = "TERM")]
        filter: Option<String>,
    },

    /// Show daemon health
    Health,
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    let transport = match Transport::from_env() {
        Ok(transport) => transport,
        Err(e) => {
            eprintln!("plugin-sync: {}", e);
            std::process::exit(2);
        }
    };

    let result = match cli.command {
        Commands::Snapshot => commands::snapshot(&transport),
        Commands::Get { repository } => commands::get(&transport, &repository),
        Commands::Install(args) => run_action(&transport, Method::Install, args),
        Commands::Activate(args) => run_action(&transport, Method::Activate, args),
        Commands::Deactivate(args) => run_action(&transport, Method::Deactivate, args),
        Commands::Refresh(args) => run_action(&transport, Method::Refresh, args),
        Commands::Reconcile { repository } => {
            commands::reconcile(&transport, repository.as_deref())
        }
        Commands::Watch { filter } => watch::run(transport, filter.as_deref()),
        Commands::Health => commands::health(&transport),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "plugin-sync command failed");
        std::process::exit(1);
    }
}

fn run_action(
    transport: &Transport,
    method: Method,
    args: ActionArgs,
) -> Result<(), commands::CliError> {
    commands::action(transport, method, &args.repository, !args.no_retry)
}
