mod commands;
mod output;
mod project;

use clap::{Args, Parser, Subcommand};
use cloudrow_engine::Mode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cloudrow")]
#[command(about = "Declared cloud state in tables, reconciled against the provider", long_about = None)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile the declared tables with the provider
    Reconcile {
        /// reconcile (provider follows the tables, imports unknown resources),
        /// apply (also deletes undeclared resources) or sync (tables follow the provider)
        #[arg(short, long, default_value_t = Mode::Reconcile)]
        mode: Mode,
        #[command(flatten)]
        target: Target,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show what a reconcile would do without changing anything
    Plan {
        #[arg(short, long, default_value_t = Mode::Reconcile)]
        mode: Mode,
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        json: bool,
    },
    /// List the registered modules and their mappers
    Modules,
    /// Install modules (and the modules they need), importing their resources
    Install {
        #[arg(required = true)]
        modules: Vec<String>,
        #[arg(short, long, env = "CLOUDROW_ACCOUNT")]
        account: Option<String>,
    },
    /// Uninstall modules, dropping their tables but keeping provider resources
    Uninstall {
        #[arg(required = true)]
        modules: Vec<String>,
    },
    /// Read and edit the declared-state tables
    #[command(subcommand)]
    Table(TableCommands),
    /// Show version information
    Version,
}

/// Which account and part of the registry a run covers
#[derive(Args)]
struct Target {
    #[arg(short, long, env = "CLOUDROW_ACCOUNT")]
    account: Option<String>,
    /// Restrict the run to one module
    #[arg(long)]
    module: Option<String>,
    /// Restrict the run to one mapper (resource kind)
    #[arg(long)]
    mapper: Option<String>,
    /// Restrict the run to one identity of --mapper
    #[arg(long, requires = "mapper")]
    id: Option<String>,
}

#[derive(Subcommand)]
enum TableCommands {
    /// Print the rows of one table, or of every table
    List {
        table: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Add a row from a JSON object
    Insert { table: String, row: String },
    /// Overwrite columns of a row from a JSON object
    Update { table: String, id: u64, columns: String },
    /// Remove a row
    Delete { table: String, id: u64 },
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "debug" } else { "warn" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // Version needs no project
    if matches!(cli.command, Commands::Version) {
        println!("cloudrow {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let project = project::Project::open().await?;

    match cli.command {
        Commands::Reconcile { mode, target, json } => {
            let ok = commands::run::handle(&project, mode, target, false, json).await?;
            if !ok {
                std::process::exit(1);
            }
        }
        Commands::Plan { mode, target, json } => {
            commands::run::handle(&project, mode, target, true, json).await?;
        }
        Commands::Modules => {
            commands::modules::handle(&project).await?;
        }
        Commands::Install { modules, account } => {
            if !commands::modules::install(&project, account, modules).await? {
                std::process::exit(1);
            }
        }
        Commands::Uninstall { modules } => {
            commands::modules::uninstall(&project, modules).await?;
        }
        Commands::Table(table_cmd) => {
            commands::table::handle(&project, table_cmd).await?;
        }
        Commands::Version => {
            unreachable!("Version is handled before the project is opened");
        }
    }

    Ok(())
}
