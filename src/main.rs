mod cli;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, ExclusionCommands, MarkCommands};

fn init_tracing() {
    let filter = EnvFilter::try_from_env("EXTRATO_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn dispatch(command: Commands) -> extrato::Result<()> {
    match command {
        Commands::Init { data_dir } => cli::init::run(data_dir),
        Commands::Import {
            file,
            bank,
            document_type,
            yes,
        } => cli::import::run(&file, bank, document_type, yes),
        Commands::History { status, limit, offset } => cli::history::list(status, limit, offset),
        Commands::DeleteBatch { id } => cli::history::delete(id),
        Commands::Classify {
            transaction,
            group,
            subgroup,
            installments,
            pattern,
        } => cli::classify::run(transaction, group, subgroup, installments, pattern),
        Commands::PropagateInfo { transaction } => cli::classify::info(transaction),
        Commands::Migrate {
            from_group,
            from_subgroup,
            to_group,
            to_subgroup,
            execute,
        } => cli::migrate::run(from_group, from_subgroup, to_group, to_subgroup, execute),
        Commands::Exclusions { command } => match command {
            ExclusionCommands::Add { merchant, bank, scope } => cli::exclusions::add(&merchant, bank, scope),
            ExclusionCommands::List { all } => cli::exclusions::list(all),
            ExclusionCommands::Remove { id, purge } => cli::exclusions::remove(id, purge),
        },
        Commands::Marks { command } => match command {
            MarkCommands::Add { token, group, subgroup } => cli::marks::add(&token, &group, subgroup.as_deref()),
            MarkCommands::List => cli::marks::list(),
        },
        Commands::Groups => cli::groups::list(),
    }
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let label = cli.command.label();

    if let Err(e) = dispatch(cli.command).with_context(|| format!("{label} failed")) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
