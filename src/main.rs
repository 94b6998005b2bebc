use clap::Parser;
use tracing_subscriber::EnvFilter;

mod app;
mod cli;
mod config;
mod images;
mod lock;
mod similarity;
mod storage;
#[cfg(test)]
mod tests;
mod web;

use app::{AppContext, AppFactory};
use cli::{commands, Command};

fn build_context() -> anyhow::Result<AppContext> {
    let paths = AppFactory::get_paths()?;
    AppFactory::build_context(&paths)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();

    match args.command {
        Command::Sync {
            batch_size,
            dry_run,
        } => commands::sync(&build_context()?, batch_size, dry_run),

        Command::Search { image, k } => commands::search(&build_context()?, &image, k),

        Command::Serve { no_sync, listen } => commands::serve(build_context()?, no_sync, listen),

        Command::Status {} => commands::status(&build_context()?),

        Command::Id { name } => {
            commands::id(&name);
            Ok(())
        }

        Command::Prune { yes } => commands::prune(&build_context()?, yes),

        // the existing index may not match the configured model, so it is
        // discarded before anything opens it
        Command::Reindex { yes, batch_size } => {
            commands::reindex(&AppFactory::get_paths()?, yes, batch_size)
        }
    }
}
