use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod commands;

#[derive(Parser, Debug)]
#[command(version, about = "Reverse image search over a photo archive", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Embed corpus images that are not indexed yet.
    Sync {
        /// Images per embedding batch (defaults to index.batch_size)
        #[clap(short, long)]
        batch_size: Option<usize>,

        /// Only report what would be embedded
        #[clap(long, default_value = "false")]
        dry_run: bool,
    },

    /// Find archive images similar to a local image.
    Search {
        /// Path to the query image
        image: PathBuf,

        /// Number of results (defaults to default_k)
        #[clap(short, long)]
        k: Option<usize>,
    },

    /// Start the HTTP API.
    Serve {
        /// Skip the startup sync
        #[clap(long, default_value = "false")]
        no_sync: bool,

        /// Address to listen on (defaults to listen_addr)
        #[clap(short, long)]
        listen: Option<String>,
    },

    /// Show model, metric and index size.
    Status {},

    /// Print the identifier an item name maps to.
    Id {
        /// Corpus item name, e.g. "1954/photo.jpg"
        name: String,
    },

    /// Remove index entries whose image is gone from the corpus.
    Prune {
        /// Do not ask for confirmation
        #[clap(short, long, default_value = "false")]
        yes: bool,
    },

    /// Discard the index and embed the whole corpus again.
    ///
    /// Required after changing index.model or index.metric.
    Reindex {
        /// Do not ask for confirmation
        #[clap(short, long, default_value = "false")]
        yes: bool,

        /// Images per embedding batch (defaults to index.batch_size)
        #[clap(short, long)]
        batch_size: Option<usize>,
    },
}
