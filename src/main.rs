use std::{error::Error, path::PathBuf};

use clap::Parser;

use gitfetch::api::GitFetcher;
use gitfetch::cli::{do_clone, do_fetch, do_head};
use gitfetch::input::Input;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Fetches Git sources into a content-addressed, TTL-bounded cache.
#[derive(Debug, Parser)]
#[clap(version)]
pub struct CliArgs {
    #[clap(subcommand)]
    pub cmd: Command,
    /// Location of the cache directory [default: platform-specific]
    #[clap(short, long)]
    pub cache_directory: Option<String>,
    /// Seconds a cached ref stays fresh before revalidation
    #[clap(short, long)]
    pub ttl: Option<u64>,
}

#[derive(Debug, Parser)]
pub enum Command {
    /// Fetches a Git input and prints its locked metadata
    Fetch {
        /// Input URL, e.g. git+https://host/repo.git?ref=main
        url: String,
        /// Branch or tag to fetch
        #[clap(long)]
        r#ref: Option<String>,
        /// Commit id to pin
        #[clap(long)]
        rev: Option<String>,
    },
    /// Clones a Git input into a directory
    Clone {
        url: String,
        directory: PathBuf,
    },
    /// Prints the default branch of a remote repository
    Head { url: String },
}

fn main() {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_env_var("RUST_LOG")
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_ansi(true);

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(filter)
        .try_init()
        .unwrap();

    if let Err(e) = run() {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli_args = CliArgs::parse();

    let mut fetcher = GitFetcher::builder();
    if let Some(cache_directory) = &cli_args.cache_directory {
        fetcher = fetcher.cache_directory(cache_directory);
    }
    if let Some(ttl) = cli_args.ttl {
        fetcher = fetcher.cache_ttl(ttl);
    }
    let fetcher = fetcher.try_build()?;

    match cli_args.cmd {
        Command::Fetch { url, r#ref, rev } => {
            let input = Input::from_url(&url)?.apply_overrides(r#ref, rev)?;
            do_fetch(&fetcher, input)
        }
        Command::Clone { url, directory } => {
            let input = Input::from_url(&url)?;
            do_clone(&fetcher, input, &directory)
        }
        Command::Head { url } => do_head(&url),
    }
}
