//! Lantern Plugin CLI - build, check and exercise plugin packages.
//!
//! Everything runs in-process: packages are validated, unpacked and executed
//! by the same runtime a Lantern host embeds, with the built-in native
//! modules registered.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod settings;
mod theme;

use commands::{discover, inspect, keys, package, route, test_intent, validate};

/// Lantern plugin tool
#[derive(Parser)]
#[command(name = "lantern-plugin")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file merged above the user and workspace layers
    #[arg(long, global = true, env = "LANTERN_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format: pretty, compact, json or full
    #[arg(long, global = true)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a package without loading it
    Validate {
        /// Package file
        package: PathBuf,
    },

    /// Print a package's manifest
    Inspect {
        /// Package file
        package: PathBuf,

        /// Also list the files in the package
        #[arg(long)]
        files: bool,
    },

    /// Pack a plugin directory into a package
    Package {
        /// Directory containing plugin.json
        dir: PathBuf,

        /// Output file (defaults to `<id>-<version>.lpkg` in the current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// File holding a base64 Ed25519 seed to sign with
        #[arg(long)]
        sign_key: Option<PathBuf>,
    },

    /// List packages in a directory
    Discover {
        /// Directory to scan (defaults to plugins.directory)
        dir: Option<PathBuf>,
    },

    /// Load a package, run one intent and unload it
    Test {
        /// Package file
        package: PathBuf,

        /// Intent to execute
        #[arg(short, long)]
        intent: String,

        /// Request parameter as key=value; values that parse as JSON keep their type
        #[arg(short, long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Execution budget in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Load every package in a directory and route a query across them
    Route {
        /// Query, e.g. `analyze_hash hash=<digest>`
        query: String,

        /// Directory to load (defaults to plugins.directory)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Per-plugin budget in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Generate a signing key
    Keygen {
        /// Where to write the base64 seed
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = settings::load_config(cli.config.as_deref())?;
    settings::init_logging(&config, cli.verbose, cli.log_format.as_deref());

    match cli.command {
        Commands::Validate { package } => validate::run(&config, &package).await,
        Commands::Inspect { package, files } => inspect::run(&config, &package, files),
        Commands::Package {
            dir,
            output,
            sign_key,
        } => package::run(&dir, output.as_deref(), sign_key.as_deref()),
        Commands::Discover { dir } => discover::run(&config, dir).await,
        Commands::Test {
            package,
            intent,
            params,
            timeout,
        } => test_intent::run(&config, &package, &intent, &params, timeout).await,
        Commands::Route {
            query,
            dir,
            timeout,
        } => route::run(&config, &query, dir, timeout).await,
        Commands::Keygen { output, force } => keys::generate(&output, force),
    }
}
