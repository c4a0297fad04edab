#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::doc_markdown)]

mod commands;
mod logging;

use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "hotwire")]
#[command(author, version, about = "Hot module replacement dev server and client", long_about = None)]
struct Cli {
    /// Increase logging verbosity (-v for DEBUG, -vv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit JSON formatted logs
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Serve a directory and push updates to connected clients
    Serve {
        /// Project root (defaults to the current directory)
        #[arg(long, value_name = "PATH")]
        root: Option<PathBuf>,

        /// Port to listen on
        #[arg(long, short = 'p', default_value_t = commands::serve::DEFAULT_PORT)]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = commands::serve::DEFAULT_HOST)]
        host: String,

        /// Path to config file (overrides auto-discovery)
        #[arg(long, short = 'c', value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Run a headless HMR client against a dev server
    Connect {
        /// Page URL, e.g. http://localhost:5173/
        #[arg(default_value = "http://localhost:5173/")]
        url: String,

        /// Public base path of the served app
        #[arg(long)]
        base: Option<String>,

        /// Socket port to dial (disables the direct-target fallback)
        #[arg(long, value_name = "PORT")]
        hmr_port: Option<u16>,

        /// Module to treat as self-accepting, e.g. /src/main.js (repeatable)
        #[arg(long, value_name = "URL")]
        accept: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(cli.verbose, cli.json);

    let rt = tokio::runtime::Runtime::new().into_diagnostic()?;
    match cli.command {
        Commands::Serve {
            root,
            port,
            host,
            config,
        } => {
            let root = match root {
                Some(root) => root,
                None => std::env::current_dir().into_diagnostic()?,
            };
            let action = commands::serve::ServeAction {
                root,
                port,
                host,
                config,
            };
            rt.block_on(commands::serve::run(action))
        }
        Commands::Connect {
            url,
            base,
            hmr_port,
            accept,
        } => {
            let action = commands::connect::ConnectAction {
                url,
                base,
                hmr_port,
                accept,
            };
            rt.block_on(commands::connect::run(action))
        }
    }
}
