use crate::init_config::CmdConfig;
use anyhow::Context;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::InfoLevel;
use directories::ProjectDirs;
use std::path::PathBuf;

mod cmd;
mod config;
mod init_config;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// driver config file; defaults to driver.toml in the user config dir
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(flatten)]
    verbosity: clap_verbosity_flag::Verbosity<InfoLevel>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Modify the driver config
    Config {
        #[command(subcommand)]
        cmd: CmdConfig,
    },
    /// Print the content stored at a path
    Get {
        path: String,
        /// Write to this file instead of stdout
        #[arg(short, long, value_name = "FILE")]
        out: Option<PathBuf>,
    },
    /// Store a local file as the content of a path
    Put { path: String, file: PathBuf },
    /// Stream a path to stdout, starting at an offset
    Read {
        path: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },
    /// Stream a local file into a path at an offset (resumable upload)
    Write {
        path: String,
        file: PathBuf,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },
    /// Show size, modification time and kind of a path
    Stat { path: String },
    /// List the direct children of a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Move a path to a new location
    Mv { source: String, dest: String },
    /// Delete a path and everything below it
    Rm { path: String },
    /// Print a signed URL for a path
    Url {
        path: String,
        #[arg(long, default_value = "GET")]
        method: String,
        /// URL lifetime; the driver default when unset
        #[arg(long, value_name = "SECS")]
        expires_in: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    // Default config location: ~/.config/regstore/driver.toml
    let config_file = match cli.config {
        Some(path) => path,
        None => ProjectDirs::from("", "", "regstore")
            .context("failed to determine config directory path")?
            .config_dir()
            .join("driver.toml"),
    };

    cmd::run_command(&config_file, cli.cmd).await
}
