use std::path::Path;

use anyhow::{Context, Result};
use regstore_core::Validated;
use regstore_s3::S3Driver;

use crate::Commands;
use crate::config::{CliConfig, StorageConfig};

mod objects;

pub use objects::run_object_command;

pub async fn run_command(config_file: &Path, cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Config { cmd } => cmd.run(config_file),
        cmd => {
            let config = CliConfig::load(config_file)?;
            match config.storage {
                StorageConfig::S3(s3) => {
                    let driver = S3Driver::new(&s3)
                        .await
                        .with_context(|| format!("failed to open bucket {}", s3.bucket))?;
                    run_object_command(&Validated::new(driver), cmd).await
                }
            }
        }
    }
}
