use std::{fs, io::Write, path::Path};

use anyhow::Context;
use clap::Subcommand;
use toml_edit::{DocumentMut, Item, Table};
use tracing::info;

#[derive(Subcommand)]
pub enum CmdConfig {
    /// Creates the config file if it doesn't exist and sets the S3 bucket
    Init {
        /// Bucket holding the registry data
        #[arg(long)]
        bucket: String,
        /// AWS region of the bucket
        #[arg(long, default_value = "us-east-1")]
        region: String,
        /// Endpoint of an S3-compatible server (e.g. MinIO)
        #[arg(long, value_name = "URL")]
        endpoint: Option<String>,
        /// Key prefix all paths are stored under
        #[arg(long, value_name = "PREFIX")]
        root_directory: Option<String>,
    },
}

impl CmdConfig {
    pub fn run(self, config_file: &Path) -> anyhow::Result<()> {
        let mut doc = if config_file.exists() {
            fs::read_to_string(config_file)?
        } else {
            if let Some(parent) = config_file.parent() {
                fs::create_dir_all(parent)?;
            }
            String::new()
        }
        .parse::<DocumentMut>()
        .context("could not parse config file")?;

        match self {
            Self::Init {
                bucket,
                region,
                endpoint,
                root_directory,
            } => {
                let storage = doc
                    .entry("storage")
                    .or_insert(Item::Table(Table::new()))
                    .as_table_mut()
                    .context("`storage` in config file is not a table")?;
                storage.insert("type", "s3".into());
                storage.insert("bucket", bucket.into());
                storage.insert("region", region.into());
                if let Some(endpoint) = endpoint {
                    storage.insert("region_endpoint", endpoint.into());
                    storage.insert("path_style", true.into());
                }
                if let Some(root) = root_directory {
                    storage.insert("root_directory", root.into());
                }
            }
        }

        info!("writing to config file {config_file:?}");

        let tmp_path = config_file.with_extension("tmp");
        let mut tmp = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        tmp.write_all(doc.to_string().as_bytes())?;
        tmp.sync_all()?;
        fs::rename(&tmp_path, config_file)?;
        Ok(())
    }
}
