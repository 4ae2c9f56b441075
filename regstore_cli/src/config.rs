use std::path::Path;

use anyhow::Context;
use regstore_s3::S3DriverConfig;

#[derive(Debug, Clone, serde::Deserialize, PartialEq, Eq)]
pub struct CliConfig {
    pub storage: StorageConfig,
}

/// Storage backend selected by the `type` key of the `[storage]` table.
#[derive(Debug, Clone, serde::Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    S3(S3DriverConfig),
}

impl CliConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let toml_content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&toml_content)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn parse(toml_content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(toml_content)?)
    }
}
