use std::time::Duration;

use regstore_core::{DriverError, DriverResult};

use crate::backend::{MAX_PART_SIZE, MIN_PART_SIZE};

pub const DEFAULT_CHUNK_SIZE: u64 = 2 * MIN_PART_SIZE;

/// Regions S3 serves from, as accepted by the `region` option.
const KNOWN_REGIONS: &[&str] = &[
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
    "us-gov-west-1",
    "us-gov-east-1",
    "ca-central-1",
    "sa-east-1",
    "eu-west-1",
    "eu-west-2",
    "eu-west-3",
    "eu-central-1",
    "eu-north-1",
    "eu-south-1",
    "ap-east-1",
    "ap-south-1",
    "ap-northeast-1",
    "ap-northeast-2",
    "ap-northeast-3",
    "ap-southeast-1",
    "ap-southeast-2",
    "me-south-1",
    "af-south-1",
    "cn-north-1",
    "cn-northwest-1",
];

/// Regions that reject anything but signature version 4.
const V4_ONLY_REGIONS: &[&str] = &[
    "us-east-2",
    "us-gov-east-1",
    "ca-central-1",
    "eu-west-2",
    "eu-west-3",
    "eu-central-1",
    "eu-north-1",
    "eu-south-1",
    "ap-east-1",
    "ap-south-1",
    "ap-northeast-2",
    "ap-northeast-3",
    "me-south-1",
    "af-south-1",
    "cn-north-1",
    "cn-northwest-1",
];

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct S3DriverConfig {
    /// Empty means the ambient credential chain (env, profile, instance role).
    #[serde(default, alias = "accessKey", alias = "accesskey")]
    pub access_key: String,
    #[serde(default, alias = "secretKey", alias = "secretkey")]
    pub secret_key: String,
    #[serde(default)]
    pub region: String,
    /// Endpoint of an S3-compatible server; relaxes region checks.
    #[serde(default, alias = "regionEndpoint", alias = "regionendpoint")]
    pub region_endpoint: Option<String>,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub encrypt: bool,
    #[serde(default = "default_true")]
    pub secure: bool,
    #[serde(default, alias = "signatureVersion4", alias = "v4auth")]
    pub signature_version4: bool,
    #[serde(
        default = "default_chunk_size",
        alias = "chunkSize",
        alias = "chunksize"
    )]
    pub chunk_size: u64,
    #[serde(default, alias = "rootDirectory", alias = "rootdirectory")]
    pub root_directory: String,
    #[serde(default, alias = "pathStyle")]
    pub path_style: bool,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

fn default_true() -> bool {
    true
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

impl S3DriverConfig {
    /// Minimal configuration for `bucket` in `region`; everything else at
    /// its default.
    pub fn new(region: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            access_key: String::new(),
            secret_key: String::new(),
            region: region.into(),
            region_endpoint: None,
            bucket: bucket.into(),
            encrypt: false,
            secure: true,
            signature_version4: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            root_directory: String::new(),
            path_style: false,
            request_timeout_secs: None,
        }
    }

    /// Checks every field and returns the parameters the driver runs with,
    /// or one error listing everything that is wrong.
    pub fn validate(&self) -> DriverResult<DriverParameters> {
        let mut problems = Vec::new();

        let region = self.region.trim();
        let endpoint = self
            .region_endpoint
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty());
        if region.is_empty() {
            problems.push("no region parameter provided".to_string());
        } else if endpoint.is_none() {
            if !KNOWN_REGIONS.contains(&region) {
                problems.push(format!("invalid region provided: {region}"));
            } else if !self.signature_version4 && V4_ONLY_REGIONS.contains(&region) {
                problems.push(format!(
                    "the {region} region only works with signature version 4"
                ));
            }
        }

        if self.bucket.trim().is_empty() {
            problems.push("no bucket parameter provided".to_string());
        }

        if self.chunk_size < MIN_PART_SIZE {
            problems.push(format!(
                "chunk_size {} must be larger than or equal to {MIN_PART_SIZE}",
                self.chunk_size
            ));
        } else if self.chunk_size > MAX_PART_SIZE {
            problems.push(format!(
                "chunk_size {} must be smaller than or equal to {MAX_PART_SIZE}",
                self.chunk_size
            ));
        }
        let chunk_size = usize::try_from(self.chunk_size).unwrap_or_else(|_| {
            problems.push(format!(
                "chunk_size {} does not fit in memory on this platform",
                self.chunk_size
            ));
            0
        });

        if self.access_key.is_empty() != self.secret_key.is_empty() {
            problems.push("access_key and secret_key must be provided together".to_string());
        }

        if self.request_timeout_secs == Some(0) {
            problems.push("request_timeout_secs must be positive".to_string());
        }

        if !problems.is_empty() {
            return Err(DriverError::InvalidConfiguration(problems));
        }

        Ok(DriverParameters {
            access_key: non_empty(&self.access_key),
            secret_key: non_empty(&self.secret_key),
            region: region.to_string(),
            region_endpoint: endpoint.map(str::to_string),
            bucket: self.bucket.trim().to_string(),
            encrypt: self.encrypt,
            secure: self.secure,
            signature_version4: self.signature_version4,
            chunk_size,
            root_directory: self.root_directory.clone(),
            path_style: self.path_style,
            request_timeout: self.request_timeout_secs.map(Duration::from_secs),
        })
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Validated, immutable driver parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverParameters {
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub region: String,
    pub region_endpoint: Option<String>,
    pub bucket: String,
    pub encrypt: bool,
    pub secure: bool,
    pub signature_version4: bool,
    pub chunk_size: usize,
    pub root_directory: String,
    pub path_style: bool,
    pub request_timeout: Option<Duration>,
}
