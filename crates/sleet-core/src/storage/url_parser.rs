//! URL parsing for storage backends.
//!
//! Extracts backend configuration from S3, GCS, Azure, local filesystem and
//! in-memory URLs.

use object_store::path::Path;
use regex::{Captures, Regex};
use std::sync::LazyLock;

use crate::error::{InvalidUrlSnafu, StorageError};

use super::{AzureConfig, GcsConfig, LocalConfig, MemoryConfig, S3Config};

const S3_PATH: &str =
    r"^https://s3\.(?P<region>[\w\-]+)\.amazonaws\.com/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_VIRTUAL: &str =
    r"^https://(?P<bucket>[a-z0-9\-\.]+)\.s3\.(?P<region>[\w\-]+)\.amazonaws\.com(/(?P<key>.+))?$";
const S3_URL: &str = r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_ENDPOINT_URL: &str = r"^[sS]3[aA]?::(?<protocol>https?)://(?P<endpoint>[^:/]+):(?<port>\d+)/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";

const GCS_VIRTUAL: &str =
    r"^https://(?P<bucket>[a-z0-9\-_\.]+)\.storage\.googleapis\.com(/(?P<key>.+))?$";
const GCS_PATH: &str =
    r"^https://storage\.googleapis\.com/(?P<bucket>[a-z0-9\-_\.]+)(/(?P<key>.+))?$";
const GCS_URL: &str = r"^[gG][sS]://(?P<bucket>[a-z0-9\-\._]+)(/(?P<key>.+))?$";

const ABFS_URL: &str = r"^abfss?://(?P<container>[a-z0-9\-]+)@(?P<account>[a-z0-9]+)\.dfs\.core\.windows\.net(/(?P<key>.+))?$";
const AZURE_HTTPS: &str = r"^https://(?P<account>[a-z0-9]+)\.(blob|dfs)\.core\.windows\.net/(?P<container>[a-z0-9\-]+)(/(?P<key>.+))?$";

const FILE_URI: &str = r"^file://(?P<path>.*)$";
const FILE_URL: &str = r"^file:(?P<path>.*)$";
const FILE_PATH: &str = r"^/(?P<path>.*)$";

const MEMORY_URL: &str = r"^memory://(?P<bucket>[A-Za-z0-9\-_\.]+)(/(?P<key>.+))?$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    S3,
    Gcs,
    Azure,
    Local,
    Memory,
}

static MATCHERS: LazyLock<Vec<(Backend, Vec<Regex>)>> = LazyLock::new(|| {
    let compile = |patterns: &[&str]| -> Vec<Regex> {
        patterns
            .iter()
            .map(|p| Regex::new(p).expect("Invalid regex pattern"))
            .collect()
    };
    vec![
        (
            Backend::S3,
            compile(&[S3_PATH, S3_VIRTUAL, S3_ENDPOINT_URL, S3_URL]),
        ),
        (Backend::Gcs, compile(&[GCS_PATH, GCS_VIRTUAL, GCS_URL])),
        (Backend::Azure, compile(&[ABFS_URL, AZURE_HTTPS])),
        (Backend::Memory, compile(&[MEMORY_URL])),
        (Backend::Local, compile(&[FILE_URI, FILE_URL, FILE_PATH])),
    ]
});

/// Backend configuration enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    S3(S3Config),
    Gcs(GcsConfig),
    Azure(AzureConfig),
    Local(LocalConfig),
    Memory(MemoryConfig),
}

impl BackendConfig {
    /// Parse a URL into a backend configuration.
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        for (backend, patterns) in MATCHERS.iter() {
            if let Some(caps) = patterns.iter().find_map(|r| r.captures(url)) {
                return Ok(match backend {
                    Backend::S3 => Self::parse_s3(&caps),
                    Backend::Gcs => Self::parse_gcs(&caps),
                    Backend::Azure => Self::parse_azure(&caps),
                    Backend::Local => Self::parse_local(&caps),
                    Backend::Memory => Self::parse_memory(&caps),
                });
            }
        }

        InvalidUrlSnafu {
            url: url.to_string(),
        }
        .fail()
    }

    fn parse_s3(caps: &Captures) -> Self {
        let bucket = caps["bucket"].to_string();

        let region = std::env::var("AWS_DEFAULT_REGION")
            .ok()
            .or_else(|| caps.name("region").map(|m| m.as_str().to_string()));

        let endpoint = std::env::var("AWS_ENDPOINT").ok().or_else(|| {
            caps.name("endpoint").map(|endpoint| {
                let port = caps
                    .name("port")
                    .and_then(|p| p.as_str().parse::<u16>().ok())
                    .unwrap_or(443);
                let protocol = caps.name("protocol").map(|p| p.as_str()).unwrap_or("https");
                format!("{protocol}://{}:{port}", endpoint.as_str())
            })
        });

        BackendConfig::S3(S3Config {
            endpoint,
            region,
            bucket,
            key: key_of(caps),
        })
    }

    fn parse_gcs(caps: &Captures) -> Self {
        BackendConfig::Gcs(GcsConfig {
            bucket: caps["bucket"].to_string(),
            key: key_of(caps),
        })
    }

    fn parse_azure(caps: &Captures) -> Self {
        BackendConfig::Azure(AzureConfig {
            account: caps["account"].to_string(),
            container: caps["container"].to_string(),
            key: key_of(caps),
        })
    }

    fn parse_local(caps: &Captures) -> Self {
        let path = &caps["path"];
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        BackendConfig::Local(LocalConfig { path })
    }

    fn parse_memory(caps: &Captures) -> Self {
        BackendConfig::Memory(MemoryConfig {
            bucket: caps["bucket"].to_string(),
            key: key_of(caps),
        })
    }

    /// Key prefix applied to every path, if the URL points below the bucket root.
    pub(crate) fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::S3(s3) => s3.key.as_ref(),
            BackendConfig::Gcs(gcs) => gcs.key.as_ref(),
            BackendConfig::Azure(azure) => azure.key.as_ref(),
            BackendConfig::Memory(memory) => memory.key.as_ref(),
            BackendConfig::Local(_) => None,
        }
    }

    /// URL of the bucket (or container, or local root) holding this location.
    ///
    /// Two locations with the same bucket URL can share one client, and
    /// objects can be renamed between them server-side.
    pub fn bucket_url(&self) -> String {
        match self {
            BackendConfig::S3(s3) => match &s3.endpoint {
                Some(endpoint) => format!("s3::{endpoint}/{}", s3.bucket),
                None => format!("s3://{}", s3.bucket),
            },
            BackendConfig::Gcs(gcs) => format!("gs://{}", gcs.bucket),
            BackendConfig::Azure(azure) => format!(
                "abfss://{}@{}.dfs.core.windows.net",
                azure.container, azure.account
            ),
            BackendConfig::Local(local) => format!("file://{}", local.path),
            BackendConfig::Memory(memory) => format!("memory://{}", memory.bucket),
        }
    }

    /// Whether a client for this backend is worth sharing between locations.
    pub fn is_shareable(&self) -> bool {
        !matches!(self, BackendConfig::Local(_))
    }
}

fn key_of(caps: &Captures) -> Option<Path> {
    caps.name("key").map(|m| Path::from(m.as_str()))
}
