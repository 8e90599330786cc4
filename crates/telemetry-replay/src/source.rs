// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Source URI resolution.
//!
//! Turns a configured file URI into a local path the record cursor can open:
//! - bare paths are used as-is
//! - `file://<path>` is looked up in the local cache directory first, then
//!   taken as an absolute path
//! - `s3://<bucket>/<key>` is looked up in the local cache directory and
//!   fetched through an [`ObjectFetcher`] only on a cache miss
//!
//! With the `s3` feature, [`S3ObjectFetcher`] downloads with the default AWS
//! credential chain and [`HttpObjectFetcher`] issues plain GETs against an
//! endpoint template.

use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Public S3 endpoint template (`{bucket}` and `{key}` are substituted).
pub const DEFAULT_OBJECT_ENDPOINT: &str = "https://{bucket}.s3.amazonaws.com/{key}";

/// Source resolution errors.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Invalid source URI: {0}")]
    InvalidUri(String),

    #[error("Unsupported URI scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Source unavailable: {uri} ({reason})")]
    Unavailable { uri: String, reason: String },

    #[error("Source has no header line: {0}")]
    Empty(PathBuf),

    #[error("Unreadable header in {path}: {reason}")]
    Header { path: PathBuf, reason: String },

    #[error("Object fetch failed: {0}")]
    Fetch(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed source URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceUri {
    /// Plain filesystem path, no scheme.
    Path(PathBuf),
    /// `file://` URI; `key` is the path with leading slashes removed.
    File { key: String },
    /// Remote object, e.g. `s3://bucket/key`.
    Object {
        scheme: String,
        bucket: String,
        key: String,
    },
}

impl SourceUri {
    /// Parse a source URI.
    pub fn parse(uri: &str) -> Result<Self, SourceError> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(SourceError::InvalidUri("empty URI".into()));
        }

        let Some((scheme, rest)) = uri.split_once("://") else {
            return Ok(Self::Path(PathBuf::from(uri)));
        };

        match scheme {
            "file" => {
                let key = rest.trim_start_matches('/');
                if key.is_empty() {
                    return Err(SourceError::InvalidUri(uri.to_string()));
                }
                Ok(Self::File { key: key.to_string() })
            }
            "s3" => {
                let (bucket, key) = rest
                    .split_once('/')
                    .ok_or_else(|| SourceError::InvalidUri(uri.to_string()))?;
                if bucket.is_empty() || key.is_empty() {
                    return Err(SourceError::InvalidUri(uri.to_string()));
                }
                Ok(Self::Object {
                    scheme: scheme.to_string(),
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
            }
            other => Err(SourceError::UnsupportedScheme(other.to_string())),
        }
    }

    /// Key used to look the source up in the local cache directory.
    pub fn cache_key(&self) -> Option<&str> {
        match self {
            Self::Path(_) => None,
            Self::File { key } | Self::Object { key, .. } => Some(key),
        }
    }
}

impl fmt::Display for SourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::File { key } => write!(f, "file:///{}", key),
            Self::Object {
                scheme,
                bucket,
                key,
            } => write!(f, "{}://{}/{}", scheme, bucket, key),
        }
    }
}

/// Resolves a source URI to local byte content on disk.
pub trait SourceResolver: Send {
    /// Resolve `uri` to a readable local path.
    fn resolve(&self, uri: &SourceUri) -> Result<PathBuf, SourceError>;
}

/// Downloads a remote object into a local file.
pub trait ObjectFetcher: Send {
    /// Fetch `bucket`/`key` and write it to `dest`.
    fn fetch(&self, bucket: &str, key: &str, dest: &Path) -> Result<(), SourceError>;
}

/// Resolver backed by a local cache directory.
pub struct CachedResolver {
    local_dir: PathBuf,
    fetcher: Option<Box<dyn ObjectFetcher>>,
}

impl CachedResolver {
    /// Create a resolver without remote fetch support.
    pub fn new<P: AsRef<Path>>(local_dir: P) -> Self {
        Self {
            local_dir: local_dir.as_ref().to_path_buf(),
            fetcher: None,
        }
    }

    /// Attach an object fetcher for remote URIs.
    pub fn with_fetcher(mut self, fetcher: impl ObjectFetcher + 'static) -> Self {
        self.fetcher = Some(Box::new(fetcher));
        self
    }

    /// Cache directory.
    pub fn local_dir(&self) -> &Path {
        &self.local_dir
    }

    /// Path a cached object with the given key lives at.
    pub fn cache_path(&self, key: &str) -> PathBuf {
        self.local_dir.join(key)
    }
}

impl SourceResolver for CachedResolver {
    fn resolve(&self, uri: &SourceUri) -> Result<PathBuf, SourceError> {
        let unavailable = |reason: &str| SourceError::Unavailable {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };

        match uri {
            SourceUri::Path(path) => {
                if path.is_file() {
                    Ok(path.clone())
                } else {
                    Err(unavailable("no such file"))
                }
            }
            SourceUri::File { key } => {
                let cached = self.cache_path(key);
                if cached.is_file() {
                    return Ok(cached);
                }
                let absolute = Path::new("/").join(key);
                if absolute.is_file() {
                    Ok(absolute)
                } else {
                    Err(unavailable("not in cache directory and no such file"))
                }
            }
            SourceUri::Object { bucket, key, .. } => {
                let cached = self.cache_path(key);
                if cached.is_file() {
                    tracing::debug!("Cache hit for {} at {}", uri, cached.display());
                    return Ok(cached);
                }

                let fetcher = self
                    .fetcher
                    .as_ref()
                    .ok_or_else(|| unavailable("remote fetch not configured"))?;

                if let Some(parent) = cached.parent() {
                    std::fs::create_dir_all(parent)?;
                }

                tracing::info!("Fetching {} into {}", uri, cached.display());
                fetcher.fetch(bucket, key, &cached)?;
                Ok(cached)
            }
        }
    }
}

/// Write a downloaded object next to `dest`, then move it into place so a
/// partial download never looks cached.
#[cfg(feature = "s3")]
fn store_object(dest: &Path, body: &[u8]) -> Result<(), SourceError> {
    let partial = dest.with_extension("partial");
    std::fs::write(&partial, body)?;
    std::fs::rename(&partial, dest)?;
    Ok(())
}

/// S3 object fetcher using the default AWS credential and region chain.
///
/// Each fetch runs on its own current-thread runtime; fetches only happen on
/// a cache miss.
#[cfg(feature = "s3")]
#[derive(Debug, Clone, Default)]
pub struct S3ObjectFetcher {
    region: Option<String>,
}

#[cfg(feature = "s3")]
impl S3ObjectFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the region from the environment.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    async fn download(&self, bucket: &str, key: &str) -> Result<Vec<u8>, SourceError> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &self.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        let client = aws_sdk_s3::Client::new(&loader.load().await);

        let output = client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                SourceError::Fetch(format!(
                    "s3://{}/{}: {}",
                    bucket,
                    key,
                    aws_sdk_s3::error::DisplayErrorContext(e)
                ))
            })?;
        let body = output
            .body
            .collect()
            .await
            .map_err(|e| SourceError::Fetch(format!("s3://{}/{}: {}", bucket, key, e)))?;
        Ok(body.to_vec())
    }
}

#[cfg(feature = "s3")]
impl ObjectFetcher for S3ObjectFetcher {
    fn fetch(&self, bucket: &str, key: &str, dest: &Path) -> Result<(), SourceError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let body = runtime.block_on(self.download(bucket, key))?;
        store_object(dest, &body)
    }
}

/// Plain HTTPS object fetcher.
///
/// Issues an unsigned GET against the endpoint template, so it only reaches
/// objects readable without credentials.
#[cfg(feature = "s3")]
pub struct HttpObjectFetcher {
    client: reqwest::blocking::Client,
    endpoint: String,
}

#[cfg(feature = "s3")]
impl HttpObjectFetcher {
    /// Create a fetcher for the given endpoint template.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    /// URL an object is fetched from.
    pub fn object_url(&self, bucket: &str, key: &str) -> String {
        self.endpoint
            .replace("{bucket}", bucket)
            .replace("{key}", key)
    }
}

#[cfg(feature = "s3")]
impl Default for HttpObjectFetcher {
    fn default() -> Self {
        Self::new(DEFAULT_OBJECT_ENDPOINT)
    }
}

#[cfg(feature = "s3")]
impl ObjectFetcher for HttpObjectFetcher {
    fn fetch(&self, bucket: &str, key: &str, dest: &Path) -> Result<(), SourceError> {
        let url = self.object_url(bucket, key);
        let response = self
            .client
            .get(&url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| SourceError::Fetch(format!("{}: {}", url, e)))?;
        let body = response
            .bytes()
            .map_err(|e| SourceError::Fetch(format!("{}: {}", url, e)))?;

        store_object(dest, &body)
    }
}
