// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Replay configuration.
//!
//! A TOML file with three optional tables:
//!
//! ```toml
//! [state]
//! file = "s3://connected-vehicle-datasource/100.csv"
//! time_col_name = "Timestamp(ms)"
//! time_scale = 1000.0
//! timestamp_offset = "yesterday"
//!
//! [driver]
//! reconnect_grace_secs = 10.0
//!
//! [source]
//! cache_dir = "/var/cache/telemetry"
//! region = "eu-west-1"
//! ```
//!
//! `s3://` sources are downloaded with the AWS credential chain unless
//! `[source] object_endpoint` names a plain URL template instead.

use crate::driver::DriverConfig;
use crate::source::CachedResolver;
use crate::state::{ProcessState, StateError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid state: {0}")]
    State(#[from] StateError),
}

/// Where source files come from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Cache directory. Overrides `state.local_dir` when set.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// AWS region for `s3://` downloads. Taken from the environment when unset.
    #[serde(default)]
    pub region: Option<String>,

    /// Unsigned object URL template with `{bucket}` and `{key}` placeholders,
    /// used instead of the AWS SDK when set.
    #[serde(default)]
    pub object_endpoint: Option<String>,
}

/// Replay configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Initial process state.
    #[serde(default)]
    pub state: ProcessState,

    /// Driver tuning.
    #[serde(default)]
    pub driver: DriverConfig,

    /// Source resolution.
    #[serde(default)]
    pub source: SourceConfig,
}

impl ReplayConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.state.validate()?;
        self.driver.validate().map_err(ConfigError::Invalid)?;

        if let Some(endpoint) = &self.source.object_endpoint {
            if !endpoint.contains("{key}") {
                return Err(ConfigError::Invalid(format!(
                    "object_endpoint '{}' has no {{key}} placeholder",
                    endpoint
                )));
            }
        }
        Ok(())
    }

    /// Example configuration replaying a vehicle trip from object storage.
    pub fn example() -> Self {
        Self {
            state: ProcessState {
                file: "s3://connected-vehicle-datasource/100.csv".into(),
                record_separator: ",".into(),
                quote_records: false,
                time_col_name: "Timestamp(ms)".into(),
                timestamp_offset: 0.0,
                time_scale: 1000.0,
                at_end: crate::cursor::EndPolicy::Repeat,
                ..Default::default()
            },
            driver: DriverConfig::default(),
            source: SourceConfig {
                cache_dir: Some(PathBuf::from("/tmp/telemetry-cache")),
                ..Default::default()
            },
        }
    }

    /// Serialize as pretty TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Cache directory in effect.
    pub fn cache_dir(&self) -> PathBuf {
        self.source
            .cache_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(&self.state.local_dir))
    }

    /// Source resolver for this configuration.
    pub fn resolver(&self) -> CachedResolver {
        let resolver = CachedResolver::new(self.cache_dir());

        #[cfg(feature = "s3")]
        let resolver = match &self.source.object_endpoint {
            Some(endpoint) => {
                resolver.with_fetcher(crate::source::HttpObjectFetcher::new(endpoint.clone()))
            }
            None => {
                let fetcher = crate::source::S3ObjectFetcher::new();
                match &self.source.region {
                    Some(region) => resolver.with_fetcher(fetcher.with_region(region.clone())),
                    None => resolver.with_fetcher(fetcher),
                }
            }
        };

        resolver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::EndPolicy;
    use crate::payload::PayloadStrategy;
    use crate::publisher::Qos;
    use crate::source::{SourceResolver, SourceUri};
    use tempfile::tempdir;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = ReplayConfig::from_toml_str("").expect("parse");
        assert_eq!(config.state.record_separator, ";");
        assert_eq!(config.state.payload_strategy, PayloadStrategy::UntimedDynamicLabelled);
        assert_eq!(config.state.message_publish_rate, Some(10.0));
        assert_eq!(config.driver, DriverConfig::default());
        assert_eq!(config.source, SourceConfig::default());
    }

    #[test]
    fn test_parse_full_file() {
        let config = ReplayConfig::from_toml_str(
            r#"
            [state]
            file = "s3://bucket/trips/100.csv"
            record_separator = ","
            quote_records = false
            time_col_name = "Timestamp(ms)"
            time_scale = 1000.0
            timestamp_offset = 0
            payload_strategy = "SimpleLabelledPayload"
            ignore_columns = []
            topic_name = "dt/cvra/{deviceid}/cardata"
            message_publish_rate = "source"
            at_end = "repeat"
            deviceid = "car-1"
            vin = "1HGCM82633A004352"

            [driver]
            qos = "at_most_once"
            reconnect_grace_secs = 2.5

            [source]
            cache_dir = "/srv/cache"
            region = "eu-west-1"
            "#,
        )
        .expect("parse");

        assert_eq!(config.state.file, "s3://bucket/trips/100.csv");
        assert_eq!(config.state.payload_strategy, PayloadStrategy::Passthrough);
        assert_eq!(config.state.message_publish_rate, None);
        assert_eq!(config.state.at_end, EndPolicy::Repeat);
        assert_eq!(config.state.extra["vin"], "1HGCM82633A004352");
        assert_eq!(config.driver.qos, Qos::AtMostOnce);
        assert_eq!(config.driver.reconnect_grace_secs, 2.5);
        assert_eq!(config.driver.empty_backoff_secs, 30.0);
        assert_eq!(config.cache_dir(), PathBuf::from("/srv/cache"));
        assert_eq!(config.source.region.as_deref(), Some("eu-west-1"));
        assert_eq!(config.source.object_endpoint, None);
    }

    #[test]
    fn test_invalid_files_rejected() {
        assert!(matches!(
            ReplayConfig::from_toml_str("[state]\ntopic_name = \"t/{vin}\""),
            Err(ConfigError::State(_))
        ));
        assert!(matches!(
            ReplayConfig::from_toml_str("[driver]\ndrain_grace_secs = -1.0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ReplayConfig::from_toml_str("[source]\nobject_endpoint = \"https://example.com\""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ReplayConfig::from_toml_str("[state\n"),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn test_example_round_trips() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("replay.toml");

        let example = ReplayConfig::example();
        std::fs::write(&path, example.to_toml().expect("serialize")).expect("write");

        let loaded = ReplayConfig::from_file(&path).expect("load");
        assert_eq!(loaded, example);
    }

    #[test]
    fn test_cache_dir_defaults_to_local_dir() {
        let config = ReplayConfig::default();
        assert_eq!(config.cache_dir(), PathBuf::from("."));
        assert_eq!(config.resolver().local_dir(), Path::new("."));
    }

    #[test]
    fn test_cached_object_resolves_without_download() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("100.csv"), "t\n1\n").expect("write");

        let config = ReplayConfig {
            source: SourceConfig {
                cache_dir: Some(dir.path().to_path_buf()),
                ..Default::default()
            },
            ..Default::default()
        };
        let uri = SourceUri::parse("s3://connected-vehicle-datasource/100.csv").expect("parse");
        assert_eq!(
            config.resolver().resolve(&uri).expect("cache hit"),
            dir.path().join("100.csv")
        );
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            ReplayConfig::from_file("/nonexistent/replay.toml"),
            Err(ConfigError::Io(_))
        ));
    }
}
