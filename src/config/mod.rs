mod polling;
mod raw;
mod settings;

use std::io;
use std::path::Path;

use thiserror::Error;
use tracing::info;

use self::raw::RawConfig;
use crate::retry::RetryPolicy;

pub(crate) use self::polling::PollingConfig;
pub use self::raw::ConfigParseError;
pub use self::settings::AutoFallback;
pub(crate) use self::settings::{BuildSettings, ExecutionSettings};

#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub namespace: Option<String>,
    pub concurrency: u16,
    pub polling: PollingConfig,
    pub retry: RetryPolicy,
    pub build: BuildSettings,
    pub execution: ExecutionSettings,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            namespace: None,
            concurrency: 8,
            polling: PollingConfig::default(),
            retry: RetryPolicy::default(),
            build: BuildSettings::default(),
            execution: ExecutionSettings::default(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("Failed to read config file '{path}': {source}")]
    Read { path: String, source: io::Error },

    #[error("Failed to parse config file '{path}': {source}")]
    Yaml {
        path: String,
        source: serde_yaml::Error,
    },

    #[error("Invalid config file '{path}': {source}")]
    Invalid {
        path: String,
        source: ConfigParseError,
    },
}

impl Config {
    /// Loads the YAML config. A missing file means every setting keeps its default.
    pub async fn new_from_file(path: &Path) -> Result<Config, ConfigLoadError> {
        let path_display = path.display().to_string();
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("Config file {} not found, using defaults.", path_display);
                return Ok(Config::default());
            }
            Err(source) => {
                return Err(ConfigLoadError::Read {
                    path: path_display,
                    source,
                });
            }
        };
        Self::from_yaml(&text).map_err(|e| match e {
            FromYamlError::Yaml(source) => ConfigLoadError::Yaml {
                path: path_display.clone(),
                source,
            },
            FromYamlError::Invalid(source) => ConfigLoadError::Invalid {
                path: path_display.clone(),
                source,
            },
        })
    }

    fn from_yaml(text: &str) -> Result<Config, FromYamlError> {
        // an empty document is a null, not an empty mapping
        let raw: RawConfig = if text.trim().is_empty() {
            serde_yaml::from_str("{}")?
        } else {
            serde_yaml::from_str(text)?
        };
        Ok(Config::try_from(raw)?)
    }
}

#[derive(Error, Debug)]
enum FromYamlError {
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Invalid(#[from] ConfigParseError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[tokio::test]
    async fn test_missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new_from_file(&dir.path().join("absent.yaml"))
            .await
            .unwrap();
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.polling.build_poll_interval, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "concurrency: 2\nretry:\n  max_retries: 4").unwrap();

        let config = Config::new_from_file(file.path()).await.unwrap();
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.retry.max_retries, 4);
        assert_eq!(config.retry.backoff, RetryPolicy::default().backoff);
    }

    #[tokio::test]
    async fn test_empty_file_means_defaults() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = Config::new_from_file(file.path()).await.unwrap();
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[tokio::test]
    async fn test_errors_name_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "concurrency: [not, a, number]").unwrap();
        let err = Config::new_from_file(file.path()).await.unwrap_err();
        assert!(matches!(err, ConfigLoadError::Yaml { .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "concurrency: 0").unwrap();
        let err = Config::new_from_file(file.path()).await.unwrap_err();
        assert!(matches!(
            err,
            ConfigLoadError::Invalid {
                source: ConfigParseError::ZeroConcurrency,
                ..
            }
        ));
    }
}
