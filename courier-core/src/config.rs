use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CourierConfig {
    pub service: ServiceSection,
    pub paths: PathsSection,
    pub fetch: FetchSection,
    pub storage: StorageSection,
    pub stream: StreamSection,
    pub index: IndexSection,
    pub limits: LimitsSection,
}

impl CourierConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    /// Cross-field checks that TOML deserialization cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.stream.max_polls == 0 {
            return Err(ConfigError::Invalid {
                field: "stream.max_polls",
                reason: "must be greater than zero".into(),
            });
        }
        if self.limits.max_concurrent_downloads == 0 {
            return Err(ConfigError::Invalid {
                field: "limits.max_concurrent_downloads",
                reason: "must be greater than zero".into(),
            });
        }
        if self.limits.max_concurrent_uploads == 0 {
            return Err(ConfigError::Invalid {
                field: "limits.max_concurrent_uploads",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSection {
    pub node_name: String,
    pub environment: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub staging_dir: String,
    pub logs_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchSection {
    pub user_agent: String,
    pub request_timeout_seconds: u64,
    pub extra_allowed_extensions: Vec<String>,
    pub probe_command: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    pub endpoint: String,
    pub bucket: String,
    pub public_base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamSection {
    pub enabled: bool,
    pub endpoint: String,
    pub poll_interval_seconds: u64,
    pub max_polls: u32,
}

impl StreamSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexSection {
    pub endpoint: String,
    pub video_index: String,
    pub post_index: String,
    pub course_index: String,
    pub find_retries: u32,
    pub find_retry_delay_ms: u64,
}

impl IndexSection {
    pub fn find_retry_delay(&self) -> Duration {
        Duration::from_millis(self.find_retry_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    pub max_concurrent_downloads: usize,
    pub max_concurrent_uploads: usize,
    pub max_asset_size_mb: u64,
}

pub fn load_courier_config<P: AsRef<Path>>(path: P) -> Result<CourierConfig> {
    let config: CourierConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/courier.toml");
        let config = load_courier_config(path).expect("config should parse");
        assert_eq!(config.service.node_name, "courier-primary");
        assert_eq!(config.stream.poll_interval(), Duration::from_secs(2));
        assert!(config.stream.max_polls >= 100);
        assert!(config.limits.max_concurrent_downloads >= 1);
    }

    #[test]
    fn rejects_zero_poll_budget() {
        let raw = std::fs::read_to_string(
            Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/courier.toml"),
        )
        .unwrap();
        let mut config: CourierConfig = toml::from_str(&raw).unwrap();
        config.stream.max_polls = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field, .. } if field == "stream.max_polls"));
    }
}
