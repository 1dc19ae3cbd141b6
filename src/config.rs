use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::acquire::AcquisitionOptions;
use crate::domain::Expert;
use crate::error::FivekError;
use crate::index::SplitRatios;
use crate::store::Layout;

pub const DEFAULT_CONFIG_FILE: &str = "fivek.json";
pub const CONFIG_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_ARCHIVE_BASE_URL: &str = "https://data.csail.mit.edu/graphics/fivek/";
pub const DEFAULT_INDEX_BASE_URL: &str =
    "https://huggingface.co/datasets/yuukicammy/MIT-Adobe-FiveK/raw/main/";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub pool_size: Option<usize>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub experts: Option<ExpertsEntry>,
    #[serde(default)]
    pub download: Option<bool>,
    #[serde(default)]
    pub archive_base_url: Option<String>,
    #[serde(default)]
    pub index_base_url: Option<String>,
    #[serde(default)]
    pub train_ratio: Option<f64>,
    #[serde(default)]
    pub val_ratio: Option<f64>,
}

/// `"a,c"` or `["a", "c"]`.
#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ExpertsEntry {
    Shorthand(String),
    List(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub root: Utf8PathBuf,
    pub pool_size: usize,
    pub retries: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
    pub experts: Vec<Expert>,
    pub download: bool,
    pub archive_base_url: String,
    pub index_base_url: String,
    pub ratios: SplitRatios,
}

impl Settings {
    pub fn acquisition_options(&self) -> AcquisitionOptions {
        AcquisitionOptions {
            pool_size: self.pool_size,
            retries: self.retries,
            retry_delay: self.retry_delay,
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// An explicit path must be readable; a missing default file means
    /// built-in defaults.
    pub fn resolve(path: Option<&str>) -> Result<Settings, FivekError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| FivekError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| FivekError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<Settings, FivekError> {
        if let Some(version) = config.schema_version.filter(|v| *v != CONFIG_SCHEMA_VERSION) {
            return Err(FivekError::InvalidConfig(format!(
                "schema_version {version} is not supported (expected {CONFIG_SCHEMA_VERSION})"
            )));
        }

        let root = match config.root {
            Some(root) => expand_home(&root)?,
            None => Layout::new()?.root().to_path_buf(),
        };

        let pool_size = config.pool_size.unwrap_or(4);
        if pool_size == 0 {
            return Err(FivekError::InvalidConfig(
                "pool_size must be at least 1".to_string(),
            ));
        }

        let timeout_secs = config.timeout_secs.unwrap_or(60);
        if timeout_secs == 0 {
            return Err(FivekError::InvalidConfig(
                "timeout_secs must be at least 1".to_string(),
            ));
        }

        let experts = match config.experts {
            None => Vec::new(),
            Some(ExpertsEntry::Shorthand(value)) => parse_experts(&value)?,
            Some(ExpertsEntry::List(values)) => values
                .iter()
                .map(|value| value.parse())
                .collect::<Result<Vec<Expert>, FivekError>>()?,
        };

        let archive_base_url = validate_url(
            config
                .archive_base_url
                .unwrap_or_else(|| DEFAULT_ARCHIVE_BASE_URL.to_string()),
        )?;
        let index_base_url = validate_url(
            config
                .index_base_url
                .unwrap_or_else(|| DEFAULT_INDEX_BASE_URL.to_string()),
        )?;

        let defaults = SplitRatios::default();
        let ratios = SplitRatios {
            train: config.train_ratio.unwrap_or(defaults.train),
            val: config.val_ratio.unwrap_or(defaults.val),
        };
        ratios.validate()?;

        Ok(Settings {
            root,
            pool_size,
            retries: config.retries.unwrap_or(5),
            retry_delay: Duration::from_millis(config.retry_delay_ms.unwrap_or(200)),
            timeout: Duration::from_secs(timeout_secs),
            experts,
            download: config.download.unwrap_or(false),
            archive_base_url,
            index_base_url,
            ratios,
        })
    }
}

/// Parses a comma-separated expert list such as `a,c,e`; duplicates collapse.
pub fn parse_experts(value: &str) -> Result<Vec<Expert>, FivekError> {
    let mut experts = value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::parse)
        .collect::<Result<Vec<Expert>, FivekError>>()?;
    experts.sort();
    experts.dedup();
    Ok(experts)
}

fn validate_url(url: String) -> Result<String, FivekError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(url)
    } else {
        Err(FivekError::InvalidConfig(format!("not an http(s) url: {url}")))
    }
}

fn expand_home(path: &str) -> Result<Utf8PathBuf, FivekError> {
    let Some(rest) = path.strip_prefix("~/") else {
        return Ok(Utf8PathBuf::from(path));
    };
    BaseDirs::new()
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.home_dir().join(rest)).ok())
        .ok_or_else(|| FivekError::InvalidConfig(format!("cannot expand {path}")))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_config_shorthand() {
        let config = Config {
            root: Some("/data/fivek".to_string()),
            experts: Some(ExpertsEntry::Shorthand("c, a,c".to_string())),
            ..Config::default()
        };

        let settings = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(settings.root, "/data/fivek");
        assert_eq!(settings.experts, vec![Expert::A, Expert::C]);
        assert_eq!(settings.pool_size, 4);
        assert_eq!(settings.retries, 5);
        assert!(!settings.download);
        assert_eq!(settings.archive_base_url, DEFAULT_ARCHIVE_BASE_URL);
    }

    #[test]
    fn unknown_schema_version_is_rejected() {
        let config = Config {
            schema_version: Some(2),
            root: Some("/data/fivek".to_string()),
            ..Config::default()
        };
        assert_matches!(
            ConfigLoader::resolve_config(config),
            Err(FivekError::InvalidConfig(message)) if message.contains("schema_version 2")
        );

        let current = Config {
            schema_version: Some(CONFIG_SCHEMA_VERSION),
            root: Some("/data/fivek".to_string()),
            ..Config::default()
        };
        assert!(ConfigLoader::resolve_config(current).is_ok());
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        let config = Config {
            root: Some("/data/fivek".to_string()),
            pool_size: Some(0),
            ..Config::default()
        };
        assert_matches!(
            ConfigLoader::resolve_config(config),
            Err(FivekError::InvalidConfig(_))
        );
    }

    #[test]
    fn ratios_must_fit() {
        let config = Config {
            root: Some("/data/fivek".to_string()),
            train_ratio: Some(0.95),
            val_ratio: Some(0.1),
            ..Config::default()
        };
        assert_matches!(
            ConfigLoader::resolve_config(config),
            Err(FivekError::InvalidConfig(_))
        );
    }
}
