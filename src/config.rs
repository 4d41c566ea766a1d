use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::gitlab::{Credentials, RetryPolicy, DEFAULT_PER_PAGE};
use crate::retrieval::{RetrievalOptions, DEFAULT_CONCURRENCY};
use crate::store::BinaryPolicy;

pub const CONFIG_FILE: &str = ".mr-diff-fetcher.toml";
pub const DEFAULT_BASE_URL: &str = "https://gitlab.com/api/v4";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("GitLab token not found: set GITLAB_TOKEN or gitlab.token")]
    MissingToken,

    #[error("PROJECT_ID environment variable not set")]
    MissingProjectId,

    #[error("DOWNLOAD_PATH environment variable not set")]
    MissingDownloadPath,

    #[error("Invalid GitLab base URL: {0}")]
    InvalidBaseUrl(String),
}

/// Top-level configuration loaded from .mr-diff-fetcher.toml.
/// All fields are optional; the environment supplies the rest.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gitlab: GitLabConfig,

    #[serde(default)]
    pub download: DownloadConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Clone, Default, Deserialize)]
pub struct GitLabConfig {
    /// API root or instance URL. Overridden by GITLAB_URL.
    pub base_url: Option<String>,
    /// Access token. Overridden by GITLAB_TOKEN.
    pub token: Option<String>,
    /// Default project. Overridden by PROJECT_ID.
    pub project_id: Option<String>,
    pub per_page: Option<u32>,
    pub request_timeout_secs: Option<u64>,
}

impl std::fmt::Debug for GitLabConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitLabConfig")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("project_id", &self.project_id)
            .field("per_page", &self.per_page)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DownloadConfig {
    /// Root for materialized diffs. Overridden by DOWNLOAD_PATH.
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub preserve_extra_files: bool,
    #[serde(default)]
    pub binary_files: BinaryPolicy,
    pub write_manifest: Option<bool>,
    pub fill_truncated: Option<bool>,
    pub concurrency: Option<usize>,
    pub operation_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetryConfig {
    pub rate_limit_attempts: Option<u32>,
    pub network_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

impl Config {
    /// Load configuration from .mr-diff-fetcher.toml in the current directory
    /// (default config if absent), then apply environment overrides.
    pub fn load() -> Result<Config, ConfigError> {
        let path = Path::new(CONFIG_FILE);
        let mut config = if path.exists() {
            Self::load_from(path)?
        } else {
            Config::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from a specific path without consulting the environment.
    pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Environment values win over the file. Empty values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(token) = var("GITLAB_TOKEN") {
            self.gitlab.token = Some(token);
        }
        if let Some(url) = var("GITLAB_URL") {
            self.gitlab.base_url = Some(url);
        }
        if let Some(project) = var("PROJECT_ID") {
            self.gitlab.project_id = Some(project);
        }
        if let Some(path) = var("DOWNLOAD_PATH") {
            self.download.path = Some(PathBuf::from(path));
        }
    }

    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        let token = self.gitlab.token.clone().ok_or(ConfigError::MissingToken)?;
        let project_id = self
            .gitlab
            .project_id
            .clone()
            .ok_or(ConfigError::MissingProjectId)?;
        let base_url = api_root(self.gitlab.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL))?;
        Ok(Credentials {
            base_url,
            token,
            project_id,
        })
    }

    pub fn download_root(&self) -> Result<PathBuf, ConfigError> {
        self.download
            .path
            .clone()
            .ok_or(ConfigError::MissingDownloadPath)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.gitlab.request_timeout_secs.unwrap_or(30))
    }

    pub fn per_page(&self) -> u32 {
        self.gitlab.per_page.unwrap_or(DEFAULT_PER_PAGE)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            rate_limit_attempts: self
                .retry
                .rate_limit_attempts
                .unwrap_or(defaults.rate_limit_attempts)
                .max(1),
            network_attempts: self
                .retry
                .network_attempts
                .unwrap_or(defaults.network_attempts)
                .max(1),
            base_delay: self
                .retry
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: self
                .retry
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
        }
    }

    pub fn retrieval_options(&self) -> RetrievalOptions {
        let defaults = RetrievalOptions::default();
        RetrievalOptions {
            binary_policy: self.download.binary_files,
            preserve_extra_files: self.download.preserve_extra_files,
            write_manifest: self.download.write_manifest.unwrap_or(defaults.write_manifest),
            fill_truncated: self.download.fill_truncated.unwrap_or(defaults.fill_truncated),
            concurrency: self
                .download
                .concurrency
                .unwrap_or(DEFAULT_CONCURRENCY)
                .clamp(1, 32),
            operation_timeout: self
                .download
                .operation_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.operation_timeout),
        }
    }
}

/// Accept either an API root or a bare instance URL; the latter gets `/api/v4`.
fn api_root(raw: &str) -> Result<String, ConfigError> {
    let url = reqwest::Url::parse(raw).map_err(|_| ConfigError::InvalidBaseUrl(raw.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(ConfigError::InvalidBaseUrl(raw.to_string()));
    }
    let trimmed = raw.trim_end_matches('/');
    if url.path() == "/" || url.path().is_empty() {
        Ok(format!("{trimmed}/api/v4"))
    } else {
        Ok(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.gitlab.token.is_none());
        assert!(config.download.path.is_none());
        assert!(matches!(config.credentials(), Err(ConfigError::MissingToken)));
        assert!(matches!(config.download_root(), Err(ConfigError::MissingDownloadPath)));
    }

    #[test]
    fn test_parse_config_toml() {
        let toml_str = r#"
[gitlab]
base_url = "https://gitlab.example.com"
project_id = "group/app"
per_page = 20

[download]
path = "/tmp/reviews"
preserve_extra_files = true
binary_files = "omit"
concurrency = 8

[retry]
rate_limit_attempts = 2
base_delay_ms = 10
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.per_page(), 20);
        assert_eq!(config.download_root().unwrap(), PathBuf::from("/tmp/reviews"));

        let options = config.retrieval_options();
        assert!(options.preserve_extra_files);
        assert_eq!(options.binary_policy, BinaryPolicy::Omit);
        assert_eq!(options.concurrency, 8);
        assert!(options.write_manifest);

        let retry = config.retry_policy();
        assert_eq!(retry.rate_limit_attempts, 2);
        assert_eq!(retry.network_attempts, 3);
        assert_eq!(retry.base_delay, Duration::from_millis(10));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config: Config = toml::from_str(
            r#"
[gitlab]
token = "from-file"
project_id = "1"
"#,
        )
        .unwrap();
        config.apply_env(env(&[
            ("GITLAB_TOKEN", "from-env"),
            ("PROJECT_ID", "42"),
            ("DOWNLOAD_PATH", "/data/diffs"),
            ("GITLAB_URL", ""),
        ]));

        let creds = config.credentials().unwrap();
        assert_eq!(creds.token, "from-env");
        assert_eq!(creds.project_id, "42");
        assert_eq!(creds.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.download_root().unwrap(), PathBuf::from("/data/diffs"));
    }

    #[test]
    fn test_missing_project_id() {
        let mut config = Config::default();
        config.apply_env(env(&[("GITLAB_TOKEN", "t")]));
        assert!(matches!(config.credentials(), Err(ConfigError::MissingProjectId)));
    }

    #[test]
    fn test_api_root_normalization() {
        assert_eq!(api_root("https://gitlab.example.com").unwrap(), "https://gitlab.example.com/api/v4");
        assert_eq!(api_root("https://gitlab.example.com/").unwrap(), "https://gitlab.example.com/api/v4");
        assert_eq!(
            api_root("https://example.com/gitlab/api/v4/").unwrap(),
            "https://example.com/gitlab/api/v4"
        );
        assert!(api_root("ftp://gitlab.example.com").is_err());
        assert!(api_root("not a url").is_err());
    }

    #[test]
    fn test_debug_redacts_token() {
        let mut config = Config::default();
        config.gitlab.token = Some("glpat-secret".to_string());
        assert!(!format!("{:?}", config).contains("glpat-secret"));
    }
}
