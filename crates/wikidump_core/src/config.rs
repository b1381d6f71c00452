use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::extract::PageErrorPolicy;
use crate::retry::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_BACKOFF_SECS, DEFAULT_MIN_BACKOFF_SECS, RetryPolicy,
};

pub const DEFAULT_USER_AGENT: &str = "wikidump/0.1";
pub const DEFAULT_CONTENT_BASE: &str = "confluence_content";
pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const DEFAULT_MAX_PAGES: usize = 1000;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RATE_LIMIT_MS: u64 = 200;

pub const ENV_SITENAME: &str = "ATLASSIAN_SITENAME";
pub const ENV_USERNAME: &str = "ATLASSIAN_USERNAME";
pub const ENV_API_KEY: &str = "ATLASSIAN_API_KEY";
pub const ENV_SPACE_KEY: &str = "ATLASSIAN_SPACE_KEY";
pub const ENV_CONTENT_FOLDER: &str = "CONFLUENCE_CONTENT_FOLDER";
pub const ENV_BACKEND_URL: &str = "BACKEND_URL";
pub const ENV_BACKEND_API_KEY: &str = "BACKEND_API_KEY";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct DumpConfig {
    #[serde(default)]
    pub confluence: ConfluenceSection,
    #[serde(default)]
    pub extract: ExtractSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub upload: UploadSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ConfluenceSection {
    /// Atlassian site name (`acme` for acme.atlassian.net) or a full base URL.
    pub site: Option<String>,
    pub username: Option<String>,
    pub api_token: Option<String>,
    pub space: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
    pub rate_limit_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ExtractSection {
    /// Base folder; the space key is appended as `{content_dir}-{space}`.
    pub content_dir: Option<String>,
    pub include_attachments: Option<bool>,
    pub page_size: Option<usize>,
    pub max_pages: Option<usize>,
    pub on_page_error: Option<PageErrorPolicy>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct RetrySection {
    pub max_attempts: Option<u32>,
    pub min_backoff_secs: Option<u64>,
    pub max_backoff_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct UploadSection {
    pub backend_url: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub site: String,
    pub username: String,
    pub api_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub backend_url: String,
    pub api_key: String,
}

impl DumpConfig {
    /// Overlay environment values on top of the file: env wins over config.
    pub fn apply_env_overrides<F>(&mut self, lookup_env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| {
            lookup_env(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        if let Some(value) = lookup(ENV_SITENAME) {
            self.confluence.site = Some(value);
        }
        if let Some(value) = lookup(ENV_USERNAME) {
            self.confluence.username = Some(value);
        }
        if let Some(value) = lookup(ENV_API_KEY) {
            self.confluence.api_token = Some(value);
        }
        if let Some(value) = lookup(ENV_SPACE_KEY) {
            self.confluence.space = Some(value);
        }
        if let Some(value) = lookup(ENV_CONTENT_FOLDER) {
            self.extract.content_dir = Some(value);
        }
        if let Some(value) = lookup(ENV_BACKEND_URL) {
            self.upload.backend_url = Some(value);
        }
        if let Some(value) = lookup(ENV_BACKEND_API_KEY) {
            self.upload.api_key = Some(value);
        }
    }

    pub fn credentials(&self) -> Result<Credentials> {
        Ok(Credentials {
            site: required(&self.confluence.site, "confluence.site", ENV_SITENAME)?,
            username: required(
                &self.confluence.username,
                "confluence.username",
                ENV_USERNAME,
            )?,
            api_token: required(
                &self.confluence.api_token,
                "confluence.api_token",
                ENV_API_KEY,
            )?,
        })
    }

    /// `https://{site}.atlassian.net/wiki`, or the site value itself when it
    /// is already a URL.
    pub fn base_url(&self) -> Result<String> {
        let site = required(&self.confluence.site, "confluence.site", ENV_SITENAME)?;
        if site.starts_with("http://") || site.starts_with("https://") {
            return Ok(site.trim_end_matches('/').to_string());
        }
        Ok(format!("https://{site}.atlassian.net/wiki"))
    }

    pub fn space_key(&self) -> Option<String> {
        self.confluence.space.clone()
    }

    pub fn user_agent(&self) -> String {
        self.confluence
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn timeout_ms(&self) -> u64 {
        self.confluence.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)
    }

    pub fn rate_limit_ms(&self) -> u64 {
        self.confluence.rate_limit_ms.unwrap_or(DEFAULT_RATE_LIMIT_MS)
    }

    pub fn content_base(&self) -> &str {
        self.extract
            .content_dir
            .as_deref()
            .unwrap_or(DEFAULT_CONTENT_BASE)
    }

    pub fn include_attachments(&self) -> bool {
        self.extract.include_attachments.unwrap_or(false)
    }

    pub fn page_size(&self) -> usize {
        self.extract.page_size.unwrap_or(DEFAULT_PAGE_SIZE)
    }

    pub fn max_pages(&self) -> usize {
        self.extract.max_pages.unwrap_or(DEFAULT_MAX_PAGES)
    }

    pub fn on_page_error(&self) -> PageErrorPolicy {
        self.extract.on_page_error.unwrap_or_default()
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        let policy = RetryPolicy {
            max_attempts: self.retry.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            min_backoff: Duration::from_secs(
                self.retry
                    .min_backoff_secs
                    .unwrap_or(DEFAULT_MIN_BACKOFF_SECS),
            ),
            max_backoff: Duration::from_secs(
                self.retry
                    .max_backoff_secs
                    .unwrap_or(DEFAULT_MAX_BACKOFF_SECS),
            ),
        };
        policy.validate().context("invalid [retry] configuration")?;
        Ok(policy)
    }

    pub fn upload_target(&self) -> Result<UploadTarget> {
        Ok(UploadTarget {
            backend_url: required(
                &self.upload.backend_url,
                "upload.backend_url",
                ENV_BACKEND_URL,
            )?,
            api_key: required(&self.upload.api_key, "upload.api_key", ENV_BACKEND_API_KEY)?,
        })
    }
}

fn required(value: &Option<String>, key: &str, env_key: &str) -> Result<String> {
    match value.as_deref().map(str::trim) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => bail!("{key} is not configured (set it in the config file or via {env_key})"),
    }
}

/// Load and parse a DumpConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<DumpConfig> {
    if !config_path.exists() {
        return Ok(DumpConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: DumpConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}
