use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::crawler::fetcher::BOT_USER_AGENT;

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CrawlerConfig {
    pub crawler: CrawlSettings,
    pub scheduler: SchedulerSettings,
    pub storage: StorageSettings,
    pub classifier: ClassifierSettings,
    pub server: ServerSettings,
    pub update: UpdateSettings,
}

/// Frontier traversal settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CrawlSettings {
    /// Maximum crawl depth below a seed
    pub max_depth: u32,

    /// Depths strictly below this threshold spider external links ("hub" pages)
    pub hub_depth: u32,

    /// Cap on non-structural internal links queued per page
    pub body_link_cap: usize,

    /// Cap on external links considered per hub page
    pub external_link_cap: usize,

    /// Hostname suffix external links must match to be spidered
    pub country_tld: String,

    /// Hostname fragments of large platforms excluded from spidering
    pub domain_blocklist: Vec<String>,

    pub user_agent: String,
}

/// Rate limiter settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SchedulerSettings {
    /// Maximum concurrently executing tasks
    pub max_concurrent: usize,

    /// Minimum milliseconds between task starts
    pub min_interval_ms: u64,
}

/// Corpus storage settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StorageSettings {
    pub data_dir: PathBuf,
}

/// Classifier endpoint settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ClassifierSettings {
    pub enabled: bool,
    pub api_url: String,
    pub model: String,
}

/// Control API server settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Re-crawl settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UpdateSettings {
    /// Records older than this many days are considered stale
    pub stale_after_days: i64,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            crawler: CrawlSettings {
                max_depth: 2,
                hub_depth: 1,
                body_link_cap: 5,
                external_link_cap: 5,
                country_tld: ".de".to_string(),
                domain_blocklist: vec![
                    "facebook.com".to_string(),
                    "twitter.com".to_string(),
                    "instagram.com".to_string(),
                    "youtube.com".to_string(),
                    "linkedin.com".to_string(),
                    "google.com".to_string(),
                    "apple.com".to_string(),
                    "adobe.com".to_string(),
                    "cloudflare.com".to_string(),
                ],
                user_agent: BOT_USER_AGENT.to_string(),
            },
            scheduler: SchedulerSettings {
                max_concurrent: 5,
                min_interval_ms: 500,
            },
            storage: StorageSettings {
                data_dir: PathBuf::from("./data/cities"),
            },
            classifier: ClassifierSettings {
                enabled: true,
                api_url: "http://localhost:11434/api/generate".to_string(),
                model: "llama3.2:3b".to_string(),
            },
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            update: UpdateSettings { stale_after_days: 3 },
        }
    }
}

impl CrawlerConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        let path = if let Some(proj_dirs) =
            directories::ProjectDirs::from("com", "evolvimus", "ese-crawler")
        {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }
        path
    }

    /// Load the default configuration, creating it on first run
    pub fn load_default() -> Result<Self> {
        let config_path = Self::config_dir().join("default.yaml");

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_as_default()?;
            Ok(config)
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        Ok(config)
    }

    /// Save the configuration as the default
    pub fn save_as_default(&self) -> Result<()> {
        let config_path = Self::config_dir().join("default.yaml");
        self.save_to_file(&config_path)
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents =
            serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }
}
