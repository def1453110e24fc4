use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::catalog::CatalogOptions;
use crate::error::{Result, SyncError};
use crate::repository::{InstallLayout, RepositoryLayout, DEFAULT_STAGING_DIR};

const CONFIG_FILE: &str = "config.toml";

/// Default config template with rich comments
const DEFAULT_CONFIG_TEMPLATE: &str = r#"# plugsync configuration file
# Location: ~/.plugsync/config.toml

[repository]
# Base path of the update site (a local or mounted directory)
# Example: url = "/mnt/update-site"
url = ""

# Site id whose files count as "official" in views
# Example: official_site = "core"
# official_site = "core"

[install]
# Root of the live installation
root = "."

# Directory below the root where downloads wait for the next restart
staging_dir = "update"

# Files replaced in place instead of staged (the old copy is kept as .old)
# Example: launchers = ["app-linux64", "app-win64.exe"]
launchers = []

[publisher]
# Your publisher identity; required to upload
# name = "alice"
"#;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub repository: RepositoryConfig,

    #[serde(default)]
    pub install: InstallConfig,

    #[serde(default)]
    pub publisher: PublisherConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RepositoryConfig {
    #[serde(default)]
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub official_site: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,

    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,

    #[serde(default)]
    pub launchers: Vec<String>,
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_staging_dir() -> String {
    DEFAULT_STAGING_DIR.to_string()
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            staging_dir: default_staging_dir(),
            launchers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PublisherConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Config {
    /// Load config from base directory
    pub fn load(base_dir: &Path) -> Result<Self> {
        let path = base_dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&content).map_err(|e| SyncError::ConfigParse {
            path: path.clone(),
            message: e.to_string(),
        })?;

        Ok(config)
    }

    /// Save config to base directory
    pub fn save(&self, base_dir: &Path) -> Result<()> {
        let path = base_dir.join(CONFIG_FILE);
        fs::create_dir_all(base_dir)?;

        let content = toml::to_string_pretty(self).map_err(|e| SyncError::ConfigParse {
            path: path.clone(),
            message: e.to_string(),
        })?;

        fs::write(&path, content)?;
        Ok(())
    }

    /// Get config file path
    pub fn path(base_dir: &Path) -> PathBuf {
        base_dir.join(CONFIG_FILE)
    }

    /// Initialize config with default template (rich comments)
    pub fn init(base_dir: &Path) -> Result<PathBuf> {
        let path = base_dir.join(CONFIG_FILE);
        fs::create_dir_all(base_dir)?;

        if !path.exists() {
            fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;
        }

        Ok(path)
    }

    /// Get a config value by dot-notation key
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "repository.url" => Some(self.repository.url.clone()),
            "repository.official_site" => {
                Some(self.repository.official_site.clone().unwrap_or_default())
            }
            "install.root" => Some(self.install.root.display().to_string()),
            "install.staging_dir" => Some(self.install.staging_dir.clone()),
            "install.launchers" => Some(format!("{:?}", self.install.launchers)),
            "publisher.name" => Some(self.publisher.name.clone().unwrap_or_default()),
            _ => None,
        }
    }

    /// Set a config value by dot-notation key. An empty value clears optional keys.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.trim();
        match key {
            "repository.url" => self.repository.url = value.to_string(),
            "repository.official_site" => self.repository.official_site = non_empty(value),
            "install.root" => self.install.root = PathBuf::from(value),
            "install.staging_dir" => {
                self.install.staging_dir = if value.is_empty() {
                    default_staging_dir()
                } else {
                    value.to_string()
                }
            }
            "install.launchers" => self.install.launchers = parse_string_list(value)?,
            "publisher.name" => self.publisher.name = non_empty(value),
            _ => {
                return Err(SyncError::ConfigKeyNotFound {
                    key: key.to_string(),
                })
            }
        }
        Ok(())
    }

    /// List all config keys with their current values
    pub fn list(&self) -> Vec<(String, String)> {
        [
            "repository.url",
            "repository.official_site",
            "install.root",
            "install.staging_dir",
            "install.launchers",
            "publisher.name",
        ]
        .iter()
        .map(|key| (key.to_string(), self.get(key).unwrap_or_default()))
        .collect()
    }

    /// Catalog settings for a session
    pub fn catalog_options(&self) -> CatalogOptions {
        CatalogOptions {
            official_site: self.repository.official_site.clone(),
            launchers: self.install.launchers.clone(),
            publisher: self.publisher.name.clone(),
        }
    }

    pub fn repository_layout(&self) -> Result<RepositoryLayout> {
        if self.repository.url.is_empty() {
            return Err(SyncError::ConfigValueMissing {
                key: "repository.url".to_string(),
            });
        }
        Ok(RepositoryLayout::new(&self.repository.url))
    }

    pub fn install_layout(&self) -> InstallLayout {
        InstallLayout::new(&self.install.root, &self.install.staging_dir)
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Parse a comma-separated or JSON-like list string
fn parse_string_list(value: &str) -> Result<Vec<String>> {
    let trimmed = value.trim();

    let inner = if trimmed.starts_with('[') && trimmed.ends_with(']') {
        &trimmed[1..trimmed.len() - 1]
    } else {
        trimmed
    };

    let items: Vec<String> = inner
        .split(',')
        .map(|s| s.trim().trim_matches('"').trim_matches('\'').to_string())
        .filter(|s| !s.is_empty())
        .collect();

    Ok(items)
}
