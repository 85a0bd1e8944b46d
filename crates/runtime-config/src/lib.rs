//! Storage configuration shared by the backend factory and the CLI.
//!
//! Values come from `councilstore.toml` and are then overridden by
//! environment variables, so a scheduled job can switch backend or
//! credentials without touching the file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Canonical config file name.
pub const CONFIG_FILE_NAME: &str = "councilstore.toml";

/// Upper bound on file operations per repository commit, imposed by the
/// repository service.
pub const MAX_BATCH_SIZE: usize = 100;
/// Public GitHub REST endpoint, used when `[github] api_url` is unset.
pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";

pub const ENV_BACKEND: &str = "COUNCILSTORE_BACKEND";
pub const ENV_DATA_DIR: &str = "COUNCILSTORE_DATA_DIR";
pub const ENV_REPOSITORY_ROOT: &str = "COUNCILSTORE_REPOSITORY_ROOT";
pub const ENV_GITHUB_REPOSITORY: &str = "GITHUB_REPOSITORY";
pub const ENV_GITHUB_TOKEN: &str = "GITHUB_TOKEN";
pub const ENV_GITHUB_API_URL: &str = "GITHUB_API_URL";
pub const ENV_AUTO_MERGE: &str = "COUNCILSTORE_AUTO_MERGE";
pub const ENV_DISABLE_CHANGE_DETECTION: &str = "COUNCILSTORE_DISABLE_CHANGE_DETECTION";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Top-level configuration (persisted as `councilstore.toml`).
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StorageConfig {
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub repository: RepositorySettings,
    #[serde(default)]
    pub github: GitHubSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageSettings {
    /// Backend kind: `local`, `repository` or `github` (aliases accepted).
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_scraper_object_type")]
    pub scraper_object_type: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            data_dir: default_data_dir(),
            scraper_object_type: default_scraper_object_type(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepositorySettings {
    /// Directory holding one bare repository per council.
    #[serde(default = "default_repository_root")]
    pub root: PathBuf,
    #[serde(default = "default_main_branch")]
    pub main_branch: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Attempts per batch when the branch head moved underneath us.
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,
}

impl Default for RepositorySettings {
    fn default() -> Self {
        Self {
            root: default_repository_root(),
            main_branch: default_main_branch(),
            batch_size: default_batch_size(),
            conflict_retries: default_conflict_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GitHubSettings {
    /// `owner/repo`.
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_true")]
    pub auto_merge: bool,
    #[serde(default = "default_max_merge_retries")]
    pub max_merge_retries: u32,
    #[serde(default = "default_false")]
    pub disable_change_detection: bool,
}

impl Default for GitHubSettings {
    fn default() -> Self {
        Self {
            repository: String::new(),
            token: String::new(),
            api_url: default_api_url(),
            auto_merge: true,
            max_merge_retries: default_max_merge_retries(),
            disable_change_detection: false,
        }
    }
}

// ── Serde default functions ─────────────────────────────────────────────

fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_backend() -> String {
    "local".to_string()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_scraper_object_type() -> String {
    "Data".to_string()
}
fn default_repository_root() -> PathBuf {
    PathBuf::from("repositories")
}
fn default_main_branch() -> String {
    "main".to_string()
}
fn default_batch_size() -> usize {
    MAX_BATCH_SIZE
}
fn default_conflict_retries() -> u32 {
    3
}
fn default_api_url() -> String {
    DEFAULT_GITHUB_API_URL.to_string()
}
fn default_max_merge_retries() -> u32 {
    3
}

impl StorageConfig {
    /// Read `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let mut config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.normalize();
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let encoded = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, encoded).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override fields from environment variables resolved through `lookup`.
    /// Empty values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(ENV_BACKEND) {
            self.storage.backend = v;
        }
        if let Some(v) = get(ENV_DATA_DIR) {
            self.storage.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get(ENV_REPOSITORY_ROOT) {
            self.repository.root = PathBuf::from(v);
        }
        if let Some(v) = get(ENV_GITHUB_REPOSITORY) {
            self.github.repository = v;
        }
        if let Some(v) = get(ENV_GITHUB_TOKEN) {
            self.github.token = v;
        }
        if let Some(v) = get(ENV_GITHUB_API_URL) {
            self.github.api_url = v;
        }
        if let Some(v) = get(ENV_AUTO_MERGE) {
            self.github.auto_merge = is_truthy(&v);
        }
        if let Some(v) = get(ENV_DISABLE_CHANGE_DETECTION) {
            self.github.disable_change_detection = is_truthy(&v);
        }
        self.normalize();
    }

    pub fn apply_process_env(&mut self) {
        self.apply_env(|key| std::env::var(key).ok());
    }

    /// Clamp values the backends cannot honour. Returns true when anything changed.
    pub fn normalize(&mut self) -> bool {
        let mut changed = false;

        let backend = self.storage.backend.trim().to_ascii_lowercase();
        if backend != self.storage.backend {
            self.storage.backend = backend;
            changed = true;
        }

        let batch_size = self.repository.batch_size.clamp(1, MAX_BATCH_SIZE);
        if batch_size != self.repository.batch_size {
            self.repository.batch_size = batch_size;
            changed = true;
        }

        if self.repository.conflict_retries == 0 {
            self.repository.conflict_retries = 1;
            changed = true;
        }

        changed
    }
}

/// `1`, `true` and `yes` (any case) enable a flag.
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
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
    fn defaults_are_stable() {
        let cfg = StorageConfig::default();
        assert_eq!(cfg.storage.backend, "local");
        assert_eq!(cfg.storage.data_dir, PathBuf::from("data"));
        assert_eq!(cfg.storage.scraper_object_type, "Data");
        assert_eq!(cfg.repository.main_branch, "main");
        assert_eq!(cfg.repository.batch_size, 100);
        assert_eq!(cfg.github.api_url, DEFAULT_GITHUB_API_URL);
        assert!(cfg.github.auto_merge);
        assert_eq!(cfg.github.max_merge_retries, 3);
        assert!(!cfg.github.disable_change_detection);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: StorageConfig = toml::from_str(
            r#"
[storage]
backend = "github"

[github]
repository = "example/council-data"
auto_merge = false
"#,
        )
        .expect("parse toml");

        assert_eq!(cfg.storage.backend, "github");
        assert_eq!(cfg.storage.data_dir, PathBuf::from("data"));
        assert_eq!(cfg.github.repository, "example/council-data");
        assert!(!cfg.github.auto_merge);
        assert_eq!(cfg.repository, RepositorySettings::default());
    }

    #[test]
    fn env_overrides_file_values() {
        let mut cfg = StorageConfig::default();
        cfg.apply_env(env(&[
            (ENV_BACKEND, " GitHub "),
            (ENV_GITHUB_REPOSITORY, "owner/repo"),
            (ENV_GITHUB_TOKEN, "secret"),
            (ENV_AUTO_MERGE, "no"),
            (ENV_DISABLE_CHANGE_DETECTION, "YES"),
            (ENV_DATA_DIR, ""),
        ]));

        assert_eq!(cfg.storage.backend, "github");
        assert_eq!(cfg.github.repository, "owner/repo");
        assert_eq!(cfg.github.token, "secret");
        assert!(!cfg.github.auto_merge);
        assert!(cfg.github.disable_change_detection);
        assert_eq!(cfg.storage.data_dir, PathBuf::from("data"));
    }

    #[test]
    fn normalize_clamps_batch_size() {
        let mut cfg = StorageConfig::default();
        cfg.repository.batch_size = 500;
        cfg.repository.conflict_retries = 0;
        assert!(cfg.normalize());
        assert_eq!(cfg.repository.batch_size, MAX_BATCH_SIZE);
        assert_eq!(cfg.repository.conflict_retries, 1);
        assert!(!cfg.normalize());
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StorageConfig::load(&dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert_eq!(cfg, StorageConfig::default());
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);
        let mut cfg = StorageConfig::default();
        cfg.storage.backend = "repository".into();
        cfg.repository.root = PathBuf::from("/srv/repos");
        cfg.save(&path).unwrap();

        assert_eq!(StorageConfig::load(&path).unwrap(), cfg);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[storage\nbackend = 1").unwrap();
        assert!(matches!(
            StorageConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn truthy_values() {
        for v in ["1", "true", "TRUE", "yes", " Yes "] {
            assert!(is_truthy(v), "{v}");
        }
        for v in ["0", "false", "no", "on", ""] {
            assert!(!is_truthy(v), "{v}");
        }
    }
}
