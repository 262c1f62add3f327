// src/config.rs

//! Persisted configuration record
//!
//! The config lives at `${XDG_CONFIG_HOME}/pmbootstrap.cfg` as a single
//! `[pmbootstrap]` table of `key = "value"` lines. Unknown keys are rejected
//! with `ConfigInvalid` so typos surface instead of being ignored. Defaults
//! are usable without ever running `init`, which only refines them.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// On-disk wrapper: everything sits under one `[pmbootstrap]` section
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    pmbootstrap: Config,
}

/// The configuration record read by every component
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Path to the work directory holding chroots, caches, and packages
    pub work: PathBuf,
    /// Path to the aports checkout
    pub aports: PathBuf,
    /// Selected target device id
    pub device: String,
    /// Kernel variant for the device
    pub kernel: String,
    /// Selected user-interface package
    pub ui: String,
    /// Alpine mirror base URL
    pub mirror_alpine: String,
    /// postmarketOS mirror URLs, tried in order
    pub mirrors_postmarketos: Vec<String>,
    /// `-j` level passed to the builder
    pub jobs: u32,
    /// Compiler cache sizing (as understood by ccache -M)
    pub ccache_size: String,
    /// Whether ccache is enabled for builds
    pub ccache: bool,
    /// Inject the user's SSH public keys into images
    pub ssh_keys: bool,
    /// Glob for which public keys to inject
    pub ssh_key_glob: String,
    /// Passed through to the image
    pub timezone: String,
    pub locale: String,
    pub hostname: String,
    pub user: String,
}

impl Default for Config {
    fn default() -> Self {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/root"));
        let jobs = std::thread::available_parallelism()
            .map(|p| p.get() as u32)
            .unwrap_or(4);

        Config {
            work: home.join(".local/var/pmbootstrap"),
            aports: home.join(".local/var/pmbootstrap/cache_git/pmaports"),
            device: "qemu-amd64".to_string(),
            kernel: "stable".to_string(),
            ui: "console".to_string(),
            mirror_alpine: "http://dl-cdn.alpinelinux.org/alpine/".to_string(),
            mirrors_postmarketos: vec!["http://mirror.postmarketos.org/postmarketos/".to_string()],
            jobs,
            ccache_size: "5G".to_string(),
            ccache: true,
            ssh_keys: false,
            ssh_key_glob: "~/.ssh/id_*.pub".to_string(),
            timezone: "UTC".to_string(),
            locale: "en_US.UTF-8".to_string(),
            hostname: String::new(),
            user: "user".to_string(),
        }
    }
}

impl Config {
    /// Default config file location: `${XDG_CONFIG_HOME}/pmbootstrap.cfg`,
    /// falling back to `~/.config/pmbootstrap.cfg`
    pub fn default_path() -> PathBuf {
        if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg).join("pmbootstrap.cfg");
        }
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/root"));
        home.join(".config/pmbootstrap.cfg")
    }

    /// Load the config from `path`, or defaults when the file does not exist
    pub fn load(path: &Path) -> Result<Config> {
        if !path.exists() {
            debug!("no config at {}, using defaults", path.display());
            return Ok(Config::default());
        }

        let content = fs::read_to_string(path)?;
        let file: ConfigFile = toml::from_str(&content)
            .map_err(|e| Error::ConfigInvalid(format!("{}: {e}", path.display())))?;
        file.pmbootstrap.validate()?;
        Ok(file.pmbootstrap)
    }

    /// Persist the config, creating parent directories as needed
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = ConfigFile {
            pmbootstrap: self.clone(),
        };
        let content = toml::to_string_pretty(&file)
            .map_err(|e| Error::ConfigInvalid(format!("cannot serialize config: {e}")))?;
        fs::write(path, content)?;
        debug!("wrote config to {}", path.display());
        Ok(())
    }

    /// Reject configs that would break invariants deeper in the stack
    pub fn validate(&self) -> Result<()> {
        if self.jobs == 0 {
            return Err(Error::ConfigInvalid("jobs must be at least 1".to_string()));
        }
        if self.mirror_alpine.is_empty() {
            return Err(Error::ConfigInvalid("mirror_alpine must not be empty".to_string()));
        }
        if self.mirrors_postmarketos.is_empty() {
            return Err(Error::ConfigInvalid(
                "mirrors_postmarketos must list at least one URL".to_string(),
            ));
        }
        if !self.work.is_absolute() {
            return Err(Error::ConfigInvalid(format!(
                "work directory must be an absolute path, got {}",
                self.work.display()
            )));
        }
        Ok(())
    }

    /// All mirror URLs in the order repositories are registered
    pub fn mirror_urls(&self) -> Vec<String> {
        let mut urls = self.mirrors_postmarketos.clone();
        for repo in ["edge/main", "edge/community"] {
            urls.push(format!("{}{}", ensure_slash(&self.mirror_alpine), repo));
        }
        urls
    }
}

fn ensure_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pmbootstrap.cfg");

        let mut config = Config::default();
        config.device = "pine64-pinephone".to_string();
        config.jobs = 8;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let loaded = Config::load(&dir.path().join("nope.cfg")).unwrap();
        assert_eq!(loaded, Config::default());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pmbootstrap.cfg");
        fs::write(&path, "[pmbootstrap]\nwrok = \"/tmp\"\n").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert_eq!(err.tag(), "ConfigInvalid");
    }

    #[test]
    fn test_zero_jobs_rejected() {
        let mut config = Config::default();
        config.jobs = 0;
        assert_eq!(config.validate().unwrap_err().tag(), "ConfigInvalid");
    }

    #[test]
    fn test_relative_work_rejected() {
        let mut config = Config::default();
        config.work = PathBuf::from("relative/work");
        assert_eq!(config.validate().unwrap_err().tag(), "ConfigInvalid");
    }

    #[test]
    fn test_mirror_urls_order() {
        let config = Config::default();
        let urls = config.mirror_urls();
        assert_eq!(urls[0], config.mirrors_postmarketos[0]);
        assert!(urls.iter().any(|u| u.contains("edge/main")));
    }
}
