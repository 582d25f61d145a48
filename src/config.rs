use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin the worker controls (scheme + host). Cross-origin requests
  /// are never intercepted.
  pub origin: String,

  /// Prefix for cache names
  pub cache_prefix: String,

  /// Cache version; bumping it retires the previous caches on activate
  pub version: String,

  /// Path prefix routed network-first
  pub api_prefix: String,

  /// Root-relative paths pre-cached on install
  pub precache: Vec<String>,

  /// Top-level routes served stale-while-revalidate
  pub app_routes: Vec<String>,

  /// Network timeout for the reqwest fetcher, in seconds
  pub network_timeout_secs: u64,

  /// Cache database location (default: $XDG_DATA_HOME/pilot-sw/cache.db)
  pub db_path: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "https://rankpilot.app".to_string(),
      cache_prefix: "rankpilot".to_string(),
      version: "v1".to_string(),
      api_prefix: "/api/".to_string(),
      precache: vec![
        "/".to_string(),
        "/dashboard".to_string(),
        "/login".to_string(),
        "/manifest.json".to_string(),
        "/favicon.ico".to_string(),
      ],
      app_routes: vec![
        "/dashboard".to_string(),
        "/projects".to_string(),
        "/keywords".to_string(),
        "/content-analyzer".to_string(),
        "/reports".to_string(),
        "/settings".to_string(),
      ],
      network_timeout_secs: 30,
      db_path: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./pilot-sw.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/pilot-sw/config.yaml
  ///
  /// Falls back to built-in defaults when no file exists.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("pilot-sw.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("pilot-sw").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Name of the current static (shell asset) cache.
  pub fn static_cache_name(&self) -> String {
    format!("{}-static-{}", self.cache_prefix, self.version)
  }

  /// Name of the current dynamic (API/page) cache.
  pub fn dynamic_cache_name(&self) -> String {
    format!("{}-dynamic-{}", self.cache_prefix, self.version)
  }

  /// Parsed origin, for resolving root-relative paths.
  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  pub fn network_timeout(&self) -> Duration {
    Duration::from_secs(self.network_timeout_secs)
  }

  /// Cache database path, honoring the override.
  pub fn cache_db_path(&self) -> Result<PathBuf> {
    if let Some(p) = &self.db_path {
      return Ok(p.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("pilot-sw").join("cache.db"))
  }

  /// Pending-sync database path, next to the cache database.
  pub fn sync_db_path(&self) -> Result<PathBuf> {
    Ok(self.cache_db_path()?.with_file_name("sync.db"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cache_names_follow_version() {
    let config = Config {
      version: "v2".to_string(),
      ..Config::default()
    };
    assert_eq!(config.static_cache_name(), "rankpilot-static-v2");
    assert_eq!(config.dynamic_cache_name(), "rankpilot-dynamic-v2");
  }

  #[test]
  fn test_partial_yaml_fills_defaults() {
    let config: Config = serde_yaml::from_str("origin: https://staging.rankpilot.app\n").unwrap();
    assert_eq!(config.origin, "https://staging.rankpilot.app");
    assert_eq!(config.api_prefix, "/api/");
    assert_eq!(config.network_timeout_secs, 30);
    assert!(config.precache.contains(&"/dashboard".to_string()));
  }

  #[test]
  fn test_origin_url_rejects_garbage() {
    let config = Config {
      origin: "not a url".to_string(),
      ..Config::default()
    };
    assert!(config.origin_url().is_err());
  }
}
