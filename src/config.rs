//! Persistent application configuration model and defaults.

use std::path::{Path, PathBuf};

use log::{info, warn};

/// Root configuration persisted to `queuecast.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    /// Broadcast server preferences.
    pub network: NetworkConfig,
    #[serde(default)]
    /// Playback behavior preferences.
    pub playback: PlaybackConfig,
}

/// Broadcast server preferences.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct NetworkConfig {
    /// Well-known listening port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Explicit bind address. Empty means auto-discover the private
    /// network interface address.
    #[serde(default)]
    pub bind_address: String,
    /// Fixed size of the connection worker pool.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

/// Playback behavior preferences.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PlaybackConfig {
    /// Pick the next loaded track at random instead of sequentially.
    #[serde(default)]
    pub random_order: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            port: default_port(),
            bind_address: String::new(),
            worker_threads: default_worker_threads(),
        }
    }
}

fn default_port() -> u16 {
    13370
}

fn default_worker_threads() -> usize {
    4
}

impl Config {
    /// Default on-disk location, under the platform config directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("queuecast.toml"))
    }

    /// Loads the config file, writing defaults when it does not exist.
    /// A file that fails to read or parse is left alone and defaults are
    /// used for this run.
    pub fn load_or_create(path: &Path) -> Config {
        if !path.exists() {
            let config = Config::default();
            info!(
                "Config file not found. Creating default config. path={}",
                path.display()
            );
            match toml::to_string(&config) {
                Ok(text) => {
                    if let Some(parent) = path.parent() {
                        if let Err(err) = std::fs::create_dir_all(parent) {
                            warn!(
                                "Failed to create config directory {}: {}",
                                parent.display(),
                                err
                            );
                        }
                    }
                    if let Err(err) = std::fs::write(path, text) {
                        warn!("Failed to write default config: {}", err);
                    }
                }
                Err(err) => warn!("Failed to serialize default config: {}", err),
            }
            return config;
        }

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                warn!(
                    "Failed to read config at {}: {}. Using defaults.",
                    path.display(),
                    err
                );
                return Config::default();
            }
        };
        match toml::from_str::<Config>(&content) {
            Ok(config) => config,
            Err(err) => {
                warn!(
                    "Failed to parse config at {}: {}. Using defaults.",
                    path.display(),
                    err
                );
                Config::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_field() {
        let config = Config::default();
        assert_eq!(config.network.port, 13370);
        assert_eq!(config.network.worker_threads, 4);
        assert!(config.network.bind_address.is_empty());
        assert!(!config.playback.random_order);
    }

    #[test]
    fn partial_files_fill_in_defaults() {
        let config: Config = toml::from_str("[network]\nport = 4242\n").expect("parse failed");
        assert_eq!(config.network.port, 4242);
        assert_eq!(config.network.worker_threads, 4);
        assert!(!config.playback.random_order);
    }

    #[test]
    fn first_run_creates_the_missing_config_directory() {
        let dir = std::env::temp_dir().join(format!("queuecast-config-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("nested").join("queuecast.toml");

        let config = Config::load_or_create(&path);
        assert_eq!(config, Config::default());
        assert!(path.exists());
        assert_eq!(Config::load_or_create(&path), config);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let mut config = Config::default();
        config.network.bind_address = "127.0.0.1".to_string();
        config.playback.random_order = true;
        let text = toml::to_string(&config).expect("serialize failed");
        let parsed: Config = toml::from_str(&text).expect("parse failed");
        assert_eq!(parsed, config);
    }
}
