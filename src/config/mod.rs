//! Application and channel configuration, persisted as pretty JSON
//!
//! Both files are forward compatible: unknown keys are ignored and missing keys
//! are filled from defaults instead of failing the load.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::constants::*;
use crate::error::ConfigError;
use crate::types::{Channel, InputConfig, OutputConfig, StreamStatus};

/// What the registry does when an encoder exits without being asked to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Classify the channel unavailable and wait for the user
    #[default]
    Never,
    /// Restart up to `max_auto_restarts` times per user start
    WithinBudget,
    /// Restart after every crash, paced by `retry_delay_seconds`
    Always,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub theme: String,
    pub logging_level: String,
    pub ffmpeg_loglevel: String,
    pub retry_attempts: u32,
    pub retry_delay_seconds: u64,
    pub last_selected_channel: String,
    pub default_channels_count: u32,
    pub udp_packet_timeout_seconds: u64,
    pub status_refresh_interval_seconds: u64,
    pub ffmpeg_process_monitor_interval_seconds: u64,
    pub preview_auto_stop_seconds: u64,
    pub probe_timeout_seconds: u64,
    pub resolver_timeout_seconds: u64,
    pub stop_grace_seconds: u64,
    pub diagnostic_warmup_seconds: u64,
    pub auto_restart: RestartPolicy,
    pub max_auto_restarts: u32,
    pub restart_on_input_loss: bool,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub ffplay_path: String,
    pub resolver_path: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            theme: "darkly".to_string(),
            logging_level: "INFO".to_string(),
            ffmpeg_loglevel: "info".to_string(),
            retry_attempts: 5,
            retry_delay_seconds: 10,
            last_selected_channel: "Channel 1".to_string(),
            default_channels_count: 10,
            udp_packet_timeout_seconds: 10,
            status_refresh_interval_seconds: 1,
            ffmpeg_process_monitor_interval_seconds: 5,
            preview_auto_stop_seconds: 60,
            probe_timeout_seconds: 15,
            resolver_timeout_seconds: 20,
            stop_grace_seconds: 5,
            diagnostic_warmup_seconds: 5,
            auto_restart: RestartPolicy::Never,
            max_auto_restarts: 3,
            restart_on_input_loss: false,
            ffmpeg_path: DEFAULT_FFMPEG.to_string(),
            ffprobe_path: DEFAULT_FFPROBE.to_string(),
            ffplay_path: DEFAULT_FFPLAY.to_string(),
            resolver_path: DEFAULT_RESOLVER.to_string(),
        }
    }
}

impl AppConfig {
    pub fn udp_packet_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_packet_timeout_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    pub fn status_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.status_refresh_interval_seconds.max(1))
    }

    pub fn process_monitor_interval(&self) -> Duration {
        Duration::from_secs(self.ffmpeg_process_monitor_interval_seconds.max(1))
    }

    pub fn preview_auto_stop(&self) -> Duration {
        Duration::from_secs(self.preview_auto_stop_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }

    pub fn resolver_timeout(&self) -> Duration {
        Duration::from_secs(self.resolver_timeout_seconds)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_seconds)
    }

    pub fn diagnostic_warmup(&self) -> Duration {
        Duration::from_secs(self.diagnostic_warmup_seconds)
    }

    /// Load from `path`; a missing file is created with defaults, a corrupt one is replaced
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        load_or_init_with(path, AppConfig::default)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        write_json(path, self)
    }
}

/// Persisted channels keyed by their stable name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelStore {
    channels: BTreeMap<String, Channel>,
}

impl ChannelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Channel 1` .. `Channel N` with the stock multicast addressing
    pub fn with_defaults(count: u32) -> Self {
        let mut store = Self::new();
        for i in 1..=count {
            let offset = u16::try_from(i).unwrap_or(u16::MAX);
            let mut channel = Channel::new(format!("Channel {i}"));
            channel.input = InputConfig {
                ip: DEFAULT_INPUT_GROUP.to_string(),
                port: DEFAULT_INPUT_PORT_BASE.saturating_add(offset),
                ..InputConfig::default()
            };
            channel.output = OutputConfig {
                ip: DEFAULT_OUTPUT_GROUP.to_string(),
                port: DEFAULT_OUTPUT_PORT_BASE.saturating_add(offset),
                ..OutputConfig::default()
            };
            store.insert(channel);
        }
        store
    }

    /// Load from `path`, or generate `default_count` channels and write them out
    pub fn load_or_init(path: &Path, default_count: u32) -> Result<Self, ConfigError> {
        let mut store = load_or_init_with(path, || ChannelStore::with_defaults(default_count))?;
        store.normalize();
        Ok(store)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        write_json(path, self)
    }

    pub fn insert(&mut self, channel: Channel) -> Option<Channel> {
        self.channels.insert(channel.name.clone(), channel)
    }

    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn into_channels(self) -> Vec<Channel> {
        self.channels.into_values().collect()
    }

    pub fn from_channels(channels: impl IntoIterator<Item = Channel>) -> Self {
        let mut store = Self::new();
        for channel in channels {
            store.insert(channel);
        }
        store
    }

    /// Restore the key as the channel name and drop volatile fields
    fn normalize(&mut self) {
        for (name, channel) in self.channels.iter_mut() {
            channel.name = name.clone();
            if channel.display_name.is_empty() {
                channel.display_name = name.clone();
            }
            channel.status = StreamStatus::Unknown;
        }
    }
}

fn load_or_init_with<T, F>(path: &Path, defaults: F) -> Result<T, ConfigError>
where
    T: DeserializeOwned + Serialize,
    F: Fn() -> T,
{
    if !path.exists() {
        let value = defaults();
        write_json(path, &value)?;
        info!(path = %path.display(), "created configuration with defaults");
        return Ok(value);
    }

    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    match serde_json::from_str(&raw) {
        Ok(value) => Ok(value),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "unreadable configuration, replacing with defaults");
            let value = defaults();
            write_json(path, &value)?;
            Ok(value)
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ConfigError> {
    let json = serde_json::to_string_pretty(value)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
            path: PathBuf::from(parent),
            source,
        })?;
    }
    fs::write(path, json).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InputType;
    use tempfile::tempdir;

    #[test]
    fn missing_app_keys_fall_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "retry_attempts": 2, "theme": "flatly", "unknown_key": 1 }"#).unwrap();

        let config = AppConfig::load_or_init(&path).unwrap();
        assert_eq!(config.retry_attempts, 2);
        assert_eq!(config.theme, "flatly");
        assert_eq!(config.udp_packet_timeout_seconds, 10);
        assert_eq!(config.auto_restart, RestartPolicy::Never);
    }

    #[test]
    fn absent_app_config_is_written_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = AppConfig::load_or_init(&path).unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(path.exists());
    }

    #[test]
    fn corrupt_app_config_is_replaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let config = AppConfig::load_or_init(&path).unwrap();
        assert_eq!(config, AppConfig::default());
        let reread: AppConfig = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(reread, config);
    }

    #[test]
    fn default_channels_use_stock_addressing() {
        let store = ChannelStore::with_defaults(3);
        assert_eq!(store.len(), 3);
        let third = store.get("Channel 3").unwrap();
        assert_eq!(third.input.ip, "239.1.1.1");
        assert_eq!(third.input.port, 1236);
        assert_eq!(third.output.port, 5680);
        assert_eq!(third.input.input_type, InputType::Udp);
    }

    #[test]
    fn channel_records_are_forward_compatible() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("channels.json");
        fs::write(
            &path,
            r#"{
                "Studio A": {
                    "status": "streaming",
                    "last_known_streaming_state": true,
                    "input": { "input_type": "SRT", "ip": "10.0.0.1", "port": 9000 }
                }
            }"#,
        )
        .unwrap();

        let store = ChannelStore::load_or_init(&path, 5).unwrap();
        assert_eq!(store.len(), 1);
        let channel = store.get("Studio A").unwrap();
        assert_eq!(channel.name, "Studio A");
        assert_eq!(channel.display_name, "Studio A");
        assert_eq!(channel.status, StreamStatus::Unknown);
        assert!(channel.last_known_streaming_state);
        assert_eq!(channel.input.input_type, InputType::Srt);
        assert_eq!(channel.input.probesize, "10M");
        assert_eq!(channel.output.video_bitrate, 2000);
        assert!(channel.programs.is_empty());
    }

    #[test]
    fn store_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("channels.json");

        let store = ChannelStore::load_or_init(&path, 2).unwrap();
        assert_eq!(store.len(), 2);

        let mut channels = store.into_channels();
        channels[0].display_name = "Lobby".to_string();
        ChannelStore::from_channels(channels).save(&path).unwrap();

        let reloaded = ChannelStore::load_or_init(&path, 9).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get("Channel 1").unwrap().display_name, "Lobby");
    }
}
