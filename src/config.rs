use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::UpdateError;

// Device endpoints
pub const DEFAULT_DEVICE_HOST: &str = "192.168.4.1";
pub const DEFAULT_UPLOAD_PORT: u16 = 9988;
pub const DEFAULT_REST_WORKER_PATH: &str = "ekx_rest_worker.php";

// Upload socket supervision
pub const HEARTBEAT_INTERVAL_MS: u64 = 500;
pub const SLOW_HEARTBEAT_INTERVAL_MS: u64 = 60_000;
pub const HEARTBEAT_MISS_THRESHOLD: u32 = 8;
pub const RECONNECT_INTERVAL_MS: u64 = 5_000;
pub const STALL_CHECK_INTERVAL_MS: u64 = 1_000;
pub const STALL_THRESHOLD: u32 = 5;
pub const MAX_STALL_RECOVERIES: u32 = 5;
pub const MAX_CONNECTION_ERRORS: u32 = 5;
pub const CONNECT_TIMEOUT_MS: u64 = 5_000;

// Validation monitoring
pub const POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 60;
pub const REQUEST_TIMEOUT_MS: u64 = 3_000;
pub const INSTALL_TIMEOUT_SECS: u64 = 120;

// Output
pub const PROGRESS_BAR_ENABLED: bool = true;
pub const DETAILED_LOGGING: bool = false;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    pub upload: UploadConfig,
    pub monitor: MonitorConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub host: String,
    pub upload_port: u16,
    /// Overrides `http://{host}` for the REST worker.
    pub http_base_url: Option<String>,
    pub rest_worker_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    pub heartbeat_interval_ms: u64,
    pub slow_heartbeat_interval_ms: u64,
    pub heartbeat_miss_threshold: u32,
    pub reconnect_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub stall_check_interval_ms: u64,
    pub stall_threshold: u32,
    pub max_stall_recoveries: u32,
    pub max_connection_errors: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub poll_interval_ms: u64,
    pub default_stage_timeout_secs: u64,
    pub request_timeout_ms: u64,
    pub install_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub progress_bar_enabled: bool,
    pub detailed_logging: bool,
}

impl Config {
    pub fn load_or_create(path: &Path) -> Result<Self, UpdateError> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save(path)?;
            info!("Created default config file at {:?}", path);
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), UpdateError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), UpdateError> {
        if self.device.host.trim().is_empty() {
            return Err(UpdateError::ConfigError("device.host must not be empty".to_string()));
        }
        if self.upload.heartbeat_interval_ms == 0 || self.upload.slow_heartbeat_interval_ms == 0 {
            return Err(UpdateError::ConfigError("heartbeat intervals must be greater than 0".to_string()));
        }
        if self.upload.heartbeat_miss_threshold == 0 {
            return Err(UpdateError::ConfigError("upload.heartbeat_miss_threshold must be greater than 0".to_string()));
        }
        if self.upload.reconnect_interval_ms == 0 || self.upload.stall_check_interval_ms == 0 {
            return Err(UpdateError::ConfigError("reconnect and stall check intervals must be greater than 0".to_string()));
        }
        if self.monitor.poll_interval_ms == 0 {
            return Err(UpdateError::ConfigError("monitor.poll_interval_ms must be greater than 0".to_string()));
        }
        if self.monitor.default_stage_timeout_secs == 0 {
            return Err(UpdateError::ConfigError("monitor.default_stage_timeout_secs must be greater than 0".to_string()));
        }
        Ok(())
    }
}

impl DeviceConfig {
    /// WebSocket address of the upload server.
    pub fn upload_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.upload_port)
    }

    pub fn http_base(&self) -> String {
        match &self.http_base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}", self.host),
        }
    }
}

impl UploadConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn slow_heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.slow_heartbeat_interval_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn stall_check_interval(&self) -> Duration {
        Duration::from_millis(self.stall_check_interval_ms)
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn default_stage_timeout(&self) -> Duration {
        Duration::from_secs(self.default_stage_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            upload: UploadConfig::default(),
            monitor: MonitorConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_DEVICE_HOST.to_string(),
            upload_port: DEFAULT_UPLOAD_PORT,
            http_base_url: None,
            rest_worker_path: DEFAULT_REST_WORKER_PATH.to_string(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
            slow_heartbeat_interval_ms: SLOW_HEARTBEAT_INTERVAL_MS,
            heartbeat_miss_threshold: HEARTBEAT_MISS_THRESHOLD,
            reconnect_interval_ms: RECONNECT_INTERVAL_MS,
            connect_timeout_ms: CONNECT_TIMEOUT_MS,
            stall_check_interval_ms: STALL_CHECK_INTERVAL_MS,
            stall_threshold: STALL_THRESHOLD,
            max_stall_recoveries: MAX_STALL_RECOVERIES,
            max_connection_errors: MAX_CONNECTION_ERRORS,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: POLL_INTERVAL_MS,
            default_stage_timeout_secs: DEFAULT_STAGE_TIMEOUT_SECS,
            request_timeout_ms: REQUEST_TIMEOUT_MS,
            install_timeout_secs: INSTALL_TIMEOUT_SECS,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            progress_bar_enabled: PROGRESS_BAR_ENABLED,
            detailed_logging: DETAILED_LOGGING,
        }
    }
}
