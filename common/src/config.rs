use serde::Deserialize;
use std::path::Path;

/// Downscaled sample width in pixels.
pub const DEFAULT_SAMPLE_WIDTH: u32 = 160;
/// A pixel counts as changed when its RGB channel-sum difference exceeds this.
pub const DEFAULT_PIXEL_THRESHOLD: u32 = 60;
/// Motion is reported when the changed-pixel fraction exceeds this.
pub const DEFAULT_MAGNITUDE_THRESHOLD: f64 = 0.05;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    pub capture: CaptureConfig,
    #[serde(default)]
    pub motion: MotionConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub location: LocationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Base URL of the surveillance server, e.g. `http://192.168.1.10:8000`.
    pub server_url: String,
    /// Pairing token issued by the server for this device.
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    pub url: String,
    #[serde(default = "default_capture_mode")]
    pub mode: String,
    #[serde(default = "default_fps")]
    pub fps: f64,
    /// Reconnect with exponential backoff when the camera connection fails.
    #[serde(default)]
    pub reconnect: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MotionConfig {
    #[serde(default = "default_sample_width")]
    pub sample_width: u32,
    #[serde(default = "default_pixel_threshold")]
    pub pixel_threshold: u32,
    #[serde(default = "default_magnitude_threshold")]
    pub magnitude_threshold: f64,
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordingConfig {
    #[serde(default = "default_codec")]
    pub codec: String,
    #[serde(default = "default_crf")]
    pub crf: u32,
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default = "default_fps")]
    pub fps: f64,
    /// ffmpeg executable used to encode clips.
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_status_poll_ms")]
    pub status_poll_interval_ms: u64,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Whole-request bound for a clip upload, body included.
    #[serde(default = "default_upload_timeout")]
    pub upload_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocationConfig {
    #[serde(default = "default_location_source")]
    pub source: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            sample_width: default_sample_width(),
            pixel_threshold: default_pixel_threshold(),
            magnitude_threshold: default_magnitude_threshold(),
            sample_interval_ms: default_sample_interval_ms(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            codec: default_codec(),
            crf: default_crf(),
            preset: default_preset(),
            fps: default_fps(),
            ffmpeg: default_ffmpeg(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            status_poll_interval_ms: default_status_poll_ms(),
            heartbeat_interval_ms: default_heartbeat_ms(),
            request_timeout_secs: default_request_timeout(),
            upload_timeout_secs: default_upload_timeout(),
        }
    }
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            source: default_location_source(),
            lat: None,
            lon: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.device.token.is_empty() {
            return Err(ConfigError::Invalid("device.token must not be empty".into()));
        }
        if self.motion.sample_width == 0 {
            return Err(ConfigError::Invalid("motion.sample_width must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.motion.magnitude_threshold) {
            return Err(ConfigError::Invalid(
                "motion.magnitude_threshold must be within [0, 1]".into(),
            ));
        }
        for (name, fps) in [("capture.fps", self.capture.fps), ("recording.fps", self.recording.fps)] {
            if !fps.is_finite() || fps <= 0.0 {
                return Err(ConfigError::Invalid(format!("{name} must be a positive number")));
            }
        }
        for (name, value) in [
            ("motion.sample_interval_ms", self.motion.sample_interval_ms),
            ("telemetry.status_poll_interval_ms", self.telemetry.status_poll_interval_ms),
            ("telemetry.heartbeat_interval_ms", self.telemetry.heartbeat_interval_ms),
            ("telemetry.request_timeout_secs", self.telemetry.request_timeout_secs),
            ("telemetry.upload_timeout_secs", self.telemetry.upload_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be > 0")));
            }
        }
        if self.location.source == "static"
            && (self.location.lat.is_none() || self.location.lon.is_none())
        {
            return Err(ConfigError::Invalid(
                "location.source = \"static\" requires lat and lon".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_capture_mode() -> String {
    "mjpeg".into()
}
fn default_fps() -> f64 {
    10.0
}
fn default_sample_width() -> u32 {
    DEFAULT_SAMPLE_WIDTH
}
fn default_pixel_threshold() -> u32 {
    DEFAULT_PIXEL_THRESHOLD
}
fn default_magnitude_threshold() -> f64 {
    DEFAULT_MAGNITUDE_THRESHOLD
}
fn default_sample_interval_ms() -> u64 {
    100
}
fn default_codec() -> String {
    "vp8".into()
}
fn default_crf() -> u32 {
    30
}
fn default_preset() -> String {
    "veryfast".into()
}
fn default_ffmpeg() -> String {
    "ffmpeg".into()
}
fn default_status_poll_ms() -> u64 {
    2000
}
fn default_heartbeat_ms() -> u64 {
    5000
}
fn default_request_timeout() -> u64 {
    10
}
fn default_upload_timeout() -> u64 {
    300
}
fn default_location_source() -> String {
    "none".into()
}
fn default_log_level() -> String {
    "info".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [device]
        server_url = "http://localhost:8000"
        token = "abc123"

        [capture]
        url = "http://camera.local/stream"
    "#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.capture.mode, "mjpeg");
        assert!(!config.capture.reconnect);
        assert_eq!(config.motion.sample_width, 160);
        assert_eq!(config.motion.pixel_threshold, 60);
        assert_eq!(config.motion.magnitude_threshold, 0.05);
        assert_eq!(config.telemetry.status_poll_interval_ms, 2000);
        assert_eq!(config.telemetry.heartbeat_interval_ms, 5000);
        assert_eq!(config.telemetry.upload_timeout_secs, 300);
        assert_eq!(config.recording.codec, "vp8");
        assert_eq!(config.location.source, "none");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn overrides_are_applied() {
        let toml = format!(
            "{MINIMAL}\n[motion]\nmagnitude_threshold = 0.2\nsample_interval_ms = 250\n"
        );
        let config = Config::parse(&toml).unwrap();
        assert_eq!(config.motion.magnitude_threshold, 0.2);
        assert_eq!(config.motion.sample_interval_ms, 250);
        assert_eq!(config.motion.sample_width, 160);
    }

    #[test]
    fn empty_token_rejected() {
        let toml = MINIMAL.replace("abc123", "");
        assert!(matches!(Config::parse(&toml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn static_location_requires_coordinates() {
        let toml = format!("{MINIMAL}\n[location]\nsource = \"static\"\nlat = 1.5\n");
        assert!(matches!(Config::parse(&toml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_intervals_rejected() {
        for table in [
            "[motion]\nsample_interval_ms = 0",
            "[telemetry]\nstatus_poll_interval_ms = 0",
            "[telemetry]\nheartbeat_interval_ms = 0",
            "[telemetry]\nupload_timeout_secs = 0",
        ] {
            let toml = format!("{MINIMAL}\n{table}\n");
            assert!(
                matches!(Config::parse(&toml), Err(ConfigError::Invalid(_))),
                "{table}"
            );
        }
    }

    #[test]
    fn non_finite_fps_rejected() {
        for fps in ["nan", "inf", "0.0", "-5.0"] {
            let toml = MINIMAL.replace(
                "url = \"http://camera.local/stream\"",
                &format!("url = \"http://camera.local/stream\"\nfps = {fps}"),
            );
            assert!(
                matches!(Config::parse(&toml), Err(ConfigError::Invalid(_))),
                "fps = {fps}"
            );
        }
        let toml = format!("{MINIMAL}\n[recording]\nfps = inf\n");
        assert!(matches!(Config::parse(&toml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn missing_device_table_is_parse_error() {
        let toml = "[capture]\nurl = \"http://camera.local/stream\"\n";
        assert!(matches!(Config::parse(toml), Err(ConfigError::Parse(_))));
    }
}
