use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::UploadError;

/// Environment variable consulted when no upload token is configured.
pub const UPLOAD_TOKEN_ENV: &str = "TAP_RECORDER_UPLOAD_TOKEN";

/// Options applied to every tap the manager creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TapOptions {
    /// Base name for the tap and its aggregate device.
    pub name: String,
    /// Ask the HAL for a mono downmix of the tapped audio.
    pub mono: bool,
    /// Hide the tap and aggregate device from other processes.
    pub private: bool,
    /// Silence the tapped process on its real output while recording.
    pub muted: bool,
}

impl Default for TapOptions {
    fn default() -> Self {
        Self {
            name: "tap-recorder".into(),
            mono: false,
            private: true,
            muted: false,
        }
    }
}

/// Configuration for capture sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfiguration {
    /// Directory where recording files are written. Must be writable.
    pub output_directory: PathBuf,

    /// Prefix of generated recording file names.
    pub file_prefix: String,

    /// Add the default input device (microphone) as the secondary stream.
    pub include_microphone: bool,

    pub tap: TapOptions,

    /// Capacity of the advisory error channel fed by the real-time thread.
    pub error_channel_capacity: usize,
}

impl CaptureConfiguration {
    pub fn validate(&self) -> Result<(), String> {
        if self.file_prefix.is_empty() {
            return Err("file prefix must not be empty".into());
        }
        if self.file_prefix.contains(|c: char| c == '/' || c == '\\') {
            return Err(format!("file prefix must not contain path separators: {}", self.file_prefix));
        }
        if self.tap.name.is_empty() {
            return Err("tap name must not be empty".into());
        }
        if self.error_channel_capacity == 0 {
            return Err("error channel capacity must be positive".into());
        }
        Ok(())
    }

    /// Fresh destination path for a new recording.
    pub fn next_recording_path(&self) -> PathBuf {
        let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
        let unique = uuid::Uuid::new_v4().simple().to_string();
        self.output_directory
            .join(format!("{}_{}_{}.wav", self.file_prefix, stamp, &unique[..8]))
    }
}

impl Default for CaptureConfiguration {
    fn default() -> Self {
        Self {
            output_directory: PathBuf::from("."),
            file_prefix: "recording".into(),
            include_microphone: true,
            tap: TapOptions::default(),
            error_channel_capacity: 32,
        }
    }
}

/// Configuration for the upload endpoint.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfiguration {
    /// Full URL the multipart body is POSTed to.
    pub endpoint: String,

    /// Bearer token sent in the `Authorization` header.
    pub api_token: Option<String>,

    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl UploadConfiguration {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), UploadError> {
        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            return Err(UploadError::Configuration(format!(
                "endpoint must start with http:// or https://, got: {}",
                self.endpoint
            )));
        }
        if self.timeout_secs == 0 {
            return Err(UploadError::Configuration("timeout must be positive".into()));
        }
        Ok(())
    }

    /// Load from a JSON file, falling back to the environment for the token.
    pub fn from_json_file(path: &Path) -> Result<Self, UploadError> {
        let json = fs::read_to_string(path)
            .map_err(|e| UploadError::Configuration(format!("failed to read {}: {}", path.display(), e)))?;
        let mut config: Self = serde_json::from_str(&json)
            .map_err(|e| UploadError::Configuration(format!("failed to parse {}: {}", path.display(), e)))?;
        if config.api_token.is_none() {
            config.api_token = std::env::var(UPLOAD_TOKEN_ENV).ok().filter(|t| !t.is_empty());
        }
        config.validate()?;
        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn is_plaintext_remote(&self) -> bool {
        self.endpoint.starts_with("http://")
            && !self.endpoint.contains("localhost")
            && !self.endpoint.contains("127.0.0.1")
            && !self.endpoint.contains("[::1]")
    }
}

impl Default for UploadConfiguration {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_token: None,
            timeout_secs: 60,
        }
    }
}

// Keep the token out of logs.
impl std::fmt::Debug for UploadConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadConfiguration")
            .field("endpoint", &self.endpoint)
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}
