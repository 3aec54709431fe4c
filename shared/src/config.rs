use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::capabilities::{CaptureConfig, HttpError, ValidatedUrl};
use crate::{
    AUTO_CAPTURE_DELAY, CAMERA_SETTLE_DELAY, CAPTURE_RETRY_DELAY, DEFAULT_API_BASE_URL,
    MATCH_THRESHOLD, MAX_CAPTURE_RETRIES, MEDIA_UPLOADS_PATH, REFRESH_TOKEN_HEADER,
    REQUEST_TIMEOUT, ROTATED_TOKEN_HEADER, UPLOAD_TIMEOUT, WARNING_DISMISS_DELAY,
};

const MAX_DELAY_MS: u64 = 60_000;
const MAX_RETRIES_CAP: u32 = 10;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub client: ClientConfig,
    pub scan: ScanConfig,
}

impl AppConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let config = config.validated();
        config.client.validate()?;
        Ok(config)
    }

    pub fn validated(self) -> Self {
        Self {
            client: self.client.validated(),
            scan: self.scan.validated(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Origin of the API, e.g. `https://api.example.com`.
    pub base_url: String,
    /// Path under `base_url` that relative media references resolve against.
    pub media_path: String,
    pub request_timeout_ms: u64,
    pub upload_timeout_ms: u64,
    pub refresh_token_header: String,
    pub rotated_token_header: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            media_path: MEDIA_UPLOADS_PATH.to_string(),
            request_timeout_ms: millis(REQUEST_TIMEOUT),
            upload_timeout_ms: millis(UPLOAD_TIMEOUT),
            refresh_token_header: REFRESH_TOKEN_HEADER.to_string(),
            rotated_token_header: ROTATED_TOKEN_HEADER.to_string(),
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
        .validated()
    }

    pub fn validated(mut self) -> Self {
        self.base_url = self.base_url.trim().trim_end_matches('/').to_string();
        self.media_path = format!("/{}", self.media_path.trim().trim_matches('/'));
        self.request_timeout_ms = self.request_timeout_ms.clamp(1_000, 300_000);
        self.upload_timeout_ms = self.upload_timeout_ms.clamp(1_000, 300_000);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ValidatedUrl::new(self.base_url.clone()).map_err(|e| ConfigError::Invalid {
            field: "client.base_url",
            reason: e.to_string(),
        })?;
        for (field, value) in [
            ("client.refresh_token_header", &self.refresh_token_header),
            ("client.rotated_token_header", &self.rotated_token_header),
        ] {
            if value.is_empty()
                || !value
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("'{}' is not a valid header name", value),
                });
            }
        }
        Ok(())
    }

    /// Absolute URL for an API path such as `/api/media/match`.
    pub fn api_url(&self, path: &str) -> Result<ValidatedUrl, HttpError> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return ValidatedUrl::new(path);
        }
        ValidatedUrl::new(format!("{}/{}", self.base_url, path.trim_start_matches('/')))
    }

    /// Base that relative media file references are joined onto, with a trailing slash.
    pub fn media_base_url(&self) -> String {
        format!("{}{}/", self.base_url, self.media_path)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub camera_settle_delay_ms: u64,
    pub auto_capture_delay_ms: u64,
    pub capture_retry_delay_ms: u64,
    pub max_capture_retries: u32,
    pub warning_dismiss_ms: u64,
    pub match_threshold: u32,
    pub capture: CaptureConfig,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            camera_settle_delay_ms: millis(CAMERA_SETTLE_DELAY),
            auto_capture_delay_ms: millis(AUTO_CAPTURE_DELAY),
            capture_retry_delay_ms: millis(CAPTURE_RETRY_DELAY),
            max_capture_retries: MAX_CAPTURE_RETRIES,
            warning_dismiss_ms: millis(WARNING_DISMISS_DELAY),
            match_threshold: MATCH_THRESHOLD,
            capture: CaptureConfig::default(),
        }
    }
}

impl ScanConfig {
    pub fn validated(mut self) -> Self {
        self.camera_settle_delay_ms = self.camera_settle_delay_ms.min(MAX_DELAY_MS);
        self.auto_capture_delay_ms = self.auto_capture_delay_ms.min(MAX_DELAY_MS);
        self.capture_retry_delay_ms = self.capture_retry_delay_ms.min(MAX_DELAY_MS);
        self.warning_dismiss_ms = self.warning_dismiss_ms.clamp(500, MAX_DELAY_MS);
        self.max_capture_retries = self.max_capture_retries.min(MAX_RETRIES_CAP);
        self.capture = self.capture.validated();
        self
    }

    pub fn camera_settle_delay(&self) -> Duration {
        Duration::from_millis(self.camera_settle_delay_ms)
    }

    pub fn auto_capture_delay(&self) -> Duration {
        Duration::from_millis(self.auto_capture_delay_ms)
    }

    pub fn capture_retry_delay(&self) -> Duration {
        Duration::from_millis(self.capture_retry_delay_ms)
    }

    pub fn warning_dismiss_delay(&self) -> Duration {
        Duration::from_millis(self.warning_dismiss_ms)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_timings() {
        let scan = ScanConfig::default();
        assert_eq!(scan.camera_settle_delay(), Duration::from_millis(1500));
        assert_eq!(scan.auto_capture_delay(), Duration::from_secs(3));
        assert_eq!(scan.capture_retry_delay(), Duration::from_secs(2));
        assert_eq!(scan.warning_dismiss_delay(), Duration::from_secs(3));
        assert_eq!(scan.max_capture_retries, 3);
        assert_eq!(scan.match_threshold, 5);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = AppConfig::from_json_str(
            r#"{ "client": { "base_url": "https://api.example.com/" }, "scan": { "max_capture_retries": 1 } }"#,
        )
        .unwrap();

        assert_eq!(config.client.base_url, "https://api.example.com");
        assert_eq!(config.client.refresh_token_header, "X-Refresh-Token");
        assert_eq!(config.scan.max_capture_retries, 1);
        assert_eq!(config.scan.auto_capture_delay_ms, 3000);
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let result = AppConfig::from_json_str(r#"{ "client": { "base_url": "ftp://nope" } }"#);
        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                field: "client.base_url",
                ..
            })
        ));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            AppConfig::from_json_str("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn scan_config_is_clamped() {
        let scan = ScanConfig {
            max_capture_retries: 99,
            warning_dismiss_ms: 0,
            auto_capture_delay_ms: 10 * MAX_DELAY_MS,
            ..ScanConfig::default()
        }
        .validated();
        assert_eq!(scan.max_capture_retries, MAX_RETRIES_CAP);
        assert_eq!(scan.warning_dismiss_ms, 500);
        assert_eq!(scan.auto_capture_delay_ms, MAX_DELAY_MS);
    }

    #[test]
    fn api_and_media_urls() {
        let client = ClientConfig::new("https://api.example.com/");
        assert_eq!(
            client.api_url("/api/media/match").unwrap().as_str(),
            "https://api.example.com/api/media/match"
        );
        assert_eq!(
            client.media_base_url(),
            "https://api.example.com/uploads/media/"
        );
    }
}
