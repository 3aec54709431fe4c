#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod auth;
pub mod capabilities;
pub mod client;
pub mod config;
pub mod event;
pub mod model;
pub mod scan;
pub mod session;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub use auth::{AuthApi, AuthRequest, Credential, SocialProvider};
pub use capabilities::{Capabilities, Effect};
pub use client::{AuthenticatedHttpClient, ClientError, RequestOptions};
pub use config::{AppConfig, ClientConfig, ConfigError, ScanConfig};
pub use event::ScanEvent;
pub use model::{MatchResult, MediaType, Route, SessionTokens, UnixTimeMs, User};
pub use scan::{ScanCoordinator, ScanMachine, ScanModel, ScanState, ScanViewModel};
pub use session::SessionStore;

use capabilities::{CameraError, HttpError, KvError};

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:3000";
pub const MEDIA_UPLOADS_PATH: &str = "/uploads/media";
pub const MATCH_PATH: &str = "/api/media/match";
pub const LOGIN_PATH: &str = "/api/auth/login";
pub const REGISTER_PATH: &str = "/api/auth/register";
pub const SOCIAL_LOGIN_PATH: &str = "/api/auth/social-login";
pub const REFRESH_PATH: &str = "/api/auth/refresh";
pub const LOGOUT_PATH: &str = "/api/auth/logout";
pub const PROFILE_PATH: &str = "/api/auth/profile";
pub const REFRESH_TOKEN_HEADER: &str = "X-Refresh-Token";
pub const ROTATED_TOKEN_HEADER: &str = "X-New-Access-Token";
pub const MATCH_THRESHOLD: u32 = 5;
pub const MAX_CAPTURE_RETRIES: u32 = 3;
pub const CAMERA_SETTLE_DELAY: Duration = Duration::from_millis(1500);
pub const AUTO_CAPTURE_DELAY: Duration = Duration::from_secs(3);
pub const CAPTURE_RETRY_DELAY: Duration = Duration::from_secs(2);
pub const WARNING_DISMISS_DELAY: Duration = Duration::from_secs(3);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Failure classes the shell can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Offline,
    Timeout,
    SignInRequired,
    Forbidden,
    BadRequest,
    NotFound,
    RateLimited,
    ServerError,
    UnexpectedResponse,
    Storage,
    CaptureFailed,
    CameraPermission,
    UnusableImage,
    Configuration,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Offline => "OFFLINE",
            Self::Timeout => "TIMEOUT",
            Self::SignInRequired => "SIGN_IN_REQUIRED",
            Self::Forbidden => "FORBIDDEN",
            Self::BadRequest => "BAD_REQUEST",
            Self::NotFound => "NOT_FOUND",
            Self::RateLimited => "RATE_LIMITED",
            Self::ServerError => "SERVER_ERROR",
            Self::UnexpectedResponse => "UNEXPECTED_RESPONSE",
            Self::Storage => "STORAGE",
            Self::CaptureFailed => "CAPTURE_FAILED",
            Self::CameraPermission => "CAMERA_PERMISSION",
            Self::UnusableImage => "UNUSABLE_IMAGE",
            Self::Configuration => "CONFIGURATION",
            Self::Internal => "INTERNAL",
        }
    }

    /// Whether trying the same thing again later can succeed.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Offline
                | Self::Timeout
                | Self::RateLimited
                | Self::ServerError
                | Self::Storage
                | Self::CaptureFailed
        )
    }

    fn from_status(status: u16) -> Self {
        match status {
            400 | 409 | 422 => Self::BadRequest,
            401 => Self::SignInRequired,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            408 => Self::Timeout,
            429 => Self::RateLimited,
            500..=599 => Self::ServerError,
            _ => Self::UnexpectedResponse,
        }
    }
}

/// Error handed across the shell boundary: a stable code, a message for
/// logs and optional diagnostic context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub message: String,
    pub internal_message: Option<String>,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            internal_message: None,
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal_message = Some(internal.into());
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Copy shown on the scan screen banner or a sign-in prompt.
    #[must_use]
    pub fn user_facing_message(&self) -> String {
        let text = match self.kind {
            ErrorKind::Offline => "You appear to be offline. Check your connection and scan again.",
            ErrorKind::Timeout | ErrorKind::ServerError => {
                "The gallery server is slow to respond. Try scanning again in a moment."
            }
            ErrorKind::SignInRequired => "Please sign in to scan artworks.",
            ErrorKind::Forbidden => "Your account can't open this artwork.",
            ErrorKind::BadRequest => return self.message.clone(),
            ErrorKind::NotFound => "That artwork is no longer available.",
            ErrorKind::RateLimited => "Lots of scans at once. Wait a few seconds and try again.",
            ErrorKind::UnexpectedResponse => "Something went wrong reading the server's answer.",
            ErrorKind::Storage => "Couldn't save your sign-in on this device.",
            ErrorKind::CaptureFailed => {
                "Couldn't capture the artwork. Hold steady and tap to scan again."
            }
            ErrorKind::CameraPermission => "Allow camera access in Settings to scan artworks.",
            ErrorKind::UnusableImage => "That photo can't be used. Move closer and scan again.",
            ErrorKind::Configuration | ErrorKind::Internal => {
                "Something went wrong. Restart the app and try again."
            }
        };
        text.to_string()
    }

    #[must_use]
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::from_status(status), message)
            .with_context("http_status", status.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {internal})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<CameraError> for AppError {
    fn from(e: CameraError) -> Self {
        let kind = match &e {
            CameraError::PermissionDenied => ErrorKind::CameraPermission,
            CameraError::ImageTooLarge { .. } | CameraError::InvalidImage { .. } => {
                ErrorKind::UnusableImage
            }
            CameraError::Timeout { .. }
            | CameraError::Unavailable { .. }
            | CameraError::CaptureFailed { .. }
            | CameraError::Released => ErrorKind::CaptureFailed,
        };
        AppError::new(kind, e.to_string())
    }
}

impl From<HttpError> for AppError {
    fn from(e: HttpError) -> Self {
        let kind = match &e {
            HttpError::Connection { .. } => ErrorKind::Offline,
            HttpError::Timeout { .. } => ErrorKind::Timeout,
            HttpError::InvalidResponse { .. } | HttpError::ResponseTooLarge { .. } => {
                ErrorKind::UnexpectedResponse
            }
            HttpError::BodyTooLarge { .. } => ErrorKind::UnusableImage,
            HttpError::Serialization { .. }
            | HttpError::InvalidUrl { .. }
            | HttpError::InvalidHeader { .. }
            | HttpError::InvalidRequest { .. } => ErrorKind::Internal,
        };
        AppError::new(kind, e.to_string())
    }
}

impl From<KvError> for AppError {
    fn from(e: KvError) -> Self {
        let kind = match &e {
            KvError::InvalidKey { .. } => ErrorKind::Internal,
            KvError::ValueTooLarge { .. }
            | KvError::Storage { .. }
            | KvError::Serialization { .. } => ErrorKind::Storage,
        };
        AppError::new(kind, e.to_string())
    }
}

impl From<ClientError> for AppError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::NoAccessToken | ClientError::SessionExpired => {
                AppError::new(ErrorKind::SignInRequired, e.to_string())
            }
            ClientError::NetworkError(inner) | ClientError::InvalidRequest(inner) => inner.into(),
            ClientError::MalformedResponse { reason } => {
                AppError::new(ErrorKind::UnexpectedResponse, "malformed server response")
                    .with_internal(reason)
            }
            ClientError::Rejected {
                status,
                code,
                message,
            } => {
                let error = AppError::from_http_status(status, message);
                match code {
                    Some(code) => error.with_context("api_code", code),
                    None => error,
                }
            }
            ClientError::Storage(inner) => inner.into(),
        }
    }
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        AppError::new(ErrorKind::Configuration, e.to_string())
    }
}
