use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};
use std::{fmt, time::Duration};
use uuid::Uuid;

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(UserId);

/// Explicit timestamp unit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        let ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Self(ms)
    }

    pub fn saturating_add(self, duration: Duration) -> Self {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(ms))
    }
}

// --- Media match ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Video,
    Audio,
    Unknown,
}

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "m4v", "mov", "webm", "mkv", "avi"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "aac", "wav", "ogg", "oga", "flac"];

impl MediaType {
    /// Maps the server's `media_type` field; anything unrecognised is `Unknown`.
    pub fn from_api(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "video" => MediaType::Video,
            "audio" => MediaType::Audio,
            _ => MediaType::Unknown,
        }
    }

    /// Best guess from the file extension of a path or URL.
    pub fn infer_from_path(path: &str) -> Self {
        let path = path.split(['?', '#']).next().unwrap_or(path);
        let Some((_, ext)) = path.rsplit_once('.') else {
            return MediaType::Unknown;
        };
        let ext = ext.to_ascii_lowercase();
        if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            MediaType::Video
        } else if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
            MediaType::Audio
        } else {
            MediaType::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Video => "video",
            MediaType::Audio => "audio",
            MediaType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One match entry returned by the media match endpoint.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MatchResult {
    pub media_type: MediaType,
    pub file_reference: String,
    /// Everything else the server sent for this entry, kept for presentation.
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl MatchResult {
    fn metadata_str(&self, field: &str) -> Option<&str> {
        self.metadata
            .get(field)
            .and_then(serde_json::Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    pub fn title(&self) -> Option<&str> {
        self.metadata_str("title")
    }

    pub fn description(&self) -> Option<&str> {
        self.metadata_str("description")
    }

    pub fn collection(&self) -> Option<&str> {
        self.metadata_str("collection")
    }

    pub fn environment(&self) -> Option<&str> {
        self.metadata_str("environment")
    }
}

// --- Capture attempts ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AttemptId(pub Uuid);

impl AttemptId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureOutcome {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CaptureAttempt {
    pub id: AttemptId,
    pub started_at: UnixTimeMs,
    pub retry_count: u32,
    pub outcome: CaptureOutcome,
}

impl CaptureAttempt {
    pub fn new(started_at: UnixTimeMs) -> Self {
        Self {
            id: AttemptId::generate(),
            started_at,
            retry_count: 0,
            outcome: CaptureOutcome::Pending,
        }
    }
}

// --- Navigation ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum Route {
    MediaPlayback {
        url: String,
        #[serde(rename = "type")]
        media_type: MediaType,
        title: Option<String>,
    },
    NoMatch,
    SignIn,
}

// --- Session ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct User {
    #[serde(deserialize_with = "deserialize_user_id")]
    pub id: UserId,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "avatarUrl", alias = "avatar")]
    pub avatar_url: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// The backend sends numeric ids for local accounts and string ids for social ones.
fn deserialize_user_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<UserId, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(i64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => UserId(s),
        RawId::Number(n) => UserId(n.to_string()),
    })
}

/// Access/refresh token pair. Never serialized; persisted field by field by
/// the session store.
pub struct SessionTokens {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub expires_at: Option<UnixTimeMs>,
}

impl SessionTokens {
    pub fn is_expired(&self, now: UnixTimeMs) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

impl Clone for SessionTokens {
    fn clone(&self) -> Self {
        Self {
            access_token: clone_secret(&self.access_token),
            refresh_token: self.refresh_token.as_ref().map(clone_secret),
            expires_at: self.expires_at,
        }
    }
}

impl fmt::Debug for SessionTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTokens")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token_present", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

pub(crate) fn clone_secret(secret: &SecretString) -> SecretString {
    SecretString::new(secret.expose_secret().clone())
}
