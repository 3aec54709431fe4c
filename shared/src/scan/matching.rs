//! Match upload and response interpretation.

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};

use crate::capabilities::{CapturedImage, HttpResponse, MultipartForm};
use crate::client::{AuthenticatedHttpClient, ClientError, RequestOptions};
use crate::config::ClientConfig;
use crate::model::{MatchResult, MediaType, Route};
use crate::MATCH_PATH;

/// Why an upload ended on the no-match screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoMatchReason {
    Transport(String),
    HttpStatus(u16),
    Malformed(String),
    Unsuccessful,
    NoEntries,
    MissingFileReference,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchTarget {
    /// Absolute URL of the media to play.
    pub url: String,
    pub media_type: MediaType,
    pub result: MatchResult,
}

impl MatchTarget {
    pub fn route(&self) -> Route {
        Route::MediaPlayback {
            url: self.url.clone(),
            media_type: self.media_type,
            title: self.result.title().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Matched(MatchTarget),
    NoMatch(NoMatchReason),
    /// The session is gone; the user has to sign in again.
    AuthRequired,
}

impl MatchOutcome {
    pub fn route(&self) -> Route {
        match self {
            MatchOutcome::Matched(target) => target.route(),
            MatchOutcome::NoMatch(_) => Route::NoMatch,
            MatchOutcome::AuthRequired => Route::SignIn,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MatchResponseBody {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default, rename = "match")]
    best: Option<Value>,
    #[serde(default)]
    matches: Option<Value>,
}

impl MatchResponseBody {
    /// `match` when it is a non-empty object, else `matches[0]` when that is one.
    fn into_entry(self) -> Option<Map<String, Value>> {
        let non_empty = |value: Value| match value {
            Value::Object(map) if !map.is_empty() => Some(map),
            _ => None,
        };
        self.best.and_then(non_empty).or_else(|| {
            self.matches
                .and_then(|matches| match matches {
                    Value::Array(entries) => entries.into_iter().next(),
                    _ => None,
                })
                .and_then(non_empty)
        })
    }
}

pub fn build_match_form(image: &CapturedImage, threshold: u32) -> MultipartForm {
    MultipartForm::new()
        .text("threshold", threshold.to_string())
        .file(
            "image",
            image.file_name(),
            image.mime_type(),
            image.data().to_vec(),
        )
}

/// Resolves a match `file_path` to an absolute URL.
pub fn normalize_media_url(config: &ClientConfig, file_path: &str) -> String {
    let path = file_path.trim();
    if path.starts_with("http") {
        return path.to_string();
    }
    let relative = path.trim_start_matches('/');
    if relative.starts_with("uploads/") {
        format!("{}/{}", config.base_url, relative)
    } else {
        format!("{}{}", config.media_base_url(), relative)
    }
}

fn entry_str<'a>(entry: &'a Map<String, Value>, field: &str) -> Option<&'a str> {
    entry
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn interpret_body(response: &HttpResponse, config: &ClientConfig) -> MatchOutcome {
    if !response.is_success() {
        return MatchOutcome::NoMatch(NoMatchReason::HttpStatus(response.status()));
    }
    let body: MatchResponseBody = match serde_json::from_slice(response.body()) {
        Ok(body) => body,
        Err(e) => return MatchOutcome::NoMatch(NoMatchReason::Malformed(e.to_string())),
    };
    if body.success != Some(true) {
        return MatchOutcome::NoMatch(NoMatchReason::Unsuccessful);
    }
    let Some(mut entry) = body.into_entry() else {
        return MatchOutcome::NoMatch(NoMatchReason::NoEntries);
    };
    let Some(file_path) = entry_str(&entry, "file_path").map(str::to_string) else {
        return MatchOutcome::NoMatch(NoMatchReason::MissingFileReference);
    };

    let declared = entry_str(&entry, "media_type").map_or(MediaType::Unknown, MediaType::from_api);
    let media_type = match declared {
        MediaType::Unknown => MediaType::infer_from_path(&file_path),
        known => known,
    };
    entry.remove("file_path");
    entry.remove("media_type");

    MatchOutcome::Matched(MatchTarget {
        url: normalize_media_url(config, &file_path),
        media_type,
        result: MatchResult {
            media_type,
            file_reference: file_path,
            metadata: entry,
        },
    })
}

pub fn interpret_match_response(
    result: Result<HttpResponse, ClientError>,
    config: &ClientConfig,
) -> MatchOutcome {
    let outcome = match result {
        Err(e) if e.is_auth_failure() => MatchOutcome::AuthRequired,
        Err(e) => MatchOutcome::NoMatch(NoMatchReason::Transport(e.to_string())),
        Ok(response) => interpret_body(&response, config),
    };
    match &outcome {
        MatchOutcome::Matched(target) => {
            info!(media_type = %target.media_type, "artwork matched");
        }
        MatchOutcome::NoMatch(reason) => info!(?reason, "no match"),
        MatchOutcome::AuthRequired => warn!("match upload needs a new sign-in"),
    }
    outcome
}

/// Uploads a captured frame to the match endpoint and interprets the reply.
#[instrument(skip_all, fields(bytes = image.file_size()))]
pub async fn upload_and_interpret(
    client: &AuthenticatedHttpClient,
    image: &CapturedImage,
    threshold: u32,
) -> MatchOutcome {
    let options = RequestOptions::post()
        .multipart(build_match_form(image, threshold))
        .timeout(client.config().upload_timeout());
    let result = client.request(MATCH_PATH, options).await;
    interpret_match_response(result, client.config())
}
