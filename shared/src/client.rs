//! Authenticated HTTP client.
//!
//! Wraps the [`HttpTransport`] capability with bearer-token injection,
//! server-side token rotation, and a single-flight refresh that retries the
//! original request once when the server reports an expired access token.

use futures::future::{BoxFuture, FutureExt, Shared};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{
    HttpBody, HttpError, HttpMethod, HttpRequest, HttpResponse, HttpTransport, KvError,
    MultipartForm,
};
use crate::config::ClientConfig;
use crate::model::{SessionTokens, UnixTimeMs, User};
use crate::session::SessionStore;
use crate::REFRESH_PATH;

/// Body `code` the API sends with a 401 when the access token has expired.
pub const TOKEN_EXPIRED_CODE: &str = "TOKEN_EXPIRED";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("no access token stored")]
    NoAccessToken,

    #[error("session expired")]
    SessionExpired,

    #[error("network error: {0}")]
    NetworkError(HttpError),

    #[error("malformed response: {reason}")]
    MalformedResponse { reason: String },

    #[error("request rejected with status {status}: {message}")]
    Rejected {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("session storage error: {0}")]
    Storage(KvError),

    #[error("invalid request: {0}")]
    InvalidRequest(HttpError),
}

impl ClientError {
    /// Failures that end the session and send the user back to sign-in.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ClientError::NoAccessToken | ClientError::SessionExpired)
    }
}

impl From<HttpError> for ClientError {
    fn from(err: HttpError) -> Self {
        if err.is_request_error() {
            ClientError::InvalidRequest(err)
        } else {
            ClientError::NetworkError(err)
        }
    }
}

impl From<KvError> for ClientError {
    fn from(err: KvError) -> Self {
        ClientError::Storage(err)
    }
}

/// Method, extra headers and body of a request against a relative API path.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: HttpMethod,
    pub headers: Vec<(String, String)>,
    pub body: HttpBody,
    pub timeout: Option<Duration>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self::get()
    }
}

impl RequestOptions {
    pub fn new(method: HttpMethod) -> Self {
        Self {
            method,
            headers: Vec::new(),
            body: HttpBody::Empty,
            timeout: None,
        }
    }

    pub fn get() -> Self {
        Self::new(HttpMethod::Get)
    }

    pub fn post() -> Self {
        Self::new(HttpMethod::Post)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json<T: Serialize>(self, value: &T) -> Result<Self, ClientError> {
        let body = serde_json::to_vec(value).map_err(|e| {
            ClientError::InvalidRequest(HttpError::Serialization {
                message: e.to_string(),
            })
        })?;
        let mut options = self.header("Content-Type", "application/json");
        options.body = HttpBody::Bytes(body);
        Ok(options)
    }

    pub fn multipart(mut self, form: MultipartForm) -> Self {
        self.body = HttpBody::Multipart(form);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    code: Option<String>,
    message: Option<String>,
    error: Option<String>,
}

fn error_body(response: &HttpResponse) -> ApiErrorBody {
    serde_json::from_slice(response.body()).unwrap_or_default()
}

fn is_token_expired(response: &HttpResponse) -> bool {
    response.status() == 401 && error_body(response).code.as_deref() == Some(TOKEN_EXPIRED_CODE)
}

/// Builds a [`ClientError::Rejected`] from a non-2xx response.
pub(crate) fn rejected(response: &HttpResponse) -> ClientError {
    let body = error_body(response);
    ClientError::Rejected {
        status: response.status(),
        message: body
            .message
            .or(body.error)
            .unwrap_or_else(|| format!("HTTP {}", response.status())),
        code: body.code,
    }
}

pub(crate) fn malformed(err: HttpError) -> ClientError {
    ClientError::MalformedResponse {
        reason: err.to_string(),
    }
}

/// `{ accessToken, refreshToken, expiresIn, user }` as returned by the auth endpoints.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TokenResponse {
    access_token: SecretString,
    #[serde(default)]
    refresh_token: Option<SecretString>,
    /// Seconds.
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    user: Option<User>,
}

impl TokenResponse {
    /// Splits the body into the token set to persist and the user, if any.
    pub(crate) fn into_parts(self, now: UnixTimeMs) -> (SessionTokens, Option<User>) {
        let tokens = SessionTokens {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: self
                .expires_in
                .map(|secs| now.saturating_add(Duration::from_secs(secs))),
        };
        (tokens, self.user)
    }
}

type RefreshResult = Result<Arc<SecretString>, ClientError>;
type InFlightRefresh = Shared<BoxFuture<'static, RefreshResult>>;

pub struct AuthenticatedHttpClient {
    config: Arc<ClientConfig>,
    transport: Arc<dyn HttpTransport>,
    session: SessionStore,
    refresh_in_flight: Mutex<Option<InFlightRefresh>>,
}

impl std::fmt::Debug for AuthenticatedHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatedHttpClient")
            .field("base_url", &self.config.base_url)
            .field("refresh_in_flight", &self.is_refreshing())
            .finish()
    }
}

impl AuthenticatedHttpClient {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn HttpTransport>,
        session: SessionStore,
    ) -> Self {
        Self {
            config: Arc::new(config),
            transport,
            session,
            refresh_in_flight: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    pub fn is_refreshing(&self) -> bool {
        self.refresh_in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn build_request(
        &self,
        path: &str,
        options: &RequestOptions,
        access_token: Option<&SecretString>,
        refresh_token: Option<&SecretString>,
    ) -> Result<HttpRequest, ClientError> {
        let url = self.config.api_url(path)?;
        let mut request = HttpRequest::new(options.method, url)
            .with_timeout(options.timeout.unwrap_or(self.config.request_timeout()))?;
        for (name, value) in &options.headers {
            request = request.with_header(name.clone(), value.clone())?;
        }
        if let Some(token) = access_token {
            request =
                request.with_header("Authorization", format!("Bearer {}", token.expose_secret()))?;
        }
        if let Some(token) = refresh_token {
            request = request.with_header(
                self.config.refresh_token_header.clone(),
                token.expose_secret().clone(),
            )?;
        }
        Ok(request.with_body(options.body.clone())?)
    }

    /// Sends a request without credentials (login, register, social login).
    #[instrument(skip(self, options), fields(method = options.method.as_str()))]
    pub async fn send_public(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<HttpResponse, ClientError> {
        let request = self.build_request(path, &options, None, None)?;
        Ok(self.transport.execute(request).await?)
    }

    /// Sends an authenticated request.
    ///
    /// Non-2xx responses are returned as-is, except a 401 carrying
    /// [`TOKEN_EXPIRED_CODE`] while a refresh token is stored: that triggers
    /// one refresh and one retry of the original request.
    #[instrument(skip(self, options), fields(method = options.method.as_str()))]
    pub async fn request(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<HttpResponse, ClientError> {
        let generation = self.session.generation();
        let Some(access) = self.session.access_token().await? else {
            // Drop whatever is left of a half-written session.
            if let Err(e) = self.session.clear().await {
                warn!(error = %e, "failed to clear session without access token");
            }
            return Err(ClientError::NoAccessToken);
        };
        let refresh = self.session.refresh_token().await?;

        let request = self.build_request(path, &options, Some(&access), refresh.as_ref())?;
        let response = self.transport.execute(request).await?;
        self.capture_rotated_token(&response, generation).await;

        if refresh.is_none() || !is_token_expired(&response) {
            return Ok(response);
        }

        info!("access token expired, refreshing before retry");
        let access = self.refresh_access_token().await?;
        let generation = self.session.generation();
        let refresh = self.session.refresh_token().await?;
        let retry = self.build_request(path, &options, Some(&access), refresh.as_ref())?;
        let response = self.transport.execute(retry).await?;
        self.capture_rotated_token(&response, generation).await;
        Ok(response)
    }

    /// Authenticated request decoding a JSON body from a 2xx response.
    pub async fn request_json<T: DeserializeOwned>(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<T, ClientError> {
        let response = self.request(path, options).await?;
        if !response.is_success() {
            return Err(rejected(&response));
        }
        response.json().map_err(malformed)
    }

    async fn capture_rotated_token(&self, response: &HttpResponse, generation: u64) {
        let Some(raw) = response.header(&self.config.rotated_token_header) else {
            return;
        };
        let token = raw.trim();
        let token = token.strip_prefix("Bearer ").unwrap_or(token).trim();
        if token.is_empty() {
            return;
        }
        match self
            .session
            .store_access_token(&SecretString::new(token.to_string()), generation)
            .await
        {
            Ok(true) => debug!("stored rotated access token"),
            Ok(false) => debug!("session changed, dropping rotated access token"),
            Err(e) => warn!(error = %e, "failed to store rotated access token"),
        }
    }

    /// Exchanges the stored refresh token for a new access token.
    ///
    /// Concurrent callers share one network call and observe the same
    /// outcome. Any failure clears the session and yields
    /// [`ClientError::SessionExpired`]. A refresh that finishes after a
    /// sign-out or a new sign-in persists nothing and also yields
    /// [`ClientError::SessionExpired`].
    pub async fn refresh_access_token(&self) -> RefreshResult {
        let in_flight = {
            let mut slot = self
                .refresh_in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(existing) => {
                    debug!("joining in-flight token refresh");
                    existing.clone()
                }
                None => {
                    let refresh = Self::perform_refresh(
                        self.config.clone(),
                        self.transport.clone(),
                        self.session.clone(),
                    )
                    .boxed()
                    .shared();
                    *slot = Some(refresh.clone());
                    refresh
                }
            }
        };

        let result = in_flight.clone().await;

        let mut slot = self
            .refresh_in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot
            .as_ref()
            .is_some_and(|current| current.ptr_eq(&in_flight))
        {
            *slot = None;
        }
        result
    }

    async fn perform_refresh(
        config: Arc<ClientConfig>,
        transport: Arc<dyn HttpTransport>,
        session: SessionStore,
    ) -> RefreshResult {
        let generation = session.generation();
        match Self::exchange_refresh_token(&config, transport.as_ref(), &session, generation).await
        {
            Ok(token) => {
                info!("access token refreshed");
                Ok(token)
            }
            Err(ClientError::SessionExpired) if session.generation() != generation => {
                info!("session ended during token refresh");
                Err(ClientError::SessionExpired)
            }
            Err(e) => {
                warn!(error = %e, "token refresh failed, clearing session");
                if let Err(clear_err) = session.clear_if_current(generation).await {
                    warn!(error = %clear_err, "failed to clear session after refresh failure");
                }
                Err(ClientError::SessionExpired)
            }
        }
    }

    async fn exchange_refresh_token(
        config: &ClientConfig,
        transport: &dyn HttpTransport,
        session: &SessionStore,
        generation: u64,
    ) -> RefreshResult {
        let refresh = session
            .refresh_token()
            .await?
            .ok_or(ClientError::SessionExpired)?;

        let request = HttpRequest::new(HttpMethod::Post, config.api_url(REFRESH_PATH)?)
            .with_timeout(config.request_timeout())?
            .with_json(&serde_json::json!({ "refreshToken": refresh.expose_secret() }))?;
        let response = transport.execute(request).await?;
        if !response.is_success() {
            return Err(rejected(&response));
        }

        let body: TokenResponse = response.json().map_err(malformed)?;
        let (tokens, user) = body.into_parts(UnixTimeMs::now());
        if !session
            .update_tokens(&tokens, user.as_ref(), generation)
            .await?
        {
            return Err(ClientError::SessionExpired);
        }
        Ok(Arc::new(tokens.access_token))
    }
}
