use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::capabilities::{HttpError, HttpResponse};
use crate::client::{
    malformed, rejected, AuthenticatedHttpClient, ClientError, RequestOptions, TokenResponse,
};
use crate::model::{UnixTimeMs, User};
use crate::session::SessionStore;
use crate::{LOGIN_PATH, LOGOUT_PATH, PROFILE_PATH, REGISTER_PATH, SOCIAL_LOGIN_PATH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocialProvider {
    Google,
    Apple,
}

/// A password or provider ID token on its way to the API. Never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

/// Session actions the shell asks the core to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthRequest {
    /// Loads the cached user at startup.
    Restore,
    Login {
        email: String,
        password: Credential,
    },
    Register {
        name: String,
        email: String,
        password: Credential,
    },
    SocialLogin {
        provider: SocialProvider,
        id_token: Credential,
    },
    Logout,
    RefreshProfile,
}

impl AuthRequest {
    pub fn name(&self) -> &'static str {
        match self {
            AuthRequest::Restore => "auth_restore",
            AuthRequest::Login { .. } => "auth_login",
            AuthRequest::Register { .. } => "auth_register",
            AuthRequest::SocialLogin { .. } => "auth_social_login",
            AuthRequest::Logout => "auth_logout",
            AuthRequest::RefreshProfile => "auth_refresh_profile",
        }
    }
}

/// Sign-in, sign-out and profile operations. Every token change goes
/// through the session store.
#[derive(Debug, Clone)]
pub struct AuthApi {
    client: Arc<AuthenticatedHttpClient>,
}

fn require(field: &str, value: &str) -> Result<(), ClientError> {
    if value.trim().is_empty() {
        return Err(ClientError::InvalidRequest(HttpError::InvalidRequest {
            reason: format!("{field} is required"),
        }));
    }
    Ok(())
}

impl AuthApi {
    pub fn new(client: Arc<AuthenticatedHttpClient>) -> Self {
        Self { client }
    }

    fn session(&self) -> &SessionStore {
        self.client.session()
    }

    #[instrument(skip_all)]
    pub async fn login(&self, email: &str, password: &str) -> Result<User, ClientError> {
        require("email", email)?;
        require("password", password)?;
        let options = RequestOptions::post().json(&serde_json::json!({
            "email": email.trim(),
            "password": password,
        }))?;
        let response = self.client.send_public(LOGIN_PATH, options).await?;
        self.complete_sign_in(&response).await
    }

    #[instrument(skip_all)]
    pub async fn register(
        &self,
        name: &str,
        email: &str,
        password: &str,
    ) -> Result<User, ClientError> {
        require("name", name)?;
        require("email", email)?;
        require("password", password)?;
        let options = RequestOptions::post().json(&serde_json::json!({
            "name": name.trim(),
            "email": email.trim(),
            "password": password,
        }))?;
        let response = self.client.send_public(REGISTER_PATH, options).await?;
        self.complete_sign_in(&response).await
    }

    /// Exchanges an ID token already obtained from the provider's SDK.
    #[instrument(skip(self, id_token))]
    pub async fn social_login(
        &self,
        provider: SocialProvider,
        id_token: &str,
    ) -> Result<User, ClientError> {
        require("id_token", id_token)?;
        let options = RequestOptions::post().json(&serde_json::json!({
            "provider": provider,
            "idToken": id_token,
        }))?;
        let response = self.client.send_public(SOCIAL_LOGIN_PATH, options).await?;
        self.complete_sign_in(&response).await
    }

    async fn complete_sign_in(&self, response: &HttpResponse) -> Result<User, ClientError> {
        if !response.is_success() {
            return Err(rejected(response));
        }
        let body: TokenResponse = response.json().map_err(malformed)?;
        let (tokens, user) = body.into_parts(UnixTimeMs::now());
        let Some(user) = user else {
            return Err(ClientError::MalformedResponse {
                reason: "sign-in response carries no user".to_string(),
            });
        };

        self.session().start_session(&tokens, Some(&user)).await?;
        info!(user_id = %user.id, "signed in");
        Ok(user)
    }

    /// Runs one [`AuthRequest`]; `Ok(None)` means no one is signed in.
    pub async fn perform(&self, request: AuthRequest) -> Result<Option<User>, ClientError> {
        match request {
            AuthRequest::Restore => self.current_user().await,
            AuthRequest::Login { email, password } => {
                self.login(&email, password.expose()).await.map(Some)
            }
            AuthRequest::Register {
                name,
                email,
                password,
            } => self
                .register(&name, &email, password.expose())
                .await
                .map(Some),
            AuthRequest::SocialLogin { provider, id_token } => self
                .social_login(provider, id_token.expose())
                .await
                .map(Some),
            AuthRequest::Logout => self.logout().await.map(|()| None),
            AuthRequest::RefreshProfile => self.profile().await.map(Some),
        }
    }

    /// Tells the server, then always drops the local session.
    #[instrument(skip_all)]
    pub async fn logout(&self) -> Result<(), ClientError> {
        if self.session().is_authenticated().await? {
            match self.client.request(LOGOUT_PATH, RequestOptions::post()).await {
                Ok(response) if response.is_success() => {}
                Ok(response) => warn!(status = response.status(), "logout call rejected"),
                Err(e) => warn!(error = %e, "logout call failed"),
            }
        }
        self.session().clear().await?;
        info!("signed out");
        Ok(())
    }

    /// Fetches the profile and refreshes the cached user, unless the
    /// session ended while the request was out.
    pub async fn profile(&self) -> Result<User, ClientError> {
        let generation = self.session().generation();
        let mut body: serde_json::Value = self
            .client
            .request_json(PROFILE_PATH, RequestOptions::get())
            .await?;
        let raw = if body.get("user").is_some_and(serde_json::Value::is_object) {
            body["user"].take()
        } else {
            body
        };
        let user: User = serde_json::from_value(raw).map_err(|e| ClientError::MalformedResponse {
            reason: e.to_string(),
        })?;
        if !self.session().update_user(&user, generation).await? {
            return Err(ClientError::SessionExpired);
        }
        Ok(user)
    }

    pub async fn current_user(&self) -> Result<Option<User>, ClientError> {
        Ok(self.session().user().await?)
    }

    pub async fn is_authenticated(&self) -> Result<bool, ClientError> {
        Ok(self.session().is_authenticated().await?)
    }
}
