use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{upload_and_interpret, MatchOutcome, ScanEffect, ScanMachine, ScanViewModel};
use crate::auth::{AuthApi, AuthRequest};
use crate::capabilities::{Capabilities, ShellHttpTransport, ShellKvStore};
use crate::client::{AuthenticatedHttpClient, ClientError};
use crate::config::AppConfig;
use crate::event::ScanEvent;
use crate::model::{AttemptId, UnixTimeMs, User};
use crate::session::SessionStore;
use crate::AppError;

/// The core app: routes shell events into the [`ScanMachine`] and the
/// session, and turns the machine's effects into capability requests.
#[derive(Debug, Default)]
pub struct ScanCoordinator;

#[derive(Debug)]
pub struct ScanModel {
    config: AppConfig,
    machine: ScanMachine,
    /// Built on first use from the HTTP and key-value capabilities.
    client: Option<Arc<AuthenticatedHttpClient>>,
    user: Option<User>,
    auth_pending: bool,
    auth_error: Option<AppError>,
}

impl Default for ScanModel {
    fn default() -> Self {
        Self::new(AppConfig::default())
    }
}

impl ScanModel {
    pub fn new(config: AppConfig) -> Self {
        let config = config.validated();
        Self {
            machine: ScanMachine::new(config.scan.clone()),
            config,
            client: None,
            user: None,
            auth_pending: false,
            auth_error: None,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn machine(&self) -> &ScanMachine {
        &self.machine
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    fn client(&mut self, caps: &Capabilities) -> Arc<AuthenticatedHttpClient> {
        if let Some(client) = &self.client {
            return client.clone();
        }
        let session = SessionStore::new(Arc::new(ShellKvStore::new(caps.kv.clone())));
        let client = Arc::new(AuthenticatedHttpClient::new(
            self.config.client.clone(),
            Arc::new(ShellHttpTransport::new(caps.http.clone())),
            session,
        ));
        info!(base_url = %self.config.client.base_url, "authenticated client ready");
        self.client = Some(client.clone());
        client
    }
}

impl crux_core::App for ScanCoordinator {
    type Event = ScanEvent;
    type Model = ScanModel;
    type ViewModel = ScanViewModel;
    type Capabilities = Capabilities;

    fn update(&self, event: ScanEvent, model: &mut ScanModel, caps: &Capabilities) {
        if event.is_user_initiated() {
            info!(event = event.name(), "user action");
        }

        match event {
            ScanEvent::Configure(config) => {
                info!(base_url = %config.client.base_url, "core configured");
                *model = ScanModel {
                    user: model.user.take(),
                    ..ScanModel::new(config)
                };
                caps.timer.cancel_all();
            }
            ScanEvent::Mounted => {
                let effects = model.machine.handle(ScanEvent::Mounted, UnixTimeMs::now());
                run(effects, model, caps);
                caps.camera.permission_status(|status| {
                    debug!(?status, "camera permission resolved");
                    ScanEvent::PermissionResolved {
                        granted: status.is_granted(),
                    }
                });
            }
            ScanEvent::Auth(request) => start_auth(request, model, caps),
            ScanEvent::AuthFinished(result) => finish_auth(result, model),
            ScanEvent::UploadFinished { attempt, outcome } => {
                if outcome == MatchOutcome::AuthRequired {
                    model.user = None;
                }
                let effects = model
                    .machine
                    .handle(ScanEvent::UploadFinished { attempt, outcome }, UnixTimeMs::now());
                run(effects, model, caps);
            }
            event => {
                let effects = model.machine.handle(event, UnixTimeMs::now());
                run(effects, model, caps);
            }
        }

        caps.render.render();
    }

    fn view(&self, model: &ScanModel) -> ScanViewModel {
        ScanViewModel {
            user: model.user.clone(),
            auth_pending: model.auth_pending,
            auth_error: model.auth_error.as_ref().map(AppError::user_facing_message),
            ..model.machine.view_model()
        }
    }
}

fn run(effects: Vec<ScanEffect>, model: &mut ScanModel, caps: &Capabilities) {
    for effect in effects {
        match effect {
            ScanEffect::ScheduleTimer {
                timer,
                epoch,
                after,
            } => caps
                .timer
                .start(timer, epoch, after, |timer, epoch| ScanEvent::TimerElapsed {
                    timer,
                    epoch,
                }),
            ScanEffect::CancelTimer(timer) => caps.timer.cancel(timer),
            ScanEffect::CancelAllTimers => caps.timer.cancel_all(),
            ScanEffect::Capture { attempt } => capture(attempt, model, caps),
            ScanEffect::Upload { attempt, image } => {
                let client = model.client(caps);
                let threshold = model.machine.config().match_threshold;
                caps.compose.spawn(move |context| async move {
                    let outcome = upload_and_interpret(&client, &image, threshold).await;
                    context.update_app(ScanEvent::UploadFinished { attempt, outcome });
                });
            }
            ScanEffect::Navigate(route) => {
                info!(?route, "navigating");
                caps.navigator.navigate(route);
            }
            ScanEffect::ReleaseCamera => caps.camera.release(),
        }
    }
}

fn capture(attempt: AttemptId, model: &ScanModel, caps: &Capabilities) {
    let config = model.machine.config().capture.clone();
    caps.camera.capture(config, move |result| match result {
        Ok(image) => ScanEvent::CaptureSucceeded { attempt, image },
        Err(error) => ScanEvent::CaptureFailed { attempt, error },
    });
}

fn start_auth(request: AuthRequest, model: &mut ScanModel, caps: &Capabilities) {
    if model.auth_pending && request != AuthRequest::Logout {
        warn!(request = request.name(), "auth request already in flight, ignoring");
        return;
    }
    model.auth_pending = true;
    model.auth_error = None;
    if request == AuthRequest::Logout {
        // Signed out from the UI's point of view right away.
        model.user = None;
    }
    let api = AuthApi::new(model.client(caps));
    caps.compose.spawn(move |context| async move {
        let result = api.perform(request).await;
        context.update_app(ScanEvent::AuthFinished(result));
    });
}

fn finish_auth(result: Result<Option<User>, ClientError>, model: &mut ScanModel) {
    model.auth_pending = false;
    match result {
        Ok(user) => {
            debug!(signed_in = user.is_some(), "auth finished");
            model.user = user;
        }
        Err(e) => {
            warn!(error = %e, "auth request failed");
            if e.is_auth_failure() {
                model.user = None;
            }
            model.auth_error = Some(AppError::from(e));
        }
    }
}
