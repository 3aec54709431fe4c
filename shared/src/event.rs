use crate::auth::AuthRequest;
use crate::capabilities::{CameraError, CapturedImage};
use crate::client::ClientError;
use crate::config::AppConfig;
use crate::model::{AttemptId, User};
use crate::scan::{MatchOutcome, ScanTimer};

/// Everything [`crate::ScanCoordinator`] reacts to. The shell sends the
/// setup, lifecycle, trigger and auth events; the rest come back from
/// capabilities as effects complete.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    // Setup
    Configure(AppConfig),
    /// The scan screen is on display; the camera permission is looked up.
    Mounted,

    // Screen lifecycle
    PermissionResolved {
        granted: bool,
    },
    CameraReady,
    FocusGained,
    FocusLost,
    Unmounted,

    // Triggers
    ManualCaptureRequested,
    TimerElapsed {
        timer: ScanTimer,
        epoch: u64,
    },

    // Session
    Auth(AuthRequest),
    /// `Ok(None)` means signed out.
    AuthFinished(Result<Option<User>, ClientError>),

    // Effect results
    CaptureSucceeded {
        attempt: AttemptId,
        image: CapturedImage,
    },
    CaptureFailed {
        attempt: AttemptId,
        error: CameraError,
    },
    UploadFinished {
        attempt: AttemptId,
        outcome: MatchOutcome,
    },
}

impl ScanEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ScanEvent::Configure(_) => "configure",
            ScanEvent::Mounted => "mounted",
            ScanEvent::PermissionResolved { .. } => "permission_resolved",
            ScanEvent::CameraReady => "camera_ready",
            ScanEvent::FocusGained => "focus_gained",
            ScanEvent::FocusLost => "focus_lost",
            ScanEvent::Unmounted => "unmounted",
            ScanEvent::ManualCaptureRequested => "manual_capture_requested",
            ScanEvent::TimerElapsed { .. } => "timer_elapsed",
            ScanEvent::Auth(request) => request.name(),
            ScanEvent::AuthFinished(_) => "auth_finished",
            ScanEvent::CaptureSucceeded { .. } => "capture_succeeded",
            ScanEvent::CaptureFailed { .. } => "capture_failed",
            ScanEvent::UploadFinished { .. } => "upload_finished",
        }
    }

    /// Events that come straight from the user rather than from an effect.
    pub fn is_user_initiated(&self) -> bool {
        matches!(
            self,
            ScanEvent::ManualCaptureRequested | ScanEvent::Auth(_)
        )
    }
}
