//! The scan screen: camera readiness, auto and manual capture with bounded
//! retry, match upload and result navigation.
//!
//! [`ScanMachine`] holds every decision and is driven synchronously;
//! [`ScanCoordinator`] is the Crux app that feeds it shell events and turns
//! its effects into capability requests.

mod coordinator;
mod machine;
mod matching;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::capabilities::CapturedImage;
use crate::model::{AttemptId, Route, User};

pub use self::coordinator::{ScanCoordinator, ScanModel};
pub use self::machine::ScanMachine;
pub use self::matching::{
    build_match_form, interpret_match_response, normalize_media_url, upload_and_interpret,
    MatchOutcome, MatchTarget, NoMatchReason,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanState {
    #[default]
    Idle,
    ArmedForAutoCapture,
    Capturing,
    CaptureWarning,
    Uploading,
    NoMatch,
    MediaPlayback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ScanTimer {
    /// Delay between the hardware-ready callback and treating the camera as initialized.
    CameraSettle,
    AutoCapture,
    CaptureRetry,
    WarningDismiss,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanEffect {
    ScheduleTimer {
        timer: ScanTimer,
        epoch: u64,
        after: Duration,
    },
    CancelTimer(ScanTimer),
    CancelAllTimers,
    Capture {
        attempt: AttemptId,
    },
    Upload {
        attempt: AttemptId,
        image: CapturedImage,
    },
    Navigate(Route),
    ReleaseCamera,
}

/// What the shell renders.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanViewModel {
    pub state: ScanState,
    pub is_scanning: bool,
    pub camera_initialized: bool,
    pub permission_granted: Option<bool>,
    pub retry_count: u32,
    /// Transient capture warning banner.
    pub warning: Option<String>,
    pub user: Option<User>,
    pub auth_pending: bool,
    pub auth_error: Option<String>,
}
