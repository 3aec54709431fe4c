use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{MatchOutcome, ScanEffect, ScanState, ScanTimer, ScanViewModel};
use crate::capabilities::{CameraError, CapturedImage};
use crate::config::ScanConfig;
use crate::event::ScanEvent;
use crate::model::{AttemptId, CaptureAttempt, CaptureOutcome, UnixTimeMs};
use crate::AppError;

/// Deterministic scan state machine.
///
/// `handle` applies one event and returns the effects the driver must run.
/// Timers are tagged with an epoch and results with the attempt id, so
/// anything arriving after a cancel, a focus change or a newer attempt is
/// dropped here.
#[derive(Debug)]
pub struct ScanMachine {
    config: ScanConfig,
    state: ScanState,
    permission_granted: Option<bool>,
    camera_ready: bool,
    camera_initialized: bool,
    focused: bool,
    navigated_away: bool,
    is_scanning: bool,
    attempt: Option<CaptureAttempt>,
    warning: Option<String>,
    next_epoch: u64,
    armed: BTreeMap<ScanTimer, u64>,
}

impl ScanMachine {
    /// A machine for a mounted, focused scan screen.
    pub fn new(config: ScanConfig) -> Self {
        Self {
            config: config.validated(),
            state: ScanState::Idle,
            permission_granted: None,
            camera_ready: false,
            camera_initialized: false,
            focused: true,
            navigated_away: false,
            is_scanning: false,
            attempt: None,
            warning: None,
            next_epoch: 0,
            armed: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn is_scanning(&self) -> bool {
        self.is_scanning
    }

    pub fn attempt(&self) -> Option<&CaptureAttempt> {
        self.attempt.as_ref()
    }

    pub fn warning(&self) -> Option<&str> {
        self.warning.as_deref()
    }

    pub fn navigated_away(&self) -> bool {
        self.navigated_away
    }

    /// Epoch of the armed timer, if it is armed.
    pub fn pending_timer(&self, timer: ScanTimer) -> Option<u64> {
        self.armed.get(&timer).copied()
    }

    pub fn view_model(&self) -> ScanViewModel {
        ScanViewModel {
            state: self.state,
            is_scanning: self.is_scanning,
            camera_initialized: self.camera_initialized,
            permission_granted: self.permission_granted,
            retry_count: self.attempt.as_ref().map_or(0, |a| a.retry_count),
            warning: self.warning.clone(),
            ..ScanViewModel::default()
        }
    }

    pub fn handle(&mut self, event: ScanEvent, now: UnixTimeMs) -> Vec<ScanEffect> {
        let mut effects = Vec::new();
        debug!(event = event.name(), state = ?self.state, "scan event");

        match event {
            ScanEvent::PermissionResolved { granted } => {
                self.on_permission(granted, &mut effects);
            }
            ScanEvent::CameraReady => self.on_camera_ready(&mut effects),
            ScanEvent::Mounted | ScanEvent::FocusGained => self.on_focus_gained(&mut effects),
            ScanEvent::FocusLost | ScanEvent::Unmounted => self.reset(&mut effects),
            ScanEvent::ManualCaptureRequested => self.start_capture("manual", now, &mut effects),
            ScanEvent::TimerElapsed { timer, epoch } => {
                if self.armed.get(&timer) != Some(&epoch) {
                    debug!(?timer, epoch, "stale timer ignored");
                    return effects;
                }
                self.armed.remove(&timer);
                self.on_timer(timer, now, &mut effects);
            }
            ScanEvent::CaptureSucceeded { attempt, image } => {
                self.on_capture_succeeded(attempt, image, &mut effects);
            }
            ScanEvent::CaptureFailed { attempt, error } => {
                self.on_capture_failed(attempt, &error, &mut effects);
            }
            ScanEvent::UploadFinished { attempt, outcome } => {
                self.on_upload_finished(attempt, outcome, &mut effects);
            }
            ScanEvent::Configure(_) | ScanEvent::Auth(_) | ScanEvent::AuthFinished(_) => {}
        }

        effects
    }

    fn schedule(&mut self, timer: ScanTimer, after: Duration, effects: &mut Vec<ScanEffect>) {
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        self.armed.insert(timer, epoch);
        effects.push(ScanEffect::ScheduleTimer {
            timer,
            epoch,
            after,
        });
    }

    fn cancel(&mut self, timer: ScanTimer, effects: &mut Vec<ScanEffect>) {
        if self.armed.remove(&timer).is_some() {
            effects.push(ScanEffect::CancelTimer(timer));
        }
    }

    fn is_current(&self, attempt: AttemptId) -> bool {
        self.attempt.as_ref().is_some_and(|a| a.id == attempt)
    }

    fn end_attempt(&mut self) {
        self.attempt = None;
        self.is_scanning = false;
    }

    /// Everything a capture needs except the in-flight guard.
    fn screen_precondition(&self) -> Result<(), &'static str> {
        if self.permission_granted != Some(true) {
            return Err("camera permission not granted");
        }
        if !self.camera_ready {
            return Err("camera not ready");
        }
        if !self.camera_initialized {
            return Err("camera not initialized");
        }
        if !self.focused {
            return Err("screen not focused");
        }
        if self.navigated_away {
            return Err("already navigated away");
        }
        Ok(())
    }

    fn try_arm(&mut self, effects: &mut Vec<ScanEffect>) {
        if self.state != ScanState::Idle || self.is_scanning || self.screen_precondition().is_err()
        {
            return;
        }
        self.state = ScanState::ArmedForAutoCapture;
        let delay = self.config.auto_capture_delay();
        self.schedule(ScanTimer::AutoCapture, delay, effects);
        debug!(delay_ms = self.config.auto_capture_delay_ms, "auto-capture armed");
    }

    fn on_permission(&mut self, granted: bool, effects: &mut Vec<ScanEffect>) {
        self.permission_granted = Some(granted);
        if granted {
            self.try_arm(effects);
            return;
        }
        warn!("camera permission denied");
        self.cancel(ScanTimer::AutoCapture, effects);
        self.cancel(ScanTimer::CaptureRetry, effects);
        if matches!(
            self.state,
            ScanState::ArmedForAutoCapture | ScanState::Capturing
        ) {
            self.end_attempt();
            self.state = ScanState::Idle;
        }
    }

    fn on_camera_ready(&mut self, effects: &mut Vec<ScanEffect>) {
        if !self.focused || self.camera_ready {
            return;
        }
        self.camera_ready = true;
        let delay = self.config.camera_settle_delay();
        self.schedule(ScanTimer::CameraSettle, delay, effects);
    }

    fn on_focus_gained(&mut self, effects: &mut Vec<ScanEffect>) {
        self.focused = true;
        self.navigated_away = false;
        if matches!(self.state, ScanState::NoMatch | ScanState::MediaPlayback) {
            self.state = ScanState::Idle;
        }
        self.try_arm(effects);
    }

    fn reset(&mut self, effects: &mut Vec<ScanEffect>) {
        self.focused = false;
        self.camera_ready = false;
        self.camera_initialized = false;
        self.end_attempt();
        self.warning = None;
        self.armed.clear();
        self.state = ScanState::Idle;
        effects.push(ScanEffect::CancelAllTimers);
        effects.push(ScanEffect::ReleaseCamera);
        debug!("scan screen reset");
    }

    fn on_timer(&mut self, timer: ScanTimer, now: UnixTimeMs, effects: &mut Vec<ScanEffect>) {
        match timer {
            ScanTimer::CameraSettle => {
                self.camera_initialized = true;
                self.try_arm(effects);
            }
            ScanTimer::AutoCapture => {
                if self.state == ScanState::ArmedForAutoCapture {
                    self.start_capture("auto", now, effects);
                }
            }
            ScanTimer::CaptureRetry => self.retry_capture(effects),
            ScanTimer::WarningDismiss => self.warning = None,
        }
    }

    fn start_capture(
        &mut self,
        trigger: &'static str,
        now: UnixTimeMs,
        effects: &mut Vec<ScanEffect>,
    ) {
        if let Err(reason) = self.screen_precondition() {
            debug!(trigger, reason, "capture trigger ignored");
            return;
        }
        if self.is_scanning {
            debug!(trigger, "capture already in progress");
            return;
        }

        self.cancel(ScanTimer::AutoCapture, effects);
        self.cancel(ScanTimer::WarningDismiss, effects);
        self.warning = None;

        let attempt = CaptureAttempt::new(now);
        info!(trigger, attempt = %attempt.id, "capture started");
        effects.push(ScanEffect::Capture { attempt: attempt.id });
        self.attempt = Some(attempt);
        self.is_scanning = true;
        self.state = ScanState::Capturing;
    }

    fn retry_capture(&mut self, effects: &mut Vec<ScanEffect>) {
        if self.state != ScanState::Capturing {
            return;
        }
        let Some(id) = self.attempt.as_ref().map(|a| a.id) else {
            return;
        };
        if let Err(reason) = self.screen_precondition() {
            debug!(reason, "capture retry abandoned");
            self.end_attempt();
            self.state = ScanState::Idle;
            return;
        }
        effects.push(ScanEffect::Capture { attempt: id });
    }

    fn on_capture_succeeded(
        &mut self,
        attempt: AttemptId,
        image: CapturedImage,
        effects: &mut Vec<ScanEffect>,
    ) {
        if !self.is_current(attempt) || self.state != ScanState::Capturing {
            debug!(%attempt, "late capture result ignored");
            return;
        }
        if let Some(current) = self.attempt.as_mut() {
            current.outcome = CaptureOutcome::Succeeded;
        }
        info!(%attempt, bytes = image.file_size(), "capture succeeded, uploading");
        self.state = ScanState::Uploading;
        effects.push(ScanEffect::Upload { attempt, image });
    }

    fn on_capture_failed(
        &mut self,
        attempt: AttemptId,
        error: &CameraError,
        effects: &mut Vec<ScanEffect>,
    ) {
        if !self.is_current(attempt) || self.state != ScanState::Capturing {
            debug!(%attempt, "late capture failure ignored");
            return;
        }

        if error.is_permission_error() {
            self.on_permission(false, effects);
            return;
        }

        let max_retries = self.config.max_capture_retries;
        let Some(current) = self.attempt.as_mut() else {
            return;
        };
        if current.retry_count < max_retries {
            current.retry_count += 1;
            warn!(
                %attempt,
                retry = current.retry_count,
                max_retries,
                error = %error,
                "capture failed, retrying"
            );
            let delay = self.config.capture_retry_delay();
            self.schedule(ScanTimer::CaptureRetry, delay, effects);
            return;
        }

        current.outcome = CaptureOutcome::Failed;
        warn!(%attempt, error = %error, "capture failed, retries exhausted");
        self.end_attempt();
        self.state = ScanState::CaptureWarning;
        self.warning = Some(AppError::from(error.clone()).user_facing_message());
        let delay = self.config.warning_dismiss_delay();
        self.schedule(ScanTimer::WarningDismiss, delay, effects);
    }

    fn on_upload_finished(
        &mut self,
        attempt: AttemptId,
        outcome: MatchOutcome,
        effects: &mut Vec<ScanEffect>,
    ) {
        if !self.is_current(attempt) || self.state != ScanState::Uploading {
            debug!(%attempt, "late upload result ignored");
            return;
        }
        if self.navigated_away || !self.focused {
            debug!(%attempt, "upload finished off screen, not navigating");
            self.end_attempt();
            return;
        }

        self.end_attempt();
        self.state = match &outcome {
            MatchOutcome::Matched(_) => ScanState::MediaPlayback,
            MatchOutcome::NoMatch(_) => ScanState::NoMatch,
            MatchOutcome::AuthRequired => ScanState::Idle,
        };
        self.navigated_away = true;
        self.armed.clear();
        effects.push(ScanEffect::CancelAllTimers);
        effects.push(ScanEffect::Navigate(outcome.route()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::ImageFormat;
    use crate::model::{MediaType, Route};
    use crate::scan::{MatchTarget, NoMatchReason};
    use proptest::prelude::*;

    const NOW: UnixTimeMs = UnixTimeMs(1_700_000_000_000);

    fn image() -> CapturedImage {
        CapturedImage::new(vec![0xFF, 0xD8, 0xFF, 0xE0], ImageFormat::Jpeg, 640, 480).unwrap()
    }

    fn fire(machine: &mut ScanMachine, timer: ScanTimer) -> Vec<ScanEffect> {
        let epoch = machine
            .pending_timer(timer)
            .unwrap_or_else(|| panic!("{timer:?} not armed"));
        machine.handle(ScanEvent::TimerElapsed { timer, epoch }, NOW)
    }

    fn current_attempt(machine: &ScanMachine) -> AttemptId {
        machine.attempt().expect("attempt in flight").id
    }

    /// Permission granted, camera ready and settled, auto-capture armed.
    fn armed_machine() -> ScanMachine {
        let mut machine = ScanMachine::new(ScanConfig::default());
        machine.handle(ScanEvent::PermissionResolved { granted: true }, NOW);
        machine.handle(ScanEvent::CameraReady, NOW);
        fire(&mut machine, ScanTimer::CameraSettle);
        assert_eq!(machine.state(), ScanState::ArmedForAutoCapture);
        machine
    }

    fn capture_failed(machine: &mut ScanMachine) -> Vec<ScanEffect> {
        let attempt = current_attempt(machine);
        machine.handle(
            ScanEvent::CaptureFailed {
                attempt,
                error: CameraError::CaptureFailed {
                    reason: "blurred".into(),
                },
            },
            NOW,
        )
    }

    fn matched() -> MatchOutcome {
        MatchOutcome::Matched(MatchTarget {
            url: "https://api.example.com/uploads/media/a.mp4".into(),
            media_type: MediaType::Video,
            result: crate::model::MatchResult {
                media_type: MediaType::Video,
                file_reference: "a.mp4".into(),
                metadata: serde_json::Map::new(),
            },
        })
    }

    #[test]
    fn camera_ready_arms_auto_capture_after_settle() {
        let mut machine = ScanMachine::new(ScanConfig::default());
        machine.handle(ScanEvent::PermissionResolved { granted: true }, NOW);

        let effects = machine.handle(ScanEvent::CameraReady, NOW);
        assert!(matches!(
            effects.as_slice(),
            [ScanEffect::ScheduleTimer { timer: ScanTimer::CameraSettle, after, .. }]
                if *after == Duration::from_millis(1500)
        ));
        assert_eq!(machine.state(), ScanState::Idle);

        let effects = fire(&mut machine, ScanTimer::CameraSettle);
        assert!(matches!(
            effects.as_slice(),
            [ScanEffect::ScheduleTimer { timer: ScanTimer::AutoCapture, after, .. }]
                if *after == Duration::from_secs(3)
        ));
        assert_eq!(machine.state(), ScanState::ArmedForAutoCapture);
    }

    #[test]
    fn auto_capture_timer_starts_capture() {
        let mut machine = armed_machine();
        let effects = fire(&mut machine, ScanTimer::AutoCapture);

        assert!(matches!(effects.as_slice(), [ScanEffect::Capture { .. }]));
        assert_eq!(machine.state(), ScanState::Capturing);
        assert!(machine.is_scanning());
    }

    #[test]
    fn manual_trigger_cancels_auto_capture() {
        let mut machine = armed_machine();
        let effects = machine.handle(ScanEvent::ManualCaptureRequested, NOW);

        assert!(matches!(
            effects.as_slice(),
            [ScanEffect::CancelTimer(ScanTimer::AutoCapture), ScanEffect::Capture { .. }]
        ));
        assert_eq!(machine.pending_timer(ScanTimer::AutoCapture), None);
    }

    #[test]
    fn trigger_without_preconditions_is_a_no_op() {
        let mut machine = ScanMachine::new(ScanConfig::default());
        machine.handle(ScanEvent::PermissionResolved { granted: true }, NOW);
        machine.handle(ScanEvent::CameraReady, NOW);

        // Ready but not yet initialized.
        assert!(machine
            .handle(ScanEvent::ManualCaptureRequested, NOW)
            .is_empty());

        let mut denied = ScanMachine::new(ScanConfig::default());
        denied.handle(ScanEvent::PermissionResolved { granted: false }, NOW);
        denied.handle(ScanEvent::CameraReady, NOW);
        assert!(denied.pending_timer(ScanTimer::CameraSettle).is_some());
        assert!(fire(&mut denied, ScanTimer::CameraSettle).is_empty());
        assert!(denied
            .handle(ScanEvent::ManualCaptureRequested, NOW)
            .is_empty());
        assert_eq!(denied.state(), ScanState::Idle);
    }

    #[test]
    fn second_trigger_while_scanning_is_ignored() {
        let mut machine = armed_machine();
        machine.handle(ScanEvent::ManualCaptureRequested, NOW);
        let first = current_attempt(&machine);

        assert!(machine
            .handle(ScanEvent::ManualCaptureRequested, NOW)
            .is_empty());
        assert_eq!(current_attempt(&machine), first);
    }

    #[test]
    fn guard_holds_during_retry_backoff_and_upload() {
        let mut machine = armed_machine();
        machine.handle(ScanEvent::ManualCaptureRequested, NOW);
        capture_failed(&mut machine);
        assert!(machine.is_scanning());
        assert!(machine
            .handle(ScanEvent::ManualCaptureRequested, NOW)
            .is_empty());

        fire(&mut machine, ScanTimer::CaptureRetry);
        let attempt = current_attempt(&machine);
        machine.handle(
            ScanEvent::CaptureSucceeded {
                attempt,
                image: image(),
            },
            NOW,
        );
        assert_eq!(machine.state(), ScanState::Uploading);
        assert!(machine
            .handle(ScanEvent::ManualCaptureRequested, NOW)
            .is_empty());
    }

    #[test]
    fn capture_success_uploads_and_match_navigates() {
        let mut machine = armed_machine();
        fire(&mut machine, ScanTimer::AutoCapture);
        let attempt = current_attempt(&machine);

        let effects = machine.handle(
            ScanEvent::CaptureSucceeded {
                attempt,
                image: image(),
            },
            NOW,
        );
        assert!(matches!(
            effects.as_slice(),
            [ScanEffect::Upload { attempt: a, .. }] if *a == attempt
        ));

        let effects = machine.handle(
            ScanEvent::UploadFinished {
                attempt,
                outcome: matched(),
            },
            NOW,
        );
        assert_eq!(
            effects.last(),
            Some(&ScanEffect::Navigate(Route::MediaPlayback {
                url: "https://api.example.com/uploads/media/a.mp4".into(),
                media_type: MediaType::Video,
                title: None,
            }))
        );
        assert_eq!(machine.state(), ScanState::MediaPlayback);
        assert!(machine.navigated_away());
        assert!(!machine.is_scanning());
    }

    #[test]
    fn no_match_and_auth_required_routes() {
        let mut machine = armed_machine();
        fire(&mut machine, ScanTimer::AutoCapture);
        let attempt = current_attempt(&machine);
        machine.handle(
            ScanEvent::CaptureSucceeded {
                attempt,
                image: image(),
            },
            NOW,
        );
        let effects = machine.handle(
            ScanEvent::UploadFinished {
                attempt,
                outcome: MatchOutcome::NoMatch(NoMatchReason::NoEntries),
            },
            NOW,
        );
        assert_eq!(effects.last(), Some(&ScanEffect::Navigate(Route::NoMatch)));
        assert_eq!(machine.state(), ScanState::NoMatch);

        let mut machine = armed_machine();
        fire(&mut machine, ScanTimer::AutoCapture);
        let attempt = current_attempt(&machine);
        machine.handle(
            ScanEvent::CaptureSucceeded {
                attempt,
                image: image(),
            },
            NOW,
        );
        let effects = machine.handle(
            ScanEvent::UploadFinished {
                attempt,
                outcome: MatchOutcome::AuthRequired,
            },
            NOW,
        );
        assert_eq!(effects.last(), Some(&ScanEffect::Navigate(Route::SignIn)));
    }

    #[test]
    fn retries_are_bounded_then_warning_shown_once() {
        let mut machine = armed_machine();
        fire(&mut machine, ScanTimer::AutoCapture);

        for expected_retry in 1..=3 {
            let effects = capture_failed(&mut machine);
            assert!(matches!(
                effects.as_slice(),
                [ScanEffect::ScheduleTimer { timer: ScanTimer::CaptureRetry, after, .. }]
                    if *after == Duration::from_secs(2)
            ));
            assert_eq!(machine.attempt().unwrap().retry_count, expected_retry);
            let effects = fire(&mut machine, ScanTimer::CaptureRetry);
            assert!(matches!(effects.as_slice(), [ScanEffect::Capture { .. }]));
        }

        let effects = capture_failed(&mut machine);
        assert!(matches!(
            effects.as_slice(),
            [ScanEffect::ScheduleTimer { timer: ScanTimer::WarningDismiss, after, .. }]
                if *after == Duration::from_secs(3)
        ));
        assert_eq!(machine.state(), ScanState::CaptureWarning);
        assert!(machine.warning().is_some());
        assert!(!machine.is_scanning());
        assert!(!effects
            .iter()
            .any(|e| matches!(e, ScanEffect::Upload { .. })));

        fire(&mut machine, ScanTimer::WarningDismiss);
        assert_eq!(machine.warning(), None);
        assert_eq!(machine.state(), ScanState::CaptureWarning);

        // A manual trigger starts a fresh attempt.
        let effects = machine.handle(ScanEvent::ManualCaptureRequested, NOW);
        assert!(matches!(effects.as_slice(), [ScanEffect::Capture { .. }]));
        assert_eq!(machine.attempt().unwrap().retry_count, 0);
    }

    #[test]
    fn permission_denied_during_capture_stops_the_attempt() {
        let mut machine = armed_machine();
        fire(&mut machine, ScanTimer::AutoCapture);
        let attempt = current_attempt(&machine);

        machine.handle(
            ScanEvent::CaptureFailed {
                attempt,
                error: CameraError::PermissionDenied,
            },
            NOW,
        );

        assert_eq!(machine.state(), ScanState::Idle);
        assert!(!machine.is_scanning());
        assert_eq!(machine.view_model().permission_granted, Some(false));
    }

    #[test]
    fn focus_loss_clears_timers_and_releases_camera() {
        let mut machine = armed_machine();
        let stale_epoch = machine.pending_timer(ScanTimer::AutoCapture).unwrap();

        let effects = machine.handle(ScanEvent::FocusLost, NOW);
        assert_eq!(
            effects,
            vec![ScanEffect::CancelAllTimers, ScanEffect::ReleaseCamera]
        );
        assert_eq!(machine.state(), ScanState::Idle);

        // The auto-capture timer fired before the driver could abort it.
        let effects = machine.handle(
            ScanEvent::TimerElapsed {
                timer: ScanTimer::AutoCapture,
                epoch: stale_epoch,
            },
            NOW,
        );
        assert!(effects.is_empty());
        assert!(machine
            .handle(ScanEvent::ManualCaptureRequested, NOW)
            .is_empty());
    }

    #[test]
    fn late_upload_after_focus_loss_never_navigates() {
        let mut machine = armed_machine();
        fire(&mut machine, ScanTimer::AutoCapture);
        let attempt = current_attempt(&machine);
        machine.handle(
            ScanEvent::CaptureSucceeded {
                attempt,
                image: image(),
            },
            NOW,
        );
        machine.handle(ScanEvent::FocusLost, NOW);

        let effects = machine.handle(
            ScanEvent::UploadFinished {
                attempt,
                outcome: matched(),
            },
            NOW,
        );
        assert!(effects.is_empty());
    }

    #[test]
    fn duplicate_upload_result_navigates_once() {
        let mut machine = armed_machine();
        fire(&mut machine, ScanTimer::AutoCapture);
        let attempt = current_attempt(&machine);
        machine.handle(
            ScanEvent::CaptureSucceeded {
                attempt,
                image: image(),
            },
            NOW,
        );
        let first = machine.handle(
            ScanEvent::UploadFinished {
                attempt,
                outcome: matched(),
            },
            NOW,
        );
        let second = machine.handle(
            ScanEvent::UploadFinished {
                attempt,
                outcome: matched(),
            },
            NOW,
        );
        assert_eq!(
            first
                .iter()
                .filter(|e| matches!(e, ScanEffect::Navigate(_)))
                .count(),
            1
        );
        assert!(second.is_empty());
    }

    #[test]
    fn returning_to_the_screen_rearms_after_camera_ready() {
        let mut machine = armed_machine();
        fire(&mut machine, ScanTimer::AutoCapture);
        let attempt = current_attempt(&machine);
        machine.handle(
            ScanEvent::CaptureSucceeded {
                attempt,
                image: image(),
            },
            NOW,
        );
        machine.handle(
            ScanEvent::UploadFinished {
                attempt,
                outcome: MatchOutcome::NoMatch(NoMatchReason::Unsuccessful),
            },
            NOW,
        );
        machine.handle(ScanEvent::FocusLost, NOW);
        machine.handle(ScanEvent::FocusGained, NOW);
        assert_eq!(machine.state(), ScanState::Idle);
        assert!(!machine.navigated_away());

        machine.handle(ScanEvent::CameraReady, NOW);
        fire(&mut machine, ScanTimer::CameraSettle);
        assert_eq!(machine.state(), ScanState::ArmedForAutoCapture);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Fail,
        Succeed,
        Manual,
        FireRetry,
        FireAuto,
        FocusLost,
        Refocus,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            4 => Just(Step::Fail),
            1 => Just(Step::Succeed),
            2 => Just(Step::Manual),
            4 => Just(Step::FireRetry),
            1 => Just(Step::FireAuto),
            1 => Just(Step::FocusLost),
            1 => Just(Step::Refocus),
        ]
    }

    proptest! {
        #[test]
        fn retry_count_never_exceeds_max(steps in proptest::collection::vec(step(), 1..60)) {
            let mut machine = armed_machine();
            let max = machine.config().max_capture_retries;

            for step in steps {
                match step {
                    Step::Fail => {
                        if let Some(attempt) = machine.attempt().map(|a| a.id) {
                            machine.handle(ScanEvent::CaptureFailed {
                                attempt,
                                error: CameraError::Timeout { timeout_ms: 10_000 },
                            }, NOW);
                        }
                    }
                    Step::Succeed => {
                        if let Some(attempt) = machine.attempt().map(|a| a.id) {
                            machine.handle(ScanEvent::CaptureSucceeded { attempt, image: image() }, NOW);
                        }
                    }
                    Step::Manual => {
                        machine.handle(ScanEvent::ManualCaptureRequested, NOW);
                    }
                    Step::FireRetry => {
                        if let Some(epoch) = machine.pending_timer(ScanTimer::CaptureRetry) {
                            machine.handle(ScanEvent::TimerElapsed { timer: ScanTimer::CaptureRetry, epoch }, NOW);
                        }
                    }
                    Step::FireAuto => {
                        if let Some(epoch) = machine.pending_timer(ScanTimer::AutoCapture) {
                            machine.handle(ScanEvent::TimerElapsed { timer: ScanTimer::AutoCapture, epoch }, NOW);
                        }
                    }
                    Step::FocusLost => {
                        machine.handle(ScanEvent::FocusLost, NOW);
                    }
                    Step::Refocus => {
                        machine.handle(ScanEvent::FocusGained, NOW);
                        machine.handle(ScanEvent::CameraReady, NOW);
                        if let Some(epoch) = machine.pending_timer(ScanTimer::CameraSettle) {
                            machine.handle(ScanEvent::TimerElapsed { timer: ScanTimer::CameraSettle, epoch }, NOW);
                        }
                    }
                }

                let retries = machine.attempt().map_or(0, |a| a.retry_count);
                prop_assert!(retries <= max);
                prop_assert_eq!(machine.view_model().retry_count, retries);
                if machine.state() == ScanState::Capturing || machine.state() == ScanState::Uploading {
                    prop_assert!(machine.is_scanning());
                }
            }
        }
    }
}
