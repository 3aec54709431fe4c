use crux_core::capability::{Capability, CapabilityContext, Operation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::scan::ScanTimer;

/// One-shot timers run by the shell.
///
/// A started timer is answered once: with `Elapsed` when it fires, or with
/// `Cancelled` when a later cancel reached the shell first. Only `Elapsed`
/// produces an event.
#[derive(Clone)]
pub struct Timer<Ev> {
    context: CapabilityContext<TimerOperation, Ev>,
}

impl<Ev> Capability<Ev> for Timer<Ev> {
    type Operation = TimerOperation;
    type MappedSelf<MappedEv> = Timer<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + Copy + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        Timer::new(self.context.map_event(f))
    }
}

impl<Ev> Timer<Ev>
where
    Ev: Send + 'static,
{
    pub fn new(context: CapabilityContext<TimerOperation, Ev>) -> Self {
        Self { context }
    }

    pub fn start<F>(&self, timer: ScanTimer, epoch: u64, after: Duration, make_event: F)
    where
        F: FnOnce(ScanTimer, u64) -> Ev + Send + 'static,
    {
        let millis = u64::try_from(after.as_millis()).unwrap_or(u64::MAX);
        let context = self.context.clone();
        self.context.spawn(async move {
            let output = context
                .request_from_shell(TimerOperation::Start {
                    timer,
                    epoch,
                    millis,
                })
                .await;
            if output == TimerOutput::Elapsed {
                context.update_app(make_event(timer, epoch));
            }
        });
    }

    pub fn cancel(&self, timer: ScanTimer) {
        self.notify(TimerOperation::Cancel { timer });
    }

    pub fn cancel_all(&self) {
        self.notify(TimerOperation::CancelAll);
    }

    fn notify(&self, operation: TimerOperation) {
        let context = self.context.clone();
        self.context.spawn(async move {
            context.notify_shell(operation).await;
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerOperation {
    Start {
        timer: ScanTimer,
        epoch: u64,
        millis: u64,
    },
    Cancel {
        timer: ScanTimer,
    },
    CancelAll,
}

impl Operation for TimerOperation {
    type Output = TimerOutput;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerOutput {
    Elapsed,
    Cancelled,
}
