use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use log::debug;
use tokio::spawn;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::device::types::ConnectionHandle;

/// A deferred action that came due. The ids let the receiver drop events that belong to a
/// scan or connection that no longer exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    ScanDeadline { scan: u64 },
    ScanSettled { scan: u64 },
    ConnectDeadline { connection: ConnectionHandle },
}

/// Schedules [`TimerEvent`]s back into the event loop that owns the receiving end.
#[derive(Debug, Clone)]
pub struct Timers {
    sender: UnboundedSender<TimerEvent>,
}

impl Timers {
    pub fn new() -> (Timers, UnboundedReceiver<TimerEvent>) {
        let (sender, receiver) = unbounded();
        (Timers { sender }, receiver)
    }

    /// Delivers `event` after `delay` unless the returned token is cancelled first.
    /// Must be called from within a tokio runtime.
    pub fn schedule(&self, delay: Duration, event: TimerEvent) -> CancellationToken {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let sender = self.sender.clone();

        spawn(async move {
            tokio::select! {
                _ = task_cancel.cancelled() => {
                    debug!("Cancelled {:?}", event);
                },
                _ = sleep(delay) => {
                    // the loop may already be gone on shutdown
                    let _ = sender.unbounded_send(event);
                },
            }
        });

        cancel
    }
}
