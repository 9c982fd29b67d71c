use futures::channel::mpsc::{channel, unbounded, Sender, UnboundedReceiver, UnboundedSender};
use futures::channel::oneshot;
use futures::{SinkExt, StreamExt};
use log::{info, warn};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::types::Config;
use crate::device::command::{CommandChannel, CommandPayload};
use crate::device::connection::{ConnectionState, FailureKind, GattConnection, GattOutcome};
use crate::device::scan::ScanSession;
use crate::device::selector::{selector_for, DeviceSelector};
use crate::device::timer::{TimerEvent, Timers};
use crate::device::transport::Transport;
use crate::device::types::{Notification, ScanResultSet, TransportEvent};
use crate::error::DeviceError;

/// Composes scan, selection, connection and commands behind the operations the shell uses,
/// and republishes what happens as [`Notification`]s.
///
/// Every method runs to completion before the next event is looked at; see
/// [`connection_manager_task`] for the loop that serializes them.
pub struct ConnectionManager<T: Transport> {
    transport: T,
    timers: Timers,
    scan: ScanSession,
    selector: Box<dyn DeviceSelector>,
    gatt: GattConnection,
    commands: CommandChannel,
    scan_period: Duration,
    early_exit: bool,
    subscribers: Vec<UnboundedSender<Notification>>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T, config: &Config, timers: Timers) -> Self {
        ConnectionManager {
            transport,
            timers,
            scan: ScanSession::new(config.service_uuid),
            selector: selector_for(config.device_name.as_deref()),
            gatt: GattConnection::new(config.service_uuid, config.command_characteristic_uuid)
                .with_connect_timeout(config.connect_timeout()),
            commands: CommandChannel::new(),
            scan_period: config.scan_period(),
            early_exit: config.early_exit,
            subscribers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self) -> UnboundedReceiver<Notification> {
        let (sender, receiver) = unbounded();
        self.subscribers.push(sender);
        receiver
    }

    pub fn scan(&self) -> &ScanSession {
        &self.scan
    }

    pub fn connection(&self) -> &GattConnection {
        &self.gatt
    }

    pub fn motor_on(&self) -> bool {
        self.commands.motor_on()
    }

    /// True while scanning or while a connection attempt or connection is alive.
    pub fn is_active(&self) -> bool {
        self.scan.is_scanning() || self.gatt.state() != ConnectionState::Idle
    }

    pub fn start(&mut self) -> Result<(), DeviceError> {
        if self.is_active() {
            return Err(DeviceError::AlreadyActive);
        }

        self.scan.start(&mut self.transport, &self.timers, self.scan_period, self.early_exit)?;
        self.publish(Notification::Scanning);
        Ok(())
    }

    /// Cancels whatever phase is running and returns to idle. A scan cancelled this way
    /// does not go on to connect.
    pub fn stop(&mut self) {
        let scan_cancelled = self.scan.stop(&mut self.transport).is_some();
        let disconnected = self.gatt.disconnect(&mut self.transport);
        self.commands.abandon();

        if scan_cancelled || disconnected {
            self.publish(Notification::Stopped);
        }
    }

    pub fn send_command(&mut self) -> Result<CommandPayload, DeviceError> {
        self.commands.toggle_motor(&mut self.gatt, &mut self.transport)
    }

    pub fn disconnect(&mut self) {
        if self.gatt.disconnect(&mut self.transport) {
            self.commands.abandon();
            self.publish(Notification::Disconnected);
        }
    }

    pub fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ScanResult(peripheral) => {
                self.scan.on_result(peripheral, &self.timers, self.selector.as_ref());
            },
            TransportEvent::ScanFailed(err) => {
                warn!("Scanning failed {:?}", err);
                if self.scan.stop(&mut self.transport).is_some() {
                    self.publish(notification_for(&err, Notification::NoDeviceFound));
                }
            },
            event => {
                if let Some(outcome) = self.gatt.on_event(&mut self.transport, event) {
                    self.apply(outcome);
                }
            },
        }
    }

    pub fn on_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::ConnectDeadline { .. } => {
                if let Some(outcome) = self.gatt.on_timer(&mut self.transport, event) {
                    self.apply(outcome);
                }
            },
            TimerEvent::ScanDeadline { .. } | TimerEvent::ScanSettled { .. } => {
                if let Some(results) = self.scan.on_timer(&mut self.transport, event) {
                    self.connect_selected(results);
                }
            },
        }
    }

    fn connect_selected(&mut self, results: ScanResultSet) {
        let Some(peripheral) = self.selector.select(&results) else {
            info!("No peripherals matched");
            self.publish(Notification::NoDeviceFound);
            return;
        };

        self.publish(Notification::Connecting);
        if let Err(err) = self.gatt.connect(&mut self.transport, &self.timers, &peripheral) {
            warn!("Connecting to peripheral failed: {:?}", err);
            self.publish(notification_for(&err, Notification::Disconnected));
        }
    }

    fn apply(&mut self, outcome: GattOutcome) {
        match outcome {
            GattOutcome::Ready => self.publish(Notification::Ready),
            GattOutcome::Failed(kind) => {
                self.commands.abandon();
                self.publish(match kind {
                    FailureKind::Discovery => Notification::ServiceDiscoveryFailed,
                    FailureKind::Connect | FailureKind::LinkLost => Notification::Disconnected,
                });
            },
            GattOutcome::WriteCompleted { success } => {
                self.commands.on_write_complete(success);
                self.publish(if success { Notification::WriteSucceeded } else { Notification::WriteFailed });
            },
        }
    }

    fn publish(&mut self, notification: Notification) {
        info!("State: {:?}", notification);
        self.subscribers.retain(|subscriber| subscriber.unbounded_send(notification).is_ok());
    }

    fn on_request(&mut self, request: ManagerRequest) {
        // a dropped reply receiver only means the caller stopped waiting
        match request {
            ManagerRequest::Start(reply) => { let _ = reply.send(self.start()); },
            ManagerRequest::Stop(reply) => { let _ = reply.send(self.stop()); },
            ManagerRequest::SendCommand(reply) => { let _ = reply.send(self.send_command()); },
            ManagerRequest::Disconnect(reply) => { let _ = reply.send(self.disconnect()); },
        }
    }
}

fn notification_for(err: &DeviceError, fallback: Notification) -> Notification {
    match err {
        err if err.is_permission_denied() => Notification::PermissionDenied,
        DeviceError::TransportUnavailable => Notification::TransportUnavailable,
        _ => fallback,
    }
}

enum ManagerRequest {
    Start(oneshot::Sender<Result<(), DeviceError>>),
    Stop(oneshot::Sender<()>),
    SendCommand(oneshot::Sender<Result<CommandPayload, DeviceError>>),
    Disconnect(oneshot::Sender<()>),
}

/// The shell's side of a running [`connection_manager_task`].
#[derive(Clone)]
pub struct ManagerHandle {
    sender: Sender<ManagerRequest>,
}

impl ManagerHandle {
    pub async fn start(&self) -> Result<(), DeviceError> {
        let (reply, response) = oneshot::channel();
        self.request(ManagerRequest::Start(reply)).await?;
        response.await.map_err(|_| DeviceError::ManagerStopped)?
    }

    pub async fn stop(&self) -> Result<(), DeviceError> {
        let (reply, response) = oneshot::channel();
        self.request(ManagerRequest::Stop(reply)).await?;
        response.await.map_err(|_| DeviceError::ManagerStopped)
    }

    pub async fn send_command(&self) -> Result<CommandPayload, DeviceError> {
        let (reply, response) = oneshot::channel();
        self.request(ManagerRequest::SendCommand(reply)).await?;
        response.await.map_err(|_| DeviceError::ManagerStopped)?
    }

    pub async fn disconnect(&self) -> Result<(), DeviceError> {
        let (reply, response) = oneshot::channel();
        self.request(ManagerRequest::Disconnect(reply)).await?;
        response.await.map_err(|_| DeviceError::ManagerStopped)
    }

    async fn request(&self, request: ManagerRequest) -> Result<(), DeviceError> {
        let mut sender = self.sender.clone();
        sender.send(request).await.map_err(|_| DeviceError::ManagerStopped)
    }
}

/// Runs a [`ConnectionManager`] on its own task. Shell requests, transport events and timers
/// are all handled by the one loop, so no transition ever runs concurrently with another.
/// On cancellation everything is stopped before the task ends.
pub fn connection_manager_task<T: Transport + 'static>(
    transport: T,
    config: &Config,
    mut transport_events: UnboundedReceiver<TransportEvent>,
    cancel: CancellationToken,
) -> (ManagerHandle, UnboundedReceiver<Notification>, JoinHandle<()>) {
    let (timers, mut timer_events) = Timers::new();
    let mut manager = ConnectionManager::new(transport, config, timers);
    let notifications = manager.subscribe();
    let (sender, mut requests) = channel::<ManagerRequest>(8);

    let handle = spawn(async move {
        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                Some(request) = requests.next() => {
                    manager.on_request(request);
                },
                Some(event) = transport_events.next() => {
                    manager.on_transport_event(event);
                },
                Some(event) = timer_events.next() => {
                    manager.on_timer(event);
                },
                else => {
                    break 'mainloop;
                },
            }
        }

        manager.stop();
        info!("Connection manager stopped");
    });

    return (ManagerHandle { sender }, notifications, handle);
}
