use log::{debug, info, warn};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::timer::{TimerEvent, Timers};
use crate::device::transport::Transport;
use crate::device::types::{
    CharacteristicHandle, ConnectionHandle, GattService, PeripheralHandle, PeripheralId, TransportEvent,
};
use crate::error::DeviceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Discovering,
    Ready,
    Disconnecting,
    Failed,
}

/// Why an attempt ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The transport could not connect, or the connect deadline passed before service
    /// discovery started.
    Connect,
    /// The transport reported the link as disconnected.
    LinkLost,
    /// Discovery errored, timed out, or did not yield exactly one command characteristic.
    Discovery,
}

/// What a transport or timer event did to the connection, as far as callers care.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattOutcome {
    Ready,
    /// The attempt failed and has already been torn down; the connection is idle again.
    Failed(FailureKind),
    WriteCompleted { success: bool },
}

/// One connection attempt and its lifetime.
#[derive(Debug)]
pub struct GattSession {
    peripheral: PeripheralId,
    connection: ConnectionHandle,
    state: ConnectionState,
    characteristic: Option<CharacteristicHandle>,
    write_outstanding: bool,
    deadline: Option<CancellationToken>,
}

impl GattSession {
    pub fn connection(&self) -> ConnectionHandle {
        self.connection
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn characteristic(&self) -> Option<&CharacteristicHandle> {
        self.characteristic.as_ref()
    }

    pub fn write_outstanding(&self) -> bool {
        self.write_outstanding
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!("Connection {} {:?} -> {:?}", self.connection, self.state, next);
        self.state = next;
    }
}

/// Owns the single live [`GattSession`] and drives it from transport events:
/// `Idle -> Connecting -> Connected -> Discovering -> Ready`, with `Failed` and an explicit
/// disconnect as the only ways back to `Idle`.
#[derive(Debug)]
pub struct GattConnection {
    service: Uuid,
    command_characteristic: Option<Uuid>,
    connect_timeout: Option<Duration>,
    session: Option<GattSession>,
}

impl GattConnection {
    /// `command_characteristic` narrows the command target to one UUID; without it any
    /// writable characteristic of `service` qualifies, as long as there is exactly one.
    pub fn new(service: Uuid, command_characteristic: Option<Uuid>) -> Self {
        GattConnection {
            service,
            command_characteristic,
            connect_timeout: None,
            session: None,
        }
    }

    /// Bounds the time from `connect` until `Ready`.
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.session.as_ref().map_or(ConnectionState::Idle, |session| session.state)
    }

    pub fn session(&self) -> Option<&GattSession> {
        self.session.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Starts a new attempt. Any previous session is torn down first.
    pub fn connect(
        &mut self,
        transport: &mut dyn Transport,
        timers: &Timers,
        peripheral: &PeripheralHandle,
    ) -> Result<(), DeviceError> {
        self.disconnect(transport);

        info!(
            "Connecting to peripheral {} {}...",
            peripheral.id,
            peripheral.name.as_deref().unwrap_or("NONE"),
        );
        let connection = transport.connect(&peripheral.id)?;

        let deadline = self.connect_timeout.map(|timeout| {
            timers.schedule(timeout, TimerEvent::ConnectDeadline { connection })
        });

        self.session = Some(GattSession {
            peripheral: peripheral.id.clone(),
            connection,
            state: ConnectionState::Connecting,
            characteristic: None,
            write_outstanding: false,
            deadline,
        });
        Ok(())
    }

    /// Applies a transport event. Events of any connection but the live one are ignored.
    pub fn on_event(&mut self, transport: &mut dyn Transport, event: TransportEvent) -> Option<GattOutcome> {
        let connection = match &event {
            TransportEvent::Connected(connection) | TransportEvent::Disconnected(connection) => *connection,
            TransportEvent::ConnectFailed { connection, .. } => *connection,
            TransportEvent::ServicesDiscovered { connection, .. } => *connection,
            TransportEvent::WriteComplete { connection, .. } => *connection,
            TransportEvent::ScanResult(_) | TransportEvent::ScanFailed(_) => return None,
        };

        let state = match &self.session {
            Some(session) if session.connection == connection => session.state,
            _ => {
                debug!("Ignoring {:?} for stale connection {}", event, connection);
                return None;
            },
        };

        match (state, event) {
            (ConnectionState::Connecting, TransportEvent::Connected(_)) => {
                info!("Connected; Discovering services...");
                let requested = transport.discover_services(connection);

                let session = self.session.as_mut()?;
                session.transition(ConnectionState::Connected);

                match requested {
                    Ok(()) => {
                        session.transition(ConnectionState::Discovering);
                        None
                    },
                    Err(err) => {
                        warn!("Failed to request service discovery: {:?}", err);
                        Some(self.fail(transport, FailureKind::Discovery))
                    },
                }
            },
            (ConnectionState::Connecting, TransportEvent::ConnectFailed { error, .. }) => {
                warn!("Connecting to peripheral failed: {}", error);
                Some(self.fail(transport, FailureKind::Connect))
            },
            (_, TransportEvent::Disconnected(_)) => {
                warn!("Connection {} lost in state {:?}", connection, state);
                Some(self.fail(transport, FailureKind::LinkLost))
            },
            (ConnectionState::Discovering, TransportEvent::ServicesDiscovered { result, .. }) => {
                let characteristic = result.and_then(|services| self.find_command_characteristic(&services));

                match characteristic {
                    Ok(characteristic) => {
                        let session = self.session.as_mut()?;
                        if let Some(deadline) = session.deadline.take() {
                            deadline.cancel();
                        }
                        info!("Using characteristic {:?} {:?}", characteristic.service, characteristic.uuid);
                        session.characteristic = Some(characteristic);
                        session.transition(ConnectionState::Ready);
                        info!("Peripheral ready");
                        Some(GattOutcome::Ready)
                    },
                    Err(err) => {
                        warn!("Service discovery failed: {}", err);
                        Some(self.fail(transport, FailureKind::Discovery))
                    },
                }
            },
            (ConnectionState::Ready, TransportEvent::WriteComplete { success, .. }) => {
                let session = self.session.as_mut()?;
                if !session.write_outstanding {
                    debug!("Ignoring write confirmation without an outstanding write");
                    return None;
                }
                session.write_outstanding = false;

                if success {
                    info!("Write to command characteristic succeeded");
                } else {
                    // a failed write is reported, the connection is kept
                    warn!("Write to command characteristic failed");
                }
                Some(GattOutcome::WriteCompleted { success })
            },
            (state, event) => {
                debug!("Ignoring {:?} in state {:?}", event, state);
                None
            },
        }
    }

    /// Fails the live attempt if `event` is its connect deadline and it is not ready yet.
    pub fn on_timer(&mut self, transport: &mut dyn Transport, event: TimerEvent) -> Option<GattOutcome> {
        let TimerEvent::ConnectDeadline { connection } = event else {
            return None;
        };

        let state = match &self.session {
            Some(session) if session.connection == connection => session.state,
            _ => return None,
        };

        let kind = match state {
            ConnectionState::Connecting | ConnectionState::Connected => FailureKind::Connect,
            ConnectionState::Discovering => FailureKind::Discovery,
            _ => return None,
        };

        warn!("Connection {} took too long in state {:?}", connection, state);
        Some(self.fail(transport, kind))
    }

    /// Submits `payload` to the command characteristic. At most one write is outstanding.
    pub fn write(&mut self, transport: &mut dyn Transport, payload: &[u8]) -> Result<(), DeviceError> {
        let session = match self.session.as_mut() {
            Some(session) if session.state == ConnectionState::Ready => session,
            _ => return Err(DeviceError::NotReady),
        };

        if session.write_outstanding {
            return Err(DeviceError::WriteInProgress);
        }

        let characteristic = session.characteristic.ok_or(DeviceError::MissingCharacteristic)?;
        transport.write_characteristic(session.connection, &characteristic, payload)?;
        session.write_outstanding = true;
        Ok(())
    }

    /// Releases the live session, if any. Returns false if there was nothing to release.
    pub fn disconnect(&mut self, transport: &mut dyn Transport) -> bool {
        let Some(mut session) = self.session.take() else {
            return false;
        };

        if let Some(deadline) = session.deadline.take() {
            deadline.cancel();
        }

        session.transition(ConnectionState::Disconnecting);
        if let Err(err) = transport.disconnect(session.connection) {
            warn!("Failed to disconnect {}: {:?}", session.connection, err);
        }
        transport.close(session.connection);

        info!("Disconnected from peripheral {}", session.peripheral);
        true
    }

    fn fail(&mut self, transport: &mut dyn Transport, kind: FailureKind) -> GattOutcome {
        if let Some(session) = self.session.as_mut() {
            session.transition(ConnectionState::Failed);
        }
        self.disconnect(transport);
        GattOutcome::Failed(kind)
    }

    fn find_command_characteristic(&self, services: &[GattService]) -> Result<CharacteristicHandle, DeviceError> {
        let service = services.iter()
            .find(|service| service.uuid == self.service)
            .ok_or(DeviceError::DiscoveryFailed)?;

        let mut candidates = service.characteristics.iter()
            .filter(|characteristic| self.command_characteristic.map_or(true, |uuid| uuid == characteristic.uuid))
            .filter_map(|characteristic| characteristic.write.map(|write| (characteristic.uuid, write)));

        match (candidates.next(), candidates.next()) {
            (Some((uuid, write)), None) => Ok(CharacteristicHandle {
                service: service.uuid,
                uuid,
                write,
            }),
            _ => Err(DeviceError::MissingCharacteristic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::constants::MOTOR_SERVICE;
    use crate::device::fake::{RecordingTransport, TransportCall};
    use crate::device::types::{GattCharacteristic, WriteMode};

    const COMMAND: Uuid = Uuid::from_u128(0xfff1);
    const STATUS: Uuid = Uuid::from_u128(0xfff2);

    fn peripheral(id: &str) -> PeripheralHandle {
        PeripheralHandle::new(id, Some("motor"), vec![MOTOR_SERVICE])
    }

    fn motor_service(characteristics: Vec<GattCharacteristic>) -> Vec<GattService> {
        vec![GattService { uuid: MOTOR_SERVICE, characteristics }]
    }

    fn writable(uuid: Uuid) -> GattCharacteristic {
        GattCharacteristic::writable(uuid, WriteMode::WithResponse)
    }

    fn read_only(uuid: Uuid) -> GattCharacteristic {
        GattCharacteristic::read_only(uuid)
    }

    fn discovered(connection: ConnectionHandle, services: Vec<GattService>) -> TransportEvent {
        TransportEvent::ServicesDiscovered { connection, result: Ok(services) }
    }

    fn ready(transport: &mut RecordingTransport, gatt: &mut GattConnection) -> ConnectionHandle {
        let (timers, _receiver) = Timers::new();
        gatt.connect(transport, &timers, &peripheral("p1")).unwrap();
        let connection = gatt.session().unwrap().connection();
        gatt.on_event(transport, TransportEvent::Connected(connection));
        let outcome = gatt.on_event(transport, discovered(connection, motor_service(vec![writable(COMMAND), read_only(STATUS)])));
        assert_eq!(outcome, Some(GattOutcome::Ready));
        connection
    }

    #[test]
    fn happy_path_reaches_ready() {
        let mut transport = RecordingTransport::new();
        let mut gatt = GattConnection::new(MOTOR_SERVICE, None);
        let (timers, _receiver) = Timers::new();

        gatt.connect(&mut transport, &timers, &peripheral("p1")).unwrap();
        assert_eq!(gatt.state(), ConnectionState::Connecting);
        let connection = gatt.session().unwrap().connection();

        assert_eq!(gatt.on_event(&mut transport, TransportEvent::Connected(connection)), None);
        assert_eq!(gatt.state(), ConnectionState::Discovering);
        assert_eq!(transport.calls().last(), Some(&TransportCall::DiscoverServices(connection)));

        let services = motor_service(vec![read_only(STATUS), writable(COMMAND)]);
        assert_eq!(gatt.on_event(&mut transport, discovered(connection, services)), Some(GattOutcome::Ready));
        assert!(gatt.is_ready());
        assert_eq!(gatt.session().unwrap().characteristic().unwrap().uuid, COMMAND);
    }

    #[test]
    fn missing_characteristic_fails_back_to_idle() {
        let mut transport = RecordingTransport::new();
        let mut gatt = GattConnection::new(MOTOR_SERVICE, None);
        let (timers, _receiver) = Timers::new();
        gatt.connect(&mut transport, &timers, &peripheral("p1")).unwrap();
        let connection = gatt.session().unwrap().connection();
        gatt.on_event(&mut transport, TransportEvent::Connected(connection));

        let outcome = gatt.on_event(&mut transport, discovered(connection, motor_service(vec![read_only(STATUS)])));

        assert_eq!(outcome, Some(GattOutcome::Failed(FailureKind::Discovery)));
        assert_eq!(gatt.state(), ConnectionState::Idle);
        assert!(transport.calls().ends_with(&[TransportCall::Disconnect(connection), TransportCall::Close(connection)]));
    }

    #[test]
    fn absent_service_or_discovery_error_fails() {
        for result in [Ok(vec![]), Err(DeviceError::DiscoveryFailed)] {
            let mut transport = RecordingTransport::new();
            let mut gatt = GattConnection::new(MOTOR_SERVICE, None);
            let (timers, _receiver) = Timers::new();
            gatt.connect(&mut transport, &timers, &peripheral("p1")).unwrap();
            let connection = gatt.session().unwrap().connection();
            gatt.on_event(&mut transport, TransportEvent::Connected(connection));

            let outcome = gatt.on_event(&mut transport, TransportEvent::ServicesDiscovered { connection, result });
            assert_eq!(outcome, Some(GattOutcome::Failed(FailureKind::Discovery)));
            assert_eq!(gatt.state(), ConnectionState::Idle);
        }
    }

    #[test]
    fn ambiguous_characteristics_need_a_configured_uuid() {
        let services = motor_service(vec![writable(STATUS), writable(COMMAND)]);

        let unconfigured = GattConnection::new(MOTOR_SERVICE, None);
        assert!(matches!(
            unconfigured.find_command_characteristic(&services),
            Err(DeviceError::MissingCharacteristic)
        ));

        let configured = GattConnection::new(MOTOR_SERVICE, Some(COMMAND));
        assert_eq!(configured.find_command_characteristic(&services).unwrap().uuid, COMMAND);
    }

    #[test]
    fn link_loss_while_connecting_fails() {
        let mut transport = RecordingTransport::new();
        let mut gatt = GattConnection::new(MOTOR_SERVICE, None);
        let (timers, _receiver) = Timers::new();
        gatt.connect(&mut transport, &timers, &peripheral("p1")).unwrap();
        let connection = gatt.session().unwrap().connection();

        let outcome = gatt.on_event(&mut transport, TransportEvent::Disconnected(connection));

        assert_eq!(outcome, Some(GattOutcome::Failed(FailureKind::LinkLost)));
        assert_eq!(gatt.state(), ConnectionState::Idle);
        assert!(transport.open_connections().is_empty());
    }

    #[test]
    fn connect_tears_down_the_previous_session() {
        let mut transport = RecordingTransport::new();
        let mut gatt = GattConnection::new(MOTOR_SERVICE, None);
        let first = ready(&mut transport, &mut gatt);
        let (timers, _receiver) = Timers::new();

        gatt.connect(&mut transport, &timers, &peripheral("p2")).unwrap();
        let second = gatt.session().unwrap().connection();

        assert_ne!(first, second);
        assert_eq!(transport.open_connections(), vec![second]);

        // late events of the first session change nothing
        assert_eq!(gatt.on_event(&mut transport, TransportEvent::Disconnected(first)), None);
        assert_eq!(gatt.state(), ConnectionState::Connecting);
    }

    #[test]
    fn only_one_write_is_outstanding() {
        let mut transport = RecordingTransport::new();
        let mut gatt = GattConnection::new(MOTOR_SERVICE, None);
        let connection = ready(&mut transport, &mut gatt);

        gatt.write(&mut transport, &[1, 0, 0, 0, 0, 0]).unwrap();
        assert!(matches!(gatt.write(&mut transport, &[0; 6]), Err(DeviceError::WriteInProgress)));
        assert_eq!(transport.writes().len(), 1);

        let outcome = gatt.on_event(&mut transport, TransportEvent::WriteComplete { connection, success: true });
        assert_eq!(outcome, Some(GattOutcome::WriteCompleted { success: true }));
        gatt.write(&mut transport, &[0; 6]).unwrap();
        assert_eq!(transport.writes().len(), 2);
    }

    #[test]
    fn write_requires_ready() {
        let mut transport = RecordingTransport::new();
        let mut gatt = GattConnection::new(MOTOR_SERVICE, None);
        assert!(matches!(gatt.write(&mut transport, &[0; 6]), Err(DeviceError::NotReady)));

        let (timers, _receiver) = Timers::new();
        gatt.connect(&mut transport, &timers, &peripheral("p1")).unwrap();
        assert!(matches!(gatt.write(&mut transport, &[0; 6]), Err(DeviceError::NotReady)));
        assert!(transport.writes().is_empty());
    }

    #[test]
    fn failed_write_keeps_the_connection() {
        let mut transport = RecordingTransport::new();
        let mut gatt = GattConnection::new(MOTOR_SERVICE, None);
        let connection = ready(&mut transport, &mut gatt);
        gatt.write(&mut transport, &[1, 0, 0, 0, 0, 0]).unwrap();

        let outcome = gatt.on_event(&mut transport, TransportEvent::WriteComplete { connection, success: false });

        assert_eq!(outcome, Some(GattOutcome::WriteCompleted { success: false }));
        assert!(gatt.is_ready());
        assert!(!gatt.session().unwrap().write_outstanding());
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut transport = RecordingTransport::new();
        let mut gatt = GattConnection::new(MOTOR_SERVICE, None);
        ready(&mut transport, &mut gatt);

        assert!(gatt.disconnect(&mut transport));
        transport.clear();
        assert!(!gatt.disconnect(&mut transport));
        assert_eq!(gatt.state(), ConnectionState::Idle);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_deadline_fails_a_stalled_attempt() {
        use futures::StreamExt;

        let mut transport = RecordingTransport::new();
        let mut gatt = GattConnection::new(MOTOR_SERVICE, None).with_connect_timeout(Some(Duration::from_secs(5)));
        let (timers, mut receiver) = Timers::new();
        gatt.connect(&mut transport, &timers, &peripheral("p1")).unwrap();
        let connection = gatt.session().unwrap().connection();
        gatt.on_event(&mut transport, TransportEvent::Connected(connection));

        let event = receiver.next().await.unwrap();
        assert_eq!(event, TimerEvent::ConnectDeadline { connection });
        assert_eq!(gatt.on_timer(&mut transport, event), Some(GattOutcome::Failed(FailureKind::Discovery)));
        assert_eq!(gatt.state(), ConnectionState::Idle);
    }

    #[test]
    fn unacknowledged_characteristic_is_written_without_response() {
        let mut transport = RecordingTransport::new();
        let mut gatt = GattConnection::new(MOTOR_SERVICE, None);
        let (timers, _receiver) = Timers::new();
        gatt.connect(&mut transport, &timers, &peripheral("p1")).unwrap();
        let connection = gatt.session().unwrap().connection();
        gatt.on_event(&mut transport, TransportEvent::Connected(connection));

        let services = motor_service(vec![GattCharacteristic::writable(COMMAND, WriteMode::WithoutResponse)]);
        gatt.on_event(&mut transport, discovered(connection, services));
        gatt.write(&mut transport, &[1, 0, 0, 0, 0, 0]).unwrap();

        let expected = CharacteristicHandle { service: MOTOR_SERVICE, uuid: COMMAND, write: WriteMode::WithoutResponse };
        assert_eq!(gatt.session().unwrap().characteristic(), Some(&expected));
        assert_eq!(
            transport.calls().last(),
            Some(&TransportCall::Write(connection, expected, vec![1, 0, 0, 0, 0, 0])),
        );
    }

    #[test]
    fn refused_connect_fails_back_to_idle() {
        let mut transport = RecordingTransport::new();
        let mut gatt = GattConnection::new(MOTOR_SERVICE, None);
        let (timers, _receiver) = Timers::new();
        gatt.connect(&mut transport, &timers, &peripheral("p1")).unwrap();
        let connection = gatt.session().unwrap().connection();

        let outcome = gatt.on_event(
            &mut transport,
            TransportEvent::ConnectFailed { connection, error: DeviceError::ConnectFailed },
        );

        assert_eq!(outcome, Some(GattOutcome::Failed(FailureKind::Connect)));
        assert_eq!(gatt.state(), ConnectionState::Idle);
        assert!(transport.open_connections().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_deadline_fails_an_unanswered_connect() {
        use futures::StreamExt;

        let mut transport = RecordingTransport::new();
        let mut gatt = GattConnection::new(MOTOR_SERVICE, None).with_connect_timeout(Some(Duration::from_secs(5)));
        let (timers, mut receiver) = Timers::new();
        gatt.connect(&mut transport, &timers, &peripheral("p1")).unwrap();
        let connection = gatt.session().unwrap().connection();

        let event = receiver.next().await.unwrap();
        assert_eq!(event, TimerEvent::ConnectDeadline { connection });
        assert_eq!(gatt.on_timer(&mut transport, event), Some(GattOutcome::Failed(FailureKind::Connect)));
        assert_eq!(gatt.state(), ConnectionState::Idle);
        assert!(transport.open_connections().is_empty());
    }
}
