use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use btleplug::api::{Central, CentralEvent, CharPropFlags, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use tokio::spawn;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::constants::WRITE_DEADLINE;
use crate::device::transport::Transport;
use crate::device::types::{
    CharacteristicHandle, ConnectionHandle, GattCharacteristic, GattService, PeripheralHandle, PeripheralId,
    TransportEvent, WriteMode,
};
use crate::error::DeviceError;

/// One connection request. Its task owns the physical link and releases it once `cancel` fires.
struct Link {
    peripheral: Peripheral,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Shared {
    scanning: bool,
    discovered: HashMap<PeripheralId, Peripheral>,
    connections: HashMap<ConnectionHandle, Link>,
}

#[derive(Debug)]
enum ScanCommand {
    Start(Uuid),
    Stop,
}

/// [`Transport`] on top of the first adapter btleplug finds.
///
/// Completions are reported from spawned tasks, so every method must be called from within
/// a tokio runtime.
pub struct BtleTransport {
    _manager: Manager,
    events: UnboundedSender<TransportEvent>,
    shared: Arc<Mutex<Shared>>,
    scan_commands: UnboundedSender<ScanCommand>,
    next_connection: u64,
    cancel: CancellationToken,
}

impl BtleTransport {
    pub async fn new(events: UnboundedSender<TransportEvent>) -> Result<Self, DeviceError> {
        let manager = Manager::new().await.map_err(DeviceError::from_btle)?;
        let adapter = manager.adapters().await
            .map_err(DeviceError::from_btle)?
            .into_iter()
            .next()
            .ok_or(DeviceError::TransportUnavailable)?;

        info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));

        let central_events = adapter.events().await.map_err(DeviceError::from_btle)?;
        let shared = Arc::new(Mutex::new(Shared::default()));
        let cancel = CancellationToken::new();
        let (scan_commands, scan_command_receiver) = unbounded();

        spawn(watch_adapter(central_events, adapter.clone(), shared.clone(), events.clone(), cancel.clone()));
        spawn(scan_task(adapter, scan_command_receiver, events.clone(), cancel.clone()));

        Ok(BtleTransport {
            _manager: manager,
            events,
            shared,
            scan_commands,
            next_connection: 0,
            cancel,
        })
    }

    fn peripheral(&self, connection: ConnectionHandle) -> Result<Peripheral, DeviceError> {
        lock(&self.shared)
            .connections
            .get(&connection)
            .map(|link| link.peripheral.clone())
            .ok_or(DeviceError::UnknownConnection(connection.0))
    }

    fn send_scan_command(&self, command: ScanCommand) -> Result<(), DeviceError> {
        self.scan_commands.unbounded_send(command).map_err(|_| DeviceError::TransportUnavailable)
    }
}

impl Drop for BtleTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sends `event` unless `connection` was closed in the meantime.
fn report(shared: &Mutex<Shared>, events: &UnboundedSender<TransportEvent>, connection: ConnectionHandle, event: TransportEvent) {
    if !lock(shared).connections.contains_key(&connection) {
        debug!("Dropping {:?} for closed connection {}", event, connection);
        return;
    }
    let _ = events.unbounded_send(event);
}

fn connect_error(err: btleplug::Error) -> DeviceError {
    match DeviceError::from_btle(err) {
        err if err.is_permission_denied() => err,
        _ => DeviceError::ConnectFailed,
    }
}

fn write_type(mode: WriteMode) -> WriteType {
    match mode {
        WriteMode::WithResponse => WriteType::WithResponse,
        WriteMode::WithoutResponse => WriteType::WithoutResponse,
    }
}

fn write_mode(properties: CharPropFlags) -> Option<WriteMode> {
    if properties.contains(CharPropFlags::WRITE) {
        Some(WriteMode::WithResponse)
    } else if properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE) {
        Some(WriteMode::WithoutResponse)
    } else {
        None
    }
}

async fn describe_peripheral(peripheral: &Peripheral) -> Result<Option<PeripheralHandle>, btleplug::Error> {
    let properties = peripheral.properties().await?;

    Ok(properties.map(|properties| PeripheralHandle {
        id: PeripheralId(peripheral.id().to_string()),
        name: properties.local_name,
        services: properties.services,
    }))
}

fn describe_services(peripheral: &Peripheral) -> Vec<GattService> {
    peripheral.services().iter()
        .map(|service| GattService {
            uuid: service.uuid,
            characteristics: service.characteristics.iter()
                .map(|characteristic| GattCharacteristic {
                    uuid: characteristic.uuid,
                    write: write_mode(characteristic.properties),
                })
                .collect(),
        })
        .collect()
}

async fn watch_adapter(
    mut central_events: Pin<Box<dyn Stream<Item = CentralEvent> + Send>>,
    adapter: Adapter,
    shared: Arc<Mutex<Shared>>,
    events: UnboundedSender<TransportEvent>,
    cancel: CancellationToken,
) {
    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            Some(event) = central_events.next() => match event {
                CentralEvent::DeviceDiscovered(id)
                | CentralEvent::DeviceUpdated(id)
                | CentralEvent::ServicesAdvertisement { id, .. } => {
                    if !lock(&shared).scanning {
                        continue 'mainloop;
                    }

                    let peripheral = match adapter.peripheral(&id).await {
                        Ok(peripheral) => peripheral,
                        Err(err) => {
                            warn!("Failed to query BLE adapter for peripheral: {}", err);
                            continue 'mainloop;
                        },
                    };

                    match describe_peripheral(&peripheral).await {
                        Err(err) => warn!("Could not query peripheral for properties: {:?}", err),
                        Ok(None) => debug!("Peripheral has no properties"),
                        Ok(Some(handle)) => {
                            lock(&shared).discovered.insert(handle.id.clone(), peripheral);
                            let _ = events.unbounded_send(TransportEvent::ScanResult(handle));
                        },
                    }
                },
                CentralEvent::DeviceDisconnected(id) => {
                    let lost: Vec<ConnectionHandle> = lock(&shared).connections.iter()
                        .filter(|(_, link)| link.peripheral.id() == id)
                        .map(|(connection, _)| *connection)
                        .collect();

                    for connection in lost {
                        let _ = events.unbounded_send(TransportEvent::Disconnected(connection));
                    }
                },
                _ => {},
            },
            else => {
                break 'mainloop;
            },
        }
    }
}

// scan start and stop run one after the other, in the order they were requested
async fn scan_task(
    adapter: Adapter,
    mut commands: UnboundedReceiver<ScanCommand>,
    events: UnboundedSender<TransportEvent>,
    cancel: CancellationToken,
) {
    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            Some(command) = commands.next() => match command {
                ScanCommand::Start(service) => {
                    let filter = ScanFilter { services: vec![service] };
                    if let Err(err) = adapter.start_scan(filter).await {
                        let _ = events.unbounded_send(TransportEvent::ScanFailed(DeviceError::from_btle(err)));
                    }
                },
                ScanCommand::Stop => {
                    if let Err(err) = adapter.stop_scan().await {
                        warn!("Failed to stop scanning: {:?}", err);
                    }
                },
            },
            else => {
                break 'mainloop;
            },
        }
    }

    if let Err(err) = adapter.stop_scan().await {
        debug!("Failed to stop scanning on shutdown: {:?}", err);
    }
}

async fn link_task(
    peripheral: Peripheral,
    connection: ConnectionHandle,
    shared: Arc<Mutex<Shared>>,
    events: UnboundedSender<TransportEvent>,
    cancel: CancellationToken,
) {
    hold_link(peripheral.connect(), || peripheral.disconnect(), connection, &shared, &events, &cancel).await;
}

/// Connects, reports the outcome while the connection is open, and releases the link once
/// `cancel` fires. A link closed before `connect` finished is released too.
async fn hold_link<C, R, D>(
    connect: C,
    release: R,
    connection: ConnectionHandle,
    shared: &Mutex<Shared>,
    events: &UnboundedSender<TransportEvent>,
    cancel: &CancellationToken,
)
where
    C: Future<Output = Result<(), btleplug::Error>>,
    R: FnOnce() -> D,
    D: Future<Output = Result<(), btleplug::Error>>,
{
    let connected = tokio::select! {
        _ = cancel.cancelled() => None,
        result = connect => Some(result),
    };

    match connected {
        Some(Ok(())) => report(shared, events, connection, TransportEvent::Connected(connection)),
        Some(Err(err)) => {
            warn!("Connecting to peripheral failed: {:?}", err);
            let error = connect_error(err);
            report(shared, events, connection, TransportEvent::ConnectFailed { connection, error });
        },
        None => debug!("Connection {} was closed while connecting", connection),
    }

    cancel.cancelled().await;
    debug!("Releasing connection {}", connection);
    if let Err(err) = release().await {
        warn!("Failed to disconnect peripheral: {:?}", err);
    }
}

impl Transport for BtleTransport {
    fn start_scan(&mut self, filter: Uuid) -> Result<(), DeviceError> {
        {
            let mut shared = lock(&self.shared);
            shared.scanning = true;
            shared.discovered.clear();
        }
        self.send_scan_command(ScanCommand::Start(filter))
    }

    fn stop_scan(&mut self) -> Result<(), DeviceError> {
        lock(&self.shared).scanning = false;
        self.send_scan_command(ScanCommand::Stop)
    }

    fn connect(&mut self, peripheral: &PeripheralId) -> Result<ConnectionHandle, DeviceError> {
        let target = lock(&self.shared)
            .discovered
            .get(peripheral)
            .cloned()
            .ok_or_else(|| DeviceError::UnknownPeripheral(peripheral.0.clone()))?;

        self.next_connection += 1;
        let connection = ConnectionHandle(self.next_connection);
        let cancel = self.cancel.child_token();
        lock(&self.shared).connections.insert(connection, Link {
            peripheral: target.clone(),
            cancel: cancel.clone(),
        });

        spawn(link_task(target, connection, self.shared.clone(), self.events.clone(), cancel));
        Ok(connection)
    }

    fn discover_services(&mut self, connection: ConnectionHandle) -> Result<(), DeviceError> {
        let peripheral = self.peripheral(connection)?;

        let shared = self.shared.clone();
        let events = self.events.clone();
        spawn(async move {
            let result = match peripheral.discover_services().await {
                Ok(()) => Ok(describe_services(&peripheral)),
                Err(err) => Err(DeviceError::from_btle(err)),
            };
            report(&shared, &events, connection, TransportEvent::ServicesDiscovered { connection, result });
        });
        Ok(())
    }

    fn write_characteristic(
        &mut self,
        connection: ConnectionHandle,
        characteristic: &CharacteristicHandle,
        bytes: &[u8],
    ) -> Result<(), DeviceError> {
        let peripheral = self.peripheral(connection)?;
        let target = peripheral.characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic.uuid && c.service_uuid == characteristic.service)
            .ok_or(DeviceError::MissingCharacteristic)?;
        let kind = write_type(characteristic.write);
        let bytes = bytes.to_vec();

        let shared = self.shared.clone();
        let events = self.events.clone();
        spawn(async move {
            let success = tokio::select! {
                _ = sleep(Duration::from_millis(WRITE_DEADLINE)) => {
                    warn!("Sending to command characteristic took too long");
                    false
                }
                result = peripheral.write(&target, &bytes, kind) => match result {
                    Ok(()) => true,
                    Err(err) => {
                        warn!("Failed to send to command characteristic: {:?}", err);
                        false
                    },
                }
            };
            report(&shared, &events, connection, TransportEvent::WriteComplete { connection, success });
        });
        Ok(())
    }

    fn disconnect(&mut self, connection: ConnectionHandle) -> Result<(), DeviceError> {
        let shared = lock(&self.shared);
        let link = shared.connections.get(&connection).ok_or(DeviceError::UnknownConnection(connection.0))?;
        link.cancel.cancel();
        Ok(())
    }

    fn close(&mut self, connection: ConnectionHandle) {
        if let Some(link) = lock(&self.shared).connections.remove(&connection) {
            link.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use futures::future;

    #[test]
    fn acknowledged_writes_are_preferred() {
        assert_eq!(write_mode(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE), Some(WriteMode::WithResponse));
        assert_eq!(write_mode(CharPropFlags::WRITE_WITHOUT_RESPONSE), Some(WriteMode::WithoutResponse));
        assert_eq!(write_mode(CharPropFlags::READ | CharPropFlags::NOTIFY), None);
    }

    #[test]
    fn write_mode_picks_the_btleplug_write_type() {
        assert_eq!(write_type(WriteMode::WithResponse), WriteType::WithResponse);
        assert_eq!(write_type(WriteMode::WithoutResponse), WriteType::WithoutResponse);
    }

    #[test]
    fn refused_connections_keep_permission_errors_apart() {
        assert!(matches!(connect_error(btleplug::Error::PermissionDenied), DeviceError::PermissionDenied));
        assert!(matches!(connect_error(btleplug::Error::NotConnected), DeviceError::ConnectFailed));
    }

    #[test]
    fn poisoned_state_is_still_usable() {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let poisoner = shared.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison the lock");
        }).join();

        assert!(shared.is_poisoned());
        lock(&shared).scanning = true;
        assert!(lock(&shared).scanning);
    }

    #[tokio::test]
    async fn link_closed_while_connecting_is_released_without_events() {
        let shared = Mutex::new(Shared::default());
        let (events, mut receiver) = unbounded();
        let cancel = CancellationToken::new();
        let released = Arc::new(AtomicBool::new(false));

        cancel.cancel();
        let flag = released.clone();
        hold_link(
            future::pending(),
            move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<(), btleplug::Error>(())
            },
            ConnectionHandle(1),
            &shared,
            &events,
            &cancel,
        ).await;

        assert!(released.load(Ordering::SeqCst));
        assert!(receiver.try_next().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn late_connect_of_a_closed_link_is_dropped_and_released() {
        let shared = Mutex::new(Shared::default());
        let (events, mut receiver) = unbounded();
        let cancel = CancellationToken::new();
        let released = Arc::new(AtomicBool::new(false));

        let closer = cancel.clone();
        let flag = released.clone();
        let connect = async move {
            sleep(Duration::from_secs(1)).await;
            closer.cancel();
            Ok::<(), btleplug::Error>(())
        };
        hold_link(
            connect,
            move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<(), btleplug::Error>(())
            },
            ConnectionHandle(1),
            &shared,
            &events,
            &cancel,
        ).await;

        assert!(released.load(Ordering::SeqCst));
        assert!(receiver.try_next().is_err());
    }
}
