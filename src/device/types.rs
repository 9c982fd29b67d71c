use std::fmt;
use indexmap::IndexMap;
use uuid::Uuid;

use crate::error::DeviceError;

/// Platform identifier of a peripheral (a MAC address on Linux, a UUID on macOS).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeripheralId(pub String);

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(value: &str) -> Self {
        PeripheralId(value.to_string())
    }
}

/// One peripheral as reported by a single scan result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralHandle {
    pub id: PeripheralId,
    pub name: Option<String>,
    pub services: Vec<Uuid>,
}

impl PeripheralHandle {
    pub fn new(id: impl Into<PeripheralId>, name: Option<&str>, services: Vec<Uuid>) -> Self {
        PeripheralHandle {
            id: id.into(),
            name: name.map(str::to_string),
            services,
        }
    }

    pub fn advertises(&self, service: &Uuid) -> bool {
        self.services.contains(service)
    }
}

/// Peripherals in discovery order, deduplicated by identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResultSet {
    peripherals: IndexMap<PeripheralId, PeripheralHandle>,
}

impl ScanResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `peripheral` unless one with the same id was already seen.
    /// Returns true if it was new.
    pub fn insert(&mut self, peripheral: PeripheralHandle) -> bool {
        if self.peripherals.contains_key(&peripheral.id) {
            return false;
        }
        self.peripherals.insert(peripheral.id.clone(), peripheral);
        true
    }

    pub fn first(&self) -> Option<&PeripheralHandle> {
        self.peripherals.first().map(|(_, peripheral)| peripheral)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeripheralHandle> {
        self.peripherals.values()
    }

    pub fn len(&self) -> usize {
        self.peripherals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peripherals.is_empty()
    }
}

/// Transport-level handle of one connection request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub u64);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of write a characteristic accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// Addresses a characteristic within a discovered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    pub service: Uuid,
    pub uuid: Uuid,
    pub write: WriteMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    /// `None` if the characteristic can not be written. Acknowledged writes win when both are offered.
    pub write: Option<WriteMode>,
}

impl GattCharacteristic {
    pub fn writable(uuid: Uuid, write: WriteMode) -> Self {
        GattCharacteristic { uuid, write: Some(write) }
    }

    pub fn read_only(uuid: Uuid) -> Self {
        GattCharacteristic { uuid, write: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

/// Asynchronous completions reported by the transport. Everything but scan events
/// names the connection it belongs to, so events of a torn down session can be told apart.
#[derive(Debug)]
pub enum TransportEvent {
    ScanResult(PeripheralHandle),
    ScanFailed(DeviceError),
    Connected(ConnectionHandle),
    ConnectFailed {
        connection: ConnectionHandle,
        error: DeviceError,
    },
    Disconnected(ConnectionHandle),
    ServicesDiscovered {
        connection: ConnectionHandle,
        result: Result<Vec<GattService>, DeviceError>,
    },
    WriteComplete {
        connection: ConnectionHandle,
        success: bool,
    },
}

/// State changes published to the presentation shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    Scanning,
    NoDeviceFound,
    Connecting,
    ServiceDiscoveryFailed,
    Ready,
    Disconnected,
    WriteSucceeded,
    WriteFailed,
    PermissionDenied,
    TransportUnavailable,
    Stopped,
}
