use uuid::Uuid;

use crate::device::types::{CharacteristicHandle, ConnectionHandle, PeripheralId};
use crate::error::DeviceError;

/// The BLE stack as seen by the central's state machines.
///
/// Every method is fire-and-forget: it only fails for problems that can be detected before
/// anything is submitted. Outcomes arrive later as [`TransportEvent`]s on the channel the
/// implementation was constructed with.
///
/// [`TransportEvent`]: crate::device::types::TransportEvent
pub trait Transport: Send {
    /// Starts reporting `ScanResult` events for peripherals advertising `filter`.
    fn start_scan(&mut self, filter: Uuid) -> Result<(), DeviceError>;

    /// Takes effect after any earlier `start_scan`.
    fn stop_scan(&mut self) -> Result<(), DeviceError>;

    /// Requests a connection. Answered by `Connected` or `ConnectFailed` for the returned handle.
    fn connect(&mut self, peripheral: &PeripheralId) -> Result<ConnectionHandle, DeviceError>;

    /// Answered by `ServicesDiscovered`.
    fn discover_services(&mut self, connection: ConnectionHandle) -> Result<(), DeviceError>;

    /// Answered by `WriteComplete`.
    fn write_characteristic(
        &mut self,
        connection: ConnectionHandle,
        characteristic: &CharacteristicHandle,
        bytes: &[u8],
    ) -> Result<(), DeviceError>;

    /// Releases the link, also when the connect request is still pending.
    fn disconnect(&mut self, connection: ConnectionHandle) -> Result<(), DeviceError>;

    /// Releases everything held for `connection`. No events are reported for it afterwards.
    fn close(&mut self, connection: ConnectionHandle);
}
