use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

use crate::device::transport::Transport;
use crate::device::types::{CharacteristicHandle, ConnectionHandle, PeripheralId};
use crate::error::DeviceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    StartScan(Uuid),
    StopScan,
    Connect(PeripheralId, ConnectionHandle),
    DiscoverServices(ConnectionHandle),
    Write(ConnectionHandle, CharacteristicHandle, Vec<u8>),
    Disconnect(ConnectionHandle),
    Close(ConnectionHandle),
}

#[derive(Default)]
struct Recording {
    calls: Vec<TransportCall>,
    next_connection: u64,
    reject_next: Option<DeviceError>,
}

/// A [`Transport`] that records every call instead of talking to a radio. Clones share the
/// same recording, so a test can hand one clone to the state machine and keep another.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    inner: Arc<Mutex<Recording>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).calls.clone()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).calls.clear();
    }

    /// Makes the next fallible call fail with `err` without recording it.
    pub fn reject_next(&self, err: DeviceError) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).reject_next = Some(err);
    }

    /// Handles that were connected and not closed yet.
    pub fn open_connections(&self) -> Vec<ConnectionHandle> {
        let calls = self.calls();
        calls.iter()
            .filter_map(|call| match call {
                TransportCall::Connect(_, handle) => Some(*handle),
                _ => None,
            })
            .filter(|handle| !calls.contains(&TransportCall::Close(*handle)))
            .collect()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.calls().into_iter()
            .filter_map(|call| match call {
                TransportCall::Write(_, _, bytes) => Some(bytes),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: TransportCall) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(err) = inner.reject_next.take() {
            return Err(err);
        }
        inner.calls.push(call);
        Ok(())
    }
}

impl Transport for RecordingTransport {
    fn start_scan(&mut self, filter: Uuid) -> Result<(), DeviceError> {
        self.record(TransportCall::StartScan(filter))
    }

    fn stop_scan(&mut self) -> Result<(), DeviceError> {
        self.record(TransportCall::StopScan)
    }

    fn connect(&mut self, peripheral: &PeripheralId) -> Result<ConnectionHandle, DeviceError> {
        let handle = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.next_connection += 1;
            ConnectionHandle(inner.next_connection)
        };
        self.record(TransportCall::Connect(peripheral.clone(), handle))?;
        Ok(handle)
    }

    fn discover_services(&mut self, connection: ConnectionHandle) -> Result<(), DeviceError> {
        self.record(TransportCall::DiscoverServices(connection))
    }

    fn write_characteristic(
        &mut self,
        connection: ConnectionHandle,
        characteristic: &CharacteristicHandle,
        bytes: &[u8],
    ) -> Result<(), DeviceError> {
        self.record(TransportCall::Write(connection, *characteristic, bytes.to_vec()))
    }

    fn disconnect(&mut self, connection: ConnectionHandle) -> Result<(), DeviceError> {
        self.record(TransportCall::Disconnect(connection))
    }

    fn close(&mut self, connection: ConnectionHandle) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).calls.push(TransportCall::Close(connection));
    }
}
