use std::io;
use std::str::Utf8Error;
use thiserror::Error;
use btleplug;
use serde_json;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

impl ConfigError {
    pub fn is_file_not_found_error(&self) -> bool {
        match self {
            ConfigError::IOError { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start (bluetooth): {source}")]
    DeviceError { #[from] source: DeviceError },

    #[error("Failed to start (io): {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to initialize logger: {source}")]
    Logger { #[from] source: log::SetLoggerError },
}

/// Errors of the BLE central. Usage errors (`AlreadyScanning`, `AlreadyActive`,
/// `WriteInProgress`, `NotReady`) are returned synchronously and never change state.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("No usable bluetooth adapter is available")]
    TransportUnavailable,

    #[error("Permission to use bluetooth was denied")]
    PermissionDenied,

    #[error("Failed to connect to peripheral")]
    ConnectFailed,

    #[error("Service discovery failed")]
    DiscoveryFailed,

    #[error("A scan is already running")]
    AlreadyScanning,

    #[error("Already scanning or connected")]
    AlreadyActive,

    #[error("A command write is still in progress")]
    WriteInProgress,

    #[error("The peripheral connection is not ready")]
    NotReady,

    #[error("A required bluetooth characteristic is not available")]
    MissingCharacteristic,

    #[error("Peripheral {0} was not discovered by this adapter")]
    UnknownPeripheral(String),

    #[error("Connection handle {0} is not open")]
    UnknownConnection(u64),

    #[error("Command payload must be exactly 6 bytes, got {len}")]
    InvalidPayload { len: usize },

    #[error("Command payload has an invalid toggle flag or non-zero reserved bytes")]
    InvalidToggleFlag,

    #[error("The connection manager is no longer running")]
    ManagerStopped,
}

impl DeviceError {
    /// Lifts a btleplug error, keeping the cases the shell reacts to distinct.
    pub fn from_btle(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::PermissionDenied => DeviceError::PermissionDenied,
            other => DeviceError::Btle { source: other },
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, DeviceError::PermissionDenied | DeviceError::Btle { source: btleplug::Error::PermissionDenied })
    }
}
