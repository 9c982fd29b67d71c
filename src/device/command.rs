use std::fmt;
use log::{debug, info};

use crate::device::connection::GattConnection;
use crate::device::constants::{COMMAND_LEN, MOTOR_OFF, MOTOR_ON};
use crate::device::transport::Transport;
use crate::error::DeviceError;

/// The fixed-size command written to the command characteristic:
/// byte 0 is the motor flag, bytes 1-5 are reserved and always zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPayload([u8; COMMAND_LEN]);

impl CommandPayload {
    pub fn motor(on: bool) -> Self {
        let mut bytes = [0u8; COMMAND_LEN];
        bytes[0] = if on { MOTOR_ON } else { MOTOR_OFF };
        CommandPayload(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DeviceError> {
        let bytes: [u8; COMMAND_LEN] = bytes.try_into()
            .map_err(|_| DeviceError::InvalidPayload { len: bytes.len() })?;

        if bytes[0] > MOTOR_ON || bytes[1..].iter().any(|byte| *byte != 0) {
            return Err(DeviceError::InvalidToggleFlag);
        }
        Ok(CommandPayload(bytes))
    }

    pub fn motor_on(&self) -> bool {
        self.0[0] == MOTOR_ON
    }

    pub fn as_bytes(&self) -> &[u8; COMMAND_LEN] {
        &self.0
    }
}

impl fmt::Display for CommandPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "motor {}", if self.motor_on() { "on" } else { "off" })
    }
}

/// Tracks the motor toggle. The state only follows a write once the peripheral confirmed it.
#[derive(Debug, Default)]
pub struct CommandChannel {
    motor_on: bool,
    pending: Option<CommandPayload>,
}

impl CommandChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn motor_on(&self) -> bool {
        self.motor_on
    }

    pub fn pending(&self) -> Option<CommandPayload> {
        self.pending
    }

    /// Submits the command that flips the motor. Returns as soon as the transport accepted it.
    pub fn toggle_motor(
        &mut self,
        gatt: &mut GattConnection,
        transport: &mut dyn Transport,
    ) -> Result<CommandPayload, DeviceError> {
        if !gatt.is_ready() {
            return Err(DeviceError::NotReady);
        }

        let payload = CommandPayload::motor(!self.motor_on);
        gatt.write(transport, payload.as_bytes())?;
        self.pending = Some(payload);

        info!("Sent {} command", payload);
        Ok(payload)
    }

    pub fn on_write_complete(&mut self, success: bool) {
        match self.pending.take() {
            Some(payload) if success => {
                self.motor_on = payload.motor_on();
                info!("Motor is now {}", if self.motor_on { "on" } else { "off" });
            },
            Some(_) => {},
            None => debug!("Write completed without a pending command"),
        }
    }

    /// Forgets the in-flight command of a session that went away.
    pub fn abandon(&mut self) {
        self.pending = None;
    }
}
