use std::time::Duration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::constants::{MOTOR_SERVICE, SCAN_PERIOD};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub service_uuid: Uuid,
    pub command_characteristic_uuid: Option<Uuid>,
    pub scan_period_ms: u64,
    // finish the scan shortly after the first match instead of waiting for the full period
    pub early_exit: bool,
    pub connect_timeout_ms: Option<u64>,
    pub device_name: Option<String>,
}

impl Config {
    pub fn scan_period(&self) -> Duration {
        Duration::from_millis(self.scan_period_ms)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            service_uuid: MOTOR_SERVICE,
            command_characteristic_uuid: None,
            scan_period_ms: SCAN_PERIOD,
            early_exit: true,
            connect_timeout_ms: None,
            device_name: None,
        }
    }
}
