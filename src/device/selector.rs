use crate::device::types::{PeripheralHandle, ScanResultSet};

/// Picks the peripheral to connect to from a finished scan. Implementations must be pure.
pub trait DeviceSelector: Send {
    fn select(&self, results: &ScanResultSet) -> Option<PeripheralHandle>;

    /// Whether `peripheral` is one this selector is waiting for. An early-exit scan only
    /// settles once such a peripheral was seen.
    fn accepts(&self, _peripheral: &PeripheralHandle) -> bool {
        true
    }
}

/// First discovered wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstDiscovered;

impl DeviceSelector for FirstDiscovered {
    fn select(&self, results: &ScanResultSet) -> Option<PeripheralHandle> {
        results.first().cloned()
    }
}

/// Prefers the first discovered peripheral advertising exactly this local name, and falls
/// back to the first discovered one.
#[derive(Debug, Clone)]
pub struct ByName {
    name: String,
}

impl ByName {
    pub fn new(name: impl Into<String>) -> Self {
        ByName { name: name.into() }
    }
}

impl DeviceSelector for ByName {
    fn select(&self, results: &ScanResultSet) -> Option<PeripheralHandle> {
        results.iter()
            .find(|peripheral| self.accepts(peripheral))
            .or_else(|| results.first())
            .cloned()
    }

    fn accepts(&self, peripheral: &PeripheralHandle) -> bool {
        peripheral.name.as_deref() == Some(self.name.as_str())
    }
}

/// Selector for an optional configured device name.
pub fn selector_for(device_name: Option<&str>) -> Box<dyn DeviceSelector> {
    match device_name {
        Some(name) => Box::new(ByName::new(name)),
        None => Box::new(FirstDiscovered),
    }
}
