use log::{debug, info, warn};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::constants::EARLY_EXIT_DELAY;
use crate::device::selector::DeviceSelector;
use crate::device::timer::{TimerEvent, Timers};
use crate::device::transport::Transport;
use crate::device::types::{PeripheralHandle, ScanResultSet};
use crate::error::DeviceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Scanning,
    Finished,
}

/// One bounded advertisement scan at a time, filtered on a single service.
///
/// The result set is emitted exactly once per scan: by the deadline, by the early-exit
/// settle timer, or by [`ScanSession::stop`], whichever comes first.
#[derive(Debug)]
pub struct ScanSession {
    filter: Uuid,
    state: ScanState,
    results: ScanResultSet,
    // increments per start, so timers of an earlier scan are recognized
    scan_id: u64,
    early_exit: bool,
    deadline: Option<CancellationToken>,
    settle: Option<CancellationToken>,
}

impl ScanSession {
    pub fn new(filter: Uuid) -> Self {
        ScanSession {
            filter,
            state: ScanState::Idle,
            results: ScanResultSet::new(),
            scan_id: 0,
            early_exit: false,
            deadline: None,
            settle: None,
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn is_scanning(&self) -> bool {
        self.state == ScanState::Scanning
    }

    pub fn scan_id(&self) -> u64 {
        self.scan_id
    }

    /// The set collected so far by the running scan.
    pub fn results(&self) -> &ScanResultSet {
        &self.results
    }

    pub fn start(
        &mut self,
        transport: &mut dyn Transport,
        timers: &Timers,
        duration: Duration,
        early_exit: bool,
    ) -> Result<(), DeviceError> {
        if self.is_scanning() {
            return Err(DeviceError::AlreadyScanning);
        }

        transport.start_scan(self.filter)?;

        self.scan_id += 1;
        self.results = ScanResultSet::new();
        self.early_exit = early_exit;
        self.state = ScanState::Scanning;
        self.deadline = Some(timers.schedule(duration, TimerEvent::ScanDeadline { scan: self.scan_id }));

        info!("Scanning for service {} for {}", self.filter, humantime::format_duration(duration));
        Ok(())
    }

    /// Collects `peripheral`. With early exit the scan settles shortly after the first
    /// result `selector` accepts.
    pub fn on_result(&mut self, peripheral: PeripheralHandle, timers: &Timers, selector: &dyn DeviceSelector) {
        if !self.is_scanning() {
            debug!("Ignoring scan result for {} outside of a scan", peripheral.id);
            return;
        }

        // Some environments ignore the filter, so make sure to check the service uuid again
        if !peripheral.advertises(&self.filter) {
            debug!("Ignoring peripheral {} without service {}", peripheral.id, self.filter);
            return;
        }

        let id = peripheral.id.clone();
        let name = peripheral.name.clone().unwrap_or(String::from("NONE"));
        let services = peripheral.services.clone();
        let accepted = selector.accepts(&peripheral);

        if self.results.insert(peripheral) {
            info!("Discovered peripheral {} {} {:?}", id, name, services);

            if self.early_exit && accepted && self.settle.is_none() {
                self.settle = Some(timers.schedule(
                    Duration::from_millis(EARLY_EXIT_DELAY),
                    TimerEvent::ScanSettled { scan: self.scan_id },
                ));
            }
        }
    }

    /// Finishes the scan if `event` is one of its own timers.
    pub fn on_timer(&mut self, transport: &mut dyn Transport, event: TimerEvent) -> Option<ScanResultSet> {
        match event {
            TimerEvent::ScanDeadline { scan } | TimerEvent::ScanSettled { scan }
                if scan == self.scan_id && self.is_scanning() =>
            {
                Some(self.finish(transport))
            },
            _ => {
                debug!("Ignoring stale {:?}", event);
                None
            },
        }
    }

    /// Cancels the running scan early. Returns what was collected, or `None` if no scan was running.
    pub fn stop(&mut self, transport: &mut dyn Transport) -> Option<ScanResultSet> {
        if !self.is_scanning() {
            return None;
        }
        Some(self.finish(transport))
    }

    fn finish(&mut self, transport: &mut dyn Transport) -> ScanResultSet {
        for token in [self.deadline.take(), self.settle.take()].into_iter().flatten() {
            token.cancel();
        }

        if let Err(err) = transport.stop_scan() {
            warn!("Failed to stop scanning: {:?}", err);
        }

        self.state = ScanState::Finished;
        let results = std::mem::take(&mut self.results);
        info!("Scan is stopped; {} peripheral(s) found", results.len());
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::time::timeout;
    use crate::device::constants::MOTOR_SERVICE;
    use crate::device::fake::{RecordingTransport, TransportCall};
    use crate::device::selector::{ByName, FirstDiscovered};

    const OTHER_SERVICE: Uuid = Uuid::from_u128(0x180f);

    fn motor_peripheral(id: &str) -> PeripheralHandle {
        PeripheralHandle::new(id, Some(id), vec![MOTOR_SERVICE])
    }

    #[tokio::test(start_paused = true)]
    async fn double_start_is_rejected() {
        let mut transport = RecordingTransport::new();
        let (timers, _receiver) = Timers::new();
        let mut scan = ScanSession::new(MOTOR_SERVICE);

        scan.start(&mut transport, &timers, Duration::from_secs(10), false).unwrap();
        let err = scan.start(&mut transport, &timers, Duration::from_secs(10), false).unwrap_err();

        assert!(matches!(err, DeviceError::AlreadyScanning));
        assert_eq!(transport.calls(), vec![TransportCall::StartScan(MOTOR_SERVICE)]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_start_is_surfaced_without_state_change() {
        let mut transport = RecordingTransport::new();
        let (timers, _receiver) = Timers::new();
        let mut scan = ScanSession::new(MOTOR_SERVICE);

        transport.reject_next(DeviceError::TransportUnavailable);
        let err = scan.start(&mut transport, &timers, Duration::from_secs(10), false).unwrap_err();

        assert!(matches!(err, DeviceError::TransportUnavailable));
        assert_eq!(scan.state(), ScanState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn results_without_the_service_are_ignored() {
        let mut transport = RecordingTransport::new();
        let (timers, _receiver) = Timers::new();
        let mut scan = ScanSession::new(MOTOR_SERVICE);
        scan.start(&mut transport, &timers, Duration::from_secs(10), false).unwrap();

        scan.on_result(PeripheralHandle::new("x", Some("X"), vec![OTHER_SERVICE]), &timers, &FirstDiscovered);
        scan.on_result(motor_peripheral("p1"), &timers, &FirstDiscovered);
        scan.on_result(motor_peripheral("p1"), &timers, &FirstDiscovered);

        assert_eq!(scan.results().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_freezes_results_and_cancels_the_deadline() {
        let mut transport = RecordingTransport::new();
        let (timers, mut receiver) = Timers::new();
        let mut scan = ScanSession::new(MOTOR_SERVICE);
        scan.start(&mut transport, &timers, Duration::from_secs(10), false).unwrap();
        scan.on_result(motor_peripheral("p1"), &timers, &FirstDiscovered);

        let results = scan.stop(&mut transport).unwrap();
        scan.on_result(motor_peripheral("p2"), &timers, &FirstDiscovered);

        assert_eq!(results.len(), 1);
        assert!(scan.results().is_empty());
        assert!(scan.stop(&mut transport).is_none());
        assert_eq!(transport.calls().last(), Some(&TransportCall::StopScan));
        assert!(timeout(Duration::from_secs(60), receiver.next()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_emits_exactly_once() {
        let mut transport = RecordingTransport::new();
        let (timers, mut receiver) = Timers::new();
        let mut scan = ScanSession::new(MOTOR_SERVICE);
        scan.start(&mut transport, &timers, Duration::from_secs(10), false).unwrap();
        scan.on_result(motor_peripheral("p1"), &timers, &FirstDiscovered);

        let event = receiver.next().await.unwrap();
        assert_eq!(event, TimerEvent::ScanDeadline { scan: scan.scan_id() });

        let results = scan.on_timer(&mut transport, event).unwrap();
        assert_eq!(results.first().unwrap().id.0, "p1");
        assert!(scan.on_timer(&mut transport, event).is_none());
        assert_eq!(scan.state(), ScanState::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn early_exit_settles_shortly_after_the_first_result() {
        let mut transport = RecordingTransport::new();
        let (timers, mut receiver) = Timers::new();
        let mut scan = ScanSession::new(MOTOR_SERVICE);
        scan.start(&mut transport, &timers, Duration::from_secs(10), true).unwrap();
        scan.on_result(motor_peripheral("p1"), &timers, &FirstDiscovered);
        scan.on_result(motor_peripheral("p2"), &timers, &FirstDiscovered);

        let event = receiver.next().await.unwrap();
        assert_eq!(event, TimerEvent::ScanSettled { scan: scan.scan_id() });
        assert_eq!(scan.on_timer(&mut transport, event).unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timers_of_an_earlier_scan_are_ignored() {
        let mut transport = RecordingTransport::new();
        let (timers, _receiver) = Timers::new();
        let mut scan = ScanSession::new(MOTOR_SERVICE);
        scan.start(&mut transport, &timers, Duration::from_secs(10), false).unwrap();
        let first = scan.scan_id();
        scan.stop(&mut transport);
        scan.start(&mut transport, &timers, Duration::from_secs(10), false).unwrap();

        assert!(scan.on_timer(&mut transport, TimerEvent::ScanDeadline { scan: first }).is_none());
        assert!(scan.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn early_exit_waits_for_a_peripheral_the_selector_accepts() {
        let mut transport = RecordingTransport::new();
        let (timers, mut receiver) = Timers::new();
        let mut scan = ScanSession::new(MOTOR_SERVICE);
        let selector = ByName::new("B");
        scan.start(&mut transport, &timers, Duration::from_secs(10), true).unwrap();

        scan.on_result(PeripheralHandle::new("p1", None, vec![MOTOR_SERVICE]), &timers, &selector);
        assert!(timeout(Duration::from_millis(500), receiver.next()).await.is_err());
        assert!(scan.is_scanning());

        scan.on_result(PeripheralHandle::new("p2", Some("B"), vec![MOTOR_SERVICE]), &timers, &selector);
        let event = receiver.next().await.unwrap();
        assert_eq!(event, TimerEvent::ScanSettled { scan: scan.scan_id() });

        let results = scan.on_timer(&mut transport, event).unwrap();
        assert_eq!(selector.select(&results).unwrap().id.0, "p2");
    }
}
