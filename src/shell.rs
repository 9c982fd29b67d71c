use std::time::Duration;
use clap::Parser;
use futures::channel::mpsc::unbounded;
use futures::StreamExt;
use log::{error, info};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::config::io::ConfigIO;
use crate::config::types::Config;
use crate::device::btle::BtleTransport;
use crate::device::manager::{connection_manager_task, ManagerHandle};
use crate::device::types::Notification;
use crate::error::{AppRunError, DeviceError};

#[derive(Parser, Debug, Default)]
#[command(name = "ble-motor-switch", version, about = "Toggle the motor of a BLE motor controller")]
pub struct Args {
    /// How long to scan for the controller, e.g. "5s"
    #[arg(long, value_parser = humantime::parse_duration)]
    pub scan_period: Option<Duration>,

    /// Give up on a connection attempt that is not ready after this long, e.g. "15s"
    #[arg(long, value_parser = humantime::parse_duration)]
    pub connect_timeout: Option<Duration>,

    /// Only connect to a peripheral advertising this name
    #[arg(long)]
    pub device_name: Option<String>,

    /// Always scan for the full scan period
    #[arg(long)]
    pub no_early_exit: bool,

    /// Write the effective configuration back to the config file
    #[arg(long)]
    pub save_config: bool,

    /// Start scanning right away
    #[arg(long)]
    pub start: bool,

    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    pub fn apply(&self, config: &mut Config) {
        if let Some(scan_period) = self.scan_period {
            config.scan_period_ms = millis(scan_period);
        }
        if let Some(connect_timeout) = self.connect_timeout {
            config.connect_timeout_ms = Some(millis(connect_timeout));
        }
        if let Some(device_name) = &self.device_name {
            config.device_name = Some(device_name.clone());
        }
        if self.no_early_exit {
            config.early_exit = false;
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub fn describe(notification: Notification) -> &'static str {
    match notification {
        Notification::Scanning => "Scanning...",
        Notification::NoDeviceFound => "No device found",
        Notification::Connecting => "Connecting...",
        Notification::ServiceDiscoveryFailed => "The device does not offer the motor command",
        Notification::Ready => "Ready, type \"send\" to toggle the motor",
        Notification::Disconnected => "Disconnected",
        Notification::WriteSucceeded => "Command sent",
        Notification::WriteFailed => "Command failed",
        Notification::PermissionDenied => "Bluetooth permission denied, grant access and start again",
        Notification::TransportUnavailable => "Bluetooth is unavailable, enable the adapter and start again",
        Notification::Stopped => "Stopped",
    }
}

const HELP: &str = "Commands: start, stop, send, disconnect, quit";

async fn load_config(config_io: &ConfigIO) -> Config {
    match config_io.read().await {
        Ok(config) => config,
        Err(err) => {
            if err.is_file_not_found_error() {
                info!("Config file not found, using defaults");
            } else {
                error!("Failed to load config, using defaults: {}", err);
            }
            Config::default()
        },
    }
}

async fn execute(manager: &ManagerHandle, line: &str) -> Result<(), DeviceError> {
    match line {
        "start" => manager.start().await,
        "stop" => manager.stop().await,
        "send" => {
            let payload = manager.send_command().await?;
            println!("Sending {}", payload);
            Ok(())
        },
        "disconnect" => manager.disconnect().await,
        _ => {
            println!("{}", HELP);
            Ok(())
        },
    }
}

pub async fn run_shell(args: Args) -> Result<(), AppRunError> {
    let mut config_io = ConfigIO::new_sync()?;
    let mut locker = config_io.locker()?;
    let _lock = locker.lock()?;

    let mut config = load_config(&config_io).await;
    args.apply(&mut config);
    if args.save_config {
        config_io.save(&config).await?;
    }

    let cancel = CancellationToken::new();
    let (event_sender, event_receiver) = unbounded();
    let transport = BtleTransport::new(event_sender).await?;
    let (manager, mut notifications, manager_task) =
        connection_manager_task(transport, &config, event_receiver, cancel.clone());

    println!("{}", HELP);
    if args.start {
        if let Err(err) = manager.start().await {
            println!("{}", err);
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    'mainloop: loop {
        tokio::select! {
            Some(notification) = notifications.next() => {
                println!("{}", describe(notification));
            },
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break 'mainloop;
                };

                match line.trim() {
                    "" => {},
                    "quit" | "exit" => break 'mainloop,
                    command => {
                        if let Err(err) = execute(&manager, command).await {
                            println!("{}", err);
                        }
                    },
                }
            },
        }
    }

    cancel.cancel();
    if let Err(err) = manager_task.await {
        error!("Connection manager task failed: {}", err);
    }
    Ok(())
}
