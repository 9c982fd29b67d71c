use clap::Parser;
use log::{error, info, LevelFilter};
use ble_motor_switch::{init_logging, run};
use ble_motor_switch::error::{AppRunError, ConfigError};
use ble_motor_switch::shell::Args;

fn main() -> Result<(), AppRunError> {
    let args = Args::parse();
    init_logging(if args.verbose { LevelFilter::Debug } else { LevelFilter::Info })?;
    info!(concat!("BLE Motor Switch ", env!("CARGO_PKG_VERSION")));

    match run(args) {
        Err(AppRunError::ConfigError { source: ConfigError::CanNotLock { .. } }) => {
            eprintln!("This application has already been started");
            Ok(())
        },
        Err(err) => {
            error!("Unexpected error: {}", err);
            Err(err)
        },
        Ok(_) => Ok(()),
    }
}
