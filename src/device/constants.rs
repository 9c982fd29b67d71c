use uuid::Uuid;

/**
 * How long (milliseconds) a scan runs before it is finished with whatever was found.
 */
pub const SCAN_PERIOD: u64 = 10_000;

/**
 * How long (milliseconds) to keep collecting after the first matching scan result when the
 * caller opted into an early exit. Advertisements tend to arrive in bursts.
 */
pub const EARLY_EXIT_DELAY: u64 = 100;

/**
 * How long (milliseconds) a write to a characteristic may take.
 */
pub const WRITE_DEADLINE: u64 = 2000;

/**
 * The UUID of the Bluetooth BLE service advertised by the motor controller.
 */
pub const MOTOR_SERVICE: Uuid = Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb);

/**
 * Length of every command written to the command characteristic.
 */
pub const COMMAND_LEN: usize = 6;

pub const MOTOR_OFF: u8 = 0x00;
pub const MOTOR_ON: u8 = 0x01;
