pub mod btle;
pub mod command;
pub mod connection;
pub mod constants;
/// In-memory transport used by the tests of this crate and of code driving a `ConnectionManager`.
pub mod fake;
pub mod manager;
pub mod scan;
pub mod selector;
pub mod timer;
pub mod transport;
pub mod types;
