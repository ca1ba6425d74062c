//! Modbus RTU register exerciser
//!
//! Blocking Modbus RTU master (frame codec, serial transport, register
//! client) and the cyclic write loop used to exercise a slave's holding
//! registers over RS-485.

pub mod cli;
pub mod config;
pub mod modbus;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use modbus::{ClientConfig, ModbusClient, ModbusClientTrait};
pub use services::Exerciser;
pub use utils::error::ModbusError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
