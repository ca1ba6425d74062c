pub mod client;
pub mod codec;
pub mod crc;
pub mod protocol;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

pub use client::{ClientConfig, ModbusClient, ModbusClientTrait};
pub use codec::{decode, encode, Frame};
pub use crc::crc16_modbus;
pub use protocol::{ModbusRequest, ModbusResponse};
pub use transport::{Connector, RtuTransport, SerialLink, SerialPortConnector};
