use log::{debug, info, warn};
use std::time::{Duration, Instant};

use super::codec;
use super::protocol::{registers_to_u32, u32_to_registers, ModbusRequest, ModbusResponse};
use super::transport::{Connector, RtuTransport, SerialPortConnector};
use crate::config::settings::ParityConfig;
use crate::utils::error::ModbusError;

/// Data bits are fixed for RTU framing.
pub const DATA_BITS: u8 = 8;

/// Unit id addressed to every slave; slaves never answer it.
pub const BROADCAST_UNIT_ID: u8 = 0;
pub const MAX_UNIT_ID: u16 = 247;

pub const DEFAULT_BAUD_RATE: u32 = 9600;
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(300);

/// Serial line settings. Fixed for the lifetime of a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub serial_port: String,
    pub baud_rate: u32,
    pub parity: ParityConfig,
    pub stop_bits: u8,
    pub response_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            serial_port: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            parity: ParityConfig::None,
            stop_bits: 1,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ModbusError> {
        if self.serial_port.trim().is_empty() {
            return Err(ModbusError::InvalidConfig("serial port path is empty".to_string()));
        }
        if self.baud_rate == 0 {
            return Err(ModbusError::InvalidConfig("baud rate must be positive".to_string()));
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return Err(ModbusError::InvalidConfig(format!(
                "stop bits must be 1 or 2, got {}",
                self.stop_bits
            )));
        }
        if self.response_timeout.is_zero() {
            return Err(ModbusError::InvalidConfig("response timeout must be positive".to_string()));
        }
        Ok(())
    }
}

/// Register-level operations the exerciser drives.
pub trait ModbusClientTrait {
    fn open(&mut self) -> Result<(), ModbusError>;
    fn close(&mut self) -> Result<(), ModbusError>;
    fn is_open(&self) -> bool;
    fn write_register(&mut self, address: u16, value: u16) -> Result<(), ModbusError>;
    fn write_uint32(&mut self, address: u16, value: u32) -> Result<(), ModbusError>;
}

/// Blocking Modbus RTU master. One request is on the bus at a time; every
/// call returns once the response is validated or the timeout expires.
/// No retries and no reconnects happen here.
pub struct ModbusClient {
    config: ClientConfig,
    transport: RtuTransport,
    unit_id: u8,
}

impl ModbusClient {
    /// Validate `config` and build a client for an OS serial device.
    /// The port is not opened until `open()`.
    pub fn new(config: ClientConfig) -> Result<Self, ModbusError> {
        Self::with_connector(config, Box::new(SerialPortConnector))
    }

    pub fn with_connector(
        config: ClientConfig,
        connector: Box<dyn Connector>,
    ) -> Result<Self, ModbusError> {
        config.validate()?;
        let transport = RtuTransport::new(config.clone(), connector);
        Ok(Self {
            config,
            transport,
            unit_id: 1,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    /// Address subsequent requests to `unit_id` (0 = broadcast).
    pub fn set_unit_id(&mut self, unit_id: u16) -> Result<(), ModbusError> {
        if unit_id > MAX_UNIT_ID {
            return Err(ModbusError::InvalidUnitId(unit_id));
        }
        self.unit_id = unit_id as u8;
        debug!("🎯 Unit id set to {}", unit_id);
        Ok(())
    }

    pub fn read_registers(&mut self, address: u16, quantity: u16) -> Result<Vec<u16>, ModbusError> {
        let request = ModbusRequest::ReadHoldingRegisters {
            start_register: address,
            quantity,
        };
        match self.execute(&request)? {
            ModbusResponse::Registers(registers) => Ok(registers),
            ModbusResponse::Written => Err(ModbusError::UnexpectedResponse(
                "write acknowledgement for a read request".to_string(),
            )),
        }
    }

    pub fn read_register(&mut self, address: u16) -> Result<u16, ModbusError> {
        let registers = self.read_registers(address, 1)?;
        Ok(registers[0])
    }

    /// Read a 32-bit value stored high word first at `address`.
    pub fn read_uint32(&mut self, address: u16) -> Result<u32, ModbusError> {
        let registers = self.read_registers(address, 2)?;
        Ok(registers_to_u32(registers[0], registers[1]))
    }

    fn execute(&mut self, request: &ModbusRequest) -> Result<ModbusResponse, ModbusError> {
        request.validate()?;
        if !self.transport.is_open() {
            return Err(ModbusError::NotConnected);
        }

        let unit_id = self.unit_id;
        if unit_id == BROADCAST_UNIT_ID && !request.is_write() {
            return Err(ModbusError::InvalidUnitId(unit_id as u16));
        }

        let frame = codec::encode(unit_id, request.function_code(), &request.payload());
        self.transport.send(&frame)?;

        if unit_id == BROADCAST_UNIT_ID {
            debug!("📣 Broadcast sent, no response expected");
            return Ok(ModbusResponse::Written);
        }

        let deadline = Instant::now() + self.config.response_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ModbusError::Timeout);
            }

            let bytes = self.transport.receive(remaining)?;
            let response = codec::decode(&bytes)?;

            if !request.correlates(unit_id, &response) {
                warn!(
                    "⚠️ Discarding frame from unit {} function 0x{:02x} while waiting for unit {} function 0x{:02x}",
                    response.unit_id,
                    response.function_code,
                    unit_id,
                    request.function_code()
                );
                continue;
            }

            return request.parse_response(&response);
        }
    }
}

impl ModbusClientTrait for ModbusClient {
    /// Open the serial port. Does nothing if it is already open; after a
    /// failure the client stays closed and `open()` may be called again.
    fn open(&mut self) -> Result<(), ModbusError> {
        if self.transport.is_open() {
            return Ok(());
        }
        self.transport.open()
    }

    fn close(&mut self) -> Result<(), ModbusError> {
        self.transport.close()
    }

    fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    fn write_register(&mut self, address: u16, value: u16) -> Result<(), ModbusError> {
        let request = ModbusRequest::WriteSingleRegister {
            register: address,
            value,
        };
        self.execute(&request)?;
        Ok(())
    }

    /// Write `value` to `address` (high word) and `address + 1` (low word)
    /// in a single write-multiple request.
    fn write_uint32(&mut self, address: u16, value: u32) -> Result<(), ModbusError> {
        let request = ModbusRequest::WriteMultipleRegisters {
            start_register: address,
            values: u32_to_registers(value).to_vec(),
        };
        self.execute(&request)?;
        Ok(())
    }
}

impl Drop for ModbusClient {
    fn drop(&mut self) {
        if self.transport.is_open() {
            info!("🔌 Closing Modbus RTU port {}", self.config.serial_port);
            let _ = self.transport.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::codec::{decode, encode};
    use crate::modbus::mock::MockBus;
    use std::sync::{Arc, Mutex};

    fn config() -> ClientConfig {
        ClientConfig {
            serial_port: "/dev/ttyMOCK0".to_string(),
            response_timeout: Duration::from_millis(100),
            ..ClientConfig::default()
        }
    }

    /// Slave at `unit_id` that echoes writes the way a real device does.
    fn echoing_slave(bus: &MockBus, unit_id: u8) {
        bus.respond_with(move |request| {
            let frame = decode(request).unwrap();
            if frame.unit_id != unit_id {
                return Vec::new();
            }
            let echo = frame.payload[..4].to_vec();
            vec![encode(unit_id, frame.function_code, &echo)]
        });
    }

    fn open_client(bus: &MockBus) -> ModbusClient {
        let mut client = ModbusClient::with_connector(config(), bus.connector()).unwrap();
        client.open().unwrap();
        client
    }

    #[test]
    fn test_new_validates_config() {
        let bus = MockBus::new();
        let invalid = [
            ClientConfig { baud_rate: 0, ..config() },
            ClientConfig { stop_bits: 3, ..config() },
            ClientConfig { stop_bits: 0, ..config() },
            ClientConfig { serial_port: String::new(), ..config() },
            ClientConfig { response_timeout: Duration::ZERO, ..config() },
        ];
        for cfg in invalid {
            assert!(matches!(
                ModbusClient::with_connector(cfg, bus.connector()),
                Err(ModbusError::InvalidConfig(_))
            ));
        }
        assert_eq!(bus.opens(), 0);
    }

    #[test]
    fn test_write_register_sends_function_06_and_accepts_echo() {
        let bus = MockBus::new();
        echoing_slave(&bus, 1);
        let mut client = open_client(&bus);

        client.write_register(4, 42).unwrap();
        assert_eq!(
            bus.written(),
            vec![vec![0x01, 0x06, 0x00, 0x04, 0x00, 0x2A, 0x49, 0xD4]]
        );
    }

    #[test]
    fn test_write_register_echo_mismatch() {
        let bus = MockBus::new();
        bus.respond_with(|_| vec![encode(1, 0x06, &[0x00, 0x05, 0x00, 0x2A])]);
        let mut client = open_client(&bus);

        assert!(matches!(
            client.write_register(4, 42),
            Err(ModbusError::UnexpectedResponse(_))
        ));
    }

    #[test]
    fn test_write_uint32_uses_big_endian_word_order() {
        let bus = MockBus::new();
        echoing_slave(&bus, 1);
        let mut client = open_client(&bus);

        client.write_uint32(100, 0x0001_0002).unwrap();

        let request = decode(&bus.written()[0]).unwrap();
        assert_eq!(request.function_code, 0x10);
        assert_eq!(
            request.payload,
            vec![0x00, 0x64, 0x00, 0x02, 0x04, 0x00, 0x01, 0x00, 0x02]
        );
    }

    #[test]
    fn test_write_uint32_partial_write() {
        let bus = MockBus::new();
        bus.respond_with(|_| vec![encode(1, 0x10, &[0x00, 0x00, 0x00, 0x01])]);
        let mut client = open_client(&bus);

        assert!(matches!(
            client.write_uint32(0, 7),
            Err(ModbusError::PartialWrite { requested: 2, written: 1 })
        ));
    }

    #[test]
    fn test_operations_require_open_client() {
        let bus = MockBus::new();
        let mut client = ModbusClient::with_connector(config(), bus.connector()).unwrap();
        assert!(matches!(client.write_register(0, 1), Err(ModbusError::NotConnected)));
        assert!(matches!(client.write_uint32(0, 1), Err(ModbusError::NotConnected)));
        assert!(matches!(client.read_register(0), Err(ModbusError::NotConnected)));
        assert!(bus.written().is_empty());
    }

    #[test]
    fn test_open_is_idempotent_and_retryable() {
        let bus = MockBus::new();
        bus.fail_next_open(ModbusError::PortUnavailable("busy".to_string()));
        let mut client = ModbusClient::with_connector(config(), bus.connector()).unwrap();

        assert!(matches!(client.open(), Err(ModbusError::PortUnavailable(_))));
        assert!(!client.is_open());

        client.open().unwrap();
        client.open().unwrap();
        assert!(client.is_open());
        assert_eq!(bus.opens(), 1);
    }

    #[test]
    fn test_close_twice_then_reopen() {
        let bus = MockBus::new();
        echoing_slave(&bus, 1);
        let mut client = open_client(&bus);

        client.close().unwrap();
        client.close().unwrap();
        assert!(!client.is_open());

        client.open().unwrap();
        client.write_register(1, 1).unwrap();
        assert_eq!(bus.opens(), 2);
    }

    #[test]
    fn test_set_unit_id_bounds_and_addressing() {
        let bus = MockBus::new();
        echoing_slave(&bus, 5);
        let mut client = open_client(&bus);

        assert!(matches!(client.set_unit_id(300), Err(ModbusError::InvalidUnitId(300))));
        assert!(matches!(client.set_unit_id(248), Err(ModbusError::InvalidUnitId(248))));
        assert_eq!(client.unit_id(), 1);

        client.set_unit_id(5).unwrap();
        client.write_register(4, 1).unwrap();
        client.write_uint32(0, 1).unwrap();
        for frame in bus.written() {
            assert_eq!(frame[0], 5);
        }
    }

    #[test]
    fn test_response_from_other_unit_is_discarded_until_timeout() {
        let bus = MockBus::new();
        bus.respond_with(|_| vec![encode(2, 0x06, &[0x00, 0x04, 0x00, 0x2A])]);
        let mut client = open_client(&bus);

        let started = Instant::now();
        assert!(matches!(client.write_register(4, 42), Err(ModbusError::Timeout)));
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_stray_frame_before_matching_response() {
        let bus = MockBus::new();
        bus.respond_with(|_| {
            vec![
                encode(9, 0x06, &[0x00, 0x04, 0x00, 0x2A]),
                encode(1, 0x06, &[0x00, 0x04, 0x00, 0x2A]),
            ]
        });
        let mut client = open_client(&bus);
        client.write_register(4, 42).unwrap();
    }

    #[test]
    fn test_corrupted_response_is_crc_mismatch() {
        let bus = MockBus::new();
        bus.respond_with(|_| {
            let mut frame = encode(1, 0x06, &[0x00, 0x04, 0x00, 0x2A]);
            frame[3] ^= 0x01;
            vec![frame]
        });
        let mut client = open_client(&bus);
        assert!(matches!(
            client.write_register(4, 42),
            Err(ModbusError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_exception_response_is_reported() {
        let bus = MockBus::new();
        bus.respond_with(|_| vec![encode(1, 0x90, &[0x02])]);
        let mut client = open_client(&bus);
        assert!(matches!(
            client.write_uint32(0, 1),
            Err(ModbusError::Exception { function: 0x10, code: 0x02 })
        ));
    }

    #[test]
    fn test_read_uint32() {
        let bus = MockBus::new();
        bus.respond_with(|_| vec![encode(1, 0x03, &[0x04, 0x00, 0x01, 0x00, 0x02])]);
        let mut client = open_client(&bus);

        assert_eq!(client.read_uint32(100).unwrap(), 0x0001_0002);
        assert_eq!(bus.written()[0], encode(1, 0x03, &[0x00, 0x64, 0x00, 0x02]));
    }

    #[test]
    fn test_broadcast_write_does_not_wait() {
        let bus = MockBus::new();
        let mut client = open_client(&bus);
        client.set_unit_id(0).unwrap();

        let started = Instant::now();
        client.write_register(4, 1).unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(matches!(client.read_register(4), Err(ModbusError::InvalidUnitId(0))));
    }

    #[test]
    fn test_unit_id_change_applies_to_next_request_only() {
        let bus = MockBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        bus.respond_with(move |request| {
            let frame = decode(request).unwrap();
            log.lock().unwrap().push(frame.unit_id);
            vec![encode(frame.unit_id, frame.function_code, &frame.payload[..4])]
        });
        let mut client = open_client(&bus);

        client.write_register(4, 1).unwrap();
        client.set_unit_id(7).unwrap();
        client.write_register(4, 2).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 7]);
    }
}
