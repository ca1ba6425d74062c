use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModbusError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid unit id {0}: must be 0-247")]
    InvalidUnitId(u16),

    #[error("Serial port unavailable: {0}")]
    PortUnavailable(String),

    #[error("Serial settings rejected: {0}")]
    ConfigRejected(String),

    #[error("Not connected: call open() first")]
    NotConnected,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Timeout waiting for response")]
    Timeout,

    #[error("CRC mismatch: expected 0x{expected:04x}, received 0x{received:04x}")]
    CrcMismatch { expected: u16, received: u16 },

    #[error("Frame too short: {0} bytes")]
    FrameTooShort(usize),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Partial write: requested {requested} registers, device wrote {written}")]
    PartialWrite { requested: u16, written: u16 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Modbus exception 0x{code:02x} ({}) for function 0x{function:02x}", exception_label(.code))]
    Exception { function: u8, code: u8 },
}

impl ModbusError {
    /// Errors that describe the state of the bus rather than a programming
    /// or configuration mistake. The exerciser keeps looping on these.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ModbusError::Io(_)
                | ModbusError::Timeout
                | ModbusError::CrcMismatch { .. }
                | ModbusError::FrameTooShort(_)
                | ModbusError::UnexpectedResponse(_)
                | ModbusError::PartialWrite { .. }
                | ModbusError::Exception { .. }
        )
    }
}

fn exception_label(code: &u8) -> &'static str {
    exception_name(*code)
}

pub fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "slave device failure",
        0x05 => "acknowledge",
        0x06 => "slave device busy",
        0x08 => "memory parity error",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target device failed to respond",
        _ => "unknown exception",
    }
}

impl From<serialport::Error> for ModbusError {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::NoDevice => ModbusError::PortUnavailable(err.description),
            serialport::ErrorKind::InvalidInput => ModbusError::ConfigRejected(err.description),
            serialport::ErrorKind::Io(kind) => match kind {
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                    ModbusError::PortUnavailable(err.description)
                }
                io::ErrorKind::InvalidInput => ModbusError::ConfigRejected(err.description),
                _ => ModbusError::Io(io::Error::new(kind, err.description)),
            },
            _ => ModbusError::PortUnavailable(err.description),
        }
    }
}
