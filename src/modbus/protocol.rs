use super::codec::Frame;
use crate::utils::error::ModbusError;

pub const READ_HOLDING_REGISTERS: u8 = 0x03;
pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

pub const EXCEPTION_FLAG: u8 = 0x80;

/// Upper bound on registers per read request (253-byte PDU limit).
pub const MAX_READ_QUANTITY: u16 = 125;
/// Upper bound on registers per write-multiple request.
pub const MAX_WRITE_QUANTITY: u16 = 123;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusRequest {
    ReadHoldingRegisters {
        start_register: u16,
        quantity: u16,
    },
    WriteSingleRegister {
        register: u16,
        value: u16,
    },
    WriteMultipleRegisters {
        start_register: u16,
        values: Vec<u16>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusResponse {
    Registers(Vec<u16>),
    Written,
}

impl ModbusRequest {
    pub fn function_code(&self) -> u8 {
        match self {
            ModbusRequest::ReadHoldingRegisters { .. } => READ_HOLDING_REGISTERS,
            ModbusRequest::WriteSingleRegister { .. } => WRITE_SINGLE_REGISTER,
            ModbusRequest::WriteMultipleRegisters { .. } => WRITE_MULTIPLE_REGISTERS,
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, ModbusRequest::ReadHoldingRegisters { .. })
    }

    /// Reject requests that cannot be put on the wire before touching the bus.
    pub fn validate(&self) -> Result<(), ModbusError> {
        match self {
            ModbusRequest::ReadHoldingRegisters { start_register, quantity } => {
                if *quantity == 0 || *quantity > MAX_READ_QUANTITY {
                    return Err(ModbusError::InvalidRequest(format!(
                        "read quantity {} outside 1-{}",
                        quantity, MAX_READ_QUANTITY
                    )));
                }
                check_range(*start_register, *quantity)
            }
            ModbusRequest::WriteSingleRegister { .. } => Ok(()),
            ModbusRequest::WriteMultipleRegisters { start_register, values } => {
                if values.is_empty() || values.len() > MAX_WRITE_QUANTITY as usize {
                    return Err(ModbusError::InvalidRequest(format!(
                        "write quantity {} outside 1-{}",
                        values.len(),
                        MAX_WRITE_QUANTITY
                    )));
                }
                check_range(*start_register, values.len() as u16)
            }
        }
    }

    /// Request data following the function code, big-endian as on the wire.
    pub fn payload(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            ModbusRequest::ReadHoldingRegisters { start_register, quantity } => {
                payload.extend_from_slice(&start_register.to_be_bytes());
                payload.extend_from_slice(&quantity.to_be_bytes());
            }
            ModbusRequest::WriteSingleRegister { register, value } => {
                payload.extend_from_slice(&register.to_be_bytes());
                payload.extend_from_slice(&value.to_be_bytes());
            }
            ModbusRequest::WriteMultipleRegisters { start_register, values } => {
                payload.extend_from_slice(&start_register.to_be_bytes());
                payload.extend_from_slice(&(values.len() as u16).to_be_bytes());
                payload.push((values.len() * 2) as u8);
                for value in values {
                    payload.extend_from_slice(&value.to_be_bytes());
                }
            }
        }
        payload
    }

    /// Whether `frame` answers this request from `unit_id`, either normally
    /// or with an exception.
    pub fn correlates(&self, unit_id: u8, frame: &Frame) -> bool {
        frame.unit_id == unit_id
            && (frame.function_code == self.function_code()
                || frame.function_code == self.function_code() | EXCEPTION_FLAG)
    }

    /// Interpret a correlated response frame.
    pub fn parse_response(&self, frame: &Frame) -> Result<ModbusResponse, ModbusError> {
        if frame.is_exception() {
            let code = frame.payload.first().copied().ok_or_else(|| {
                ModbusError::UnexpectedResponse("exception response without code".to_string())
            })?;
            return Err(ModbusError::Exception {
                function: self.function_code(),
                code,
            });
        }

        let data = &frame.payload;
        match self {
            ModbusRequest::ReadHoldingRegisters { quantity, .. } => {
                let expected = *quantity as usize * 2;
                let byte_count = *data.first().ok_or_else(|| {
                    ModbusError::UnexpectedResponse("empty read response".to_string())
                })? as usize;

                if byte_count != expected || data.len() != expected + 1 {
                    return Err(ModbusError::UnexpectedResponse(format!(
                        "expected {} data bytes, got byte count {} with {} bytes",
                        expected,
                        byte_count,
                        data.len().saturating_sub(1)
                    )));
                }

                let registers = data[1..]
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect();
                Ok(ModbusResponse::Registers(registers))
            }
            ModbusRequest::WriteSingleRegister { register, value } => {
                let (echo_register, echo_value) = read_echo(data)?;
                if echo_register != *register || echo_value != *value {
                    return Err(ModbusError::UnexpectedResponse(format!(
                        "echo mismatch: sent register {} = 0x{:04x}, got register {} = 0x{:04x}",
                        register, value, echo_register, echo_value
                    )));
                }
                Ok(ModbusResponse::Written)
            }
            ModbusRequest::WriteMultipleRegisters { start_register, values } => {
                let (echo_start, written) = read_echo(data)?;
                if echo_start != *start_register {
                    return Err(ModbusError::UnexpectedResponse(format!(
                        "echo mismatch: sent start register {}, got {}",
                        start_register, echo_start
                    )));
                }
                let requested = values.len() as u16;
                if written != requested {
                    return Err(ModbusError::PartialWrite { requested, written });
                }
                Ok(ModbusResponse::Written)
            }
        }
    }
}

fn check_range(start: u16, quantity: u16) -> Result<(), ModbusError> {
    if start as u32 + quantity as u32 > 0x1_0000 {
        return Err(ModbusError::InvalidRequest(format!(
            "{} registers from address {} run past 65535",
            quantity, start
        )));
    }
    Ok(())
}

fn read_echo(data: &[u8]) -> Result<(u16, u16), ModbusError> {
    if data.len() != 4 {
        return Err(ModbusError::UnexpectedResponse(format!(
            "write echo carries {} bytes instead of 4",
            data.len()
        )));
    }
    Ok((
        u16::from_be_bytes([data[0], data[1]]),
        u16::from_be_bytes([data[2], data[3]]),
    ))
}

/// Split a 32-bit value into registers, high word first.
pub fn u32_to_registers(value: u32) -> [u16; 2] {
    [(value >> 16) as u16, (value & 0xFFFF) as u16]
}

pub fn registers_to_u32(high: u16, low: u16) -> u32 {
    ((high as u32) << 16) | low as u32
}
