use bytes::{BufMut, BytesMut};

use super::crc::crc16_modbus;
use crate::utils::error::ModbusError;

/// Smallest valid RTU frame: address, function code and the two CRC bytes.
pub const MIN_FRAME_LEN: usize = 4;

/// Largest RTU ADU allowed on a serial line.
pub const MAX_FRAME_LEN: usize = 256;

/// A decoded RTU frame whose CRC has been verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub unit_id: u8,
    pub function_code: u8,
    pub payload: Vec<u8>,
    pub crc: u16,
}

impl Frame {
    pub fn is_exception(&self) -> bool {
        self.function_code & 0x80 != 0
    }
}

/// Build `{unit_id, function_code, payload..., crc_lo, crc_hi}`.
pub fn encode(unit_id: u8, function_code: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(payload.len() + MIN_FRAME_LEN);
    buf.put_u8(unit_id);
    buf.put_u8(function_code);
    buf.put_slice(payload);

    let crc = crc16_modbus(&buf);
    buf.put_u16_le(crc);
    buf.to_vec()
}

pub fn decode(bytes: &[u8]) -> Result<Frame, ModbusError> {
    if bytes.len() < MIN_FRAME_LEN {
        return Err(ModbusError::FrameTooShort(bytes.len()));
    }

    let data_len = bytes.len() - 2;
    let received = u16::from_le_bytes([bytes[data_len], bytes[data_len + 1]]);
    let expected = crc16_modbus(&bytes[..data_len]);

    if received != expected {
        return Err(ModbusError::CrcMismatch { expected, received });
    }

    Ok(Frame {
        unit_id: bytes[0],
        function_code: bytes[1],
        payload: bytes[2..data_len].to_vec(),
        crc: received,
    })
}
