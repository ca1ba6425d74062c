use log::{debug, info, warn};
use serialport::{ClearBuffer, SerialPort};
use std::io::{self, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use super::client::{ClientConfig, DATA_BITS};
use super::codec::MAX_FRAME_LEN;
use crate::config::settings::ParityConfig;
use crate::utils::error::ModbusError;

/// Bits per RTU character: start, 8 data, parity or second stop, stop.
const BITS_PER_CHAR: u64 = 11;

/// Fixed 3.5 character silence used above 19200 baud.
const HIGH_BAUD_FRAME_GAP: Duration = Duration::from_micros(1750);

/// Byte stream to an RTU bus. Reads must return within a short poll
/// interval (`TimedOut`/`WouldBlock` or `Ok(0)`) when the line is quiet.
pub trait SerialLink: Read + Write + Send {
    /// Drop whatever is waiting in the receive buffer.
    fn clear_input(&mut self) -> io::Result<()>;
}

/// Opens `SerialLink`s for a transport.
pub trait Connector: Send {
    fn connect(
        &self,
        config: &ClientConfig,
        poll_interval: Duration,
    ) -> Result<Box<dyn SerialLink>, ModbusError>;
}

/// Connector backed by an OS serial device.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialPortConnector;

struct SerialPortLink {
    port: Box<dyn SerialPort>,
}

impl Read for SerialPortLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialPortLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl SerialLink for SerialPortLink {
    fn clear_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

impl Connector for SerialPortConnector {
    fn connect(
        &self,
        config: &ClientConfig,
        poll_interval: Duration,
    ) -> Result<Box<dyn SerialLink>, ModbusError> {
        let parity = match config.parity {
            ParityConfig::None => serialport::Parity::None,
            ParityConfig::Even => serialport::Parity::Even,
            ParityConfig::Odd => serialport::Parity::Odd,
        };
        let stop_bits = match config.stop_bits {
            1 => serialport::StopBits::One,
            2 => serialport::StopBits::Two,
            other => {
                return Err(ModbusError::ConfigRejected(format!(
                    "unsupported stop bits: {}",
                    other
                )))
            }
        };

        let port = serialport::new(config.serial_port.as_str(), config.baud_rate)
            .timeout(poll_interval)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(stop_bits)
            .parity(parity)
            .open()?;

        Ok(Box::new(SerialPortLink { port }))
    }
}

/// Minimum inter-frame silence (3.5 character times) for a baud rate.
pub fn frame_gap(baud_rate: u32) -> Duration {
    if baud_rate > 19_200 || baud_rate == 0 {
        return HIGH_BAUD_FRAME_GAP;
    }
    let char_time_us = BITS_PER_CHAR * 1_000_000 / baud_rate as u64;
    Duration::from_micros(char_time_us * 35 / 10)
}

/// Owns the serial connection and moves raw RTU frames across it.
pub struct RtuTransport {
    config: ClientConfig,
    connector: Box<dyn Connector>,
    link: Option<Box<dyn SerialLink>>,
    frame_gap: Duration,
    last_activity: Option<Instant>,
}

impl RtuTransport {
    pub fn new(config: ClientConfig, connector: Box<dyn Connector>) -> Self {
        let frame_gap = frame_gap(config.baud_rate);
        Self {
            config,
            connector,
            link: None,
            frame_gap,
            last_activity: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    pub fn frame_gap(&self) -> Duration {
        self.frame_gap
    }

    /// Open the device. An existing link is dropped first.
    pub fn open(&mut self) -> Result<(), ModbusError> {
        self.link = None;

        info!("🔌 Connecting to Modbus RTU port: {}", self.config.serial_port);
        info!(
            "⚙️  Configuration: {} baud, {} data bits, parity {}, {} stop bit(s)",
            self.config.baud_rate, DATA_BITS, self.config.parity, self.config.stop_bits
        );

        let poll_interval = self.frame_gap.max(Duration::from_millis(1));
        let link = self.connector.connect(&self.config, poll_interval)?;

        self.link = Some(link);
        self.last_activity = None;
        info!("✅ Modbus RTU connection established");
        Ok(())
    }

    pub fn send(&mut self, bytes: &[u8]) -> Result<(), ModbusError> {
        let link = self.link.as_mut().ok_or(ModbusError::NotConnected)?;

        // Keep the bus quiet for a full frame gap since the last traffic.
        if let Some(last) = self.last_activity {
            let idle = last.elapsed();
            if idle < self.frame_gap {
                thread::sleep(self.frame_gap - idle);
            }
        }

        link.clear_input()?;
        debug!("📤 TX ({} bytes): {}", bytes.len(), hex::encode(bytes));
        link.write_all(bytes)?;
        link.flush()?;

        self.last_activity = Some(Instant::now());
        Ok(())
    }

    /// Block until a frame terminated by a 3.5 character silence has been
    /// received, or fail with `Timeout` if nothing arrives in `timeout`.
    pub fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, ModbusError> {
        let frame_gap = self.frame_gap;
        let link = self.link.as_mut().ok_or(ModbusError::NotConnected)?;

        let deadline = Instant::now() + timeout;
        let mut frame = Vec::new();
        let mut buffer = [0u8; MAX_FRAME_LEN];
        let mut last_byte_at: Option<Instant> = None;

        loop {
            match link.read(&mut buffer) {
                Ok(n) if n > 0 => {
                    frame.extend_from_slice(&buffer[..n]);
                    last_byte_at = Some(Instant::now());
                    if frame.len() >= MAX_FRAME_LEN {
                        warn!("⚠️ Frame reached {} bytes without a silence gap", frame.len());
                        frame.truncate(MAX_FRAME_LEN);
                        break;
                    }
                    continue;
                }
                Ok(_) => thread::sleep(Duration::from_millis(1)),
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(ModbusError::Io(e)),
            }

            match last_byte_at {
                Some(at) if at.elapsed() >= frame_gap => break,
                Some(_) => {}
                None if Instant::now() >= deadline => return Err(ModbusError::Timeout),
                None => {}
            }
        }

        debug!("📥 RX ({} bytes): {}", frame.len(), hex::encode(&frame));
        self.last_activity = Some(Instant::now());
        Ok(frame)
    }

    /// Release the device. Closing a closed transport does nothing.
    pub fn close(&mut self) -> Result<(), ModbusError> {
        if self.link.take().is_some() {
            info!("✅ RS485 connection closed");
        }
        self.last_activity = None;
        Ok(())
    }
}
