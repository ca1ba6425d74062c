use anyhow::{Context, Result};
use clap::ArgMatches;
use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::modbus::client::{ClientConfig, DEFAULT_BAUD_RATE, MAX_UNIT_ID};
use crate::utils::error::ModbusError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Serial line
    pub serial_port: String,
    pub baud_rate: u32,
    pub parity: ParityConfig,
    pub stop_bits: u8,
    pub timeout_ms: u64,

    // Modbus device
    pub slave_id: u16,
    pub start_address: u16,

    // Write cycle
    pub pause_ms: u64,
    pub max_cycles: Option<u64>,
    pub registers: RegisterLayout,
}

/// Register offsets relative to `start_address`, and how the written
/// values evolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterLayout {
    pub single_register: u16,
    pub first_pair: u16,
    pub second_pair: u16,
    pub cycles_per_step: u16,
    pub wrap_above: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParityConfig {
    None,
    Even,
    Odd,
}

impl ParityConfig {
    /// Numeric parity codes used on the command line: 0 none, 1 even, 2 odd.
    pub fn from_code(code: u8) -> Result<Self, ModbusError> {
        match code {
            0 => Ok(ParityConfig::None),
            1 => Ok(ParityConfig::Even),
            2 => Ok(ParityConfig::Odd),
            other => Err(ModbusError::InvalidConfig(format!(
                "parity code {} is not 0 (none), 1 (even) or 2 (odd)",
                other
            ))),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            ParityConfig::None => 0,
            ParityConfig::Even => 1,
            ParityConfig::Odd => 2,
        }
    }
}

impl fmt::Display for ParityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParityConfig::None => "none",
            ParityConfig::Even => "even",
            ParityConfig::Odd => "odd",
        };
        f.write_str(name)
    }
}

impl Default for RegisterLayout {
    fn default() -> Self {
        Self {
            single_register: 4,
            first_pair: 0,
            second_pair: 2,
            cycles_per_step: 60,
            wrap_above: 1000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial_port: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            parity: ParityConfig::None,
            stop_bits: 1,
            timeout_ms: 300,

            slave_id: 1,
            start_address: 0,

            pause_ms: 5000,
            max_cycles: None,
            registers: RegisterLayout::default(),
        }
    }
}

impl Config {
    /// Override fields with the flags given on the command line. Flags that
    /// were not passed leave the current value alone, and so does an unknown
    /// parity code.
    pub fn apply_matches(&mut self, matches: &ArgMatches) {
        if let Some(port) = matches.get_one::<String>("serial") {
            self.serial_port = port.clone();
        }
        if let Some(baud) = matches.get_one::<u32>("baud") {
            self.baud_rate = *baud;
        }
        if let Some(code) = matches.get_one::<u8>("parity") {
            match ParityConfig::from_code(*code) {
                Ok(parity) => self.parity = parity,
                Err(e) => error!("❌ {}; keeping parity {}", e, self.parity),
            }
        }
        if let Some(stop_bits) = matches.get_one::<u8>("stop-bits") {
            self.stop_bits = *stop_bits;
        }
        if let Some(timeout) = matches.get_one::<u64>("timeout") {
            self.timeout_ms = *timeout;
        }
        if let Some(slave) = matches.get_one::<u16>("slave") {
            self.slave_id = *slave;
        }
        if let Some(start) = matches.get_one::<u16>("start") {
            self.start_address = *start;
        }
        if let Some(pause) = matches.get_one::<u64>("pause") {
            self.pause_ms = *pause;
        }
        if let Some(cycles) = matches.get_one::<u64>("cycles") {
            self.max_cycles = Some(*cycles);
        }
    }

    /// Put every setting that cannot drive the bus back to its default.
    /// Each replacement is logged and returned so the run can go on.
    pub fn sanitize(&mut self) -> Vec<ModbusError> {
        let defaults = Config::default();
        let mut problems = Vec::new();

        if self.baud_rate == 0 {
            problems.push(ModbusError::InvalidConfig("baud rate must be positive".to_string()));
            self.baud_rate = defaults.baud_rate;
        }
        if !matches!(self.stop_bits, 1 | 2) {
            problems.push(ModbusError::InvalidConfig(format!(
                "stop bits must be 1 or 2, got {}",
                self.stop_bits
            )));
            self.stop_bits = defaults.stop_bits;
        }
        if self.timeout_ms == 0 {
            problems.push(ModbusError::InvalidConfig("response timeout must be positive".to_string()));
            self.timeout_ms = defaults.timeout_ms;
        }
        if self.slave_id > MAX_UNIT_ID {
            problems.push(ModbusError::InvalidUnitId(self.slave_id));
            self.slave_id = defaults.slave_id;
        }
        if let Err(e) = self.check_register_layout() {
            problems.push(e);
            self.start_address = defaults.start_address;
            self.registers = defaults.registers;
        }

        for problem in &problems {
            error!("❌ {}; using the default instead", problem);
        }
        problems
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        debug!("📄 Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        // Create directory if it doesn't exist
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.pause_ms)
    }

    /// Serial settings for the Modbus client, validated.
    pub fn client_config(&self) -> Result<ClientConfig, ModbusError> {
        let config = ClientConfig {
            serial_port: self.serial_port.clone(),
            baud_rate: self.baud_rate,
            parity: self.parity,
            stop_bits: self.stop_bits,
            response_timeout: Duration::from_millis(self.timeout_ms),
        };
        config.validate()?;
        Ok(config)
    }

    /// Fails if a register, or the second word of a pair, lies past 65535.
    pub fn check_register_layout(&self) -> Result<(), ModbusError> {
        let layout = &self.registers;
        self.register_address(layout.single_register)?;
        for offset in [layout.first_pair, layout.second_pair] {
            let pair = self.register_address(offset)?;
            if pair == u16::MAX {
                return Err(ModbusError::InvalidConfig(format!(
                    "register pair at {} runs past 65535",
                    pair
                )));
            }
        }
        Ok(())
    }

    /// Absolute address of a register offset, or an error if it runs past
    /// the end of the register space.
    pub fn register_address(&self, offset: u16) -> Result<u16, ModbusError> {
        self.start_address.checked_add(offset).ok_or_else(|| {
            ModbusError::InvalidConfig(format!(
                "start address {} + offset {} exceeds 65535",
                self.start_address, offset
            ))
        })
    }
}
