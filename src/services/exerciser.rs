use async_trait::async_trait;
use chrono::Utc;
use log::{error, info, warn};
use std::future::Future;
use std::time::Duration;

use crate::config::Config;
use crate::modbus::ModbusClientTrait;
use crate::utils::error::ModbusError;

/// Waits between write cycles. Tests swap in a fake that returns at once.
#[async_trait]
pub trait Pause: Send + Sync {
    async fn pause(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioPause;

#[async_trait]
impl Pause for TokioPause {
    async fn pause(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExerciserSettings {
    pub single_register: u16,
    pub first_pair: u16,
    pub second_pair: u16,
    pub pause: Duration,
    pub cycles_per_step: u16,
    pub wrap_above: u32,
    pub max_cycles: Option<u64>,
}

impl ExerciserSettings {
    /// Resolve absolute register addresses from `config`.
    pub fn from_config(config: &Config) -> Result<Self, ModbusError> {
        config.check_register_layout()?;
        let layout = &config.registers;

        Ok(Self {
            single_register: config.register_address(layout.single_register)?,
            first_pair: config.register_address(layout.first_pair)?,
            second_pair: config.register_address(layout.second_pair)?,
            pause: config.pause(),
            cycles_per_step: layout.cycles_per_step,
            wrap_above: layout.wrap_above,
            max_cycles: config.max_cycles,
        })
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub writes_ok: u32,
    pub writes_failed: u32,
    pub open_failed: bool,
    /// First register of every write that did not go through.
    pub failed_registers: Vec<u16>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    pub writes_ok: u64,
    pub writes_failed: u64,
}

/// Cyclic write pattern: one 16-bit register and the same 32-bit value in
/// two register pairs. Values step up by one every `cycles_per_step + 1`
/// cycles and drop back to zero once they pass `wrap_above`.
pub struct Exerciser {
    settings: ExerciserSettings,
    cycle: u32,
    single_value: u16,
    pair_value: u32,
    completed: u64,
}

impl Exerciser {
    pub fn new(settings: ExerciserSettings) -> Self {
        Self {
            settings,
            cycle: 0,
            single_value: 0,
            pair_value: 0,
            completed: 0,
        }
    }

    pub fn single_value(&self) -> u16 {
        self.single_value
    }

    pub fn pair_value(&self) -> u32 {
        self.pair_value
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Issue the three writes of one cycle. Failures are logged and counted,
    /// never returned: the next cycle simply tries again.
    pub fn run_cycle<C>(&mut self, client: &mut C) -> CycleReport
    where
        C: ModbusClientTrait + ?Sized,
    {
        let mut report = CycleReport::default();

        if !client.is_open() {
            match client.open() {
                Ok(()) => info!("🔌 Serial port reopened"),
                Err(e) => {
                    error!("❌ Failed to open serial port: {}", e);
                    report.open_failed = true;
                    self.skip_writes(&mut report);
                    return report;
                }
            }
        }

        let single = self.settings.single_register;
        let result = client.write_register(single, self.single_value);
        match &result {
            Ok(()) => info!("✅ register {}: 0x{:04x}", single, self.single_value),
            Err(e) => error!(
                "❌ failed to write register {} = 0x{:04x}: {}",
                single, self.single_value, e
            ),
        }
        self.record(client, single, result, &mut report);

        for pair in [self.settings.first_pair, self.settings.second_pair] {
            let result = client.write_uint32(pair, self.pair_value);
            match &result {
                Ok(()) => info!(
                    "✅ registers {} and {}: 0x{:08x}",
                    pair,
                    pair.wrapping_add(1),
                    self.pair_value
                ),
                Err(e) => error!(
                    "❌ failed to write registers {} and {} = 0x{:08x}: {}",
                    pair,
                    pair.wrapping_add(1),
                    self.pair_value,
                    e
                ),
            }
            self.record(client, pair, result, &mut report);
        }

        report
    }

    /// Log and count the writes of a cycle that never reached the bus.
    fn skip_writes(&self, report: &mut CycleReport) {
        let single = self.settings.single_register;
        error!(
            "❌ skipped register {} = 0x{:04x}: port not open",
            single, self.single_value
        );
        report.writes_failed += 1;
        report.failed_registers.push(single);

        for pair in [self.settings.first_pair, self.settings.second_pair] {
            error!(
                "❌ skipped registers {} and {} = 0x{:08x}: port not open",
                pair,
                pair.wrapping_add(1),
                self.pair_value
            );
            report.writes_failed += 1;
            report.failed_registers.push(pair);
        }
    }

    fn record<C>(
        &self,
        client: &mut C,
        register: u16,
        result: Result<(), ModbusError>,
        report: &mut CycleReport,
    ) where
        C: ModbusClientTrait + ?Sized,
    {
        if result.is_err() {
            report.failed_registers.push(register);
        }
        match result {
            Ok(()) => report.writes_ok += 1,
            Err(ModbusError::Io(e)) => {
                report.writes_failed += 1;
                // The port is likely gone; reopen on the next cycle.
                warn!("⚠️ Closing serial port after I/O error: {}", e);
                if let Err(close_err) = client.close() {
                    error!("❌ Failed to close serial port: {}", close_err);
                }
            }
            Err(_) => report.writes_failed += 1,
        }
    }

    /// Count a finished cycle and step the written values when due.
    pub fn advance(&mut self) {
        self.completed += 1;
        self.cycle += 1;

        if self.cycle > u32::from(self.settings.cycles_per_step) {
            self.cycle = 0;
            self.single_value = self.single_value.wrapping_add(1);
            self.pair_value = self.pair_value.wrapping_add(1);

            if u32::from(self.single_value) > self.settings.wrap_above
                || self.pair_value > self.settings.wrap_above
            {
                self.single_value = 0;
                self.pair_value = 0;
            }
        }
    }

    /// Run write cycles until `shutdown` resolves or `max_cycles` is reached.
    pub async fn run<C, P, S>(&mut self, client: &mut C, pause: &P, shutdown: S) -> RunSummary
    where
        C: ModbusClientTrait + ?Sized,
        P: Pause + ?Sized,
        S: Future<Output = ()>,
    {
        info!("🔄 Starting register write cycles");
        info!(
            "   📝 Register {}, pairs {}/{} and {}/{}",
            self.settings.single_register,
            self.settings.first_pair,
            self.settings.first_pair.wrapping_add(1),
            self.settings.second_pair,
            self.settings.second_pair.wrapping_add(1)
        );
        info!("   ⏱️  Pause between cycles: {:?}", self.settings.pause);

        tokio::pin!(shutdown);
        let mut summary = RunSummary::default();

        loop {
            // Polling here also arms the listener before the first cycle.
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("🛑 Stopping register write cycles...");
                    break;
                }
                _ = std::future::ready(()) => {}
            }

            info!(
                "⏰ {} - cycle {}",
                Utc::now().format("%Y-%m-%d %H:%M:%S"),
                self.completed + 1
            );
            let report = self.run_cycle(client);
            summary.cycles += 1;
            summary.writes_ok += u64::from(report.writes_ok);
            summary.writes_failed += u64::from(report.writes_failed);
            self.advance();

            if let Some(max) = self.settings.max_cycles {
                if self.completed >= max {
                    info!("🏁 Completed {} cycles", max);
                    break;
                }
            }

            tokio::select! {
                _ = &mut shutdown => {
                    info!("🛑 Stopping register write cycles...");
                    break;
                }
                _ = pause.pause(self.settings.pause) => {}
            }
        }

        info!("📊 Final Statistics:");
        info!("   🔁 Cycles: {}", summary.cycles);
        info!("   ✅ Successful writes: {}", summary.writes_ok);
        info!("   ❌ Failed writes: {}", summary.writes_failed);
        summary
    }
}
