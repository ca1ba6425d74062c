use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::{error, info};
use std::path::PathBuf;

use crate::config::Config;
use crate::modbus::{ModbusClient, ModbusClientTrait};
use crate::services::exerciser::{Exerciser, ExerciserSettings, TokioPause};

pub fn build_cli() -> Command {
    Command::new("rtu-exerciser")
        .version(crate::VERSION)
        .about("Cyclically writes holding registers on a Modbus RTU slave over RS-485")
        .arg(
            Arg::new("serial")
                .long("serial")
                .value_name("PATH")
                .help("Serial port (RS485) to use, e.g. /dev/ttyS0 (try \"dmesg | grep tty\" to find)"),
        )
        .arg(
            Arg::new("baud")
                .long("baud")
                .value_name("BAUD")
                .value_parser(value_parser!(u32))
                .help("Baud rate [default: 9600]"),
        )
        .arg(
            Arg::new("parity")
                .long("parity")
                .value_name("CODE")
                .value_parser(value_parser!(u8))
                .help("Parity: 0 = none, 1 = even, 2 = odd [default: 0]"),
        )
        .arg(
            Arg::new("stop-bits")
                .long("stop-bits")
                .alias("stopBits")
                .value_name("N")
                .value_parser(value_parser!(u8))
                .help("Stop bits, 1 or 2 [default: 1]"),
        )
        .arg(
            Arg::new("slave")
                .long("slave")
                .value_name("ID")
                .value_parser(value_parser!(u16))
                .help("Slave device (unit) id, 0-247 [default: 1]"),
        )
        .arg(
            Arg::new("start")
                .long("start")
                .value_name("ADDR")
                .value_parser(value_parser!(u16))
                .help("Start address added to every exercised register [default: 0]"),
        )
        .arg(
            Arg::new("pause")
                .long("pause")
                .value_name("MS")
                .value_parser(value_parser!(u64))
                .help("Pause between write cycles in milliseconds [default: 5000]"),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_name("MS")
                .value_parser(value_parser!(u64))
                .help("Response timeout in milliseconds [default: 300]"),
        )
        .arg(
            Arg::new("cycles")
                .long("cycles")
                .value_name("N")
                .value_parser(value_parser!(u64))
                .help("Stop after N write cycles instead of running until Ctrl+C"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("Load settings from a TOML file; flags override file values"),
        )
        .arg(
            Arg::new("save-config")
                .long("save-config")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("Write the effective settings to a TOML file and exit"),
        )
        .arg(
            Arg::new("list-ports")
                .long("list-ports")
                .action(ArgAction::SetTrue)
                .help("List available serial ports and exit"),
        )
}

/// Settings from `--config` (if any) with command line flags applied on top.
/// An unreadable file is logged and the defaults are used in its place.
pub fn load_config(matches: &ArgMatches) -> Config {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => Config::from_file(path).unwrap_or_else(|e| {
            error!("❌ {:#}; using default settings", e);
            Config::default()
        }),
        None => Config::default(),
    };
    config.apply_matches(matches);
    config
}

pub fn list_serial_ports() -> Result<()> {
    println!("📡 Available Serial Ports:");

    let ports = serialport::available_ports().context("enumerating serial ports")?;
    if ports.is_empty() {
        println!("   ⚠️  No serial ports found");
        return Ok(());
    }

    for (index, port) in ports.iter().enumerate() {
        println!("   {}. {}", index + 1, port.port_name);
        if let serialport::SerialPortType::UsbPort(usb_info) = &port.port_type {
            if let Some(manufacturer) = &usb_info.manufacturer {
                println!("      📱 Manufacturer: {}", manufacturer);
            }
            if let Some(serial_number) = &usb_info.serial_number {
                println!("      🔢 Serial Number: {}", serial_number);
            }
        }
    }

    Ok(())
}

/// Run the program for parsed arguments.
pub async fn handle_commands(mut cli: Command, matches: &ArgMatches) -> Result<()> {
    if matches.get_flag("list-ports") {
        return list_serial_ports();
    }

    let mut config = load_config(matches);

    if let Some(path) = matches.get_one::<PathBuf>("save-config") {
        config
            .save_to_file(path)
            .with_context(|| format!("saving config to {}", path.display()))?;
        println!("💾 Configuration written to {}", path.display());
        return Ok(());
    }

    if config.serial_port.is_empty() {
        cli.print_help()?;
        println!();
        return Ok(());
    }

    config.sanitize();

    let settings = ExerciserSettings::from_config(&config)?;
    let mut client = ModbusClient::new(config.client_config()?)?;
    client.set_unit_id(config.slave_id)?;

    if let Err(e) = client.open() {
        error!("❌ Failed to open {}: {} (retrying every cycle)", config.serial_port, e);
    }

    let mut exerciser = Exerciser::new(settings);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("❌ Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    info!("🛑 Press Ctrl+C to stop");
    exerciser.run(&mut client, &TokioPause, shutdown).await;

    client.close()?;
    Ok(())
}
