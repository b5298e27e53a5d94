// Licensed under the Apache-2.0 license

//! Boots the emulated hub, exchanges echo traffic with it and optionally
//! drives it through a silent recovery.

use anyhow::{bail, Context, Result};
use clap::Parser;
use hub_config::HubConfig;
use hub_emulator::HubEmulator;
use hub_ipc::{Direction, HubState};
use log::{info, LevelFilter};
use simple_logger::SimpleLogger;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None, name = "Sensor Hub Emulator")]
struct HubEmulatorArgs {
    /// TOML file overriding the default hub configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of echo messages to exchange
    #[arg(short, long, default_value_t = 16)]
    messages: u32,

    /// Payload size of each echo message, in bytes
    #[arg(short, long, default_value_t = 64)]
    payload_size: usize,

    /// Make the hub report a firmware fault and wait for recovery
    #[arg(long, default_value_t = false)]
    inject_fault: bool,

    #[arg(long, default_value_t = LevelFilter::Info)]
    log_level: LevelFilter,
}

const RECV_TIMEOUT: Duration = Duration::from_secs(1);
const RECOVERY_TIMEOUT: Duration = Duration::from_secs(5);

fn run(args: HubEmulatorArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => HubConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => HubConfig::default(),
    };
    let emulator = HubEmulator::new(config)?;
    let lifecycle = &emulator.lifecycle;
    lifecycle.power_on().context("hub power on")?;
    lifecycle.check_alive().context("alive check")?;
    info!(
        "sensor table: {} bytes",
        lifecycle.get_token()?.sensor_table().len()
    );

    let transport = emulator.transport();
    let tx = transport.open_channel(Direction::ApToHub);
    let rx = transport.open_channel(Direction::HubToAp);
    for i in 0..args.messages {
        let payload: Vec<u8> = (0..args.payload_size)
            .map(|b| (b as u32 + i) as u8)
            .collect();
        transport.send(&tx, &payload)?;
        let echoed = transport.recv(&rx, RECV_TIMEOUT)?;
        if echoed != payload {
            bail!("message {i} came back corrupted");
        }
    }
    info!("{} messages echoed", args.messages);

    if args.inject_fault {
        emulator.firmware.raise_fault(0xbad0_0001)?;
        emulator.wait_for_resets(1, RECOVERY_TIMEOUT)?;
        emulator.wait_for_state(HubState::Running, RECOVERY_TIMEOUT)?;
        if let Some(dump) = lifecycle.last_dump() {
            info!(
                "postmortem: reason {}, call stack {:?}",
                dump.reason, dump.call_stack
            );
        }
        transport.send(&tx, b"after recovery")?;
        transport.recv(&rx, RECV_TIMEOUT)?;
    }

    let drained = lifecycle.drain_log();
    let stats = lifecycle.stats();
    let fw = emulator.firmware.stats();
    println!("state:            {:?}", stats.state);
    println!("hub boots:        {}", fw.boots);
    println!("messages echoed:  {}", fw.echoed);
    println!("resets completed: {}", stats.resets_completed);
    println!("resets failed:    {}", stats.resets_failed);
    println!("log records:      {drained}");

    lifecycle.power_off()?;
    Ok(())
}

fn main() -> Result<()> {
    let args = HubEmulatorArgs::parse();
    SimpleLogger::new().with_level(args.log_level).init()?;
    run(args)
}
