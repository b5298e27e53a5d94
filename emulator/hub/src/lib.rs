// Licensed under the Apache-2.0 license

//! Software model of the sensor hub: mailbox block, firmware and platform
//! hooks, wired to an AP-side [`Lifecycle`].

pub mod firmware;
pub mod mailbox;
pub mod platform;

use anyhow::{Context, Result};
use hub_config::HubConfig;
use hub_ipc::{HubState, Lifecycle, SharedMemory, Transport};
use log::warn;
use poll_common::poll_until;
use std::sync::Arc;
use std::time::Duration;

pub use firmware::{FirmwareStats, HubFirmware};
pub use mailbox::EmulatedMailbox;
pub use platform::EmulatedPlatform;

const POLL_INTERVAL: Duration = Duration::from_millis(2);

pub struct HubEmulator {
    pub config: HubConfig,
    pub mem: SharedMemory,
    pub mailbox: Arc<EmulatedMailbox>,
    pub firmware: HubFirmware,
    pub platform: Arc<EmulatedPlatform>,
    pub lifecycle: Lifecycle,
}

impl HubEmulator {
    pub fn new(config: HubConfig) -> Result<Self> {
        config.validate().context("invalid hub configuration")?;
        let mem = SharedMemory::new(config.memory_map.shared_mem_size as usize);
        let mailbox = EmulatedMailbox::new();
        let firmware = HubFirmware::new(config.clone(), mem.clone(), mailbox.clone());
        let platform = Arc::new(EmulatedPlatform::new(
            config.clone(),
            mem.clone(),
            mailbox.clone(),
            firmware.clone(),
        ));
        let lifecycle = Lifecycle::new(
            config.clone(),
            mem.clone(),
            mailbox.clone(),
            platform.clone(),
            platform.clone(),
        );
        Ok(HubEmulator {
            config,
            mem,
            mailbox,
            firmware,
            platform,
            lifecycle,
        })
    }

    pub fn transport(&self) -> Transport {
        Transport::new(self.lifecycle.clone())
    }

    pub fn wait_for_state(&self, state: HubState, timeout: Duration) -> Result<()> {
        poll_until(timeout, POLL_INTERVAL, || {
            Ok(self.lifecycle.state() == state && !self.lifecycle.in_reset())
        })
        .with_context(|| {
            format!(
                "hub did not reach {state:?}, still {:?}",
                self.lifecycle.state()
            )
        })
    }

    /// Waits until `count` resets have finished, successfully or not.
    pub fn wait_for_resets(&self, count: u32, timeout: Duration) -> Result<()> {
        poll_until(timeout, POLL_INTERVAL, || {
            let stats = self.lifecycle.stats();
            Ok(stats.resets_completed + stats.resets_failed >= count)
        })
        .with_context(|| format!("{count} resets not finished: {:?}", self.lifecycle.stats()))
    }
}

impl Drop for HubEmulator {
    fn drop(&mut self) {
        if self.lifecycle.state() != HubState::NoPower {
            if let Err(err) = self.lifecycle.power_off() {
                warn!("emulated hub power off failed: {err}");
            }
        }
    }
}
