// Licensed under the Apache-2.0 license

//! Emulated power, reset and firmware loading for the hub.

use crate::firmware::HubFirmware;
use crate::mailbox::EmulatedMailbox;
use hub_config::HubConfig;
use hub_ipc::{
    BootDescriptor, FirmwareLoader, HubPlatform, ImageError, MailboxBus, PlatformError,
    SharedMemory, Symbol,
};
use hub_mailbox_regs::bits::McuCtrl;
use hub_mailbox_regs::offsets;
use log::{debug, info};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const IMAGE_MAGIC: &[u8; 8] = b"HUBFWIMG";

pub struct EmulatedPlatform {
    config: HubConfig,
    mem: SharedMemory,
    mailbox: Arc<EmulatedMailbox>,
    firmware: HubFirmware,
    powered: AtomicBool,
    fail_load: AtomicBool,
    loads: AtomicU32,
    load_delay: Mutex<Duration>,
    window: Mutex<Option<(usize, usize)>>,
}

impl EmulatedPlatform {
    pub fn new(
        config: HubConfig,
        mem: SharedMemory,
        mailbox: Arc<EmulatedMailbox>,
        firmware: HubFirmware,
    ) -> Self {
        EmulatedPlatform {
            config,
            mem,
            mailbox,
            firmware,
            powered: AtomicBool::new(false),
            fail_load: AtomicBool::new(false),
            loads: AtomicU32::new(0),
            load_delay: Mutex::new(Duration::ZERO),
            window: Mutex::new(None),
        }
    }

    /// Makes every following image load fail verification.
    pub fn set_fail_load(&self, fail: bool) {
        self.fail_load.store(fail, Ordering::SeqCst);
    }

    /// Time an image download takes.
    pub fn set_load_delay(&self, delay: Duration) {
        *self.load_delay.lock().unwrap() = delay;
    }

    pub fn loads(&self) -> u32 {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn is_powered(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }

    pub fn access_window(&self) -> Option<(usize, usize)> {
        *self.window.lock().unwrap()
    }
}

impl HubPlatform for EmulatedPlatform {
    fn power_on(&self) -> Result<(), PlatformError> {
        let map = &self.config.memory_map;
        self.mailbox
            .write(offsets::MCUCTRL, McuCtrl::SwReset::SET.value);
        BootDescriptor::new(map)
            .write_to(&self.mem, map.boot_desc_offset as usize)
            .map_err(|err| PlatformError::Power(err.to_string()))?;
        self.powered.store(true, Ordering::SeqCst);
        info!("hub powered, boot descriptor published");
        Ok(())
    }

    fn power_off(&self) -> Result<(), PlatformError> {
        self.firmware.stop();
        self.powered.store(false, Ordering::SeqCst);
        *self.window.lock().unwrap() = None;
        Ok(())
    }

    fn assert_reset(&self) -> Result<(), PlatformError> {
        self.firmware.stop();
        self.mailbox
            .write(offsets::MCUCTRL, McuCtrl::SwReset::SET.value);
        debug!("hub held in reset");
        Ok(())
    }

    fn release_reset(&self) -> Result<(), PlatformError> {
        if !self.is_powered() {
            return Err(PlatformError::Power("hub is not powered".into()));
        }
        self.mailbox
            .write(offsets::MCUCTRL, McuCtrl::SwReset::CLEAR.value);
        self.firmware
            .start()
            .map_err(|err| PlatformError::Reset(format!("{err:#}")))
    }

    fn configure_access_window(&self, base: usize, size: usize) -> Result<(), PlatformError> {
        match base.checked_add(size) {
            Some(end) if end <= self.mem.len() => {}
            _ => return Err(PlatformError::AccessWindow { base, size }),
        }
        *self.window.lock().unwrap() = Some((base, size));
        Ok(())
    }

    fn read_debug_registers(&self) -> Vec<(String, u32)> {
        vec![
            ("mcuctrl".to_string(), self.mailbox.read(offsets::MCUCTRL)),
            ("intsr0".to_string(), self.mailbox.read(offsets::INTSR0)),
            ("intsr1".to_string(), self.mailbox.read(offsets::INTSR1)),
            ("boots".to_string(), self.firmware.stats().boots),
        ]
    }

    fn read_call_stack(&self) -> Vec<u32> {
        let base = self.config.memory_map.firmware_offset;
        vec![base + 0x1024, base + 0x2210, 0xffff_0000]
    }
}

impl FirmwareLoader for EmulatedPlatform {
    fn load_and_verify_image(&self, slot: u32) -> Result<(), ImageError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let delay = *self.load_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(ImageError::Verification(slot));
        }
        let map = &self.config.memory_map;
        let region = self
            .mem
            .region(map.firmware_offset as usize, map.firmware_size as usize)
            .map_err(|err| ImageError::Download(err.to_string()))?;
        region
            .write_bytes(0, IMAGE_MAGIC)
            .and_then(|()| region.write_u32(IMAGE_MAGIC.len(), slot))
            .map_err(|err| ImageError::Download(err.to_string()))?;
        debug!("hub image from slot {slot} loaded");
        Ok(())
    }

    fn symbols(&self) -> Vec<Symbol> {
        let base = self.config.memory_map.firmware_offset;
        vec![
            Symbol {
                addr: base + 0x1000,
                size: 0x100,
                name: "hub_main".into(),
            },
            Symbol {
                addr: base + 0x2200,
                size: 0x80,
                name: "ipc_dispatch".into(),
            },
        ]
    }
}
