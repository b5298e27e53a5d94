// Licensed under the Apache-2.0 license

//! In-memory mailbox used by unit tests. Interrupt handlers run inline on
//! the thread that raised the line.

use crate::error::{ImageError, PlatformError};
use crate::layout::{self, attach, BootDescriptor, LayoutMap};
use crate::lifecycle::Lifecycle;
use crate::mailbox::{Endpoint, IrqHandler, MailboxBus};
use crate::platform::{FirmwareLoader, HubPlatform};
use crate::session::IpcSession;
use crate::shmem::SharedMemory;
use hub_config::HubConfig;
use hub_mailbox_regs::{BankRegs, BANK0};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct TestBus {
    regs: Mutex<HashMap<u32, u32>>,
    handlers: Mutex<HashMap<Endpoint, IrqHandler>>,
}

impl TestBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn raw(&self, offset: u32) -> u32 {
        self.regs.lock().unwrap().get(&offset).copied().unwrap_or(0)
    }

    fn set(&self, offset: u32, value: u32) {
        self.regs.lock().unwrap().insert(offset, value);
    }

    fn bank_endpoint(bank: BankRegs) -> Endpoint {
        if bank == BANK0 {
            Endpoint::Hub
        } else {
            Endpoint::Ap
        }
    }

    fn deliver(&self, bank: BankRegs) {
        if self.raw(bank.intsr) & !self.raw(bank.intmr) & bank.line_mask() == 0 {
            return;
        }
        let handler = self
            .handlers
            .lock()
            .unwrap()
            .get(&Self::bank_endpoint(bank))
            .cloned();
        if let Some(handler) = handler {
            handler();
        }
    }
}

impl MailboxBus for TestBus {
    fn read(&self, offset: u32) -> u32 {
        match BankRegs::for_offset(offset) {
            Some(bank) if offset == bank.intmsr => self.raw(bank.intsr) & !self.raw(bank.intmr),
            _ => self.raw(offset),
        }
    }

    fn write(&self, offset: u32, value: u32) {
        let Some(bank) = BankRegs::for_offset(offset) else {
            self.set(offset, value);
            return;
        };
        let value = value & bank.line_mask();
        if offset == bank.intgr {
            self.set(bank.intsr, self.raw(bank.intsr) | value);
            self.deliver(bank);
        } else if offset == bank.intcr {
            self.set(bank.intsr, self.raw(bank.intsr) & !value);
        } else if offset == bank.intmr {
            self.set(bank.intmr, value);
            self.deliver(bank);
        }
    }

    fn connect_irq(&self, endpoint: Endpoint, handler: IrqHandler) {
        self.handlers.lock().unwrap().insert(endpoint, handler);
    }

    fn disconnect_irq(&self, endpoint: Endpoint) {
        self.handlers.lock().unwrap().remove(&endpoint);
    }
}

/// Shared memory with a published boot descriptor and a negotiated map
/// area.
pub fn negotiated(config: &HubConfig) -> (SharedMemory, LayoutMap) {
    let map = &config.memory_map;
    let mem = SharedMemory::new(map.shared_mem_size as usize);
    BootDescriptor::new(map)
        .write_to(&mem, map.boot_desc_offset as usize)
        .unwrap();
    let layout = layout::negotiate(&mem, config).unwrap();
    (mem, layout)
}

/// Boot loader and hub firmware stand-in. Releasing reset attaches a
/// hub session that answers alive checks and consumes AP events.
pub struct MockHub {
    config: HubConfig,
    pub mem: SharedMemory,
    bus: Arc<TestBus>,
    hub: Mutex<Option<Arc<IpcSession>>>,
    pub fail_load: AtomicBool,
    pub mute: AtomicBool,
    pub loads: AtomicU32,
}

impl MockHub {
    pub fn new(config: &HubConfig, mem: &SharedMemory, bus: &Arc<TestBus>) -> Arc<Self> {
        Arc::new(MockHub {
            config: config.clone(),
            mem: mem.clone(),
            bus: bus.clone(),
            hub: Mutex::new(None),
            fail_load: AtomicBool::new(false),
            mute: AtomicBool::new(false),
            loads: AtomicU32::new(0),
        })
    }

    pub fn session(&self) -> Arc<IpcSession> {
        self.hub.lock().unwrap().clone().unwrap()
    }
}

impl HubPlatform for MockHub {
    fn power_on(&self) -> Result<(), PlatformError> {
        let map = &self.config.memory_map;
        BootDescriptor::new(map)
            .write_to(&self.mem, map.boot_desc_offset as usize)
            .map_err(|e| PlatformError::Power(e.to_string()))
    }

    fn power_off(&self) -> Result<(), PlatformError> {
        Ok(())
    }

    fn assert_reset(&self) -> Result<(), PlatformError> {
        self.bus.disconnect_irq(Endpoint::Hub);
        *self.hub.lock().unwrap() = None;
        Ok(())
    }

    fn release_reset(&self) -> Result<(), PlatformError> {
        let layout =
            attach(&self.mem, &self.config).map_err(|e| PlatformError::Reset(e.to_string()))?;
        let hub = Arc::new(
            IpcSession::new(Endpoint::Hub, &self.mem, layout, self.bus.clone(), &self.config)
                .map_err(|e| PlatformError::Reset(e.to_string()))?,
        );
        hub.alive().set_responding(!self.mute.load(Ordering::SeqCst));
        let handler_hub = hub.clone();
        self.bus.connect_irq(
            Endpoint::Hub,
            Arc::new(move || {
                handler_hub.handle_irq();
            }),
        );
        *self.hub.lock().unwrap() = Some(hub);
        Ok(())
    }

    fn configure_access_window(&self, _base: usize, _size: usize) -> Result<(), PlatformError> {
        Ok(())
    }
}

impl FirmwareLoader for MockHub {
    fn load_and_verify_image(&self, slot: u32) -> Result<(), ImageError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(ImageError::Verification(slot));
        }
        Ok(())
    }
}

/// Lifecycle over a [`MockHub`] with short alive timeouts and no dump
/// rate limit.
pub fn mock_lifecycle() -> (Lifecycle, Arc<MockHub>) {
    let mut config = HubConfig::default();
    config.alive.timeout_ms = 20;
    config.alive.tries = 2;
    config.reset.dump_min_interval_ms = 0;
    let mem = SharedMemory::new(config.memory_map.shared_mem_size as usize);
    let bus = TestBus::new();
    let hub = MockHub::new(&config, &mem, &bus);
    let lifecycle = Lifecycle::new(config, mem, bus, hub.clone(), hub.clone());
    (lifecycle, hub)
}
