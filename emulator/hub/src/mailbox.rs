// Licensed under the Apache-2.0 license

//! Emulated mailbox block.
//!
//! Both interrupt banks live in one status and one mask register, bank 0
//! in the `Hub` field and bank 1 in the `Ap` field. Each endpoint has a
//! delivery thread that runs the connected handler whenever a write may
//! have left an unmasked line pending, the way a level interrupt would be
//! taken again after the handler returns.

use hub_ipc::{Endpoint, IrqHandler, MailboxBus};
use hub_mailbox_regs::bits::{Intr, McuCtrl};
use hub_mailbox_regs::{offsets, BankRegs, BANK0, BANK1};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use tock_registers::fields::Field;
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use tock_registers::registers::InMemoryRegister;

fn bank_of(endpoint: Endpoint) -> BankRegs {
    match endpoint {
        Endpoint::Hub => BANK0,
        Endpoint::Ap => BANK1,
    }
}

fn field_of(bank: BankRegs) -> Field<u32, Intr::Register> {
    if bank == BANK0 {
        Intr::Hub
    } else {
        Intr::Ap
    }
}

struct Regs {
    mcuctrl: InMemoryRegister<u32, McuCtrl::Register>,
    status: InMemoryRegister<u32, Intr::Register>,
    mask: InMemoryRegister<u32, Intr::Register>,
    issr: Vec<u32>,
    /// Bumped on every write that can make a line deliverable.
    generation: u64,
    stopped: bool,
}

impl Regs {
    fn pending(&self, bank: BankRegs) -> u32 {
        let field = field_of(bank);
        self.status.read(field) & !self.mask.read(field)
    }
}

struct Shared {
    regs: Mutex<Regs>,
    changed: Condvar,
    handlers: Mutex<HashMap<Endpoint, IrqHandler>>,
}

impl Shared {
    fn kick(&self, regs: &mut Regs) {
        regs.generation += 1;
        self.changed.notify_all();
    }

    fn deliver(&self, endpoint: Endpoint) {
        let bank = bank_of(endpoint);
        let mut seen = 0;
        loop {
            {
                let mut regs = self.regs.lock().unwrap();
                while !regs.stopped && (regs.generation == seen || regs.pending(bank) == 0) {
                    seen = regs.generation;
                    regs = self.changed.wait(regs).unwrap();
                }
                if regs.stopped {
                    break;
                }
                seen = regs.generation;
            }
            let handler = self.handlers.lock().unwrap().get(&endpoint).cloned();
            match handler {
                Some(handler) => handler(),
                None => debug!("{endpoint:?} interrupt with no handler connected"),
            }
        }
    }
}

/// Mailbox register block shared by the AP runtime and the emulated hub.
pub struct EmulatedMailbox {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl EmulatedMailbox {
    pub fn new() -> Arc<Self> {
        let shared = Arc::new(Shared {
            regs: Mutex::new(Regs {
                mcuctrl: InMemoryRegister::new(0),
                status: InMemoryRegister::new(0),
                mask: InMemoryRegister::new(0),
                issr: vec![0; offsets::ISSR_COUNT as usize],
                generation: 0,
                stopped: false,
            }),
            changed: Condvar::new(),
            handlers: Mutex::new(HashMap::new()),
        });
        let threads = [Endpoint::Ap, Endpoint::Hub]
            .into_iter()
            .map(|endpoint| {
                let shared = shared.clone();
                std::thread::spawn(move || shared.deliver(endpoint))
            })
            .collect();
        Arc::new(EmulatedMailbox {
            shared,
            threads: Mutex::new(threads),
        })
    }

    /// Whether the hub core is held in software reset.
    pub fn hub_in_reset(&self) -> bool {
        self.shared
            .regs
            .lock()
            .unwrap()
            .mcuctrl
            .is_set(McuCtrl::SwReset)
    }
}

impl MailboxBus for EmulatedMailbox {
    fn read(&self, offset: u32) -> u32 {
        let regs = self.shared.regs.lock().unwrap();
        if offset == offsets::MCUCTRL {
            return regs.mcuctrl.get();
        }
        if let Some(bank) = BankRegs::for_offset(offset) {
            let field = field_of(bank);
            let value = if offset == bank.intsr {
                regs.status.read(field)
            } else if offset == bank.intmr {
                regs.mask.read(field)
            } else if offset == bank.intmsr {
                regs.pending(bank)
            } else {
                // Generate and clear are write-only.
                0
            };
            return value << bank.shift;
        }
        match offset.checked_sub(offsets::ISSR_BASE) {
            Some(rel) if rel % 4 == 0 && ((rel / 4) as usize) < regs.issr.len() => {
                regs.issr[(rel / 4) as usize]
            }
            _ => {
                warn!("read of unmapped mailbox offset 0x{offset:x}");
                0
            }
        }
    }

    fn write(&self, offset: u32, value: u32) {
        let mut regs = self.shared.regs.lock().unwrap();
        if offset == offsets::MCUCTRL {
            regs.mcuctrl.set(value);
            return;
        }
        if let Some(bank) = BankRegs::for_offset(offset) {
            let field = field_of(bank);
            let lines = (value & bank.line_mask()) >> bank.shift;
            if offset == bank.intgr {
                let raised = regs.status.read(field) | lines;
                regs.status.modify(field.val(raised));
                self.shared.kick(&mut regs);
            } else if offset == bank.intcr {
                let left = regs.status.read(field) & !lines;
                regs.status.modify(field.val(left));
            } else if offset == bank.intmr {
                regs.mask.modify(field.val(lines));
                self.shared.kick(&mut regs);
            }
            return;
        }
        match offset.checked_sub(offsets::ISSR_BASE) {
            Some(rel) if rel % 4 == 0 && ((rel / 4) as usize) < regs.issr.len() => {
                regs.issr[(rel / 4) as usize] = value;
            }
            _ => warn!("write of unmapped mailbox offset 0x{offset:x}"),
        }
    }

    fn connect_irq(&self, endpoint: Endpoint, handler: IrqHandler) {
        self.shared
            .handlers
            .lock()
            .unwrap()
            .insert(endpoint, handler);
        let mut regs = self.shared.regs.lock().unwrap();
        self.shared.kick(&mut regs);
    }

    fn disconnect_irq(&self, endpoint: Endpoint) {
        self.shared.handlers.lock().unwrap().remove(&endpoint);
    }
}

impl Drop for EmulatedMailbox {
    fn drop(&mut self) {
        {
            let mut regs = self.shared.regs.lock().unwrap();
            regs.stopped = true;
            self.shared.changed.notify_all();
        }
        self.shared.handlers.lock().unwrap().clear();
        let current = std::thread::current().id();
        for handle in self.threads.lock().unwrap().drain(..) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}
