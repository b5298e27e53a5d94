// Licensed under the Apache-2.0 license

//! Access to the AP <-> hub mailbox block.
//!
//! Each endpoint owns the bank that interrupts it ("mine") and raises
//! interrupts through the other bank ("theirs"). Bank 1 lines live in the
//! upper half of its registers; [`Mailbox`] hides that shift so callers
//! always deal in line numbers `0..BANK_LINES`.

use hub_mailbox_regs::{offsets, BankRegs, BANK0, BANK1, BANK_LINES};
use std::sync::{Arc, Mutex};

/// Line reserved for the alive handshake. Event channels use the lines
/// below it.
pub const ALIVE_LINE: u32 = BANK_LINES - 1;

/// Lines available to carry events.
pub const EVENT_LINES: u32 = ALIVE_LINE;

const LOW_LINES: u32 = (1 << BANK_LINES) - 1;

pub type IrqHandler = Arc<dyn Fn() + Send + Sync>;

/// Register level access to the mailbox block. Every call is a single
/// synchronous register access.
pub trait MailboxBus: Send + Sync {
    fn read(&self, offset: u32) -> u32;
    fn write(&self, offset: u32, value: u32);

    /// Installs the interrupt handler run when a line of `endpoint`'s bank
    /// becomes pending and unmasked.
    fn connect_irq(&self, endpoint: Endpoint, handler: IrqHandler);
    fn disconnect_irq(&self, endpoint: Endpoint);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Ap,
    Hub,
}

impl Endpoint {
    /// Bank that interrupts this endpoint.
    pub fn own_bank(self) -> BankRegs {
        match self {
            Endpoint::Ap => BANK1,
            Endpoint::Hub => BANK0,
        }
    }

    pub fn peer_bank(self) -> BankRegs {
        self.peer().own_bank()
    }

    pub fn peer(self) -> Endpoint {
        match self {
            Endpoint::Ap => Endpoint::Hub,
            Endpoint::Hub => Endpoint::Ap,
        }
    }
}

/// Shared scratch registers (ISSR) with a fixed meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ScratchSlot {
    Alive = 0,
    BootMode = 1,
    FaultCode = 2,
    ResetReason = 3,
}

impl ScratchSlot {
    pub const ALL: [ScratchSlot; 4] = [
        ScratchSlot::Alive,
        ScratchSlot::BootMode,
        ScratchSlot::FaultCode,
        ScratchSlot::ResetReason,
    ];
}

fn line_bit(line: u32) -> u32 {
    1u32.checked_shl(line).unwrap_or(0) & LOW_LINES
}

#[derive(Clone)]
pub struct Mailbox {
    bus: Arc<dyn MailboxBus>,
    endpoint: Endpoint,
    /// Serializes read-modify-write updates of the mask register.
    mask_lock: Arc<Mutex<()>>,
}

impl Mailbox {
    pub fn new(bus: Arc<dyn MailboxBus>, endpoint: Endpoint) -> Self {
        Mailbox {
            bus,
            endpoint,
            mask_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn bus(&self) -> &Arc<dyn MailboxBus> {
        &self.bus
    }

    fn mine(&self) -> BankRegs {
        self.endpoint.own_bank()
    }

    fn theirs(&self) -> BankRegs {
        self.endpoint.peer_bank()
    }

    /// Raises `line` at the peer.
    pub fn generate(&self, line: u32) {
        let bank = self.theirs();
        self.bus.write(bank.intgr, line_bit(line) << bank.shift);
    }

    pub fn generate_all(&self) {
        let bank = self.theirs();
        self.bus.write(bank.intgr, bank.line_mask());
    }

    pub fn clear_pending(&self, line: u32) {
        self.clear_pending_mask(line_bit(line));
    }

    /// Clears every line set in `mask` (bit `n` is line `n`).
    pub fn clear_pending_mask(&self, mask: u32) {
        let bank = self.mine();
        self.bus.write(bank.intcr, (mask & LOW_LINES) << bank.shift);
    }

    pub fn clear_all_pending(&self) {
        self.clear_pending_mask(LOW_LINES);
    }

    /// Pending and unmasked lines of this endpoint's bank, bit `n` for
    /// line `n`.
    pub fn read_pending_mask(&self) -> u32 {
        let bank = self.mine();
        (self.bus.read(bank.intmsr) >> bank.shift) & LOW_LINES
    }

    /// Lines still pending at the peer, i.e. raised by us and not yet
    /// cleared by the peer's handler.
    pub fn read_peer_pending(&self) -> u32 {
        let bank = self.theirs();
        (self.bus.read(bank.intsr) >> bank.shift) & LOW_LINES
    }

    fn update_mask<F>(&self, f: F)
    where
        F: FnOnce(u32, BankRegs) -> u32,
    {
        let _guard = self.mask_lock.lock().unwrap();
        let bank = self.mine();
        let value = f(self.bus.read(bank.intmr), bank);
        self.bus.write(bank.intmr, value);
    }

    pub fn mask(&self, line: u32) {
        self.update_mask(|v, bank| v | (line_bit(line) << bank.shift));
    }

    pub fn unmask(&self, line: u32) {
        self.update_mask(|v, bank| v & !(line_bit(line) << bank.shift));
    }

    pub fn mask_all(&self) {
        self.update_mask(|v, bank| v | bank.line_mask());
    }

    pub fn unmask_all(&self) {
        self.update_mask(|v, bank| v & !bank.line_mask());
    }

    pub fn masked_lines(&self) -> u32 {
        let bank = self.mine();
        (self.bus.read(bank.intmr) >> bank.shift) & LOW_LINES
    }

    pub fn write_scratch(&self, slot: ScratchSlot, value: u32) {
        self.bus.write(offsets::issr(slot as u32), value);
    }

    pub fn read_scratch(&self, slot: ScratchSlot) -> u32 {
        self.bus.read(offsets::issr(slot as u32))
    }

    pub fn connect_irq(&self, handler: IrqHandler) {
        self.bus.connect_irq(self.endpoint, handler);
    }

    pub fn disconnect_irq(&self) {
        self.bus.disconnect_irq(self.endpoint);
    }
}
