// Licensed under the Apache-2.0 license

//! Register map of the AP <-> hub mailbox block.
//!
//! The block has two interrupt banks. Bank 0 interrupts the hub, bank 1
//! interrupts the AP. Each bank has a generate (INTGR), clear (INTCR),
//! mask (INTMR), raw status (INTSR) and masked status (INTMSR) register.
//! Bank 1 lines sit in the upper half of the word, so line `n` of bank 1 is
//! bit `n + 16` in every bank 1 register.
//!
//! The ISSR scratch registers are plain read/write words visible to both
//! sides.

#![cfg_attr(target_arch = "riscv32", no_std)]

pub mod bits {
    use tock_registers::register_bitfields;

    register_bitfields![u32,
        pub Intr [
            Hub OFFSET(0) NUMBITS(16) [],
            Ap OFFSET(16) NUMBITS(16) [],
        ],
        pub McuCtrl [
            SwReset OFFSET(0) NUMBITS(1) [],
        ],
    ];
}

pub mod offsets {
    pub const MCUCTRL: u32 = 0x000;

    pub const INTGR0: u32 = 0x008;
    pub const INTCR0: u32 = 0x00c;
    pub const INTMR0: u32 = 0x010;
    pub const INTSR0: u32 = 0x014;
    pub const INTMSR0: u32 = 0x018;

    pub const INTGR1: u32 = 0x01c;
    pub const INTCR1: u32 = 0x020;
    pub const INTMR1: u32 = 0x024;
    pub const INTSR1: u32 = 0x028;
    pub const INTMSR1: u32 = 0x02c;

    pub const ISSR_BASE: u32 = 0x080;
    pub const ISSR_COUNT: u32 = 64;

    pub const fn issr(slot: u32) -> u32 {
        ISSR_BASE + slot * 4
    }

    pub const BLOCK_SIZE: u32 = ISSR_BASE + ISSR_COUNT * 4;
}

/// Interrupt lines per bank.
pub const BANK_LINES: u32 = 16;

/// Bit offset of bank 1 lines inside its registers.
pub const BANK1_SHIFT: u32 = 16;

/// Register offsets of one interrupt bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BankRegs {
    pub intgr: u32,
    pub intcr: u32,
    pub intmr: u32,
    pub intsr: u32,
    pub intmsr: u32,
    pub shift: u32,
}

pub const BANK0: BankRegs = BankRegs {
    intgr: offsets::INTGR0,
    intcr: offsets::INTCR0,
    intmr: offsets::INTMR0,
    intsr: offsets::INTSR0,
    intmsr: offsets::INTMSR0,
    shift: 0,
};

pub const BANK1: BankRegs = BankRegs {
    intgr: offsets::INTGR1,
    intcr: offsets::INTCR1,
    intmr: offsets::INTMR1,
    intsr: offsets::INTSR1,
    intmsr: offsets::INTMSR1,
    shift: BANK1_SHIFT,
};

impl BankRegs {
    /// Bank owning the register at `offset`, if any.
    pub fn for_offset(offset: u32) -> Option<BankRegs> {
        [BANK0, BANK1].into_iter().find(|bank| {
            [bank.intgr, bank.intcr, bank.intmr, bank.intsr, bank.intmsr].contains(&offset)
        })
    }

    pub const fn line_mask(&self) -> u32 {
        ((1 << BANK_LINES) - 1) << self.shift
    }
}
