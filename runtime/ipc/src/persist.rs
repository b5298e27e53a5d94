// Licensed under the Apache-2.0 license

//! Values kept across soft resets of the hub. The block is only cleared on
//! full power-off.

use crate::error::MemError;
use crate::shmem::MemRegion;
use log::warn;
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const PERSIST_SIZE: usize = 64;
pub const GOVERNOR_SLOTS: usize = 8;

const BOOT_MODE: usize = 0;
const LOG_LEVEL: usize = 4;
const GOVERNOR: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum BootMode {
    Cold = 0,
    Warm = 1,
}

#[derive(Clone, Debug)]
pub struct PersistedBlock {
    region: MemRegion,
}

impl PersistedBlock {
    pub fn new(region: MemRegion) -> Self {
        PersistedBlock { region }
    }

    pub fn boot_mode(&self) -> Result<BootMode, MemError> {
        let raw = self.region.read_u32(BOOT_MODE)?;
        Ok(BootMode::try_from(raw).unwrap_or_else(|_| {
            warn!("unknown boot mode {raw}, assuming cold boot");
            BootMode::Cold
        }))
    }

    pub fn set_boot_mode(&self, mode: BootMode) -> Result<(), MemError> {
        self.region.write_u32(BOOT_MODE, mode.into())
    }

    pub fn log_level(&self) -> Result<u32, MemError> {
        self.region.read_u32(LOG_LEVEL)
    }

    pub fn set_log_level(&self, level: u32) -> Result<(), MemError> {
        self.region.write_u32(LOG_LEVEL, level)
    }

    fn governor_offset(index: usize) -> Result<usize, MemError> {
        if index >= GOVERNOR_SLOTS {
            return Err(MemError::OutOfBounds {
                offset: GOVERNOR + index * 4,
                len: 4,
                size: GOVERNOR + GOVERNOR_SLOTS * 4,
            });
        }
        Ok(GOVERNOR + index * 4)
    }

    pub fn governor(&self, index: usize) -> Result<u32, MemError> {
        self.region.read_u32(Self::governor_offset(index)?)
    }

    pub fn set_governor(&self, index: usize, value: u32) -> Result<(), MemError> {
        self.region.write_u32(Self::governor_offset(index)?, value)
    }

    pub fn clear(&self) -> Result<(), MemError> {
        self.region.fill(0, self.region.size(), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shmem::SharedMemory;

    #[test]
    fn test_persisted_values() {
        let mem = SharedMemory::new(256);
        let block = PersistedBlock::new(mem.region(64, PERSIST_SIZE).unwrap());
        assert_eq!(block.boot_mode().unwrap(), BootMode::Cold);

        block.set_boot_mode(BootMode::Warm).unwrap();
        block.set_log_level(4).unwrap();
        block.set_governor(7, 800_000).unwrap();
        assert_eq!(block.boot_mode().unwrap(), BootMode::Warm);
        assert_eq!(block.log_level().unwrap(), 4);
        assert_eq!(block.governor(7).unwrap(), 800_000);
        assert!(block.set_governor(GOVERNOR_SLOTS, 1).is_err());

        block.clear().unwrap();
        assert_eq!(block.log_level().unwrap(), 0);
        assert_eq!(block.governor(7).unwrap(), 0);
    }
}
