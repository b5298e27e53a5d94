// Licensed under the Apache-2.0 license

//! Hooks into the platform code that owns hub power, reset and firmware.

use crate::error::{ImageError, PlatformError};

pub trait HubPlatform: Send + Sync {
    /// Powers the hub with its core held in reset. The boot loader
    /// publishes the boot descriptor during this step.
    fn power_on(&self) -> Result<(), PlatformError>;
    fn power_off(&self) -> Result<(), PlatformError>;
    fn assert_reset(&self) -> Result<(), PlatformError>;
    fn release_reset(&self) -> Result<(), PlatformError>;

    /// Restricts hub bus masters to `size` bytes of shared memory at
    /// `base`.
    fn configure_access_window(&self, base: usize, size: usize) -> Result<(), PlatformError>;

    /// Vendor debug registers, captured into postmortem dumps.
    fn read_debug_registers(&self) -> Vec<(String, u32)> {
        Vec::new()
    }

    /// Return addresses of the hub's stack, innermost first.
    fn read_call_stack(&self) -> Vec<u32> {
        Vec::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub addr: u32,
    pub size: u32,
    pub name: String,
}

pub trait FirmwareLoader: Send + Sync {
    /// Downloads the image in `slot` into the firmware region and checks
    /// it. The image contents are opaque here.
    fn load_and_verify_image(&self, slot: u32) -> Result<(), ImageError>;

    /// Symbol table of the loaded image, used to resolve call stacks.
    fn symbols(&self) -> Vec<Symbol> {
        Vec::new()
    }
}
