// Licensed under the Apache-2.0 license

//! Postmortem capture taken right before the hub is reset.

use crate::lifecycle::HubState;
use crate::mailbox::ScratchSlot;
use crate::platform::Symbol;
use crate::session::Snapshot;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxState {
    /// Pending and unmasked AP lines.
    pub pending: u32,
    pub masked: u32,
    /// Lines raised towards the hub and not yet taken by it.
    pub peer_pending: u32,
}

/// Everything captured for offline diagnosis. The debug-dump subsystem
/// decides how to present or store it.
#[derive(Debug, Clone)]
pub struct DumpBlob {
    pub reason: String,
    pub taken_at: SystemTime,
    pub state: HubState,
    pub registers: Vec<(String, u32)>,
    pub scratch: Vec<(ScratchSlot, u32)>,
    pub mailbox: MailboxState,
    pub debug_values: Vec<u32>,
    pub snapshot: Option<Snapshot>,
    pub call_stack: Vec<String>,
    pub shared_memory: Vec<u8>,
}

/// Maps return addresses to `symbol+offset`, or bare hex when no symbol
/// covers the address.
pub fn resolve_call_stack(addrs: &[u32], symbols: &[Symbol]) -> Vec<String> {
    addrs
        .iter()
        .map(|&addr| {
            symbols
                .iter()
                .find(|s| addr >= s.addr && addr - s.addr < s.size.max(1))
                .map(|s| format!("{}+0x{:x}", s.name, addr - s.addr))
                .unwrap_or_else(|| format!("0x{addr:08x}"))
        })
        .collect()
}

/// Refuses a new dump while the previous one is younger than the minimum
/// interval.
pub struct DumpLimiter {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl DumpLimiter {
    pub fn new(min_interval: Duration) -> Self {
        DumpLimiter {
            min_interval,
            last: Mutex::new(None),
        }
    }

    pub fn try_acquire(&self) -> bool {
        let mut last = self.last.lock().unwrap();
        match *last {
            Some(at) if at.elapsed() < self.min_interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}
