// Licensed under the Apache-2.0 license

//! Event channel: a ring of small event descriptors, each signalled on a
//! physical mailbox line.
//!
//! Layout (little endian words):
//!
//! | offset | field                          |
//! |--------|--------------------------------|
//! | 0x00   | enqueue index (producer)       |
//! | 0x04   | dequeue index (consumer)       |
//! | 0x08   | pending flag per mailbox line  |
//! | 0x48   | slots: code, line, status      |

use crate::error::{EvtError, MemError};
use crate::mailbox::{Mailbox, EVENT_LINES};
use crate::shmem::MemRegion;
use crate::wait::Notifier;
use hub_config::RetryConfig;
use hub_mailbox_regs::BANK_LINES;
use log::{debug, error, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

const EQ: usize = 0;
const DQ: usize = 4;
const PENDING: usize = 8;
const HEADER_SIZE: usize = PENDING + BANK_LINES as usize * 4;

const SLOT_SIZE: usize = 12;
const SLOT_CODE: usize = 0;
const SLOT_LINE: usize = 4;
const SLOT_STATUS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum EventCode {
    /// A data slot was published on the matching data channel.
    DataReady = 1,
    /// Hub asks the AP to drain the log channel.
    LogFlush = 2,
    /// Runtime log level changed in the persisted block.
    LogLevel = 3,
    ApSleep = 4,
    ApWake = 5,
    /// AP is about to reset the hub.
    Shutdown = 6,
    /// Hub firmware detected an internal fault. The fault code is in the
    /// `FaultCode` scratch register.
    FwFault = 0x10,
    RebootRequest = 0x11,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
enum SlotStatus {
    Enqueued = 1,
    Dequeued = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventDescriptor {
    pub code: u32,
    pub line: u32,
}

impl EventDescriptor {
    /// Decoded event code, or the raw value if it is not a known event.
    pub fn event(&self) -> Result<EventCode, u32> {
        EventCode::try_from(self.code).map_err(|e| e.number)
    }
}

pub struct EventChannel {
    region: MemRegion,
    capacity: u32,
    mailbox: Mailbox,
    notifier: Arc<Notifier>,
    retry: RetryConfig,
    lock: Mutex<()>,
    next_line: AtomicU32,
    integrity_errors: AtomicU32,
}

impl EventChannel {
    pub fn footprint(slots: u32) -> usize {
        HEADER_SIZE + slots as usize * SLOT_SIZE
    }

    pub fn new(
        region: MemRegion,
        capacity: u32,
        mailbox: Mailbox,
        notifier: Arc<Notifier>,
        retry: RetryConfig,
    ) -> Result<Self, MemError> {
        let required = Self::footprint(capacity);
        if capacity < 2 || region.size() < required {
            return Err(MemError::OutOfBounds {
                offset: region.base(),
                len: required,
                size: region.size(),
            });
        }
        Ok(EventChannel {
            region,
            capacity,
            mailbox,
            notifier,
            retry,
            lock: Mutex::new(()),
            next_line: AtomicU32::new(0),
            integrity_errors: AtomicU32::new(0),
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn index(&self, offset: usize) -> Result<u32, EvtError> {
        let index = self.region.read_u32(offset)?;
        if index >= self.capacity {
            error!("event ring index {index} out of range");
            return Err(EvtError::IndexCorrupt {
                index,
                capacity: self.capacity,
            });
        }
        Ok(index)
    }

    fn slot(index: u32) -> usize {
        HEADER_SIZE + index as usize * SLOT_SIZE
    }

    fn pending(line: u32) -> usize {
        PENDING + line as usize * 4
    }

    pub fn len(&self) -> Result<u32, EvtError> {
        let eq = self.index(EQ)?;
        let dq = self.index(DQ)?;
        Ok((eq + self.capacity - dq) % self.capacity)
    }

    pub fn is_empty(&self) -> Result<bool, EvtError> {
        Ok(self.len()? == 0)
    }

    pub fn is_full(&self) -> Result<bool, EvtError> {
        Ok(self.len()? == self.capacity - 1)
    }

    /// Raw enqueue/dequeue index words, unvalidated.
    pub fn indices(&self) -> (u32, u32) {
        (
            self.region.read_u32(EQ).unwrap_or(u32::MAX),
            self.region.read_u32(DQ).unwrap_or(u32::MAX),
        )
    }

    fn find_free_line(&self) -> Result<Option<u32>, EvtError> {
        let start = self.next_line.load(Ordering::Relaxed) % EVENT_LINES;
        for i in 0..EVENT_LINES {
            let line = (start + i) % EVENT_LINES;
            if self.region.read_u32(Self::pending(line))? == 0 {
                return Ok(Some(line));
            }
        }
        Ok(None)
    }

    fn wait_for<F>(&self, ready: F) -> bool
    where
        F: FnMut() -> bool,
    {
        self.notifier
            .wait_until(self.retry.ceiling, self.retry.interval(), ready)
    }

    /// Posts an event, waiting a bounded time for ring space and a free
    /// line. Must not be called from interrupt context.
    pub fn enqueue<C: Into<u32>>(&self, code: C) -> Result<(), EvtError> {
        self.post(code.into(), true)
    }

    /// Posts an event without waiting.
    pub fn try_enqueue<C: Into<u32>>(&self, code: C) -> Result<(), EvtError> {
        self.post(code.into(), false)
    }

    fn post(&self, code: u32, wait: bool) -> Result<(), EvtError> {
        let _guard = self.lock.lock().unwrap();

        if self.is_full()? {
            warn!("event ring full, waiting for the peer");
            if wait {
                self.wait_for(|| !matches!(self.is_full(), Ok(true)));
            }
            if self.is_full()? {
                return Err(EvtError::ChannelFull);
            }
        }

        let line = match self.find_free_line()? {
            Some(line) => line,
            None => {
                warn!("no free event line, waiting for the peer");
                if wait {
                    self.wait_for(|| !matches!(self.find_free_line(), Ok(None)));
                }
                self.find_free_line()?.ok_or(EvtError::NoFreeLine)?
            }
        };
        self.next_line.store(line + 1, Ordering::Relaxed);

        let eq = self.index(EQ)?;
        let slot = Self::slot(eq);
        self.region.write_u32(slot + SLOT_CODE, code)?;
        self.region.write_u32(slot + SLOT_LINE, line)?;
        self.region
            .write_u32(slot + SLOT_STATUS, SlotStatus::Enqueued.into())?;
        self.region.write_u32(Self::pending(line), 1)?;
        self.region.write_u32(EQ, (eq + 1) % self.capacity)?;
        self.mailbox.generate(line);
        debug!("event 0x{code:x} posted in slot {eq} on line {line}");
        Ok(())
    }

    /// Whether an enqueued slot in `from..to` still rides on `line`.
    fn line_outstanding(&self, line: u32, from: u32, to: u32) -> Result<bool, EvtError> {
        let mut index = from;
        while index != to {
            let slot = Self::slot(index);
            if self.region.read_u32(slot + SLOT_LINE)? == line
                && self.region.read_u32(slot + SLOT_STATUS)? == u32::from(SlotStatus::Enqueued)
            {
                return Ok(true);
            }
            index = (index + 1) % self.capacity;
        }
        Ok(false)
    }

    /// Takes the oldest event. Slots not in the enqueued state are logged,
    /// counted and skipped.
    pub fn dequeue(&self) -> Result<Option<EventDescriptor>, EvtError> {
        let _guard = self.lock.lock().unwrap();
        loop {
            let dq = self.index(DQ)?;
            let eq = self.index(EQ)?;
            if dq == eq {
                return Ok(None);
            }
            let slot = Self::slot(dq);
            let code = self.region.read_u32(slot + SLOT_CODE)?;
            let line = self.region.read_u32(slot + SLOT_LINE)?;
            let status = self.region.read_u32(slot + SLOT_STATUS)?;
            let next = (dq + 1) % self.capacity;

            if status == u32::from(SlotStatus::Enqueued) && line < EVENT_LINES {
                self.region.write_u32(Self::pending(line), 0)?;
                self.region
                    .write_u32(slot + SLOT_STATUS, SlotStatus::Dequeued.into())?;
                self.region.write_u32(DQ, next)?;
                return Ok(Some(EventDescriptor { code, line }));
            }

            error!("event slot {dq} not enqueued (status {status}, line {line}), skipping");
            self.integrity_errors.fetch_add(1, Ordering::Relaxed);
            if line < EVENT_LINES && !self.line_outstanding(line, next, eq)? {
                self.region.write_u32(Self::pending(line), 0)?;
            }
            self.region.write_u32(DQ, next)?;
        }
    }

    /// Returns and resets the number of corrupt slots skipped by
    /// [`EventChannel::dequeue`].
    pub fn take_integrity_errors(&self) -> u32 {
        self.integrity_errors.swap(0, Ordering::Relaxed)
    }
}
