// Licensed under the Apache-2.0 license

//! Data channel: a ring of fixed-size packet slots. Every published slot is
//! announced with a `DataReady` event on the event channel of the same
//! direction.
//!
//! Each slot starts with a length word. Two length values are reserved:
//! [`TOMBSTONE`] marks a slot whose event could not be posted, and
//! `RESERVED` marks a slot still being filled.

use crate::error::{DataError, MemError};
use crate::evt::{EventChannel, EventCode};
use crate::shmem::MemRegion;
use crate::wait::Notifier;
use hub_config::RetryConfig;
use log::{debug, error, warn};
use std::sync::{Arc, Mutex};

const EQ: usize = 0;
const DQ: usize = 4;
const HEADER_SIZE: usize = 8;

pub const TOMBSTONE: u32 = u32::MAX;
const RESERVED: u32 = u32::MAX - 1;

/// A published slot handed out by [`DataChannel::read`]. The bytes stay in
/// shared memory and must be consumed before the producer wraps around to
/// the same slot.
#[derive(Debug, Clone)]
pub struct DataSlot {
    index: u32,
    payload: MemRegion,
}

impl DataSlot {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn len(&self) -> usize {
        self.payload.size()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.size() == 0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.payload.to_vec()
    }

    /// Copies the payload into `buf`, returning the number of bytes copied.
    pub fn read_into(&self, buf: &mut [u8]) -> Result<usize, MemError> {
        let n = buf.len().min(self.len());
        self.payload.read_bytes(0, &mut buf[..n])?;
        Ok(n)
    }
}

pub struct DataChannel {
    region: MemRegion,
    capacity: u32,
    packet_size: usize,
    events: Arc<EventChannel>,
    notifier: Arc<Notifier>,
    retry: RetryConfig,
    lock: Mutex<()>,
}

impl DataChannel {
    fn stride(packet_size: u32) -> usize {
        4 + (packet_size as usize).next_multiple_of(4)
    }

    pub fn footprint(slots: u32, packet_size: u32) -> usize {
        HEADER_SIZE + slots as usize * Self::stride(packet_size)
    }

    pub fn new(
        region: MemRegion,
        capacity: u32,
        packet_size: u32,
        events: Arc<EventChannel>,
        notifier: Arc<Notifier>,
        retry: RetryConfig,
    ) -> Result<Self, MemError> {
        let required = Self::footprint(capacity, packet_size);
        if capacity < 2 || region.size() < required {
            return Err(MemError::OutOfBounds {
                offset: region.base(),
                len: required,
                size: region.size(),
            });
        }
        Ok(DataChannel {
            region,
            capacity,
            packet_size: packet_size as usize,
            events,
            notifier,
            retry,
            lock: Mutex::new(()),
        })
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    fn index(&self, offset: usize) -> Result<u32, DataError> {
        let index = self.region.read_u32(offset)?;
        if index >= self.capacity {
            error!("data ring index {index} out of range");
            return Err(DataError::IndexCorrupt {
                index,
                capacity: self.capacity,
            });
        }
        Ok(index)
    }

    fn slot(&self, index: u32) -> usize {
        HEADER_SIZE + index as usize * Self::stride(self.packet_size as u32)
    }

    /// Number of published slots the consumer has not read yet.
    pub fn pending_count(&self) -> Result<u32, DataError> {
        let eq = self.index(EQ)?;
        let dq = self.index(DQ)?;
        Ok((eq + self.capacity - dq) % self.capacity)
    }

    pub fn is_full(&self) -> Result<bool, DataError> {
        Ok(self.pending_count()? == self.capacity - 1)
    }

    /// Raw enqueue/dequeue index words, unvalidated.
    pub fn indices(&self) -> (u32, u32) {
        (
            self.region.read_u32(EQ).unwrap_or(u32::MAX),
            self.region.read_u32(DQ).unwrap_or(u32::MAX),
        )
    }

    /// Reserves the next slot, waiting a bounded time for space. The lock
    /// is not held while waiting.
    fn reserve(&self) -> Result<u32, DataError> {
        for attempt in 0..=self.retry.ceiling {
            {
                let _guard = self.lock.lock().unwrap();
                let eq = self.index(EQ)?;
                let dq = self.index(DQ)?;
                if (eq + 1) % self.capacity != dq {
                    self.region.write_u32(self.slot(eq), RESERVED)?;
                    self.region.write_u32(EQ, (eq + 1) % self.capacity)?;
                    return Ok(eq);
                }
            }
            if attempt < self.retry.ceiling {
                self.notifier.wait_until(1, self.retry.interval(), || {
                    !matches!(self.is_full(), Ok(true))
                });
            }
        }
        warn!("data ring full after {} retries", self.retry.ceiling);
        Err(DataError::ChannelFull)
    }

    /// Publishes `payload` and posts `DataReady`. If the event cannot be
    /// posted the slot is tombstoned and the write fails.
    pub fn write(&self, payload: &[u8]) -> Result<(), DataError> {
        if payload.len() > self.packet_size {
            return Err(DataError::PayloadTooLarge {
                len: payload.len(),
                max: self.packet_size,
            });
        }
        let index = self.reserve()?;
        let slot = self.slot(index);
        self.region.write_bytes(slot + 4, payload)?;
        self.region.write_u32(slot, payload.len() as u32)?;

        if let Err(err) = self.events.enqueue(EventCode::DataReady) {
            error!("data slot {index} written but not signalled: {err}");
            self.region.write_u32(slot, TOMBSTONE)?;
            return Err(err.into());
        }
        debug!("data slot {index}: {} bytes", payload.len());
        Ok(())
    }

    /// Takes the next published slot, skipping tombstoned ones. Returns
    /// `None` when the ring is empty or the next slot is still being
    /// filled.
    pub fn read(&self) -> Result<Option<DataSlot>, DataError> {
        let _guard = self.lock.lock().unwrap();
        loop {
            let dq = self.index(DQ)?;
            let eq = self.index(EQ)?;
            if dq == eq {
                return Ok(None);
            }
            let slot = self.slot(dq);
            let next = (dq + 1) % self.capacity;
            match self.region.read_u32(slot)? {
                TOMBSTONE => {
                    warn!("skipping tombstoned data slot {dq}");
                    self.region.write_u32(DQ, next)?;
                }
                RESERVED => return Ok(None),
                len if len as usize > self.packet_size => {
                    error!("data slot {dq} declares {len} bytes");
                    self.region.write_u32(DQ, next)?;
                    return Err(DataError::InvalidLength {
                        len,
                        max: self.packet_size,
                    });
                }
                len => {
                    let payload = self.region.sub(slot + 4, len as usize)?;
                    self.region.write_u32(DQ, next)?;
                    return Ok(Some(DataSlot { index: dq, payload }));
                }
            }
        }
    }
}
