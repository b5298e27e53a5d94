// Licensed under the Apache-2.0 license

//! Contract offered to front-end drivers. Internal index and register
//! detail never crosses this boundary; failures are folded into
//! [`TransportError`].

use crate::error::{DataError, TransportError};
use crate::evt::{EventCode, EventDescriptor};
use crate::lifecycle::{HubState, Lifecycle};
use crate::session::Direction;
use log::debug;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelHandle {
    direction: Direction,
    id: u32,
}

impl ChannelHandle {
    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

fn client_error(err: &DataError) -> TransportError {
    match err {
        DataError::PayloadTooLarge { len, max } => TransportError::PayloadTooLarge {
            len: *len,
            max: *max,
        },
        DataError::ChannelFull | DataError::Signal(_) | DataError::InvalidLength { .. } => {
            TransportError::Busy
        }
        // Corruption always schedules a reset.
        DataError::IndexCorrupt { .. } | DataError::Memory(_) => TransportError::Unavailable,
    }
}

pub struct Transport {
    lifecycle: Lifecycle,
    next_id: AtomicU32,
}

impl Transport {
    pub fn new(lifecycle: Lifecycle) -> Self {
        Transport {
            lifecycle,
            next_id: AtomicU32::new(0),
        }
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Largest payload a single `send` accepts.
    pub fn max_payload(&self) -> usize {
        self.lifecycle.config().geometry.packet_size as usize
    }

    pub fn open_channel(&self, direction: Direction) -> ChannelHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!("opened {direction:?} channel {id}");
        ChannelHandle { direction, id }
    }

    pub fn send(&self, handle: &ChannelHandle, payload: &[u8]) -> Result<(), TransportError> {
        if handle.direction != Direction::ApToHub {
            return Err(TransportError::InvalidChannel);
        }
        let max = self.max_payload();
        if payload.len() > max {
            return Err(TransportError::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }
        let token = self.lifecycle.get_token()?;
        match token.send(payload) {
            Ok(()) => Ok(()),
            Err(err) => {
                drop(token);
                if let Some(fault) = err.write_fault() {
                    self.lifecycle.handle_debug(fault);
                }
                Err(client_error(&err))
            }
        }
    }

    fn try_recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let token = self.lifecycle.get_token()?;
        match token.recv() {
            Ok(payload) => Ok(payload),
            Err(err) => {
                drop(token);
                self.lifecycle.handle_debug(err.read_fault());
                Err(client_error(&err))
            }
        }
    }

    fn inbound_pending(&self) -> bool {
        match self.lifecycle.get_token() {
            Ok(token) => !matches!(token.data(Direction::HubToAp).pending_count(), Ok(0)),
            // Let the caller see why.
            Err(_) => true,
        }
    }

    /// Takes the next hub→AP payload, waiting up to `timeout` for one.
    pub fn recv(&self, handle: &ChannelHandle, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if handle.direction != Direction::HubToAp {
            return Err(TransportError::InvalidChannel);
        }
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(payload) = self.try_recv()? {
                return Ok(payload);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout);
            }
            self.lifecycle
                .wait_activity(deadline - now, || self.inbound_pending());
        }
    }

    pub fn register_event_callback<F>(&self, code: EventCode, callback: F)
    where
        F: Fn(&EventDescriptor) + Send + Sync + 'static,
    {
        self.lifecycle.register_event_callback(code, callback);
    }

    pub fn request_lifecycle_state(&self) -> HubState {
        self.lifecycle.state()
    }
}
