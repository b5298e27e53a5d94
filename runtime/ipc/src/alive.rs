// Licensed under the Apache-2.0 license

use crate::error::TimeoutError;
use crate::mailbox::{Mailbox, ScratchSlot, ALIVE_LINE};
use crate::wait::Notifier;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const ALIVE_REQUEST: u32 = 0x4150_574b;
pub const ALIVE_RESPONSE: u32 = 0x4855_4241;

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Liveness round trip over the `Alive` scratch register and the dedicated
/// alive line.
pub struct AliveHandshake {
    mailbox: Mailbox,
    notifier: Arc<Notifier>,
    acked: AtomicBool,
    responding: AtomicBool,
}

impl AliveHandshake {
    pub fn new(mailbox: Mailbox, notifier: Arc<Notifier>) -> Self {
        AliveHandshake {
            mailbox,
            notifier,
            acked: AtomicBool::new(false),
            responding: AtomicBool::new(true),
        }
    }

    /// Asks the peer to prove it is scheduling. Does not retry.
    pub fn ping(&self, timeout: Duration) -> Result<(), TimeoutError> {
        self.acked.store(false, Ordering::SeqCst);
        self.mailbox.write_scratch(ScratchSlot::Alive, ALIVE_REQUEST);
        self.mailbox.generate(ALIVE_LINE);
        let acked = self.notifier.wait_for(timeout, POLL_INTERVAL, || {
            self.acked.load(Ordering::SeqCst)
        });
        self.acked.store(false, Ordering::SeqCst);
        if acked {
            debug!("alive handshake completed");
            Ok(())
        } else {
            Err(TimeoutError(timeout))
        }
    }

    /// Runs from the interrupt handler when the alive line is pending.
    pub fn on_irq(&self) {
        match self.mailbox.read_scratch(ScratchSlot::Alive) {
            ALIVE_REQUEST => {
                if self.responding.load(Ordering::SeqCst) {
                    self.mailbox
                        .write_scratch(ScratchSlot::Alive, ALIVE_RESPONSE);
                    self.mailbox.generate(ALIVE_LINE);
                } else {
                    debug!("alive request left unanswered");
                }
            }
            ALIVE_RESPONSE => {
                self.acked.store(true, Ordering::SeqCst);
                self.notifier.notify_all();
            }
            other => warn!("unexpected alive scratch value 0x{other:08x}"),
        }
    }

    /// Whether requests from the peer are answered.
    pub fn set_responding(&self, responding: bool) {
        self.responding.store(responding, Ordering::SeqCst);
    }
}
