// Licensed under the Apache-2.0 license

//! Emulated hub firmware: the far endpoint of the IPC protocol.
//!
//! The interrupt handler only services the mailbox and queues inbound
//! events; a firmware thread consumes data and acts on the events. Data
//! received from the AP is echoed back unchanged.

use hub_config::HubConfig;
use hub_ipc::persist::BootMode;
use hub_ipc::{
    attach, Direction, Endpoint, EventCode, EventDescriptor, IpcSession, MailboxBus, ScratchSlot,
    SharedMemory,
};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::JoinHandle;

/// Hub log levels, numerically aligned with `log::Level`.
pub const LOG_ERROR: u32 = 1;
pub const LOG_INFO: u32 = 3;

enum FwWork {
    Event(EventDescriptor),
    Stop,
}

struct Running {
    session: Arc<IpcSession>,
    tx: Sender<FwWork>,
    handle: JoinHandle<()>,
}

/// Counters the tests and the CLI report on.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareStats {
    pub boots: u32,
    pub echoed: u32,
    pub shutdowns: u32,
    pub log_level_updates: u32,
}

struct FwInner {
    config: HubConfig,
    mem: SharedMemory,
    bus: Arc<dyn MailboxBus>,
    running: RwLock<Option<Running>>,
    paused: AtomicBool,
    responding: AtomicBool,
    echo: AtomicBool,
    boots: AtomicU32,
    echoed: AtomicU32,
    shutdowns: AtomicU32,
    log_level_updates: AtomicU32,
    // Serializes start and stop.
    control: Mutex<()>,
    // Keeps echoes in arrival order.
    echo_lock: Mutex<()>,
}

impl FwInner {
    fn session(&self) -> Option<Arc<IpcSession>> {
        self.running
            .read()
            .unwrap()
            .as_ref()
            .map(|r| r.session.clone())
    }

    fn on_irq(&self) {
        if self.paused.load(Ordering::SeqCst) {
            return;
        }
        let running = self.running.read().unwrap();
        let Some(running) = running.as_ref() else {
            return;
        };
        let report = running.session.handle_irq();
        for fault in report.faults {
            warn!("hub firmware saw {fault:?} on the AP event ring");
        }
        for desc in report.events {
            let _ = running.tx.send(FwWork::Event(desc));
        }
    }

    fn echo_pending(&self, session: &IpcSession) {
        let _order = self.echo_lock.lock().unwrap();
        loop {
            let payload = match session.recv() {
                Ok(Some(payload)) => payload,
                Ok(None) => break,
                Err(err) => {
                    error!("hub firmware read failed: {err}");
                    let _ = session
                        .log()
                        .producer_emit(LOG_ERROR, &format!("rx failed: {err}"));
                    break;
                }
            };
            if !self.echo.load(Ordering::SeqCst) {
                continue;
            }
            match session.send(&payload) {
                Ok(()) => {
                    self.echoed.fetch_add(1, Ordering::SeqCst);
                }
                Err(err) => {
                    warn!("hub firmware echo failed: {err}");
                    let _ = session
                        .log()
                        .producer_emit(LOG_ERROR, &format!("tx failed: {err}"));
                }
            }
        }
    }

    fn handle_event(&self, session: &IpcSession, desc: EventDescriptor) {
        match desc.event() {
            Ok(EventCode::DataReady) => self.echo_pending(session),
            Ok(EventCode::Shutdown) => {
                self.shutdowns.fetch_add(1, Ordering::SeqCst);
                info!("hub firmware told to shut down");
            }
            Ok(EventCode::LogLevel) => {
                self.log_level_updates.fetch_add(1, Ordering::SeqCst);
                let level = session.persist().log_level().unwrap_or(LOG_INFO);
                debug!("hub firmware log level now {level}");
            }
            Ok(EventCode::ApSleep) => debug!("AP went to sleep"),
            Ok(EventCode::ApWake) => debug!("AP woke up"),
            Ok(code) => warn!("hub firmware ignores {code:?}"),
            Err(raw) => warn!("hub firmware got unknown event 0x{raw:x}"),
        }
    }

    fn run(weak: Weak<FwInner>, session: Arc<IpcSession>, rx: mpsc::Receiver<FwWork>) {
        while let Ok(FwWork::Event(desc)) = rx.recv() {
            let Some(inner) = weak.upgrade() else {
                break;
            };
            inner.handle_event(&session, desc);
        }
        debug!("hub firmware thread stopped");
    }
}

/// Handle to the emulated firmware. Clones share state.
#[derive(Clone)]
pub struct HubFirmware {
    inner: Arc<FwInner>,
}

impl HubFirmware {
    pub fn new(config: HubConfig, mem: SharedMemory, bus: Arc<dyn MailboxBus>) -> Self {
        HubFirmware {
            inner: Arc::new(FwInner {
                config,
                mem,
                bus,
                running: RwLock::new(None),
                paused: AtomicBool::new(false),
                responding: AtomicBool::new(true),
                echo: AtomicBool::new(true),
                boots: AtomicU32::new(0),
                echoed: AtomicU32::new(0),
                shutdowns: AtomicU32::new(0),
                log_level_updates: AtomicU32::new(0),
                control: Mutex::new(()),
                echo_lock: Mutex::new(()),
            }),
        }
    }

    /// Boots the firmware on the map area the AP negotiated.
    pub fn start(&self) -> anyhow::Result<()> {
        let inner = &self.inner;
        let _control = inner.control.lock().unwrap();
        self.stop_locked();
        inner.paused.store(false, Ordering::SeqCst);

        let layout = attach(&inner.mem, &inner.config)?;
        let session = Arc::new(IpcSession::new(
            Endpoint::Hub,
            &inner.mem,
            layout,
            inner.bus.clone(),
            &inner.config,
        )?);
        session
            .alive()
            .set_responding(inner.responding.load(Ordering::SeqCst));

        let boots = inner.boots.fetch_add(1, Ordering::SeqCst) + 1;
        let mode = session.persist().boot_mode()?;
        let table: Vec<u8> = (0..inner.config.geometry.sensor_table_size)
            .map(|i| i as u8)
            .collect();
        session.write_sensor_table(&table)?;
        session.set_debug_value(0, boots)?;
        session.log().producer_emit(
            LOG_INFO,
            &format!(
                "hub firmware up, boot {boots}, {} start",
                if mode == BootMode::Warm { "warm" } else { "cold" }
            ),
        )?;

        let (tx, rx) = mpsc::channel();
        let weak = Arc::downgrade(inner);
        let thread_session = session.clone();
        let handle = std::thread::spawn(move || FwInner::run(weak, thread_session, rx));
        *inner.running.write().unwrap() = Some(Running {
            session,
            tx,
            handle,
        });

        let weak = Arc::downgrade(inner);
        inner.bus.connect_irq(
            Endpoint::Hub,
            Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_irq();
                }
            }),
        );
        info!("hub firmware started ({mode:?})");
        Ok(())
    }

    fn stop_locked(&self) {
        let inner = &self.inner;
        inner.bus.disconnect_irq(Endpoint::Hub);
        let running = inner.running.write().unwrap().take();
        if let Some(Running { tx, handle, .. }) = running {
            let _ = tx.send(FwWork::Stop);
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
            info!("hub firmware stopped");
        }
    }

    /// Halts the firmware, as holding the core in reset does.
    pub fn stop(&self) {
        let _control = self.inner.control.lock().unwrap();
        self.stop_locked();
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.read().unwrap().is_some()
    }

    pub fn session(&self) -> Option<Arc<IpcSession>> {
        self.inner.session()
    }

    /// Stops servicing interrupts. Inbound data and events pile up.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    /// Resumes servicing and catches up with everything left pending.
    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.on_irq();
        if let Some(session) = self.inner.session() {
            self.inner.echo_pending(&session);
        }
    }

    pub fn set_echo(&self, echo: bool) {
        self.inner.echo.store(echo, Ordering::SeqCst);
    }

    /// Whether alive requests are answered, now and after later boots.
    pub fn set_responding(&self, responding: bool) {
        self.inner.responding.store(responding, Ordering::SeqCst);
        if let Some(session) = self.inner.session() {
            session.alive().set_responding(responding);
        }
    }

    /// Sends a payload to the AP outside of the echo path.
    pub fn send(&self, payload: &[u8]) -> anyhow::Result<()> {
        let session = self.session().ok_or_else(|| anyhow::anyhow!("hub not running"))?;
        session.send(payload)?;
        Ok(())
    }

    pub fn emit_log(&self, level: u32, text: &str) -> anyhow::Result<()> {
        let session = self.session().ok_or_else(|| anyhow::anyhow!("hub not running"))?;
        session.log().producer_emit(level, text)?;
        Ok(())
    }

    /// Reports a firmware fault with `code` in the fault scratch register.
    pub fn raise_fault(&self, code: u32) -> anyhow::Result<()> {
        let session = self.session().ok_or_else(|| anyhow::anyhow!("hub not running"))?;
        session.mailbox().write_scratch(ScratchSlot::FaultCode, code);
        session.post(EventCode::FwFault)?;
        Ok(())
    }

    pub fn request_reboot(&self) -> anyhow::Result<()> {
        let session = self.session().ok_or_else(|| anyhow::anyhow!("hub not running"))?;
        session.post(EventCode::RebootRequest)?;
        Ok(())
    }

    /// Payloads the AP has queued for the hub and the hub has not read.
    pub fn backlog(&self) -> u32 {
        self.session()
            .and_then(|s| s.data(Direction::ApToHub).pending_count().ok())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> FirmwareStats {
        let inner = &self.inner;
        FirmwareStats {
            boots: inner.boots.load(Ordering::SeqCst),
            echoed: inner.echoed.load(Ordering::SeqCst),
            shutdowns: inner.shutdowns.load(Ordering::SeqCst),
            log_level_updates: inner.log_level_updates.load(Ordering::SeqCst),
        }
    }
}
