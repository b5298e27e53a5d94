// Licensed under the Apache-2.0 license

//! Hub power, supervision and silent recovery.
//!
//! Every protocol operation runs under a [`Token`]. A reset raises the
//! in-reset count first, so new tokens are refused, then waits a bounded
//! time for the outstanding ones to be dropped before it tears down the
//! session. Faults reported through [`Lifecycle::handle_debug`] are counted
//! per kind; crossing the threshold of a kind schedules one reset on the
//! lifecycle worker thread, never inline in interrupt context.

use crate::dump::{resolve_call_stack, DumpBlob, DumpLimiter, MailboxState};
use crate::error::{LayoutError, LifecycleError};
use crate::evt::{EventCode, EventDescriptor};
use crate::fault::{FaultCounters, FaultKind};
use crate::layout::{negotiate, LayoutMap};
use crate::mailbox::{Endpoint, Mailbox, MailboxBus, ScratchSlot};
use crate::persist::BootMode;
use crate::platform::{FirmwareLoader, HubPlatform};
use crate::session::{Direction, IpcSession};
use crate::shmem::SharedMemory;
use crate::wait::Notifier;
use hub_config::HubConfig;
use log::{debug, error, info, warn};
use smlang::statemachine;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

statemachine! {
    derive_states: [Debug, Clone, Copy, Eq],
    derive_events: [Clone, Copy, Debug],
    transitions: {
        *NoPower + PowerOn = PoweredOn,

        PoweredOn + AliveOk = Running,
        NotResponding + AliveOk = Running,
        PoweredOn + AliveTimeout = NotResponding,
        Running + AliveTimeout = NotResponding,

        Running + Fault = Error,
        NotResponding + Fault = Error,
        Running + Hang = Hung,
        NotResponding + Hang = Hung,

        _ + BusFault = BusMonitorFault,
        _ + ResetOk = Running,
        _ + ResetFail = ResetFailed,
        _ + PowerOff = NoPower
    }
}

pub struct HubContext;

impl StateMachineContext for HubContext {}

pub type HubState = States;
pub type HubEvent = Events;

pub type EventCallback = Arc<dyn Fn(&EventDescriptor) + Send + Sync>;

const DRAIN_POLL: Duration = Duration::from_millis(1);

enum Work {
    Reset { force: bool, reason: FaultKind },
    DrainLog,
}

struct Worker {
    tx: Sender<Work>,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleStats {
    pub state: HubState,
    pub resets_scheduled: u32,
    pub resets_completed: u32,
    pub resets_failed: u32,
    pub tokens_held: u32,
    pub faults: Vec<(FaultKind, u32)>,
}

/// Permit to use the IPC session. Dropping it releases the permit.
pub struct Token<'a> {
    inner: &'a Inner,
    session: Arc<IpcSession>,
}

impl Deref for Token<'_> {
    type Target = IpcSession;

    fn deref(&self) -> &IpcSession {
        &self.session
    }
}

impl Drop for Token<'_> {
    fn drop(&mut self) {
        self.inner.tokens.fetch_sub(1, Ordering::SeqCst);
        self.inner.token_released.notify_all();
    }
}

struct Inner {
    config: HubConfig,
    mem: SharedMemory,
    mailbox: Mailbox,
    platform: Arc<dyn HubPlatform>,
    loader: Arc<dyn FirmwareLoader>,
    sm: Mutex<StateMachine<HubContext>>,
    session: RwLock<Option<Arc<IpcSession>>>,
    layout: Mutex<Option<LayoutMap>>,
    tokens: AtomicU32,
    in_reset: AtomicU32,
    reset_pending: AtomicBool,
    /// Serializes power transitions and resets.
    reset_lock: Mutex<()>,
    token_released: Notifier,
    /// Poked when data arrives or a reset completes.
    activity: Notifier,
    faults: FaultCounters,
    callbacks: RwLock<HashMap<EventCode, Vec<EventCallback>>>,
    dumps: DumpLimiter,
    last_dump: Mutex<Option<DumpBlob>>,
    worker: Mutex<Option<Worker>>,
    resets_scheduled: AtomicU32,
    resets_completed: AtomicU32,
    resets_failed: AtomicU32,
}

impl Inner {
    fn state(&self) -> HubState {
        *self.sm.lock().unwrap().state()
    }

    fn transition(&self, event: HubEvent) -> Result<HubState, LifecycleError> {
        let mut sm = self.sm.lock().unwrap();
        let from = *sm.state();
        match sm.process_event(event) {
            Ok(to) => {
                let to = *to;
                if from != to {
                    info!("hub state {from:?} -> {to:?} on {event:?}");
                }
                Ok(to)
            }
            Err(_) => {
                debug!("{event:?} ignored in state {from:?}");
                Err(LifecycleError::InvalidTransition {
                    state: format!("{from:?}"),
                    event: format!("{event:?}"),
                })
            }
        }
    }

    fn get_token(&self) -> Result<Token<'_>, LifecycleError> {
        if self.in_reset.load(Ordering::SeqCst) > 0 {
            return Err(LifecycleError::ResetInProgress);
        }
        self.tokens.fetch_add(1, Ordering::SeqCst);
        let refuse = |err: LifecycleError| {
            self.tokens.fetch_sub(1, Ordering::SeqCst);
            self.token_released.notify_all();
            Err(err)
        };
        // A reset may have started between the check and the increment.
        if self.in_reset.load(Ordering::SeqCst) > 0 {
            return refuse(LifecycleError::ResetInProgress);
        }
        match self.state() {
            States::NoPower | States::PoweredOn => return refuse(LifecycleError::NotRunning),
            States::ResetFailed => return refuse(LifecycleError::ResetFailed),
            _ => {}
        }
        let session = self.session.read().unwrap().clone();
        match session {
            Some(session) => Ok(Token {
                inner: self,
                session,
            }),
            None => refuse(LifecycleError::NotRunning),
        }
    }

    fn schedule(&self, work: Work) -> bool {
        match self.worker.lock().unwrap().as_ref() {
            Some(worker) => worker.tx.send(work).is_ok(),
            None => false,
        }
    }

    fn handle_debug(&self, kind: FaultKind) -> bool {
        let count = self.faults.bump(kind);
        let threshold = kind.threshold(&self.config.thresholds);
        warn!("hub fault {kind:?} ({count}/{threshold})");
        if count < threshold {
            return false;
        }
        let state = self.state();
        match state {
            States::NoPower => return false,
            States::ResetFailed => {
                debug!("hub reset failed earlier, {kind:?} waits for an explicit reset");
                return false;
            }
            _ => {}
        }
        if self.reset_pending.swap(true, Ordering::SeqCst) {
            debug!("hub reset already scheduled");
            return false;
        }

        let event = match kind {
            FaultKind::BusFault | FaultKind::AccessViolation => Events::BusFault,
            FaultKind::Watchdog => Events::Hang,
            FaultKind::NoResponse => Events::AliveTimeout,
            _ => Events::Fault,
        };
        if state != States::Error {
            let _ = self.transition(event);
        }
        // A hub that hangs or lost its bus cannot drain before the reset.
        let force = matches!(
            kind,
            FaultKind::BusFault
                | FaultKind::AccessViolation
                | FaultKind::Watchdog
                | FaultKind::NoResponse
        );
        self.resets_scheduled.fetch_add(1, Ordering::SeqCst);
        if !self.schedule(Work::Reset {
            force,
            reason: kind,
        }) {
            error!("lifecycle worker not running, reset for {kind:?} dropped");
            self.reset_pending.store(false, Ordering::SeqCst);
            return false;
        }
        info!("hub reset scheduled after {kind:?}");
        true
    }

    fn on_irq(&self) {
        let Some(session) = self.session.read().unwrap().clone() else {
            return;
        };
        let report = session.handle_irq();
        for fault in report.faults {
            self.handle_debug(fault);
        }
        for desc in &report.events {
            self.dispatch(desc);
        }
    }

    fn dispatch(&self, desc: &EventDescriptor) {
        let code = match desc.event() {
            Ok(code) => code,
            Err(raw) => {
                error!("unrecognized hub event 0x{raw:x} on line {}", desc.line);
                self.handle_debug(FaultKind::EventMalformed);
                return;
            }
        };
        match code {
            EventCode::DataReady => self.activity.notify_all(),
            EventCode::LogFlush => {
                self.schedule(Work::DrainLog);
            }
            EventCode::FwFault => {
                let fault = self.mailbox.read_scratch(ScratchSlot::FaultCode);
                error!("hub firmware fault 0x{fault:08x}");
                self.handle_debug(FaultKind::FwFault);
            }
            EventCode::RebootRequest => {
                info!("hub requested a reboot");
                self.handle_debug(FaultKind::HubReboot);
            }
            EventCode::LogLevel
            | EventCode::ApSleep
            | EventCode::ApWake
            | EventCode::Shutdown => warn!("unexpected {code:?} event from the hub"),
        }
        let callbacks = self
            .callbacks
            .read()
            .unwrap()
            .get(&code)
            .cloned()
            .unwrap_or_default();
        for callback in callbacks {
            callback(desc);
        }
    }

    fn ping_with_retries(&self, session: &IpcSession) -> Result<(), LifecycleError> {
        let tries = self.config.alive.tries;
        for attempt in 1..=tries {
            match session.alive().ping(self.config.alive.timeout()) {
                Ok(()) => return Ok(()),
                Err(err) => warn!("alive check {attempt}/{tries} failed: {err}"),
            }
        }
        Err(LifecycleError::NotResponding)
    }

    /// Brings a hub held in reset up to a completed alive handshake.
    fn boot_hub(&self, mode: BootMode) -> Result<(), LifecycleError> {
        let layout = negotiate(&self.mem, &self.config)?;
        self.platform
            .configure_access_window(layout.ram.base, layout.ram.size)?;
        self.loader
            .load_and_verify_image(self.config.reset.firmware_slot)?;

        let session = Arc::new(IpcSession::new(
            Endpoint::Ap,
            &self.mem,
            layout.clone(),
            self.mailbox.bus().clone(),
            &self.config,
        )?);
        session.persist().set_boot_mode(mode)?;
        if mode == BootMode::Cold {
            session
                .persist()
                .set_log_level(self.config.log.runtime_level)?;
        }
        self.mailbox.write_scratch(ScratchSlot::BootMode, mode.into());
        *self.layout.lock().unwrap() = Some(layout);
        *self.session.write().unwrap() = Some(session.clone());

        self.mailbox.clear_all_pending();
        self.mailbox.unmask_all();
        self.platform.release_reset()?;
        self.ping_with_retries(&session)
    }

    fn drain_tokens(&self) -> bool {
        let drained = self.token_released.wait_until(
            self.config.reset.token_drain_tries,
            self.config.reset.token_drain_interval(),
            || self.tokens.load(Ordering::SeqCst) == 0,
        );
        if !drained {
            warn!(
                "{} protocol operations still hold tokens, proceeding",
                self.tokens.load(Ordering::SeqCst)
            );
        }
        drained
    }

    /// Lets the hub consume what the AP already sent, then tells it a
    /// reset is coming. Failures are only logged.
    fn shutdown_hub(&self) {
        let Some(session) = self.session.read().unwrap().clone() else {
            return;
        };
        let tx = session.data(Direction::ApToHub);
        let drained = session
            .notifier()
            .wait_for(self.config.reset.shutdown_wait(), DRAIN_POLL, || {
                matches!(tx.pending_count(), Ok(0))
            });
        if !drained {
            warn!("hub did not drain AP data before shutdown");
        }
        let events = session.events(Direction::ApToHub);
        if let Err(err) = events.try_enqueue(EventCode::Shutdown) {
            warn!("shutdown event not delivered: {err}");
            return;
        }
        let taken = session
            .notifier()
            .wait_for(self.config.reset.shutdown_wait(), DRAIN_POLL, || {
                matches!(events.is_empty(), Ok(true))
            });
        if !taken {
            warn!("hub did not take the shutdown event");
        }
    }

    fn capture(&self, reason: &str) -> DumpBlob {
        let session = self.session.read().unwrap().clone();
        DumpBlob {
            reason: reason.to_string(),
            taken_at: SystemTime::now(),
            state: self.state(),
            registers: self.platform.read_debug_registers(),
            scratch: ScratchSlot::ALL
                .iter()
                .map(|&slot| (slot, self.mailbox.read_scratch(slot)))
                .collect(),
            mailbox: MailboxState {
                pending: self.mailbox.read_pending_mask(),
                masked: self.mailbox.masked_lines(),
                peer_pending: self.mailbox.read_peer_pending(),
            },
            debug_values: session
                .as_ref()
                .map(|s| s.debug_values())
                .unwrap_or_default(),
            snapshot: session.as_ref().map(|s| s.snapshot()),
            call_stack: resolve_call_stack(
                &self.platform.read_call_stack(),
                &self.loader.symbols(),
            ),
            shared_memory: self.mem.snapshot(),
        }
    }

    fn reset(&self, force: bool, reason: &str) -> Result<(), LifecycleError> {
        let _serial = self.reset_lock.lock().unwrap();
        if self.state() == States::NoPower {
            self.reset_pending.store(false, Ordering::SeqCst);
            return Err(LifecycleError::NotRunning);
        }
        self.in_reset.fetch_add(1, Ordering::SeqCst);
        info!("resetting hub ({reason}), force {force}");
        self.drain_tokens();
        self.mailbox.mask_all();

        if self.dumps.try_acquire() {
            let blob = self.capture(reason);
            *self.last_dump.lock().unwrap() = Some(blob);
        } else {
            info!("postmortem dump skipped, previous one is too recent");
        }
        if !force {
            self.shutdown_hub();
        }

        *self.session.write().unwrap() = None;
        let result = self
            .platform
            .assert_reset()
            .map_err(LifecycleError::from)
            .and_then(|()| self.boot_hub(BootMode::Warm));

        match &result {
            Ok(()) => {
                let _ = self.transition(Events::ResetOk);
                self.resets_completed.fetch_add(1, Ordering::SeqCst);
                info!("hub recovered");
            }
            Err(err) => {
                error!("hub reset failed: {err}");
                let _ = self.transition(Events::ResetFail);
                self.resets_failed.fetch_add(1, Ordering::SeqCst);
                // Never leave the AP deaf to the mailbox.
                self.mailbox.unmask_all();
            }
        }
        self.faults.clear();
        self.reset_pending.store(false, Ordering::SeqCst);
        self.in_reset.fetch_sub(1, Ordering::SeqCst);
        self.activity.notify_all();
        result
    }

    fn drain_log(&self) -> u32 {
        let Ok(token) = self.get_token() else {
            return 0;
        };
        if token.ap_sleep() {
            debug!("AP asleep, hub log drain deferred");
            return 0;
        }
        let batch = self.config.log.drain_batch;
        let mut total = 0;
        loop {
            match token.drain_log(batch) {
                Ok(n) => {
                    total += n;
                    if n < batch {
                        break;
                    }
                }
                Err(err) => {
                    error!("hub log drain failed: {err}");
                    drop(token);
                    self.handle_debug(FaultKind::ReadFail);
                    break;
                }
            }
        }
        total
    }

    fn run(&self, work: Work) {
        match work {
            Work::Reset { force, reason } => {
                if let Err(err) = self.reset(force, &format!("{reason:?}")) {
                    error!("hub recovery after {reason:?} failed: {err}");
                }
            }
            Work::DrainLog => {
                let drained = self.drain_log();
                debug!("drained {drained} hub log records");
            }
        }
    }
}

/// Owner of the hub lifecycle. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

impl Lifecycle {
    pub fn new(
        config: HubConfig,
        mem: SharedMemory,
        bus: Arc<dyn MailboxBus>,
        platform: Arc<dyn HubPlatform>,
        loader: Arc<dyn FirmwareLoader>,
    ) -> Self {
        let dumps = DumpLimiter::new(config.reset.dump_min_interval());
        Lifecycle {
            inner: Arc::new(Inner {
                mailbox: Mailbox::new(bus, Endpoint::Ap),
                sm: Mutex::new(StateMachine::new(HubContext)),
                session: RwLock::new(None),
                layout: Mutex::new(None),
                tokens: AtomicU32::new(0),
                in_reset: AtomicU32::new(0),
                reset_pending: AtomicBool::new(false),
                reset_lock: Mutex::new(()),
                token_released: Notifier::new(),
                activity: Notifier::new(),
                faults: FaultCounters::default(),
                callbacks: RwLock::new(HashMap::new()),
                dumps,
                last_dump: Mutex::new(None),
                worker: Mutex::new(None),
                resets_scheduled: AtomicU32::new(0),
                resets_completed: AtomicU32::new(0),
                resets_failed: AtomicU32::new(0),
                config,
                mem,
                platform,
                loader,
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn state(&self) -> HubState {
        self.inner.state()
    }

    pub fn in_reset(&self) -> bool {
        self.inner.in_reset.load(Ordering::SeqCst) > 0
    }

    fn start_worker(&self) {
        let mut worker = self.inner.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }
        let (tx, rx) = mpsc::channel::<Work>();
        let weak = Arc::downgrade(&self.inner);
        let handle = std::thread::spawn(move || {
            while let Ok(work) = rx.recv() {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.run(work);
            }
            debug!("lifecycle worker stopped");
        });
        *worker = Some(Worker { tx, handle });
    }

    fn stop_worker(&self) {
        let worker = self.inner.worker.lock().unwrap().take();
        if let Some(Worker { tx, handle }) = worker {
            drop(tx);
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn connect_irq(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.mailbox.connect_irq(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_irq();
            }
        }));
    }

    /// Powers the hub, negotiates the map area, loads firmware and waits
    /// for the first alive handshake.
    pub fn power_on(&self) -> Result<(), LifecycleError> {
        self.start_worker();
        let _serial = self.inner.reset_lock.lock().unwrap();
        self.inner.transition(Events::PowerOn)?;
        self.inner.platform.power_on()?;
        self.connect_irq();

        match self.inner.boot_hub(BootMode::Cold) {
            Ok(()) => {
                self.inner.transition(Events::AliveOk)?;
                info!("hub running");
                self.inner.activity.notify_all();
                Ok(())
            }
            Err(err) => {
                error!("hub power-on failed: {err}");
                if matches!(err, LifecycleError::NotResponding) {
                    let _ = self.inner.transition(Events::AliveTimeout);
                }
                Err(err)
            }
        }
    }

    /// Stops all IPC, holds the hub in reset, removes power and clears the
    /// persisted block.
    pub fn power_off(&self) -> Result<(), LifecycleError> {
        self.stop_worker();
        let inner = &self.inner;
        let _serial = inner.reset_lock.lock().unwrap();
        inner.in_reset.fetch_add(1, Ordering::SeqCst);
        inner.drain_tokens();
        inner.mailbox.mask_all();
        inner.mailbox.disconnect_irq();
        *inner.session.write().unwrap() = None;

        if let Some(layout) = inner.layout.lock().unwrap().take() {
            let cleared = layout
                .map
                .persist
                .region(&inner.mem)
                .and_then(|r| r.fill(0, r.size(), 0).map_err(LayoutError::from));
            if let Err(err) = cleared {
                warn!("persisted block not cleared: {err}");
            }
        }
        let result = inner
            .platform
            .assert_reset()
            .and_then(|()| inner.platform.power_off())
            .map_err(LifecycleError::from);
        let _ = inner.transition(Events::PowerOff);
        inner.faults.clear();
        inner.reset_pending.store(false, Ordering::SeqCst);
        inner.in_reset.fetch_sub(1, Ordering::SeqCst);
        info!("hub powered off");
        result
    }

    /// Acquires a protocol permit. Fails immediately while a reset is in
    /// progress.
    pub fn get_token(&self) -> Result<Token<'_>, LifecycleError> {
        self.inner.get_token()
    }

    /// Counts a fault and schedules a reset when its threshold is crossed.
    /// Returns whether this call scheduled the reset. Safe to call from
    /// interrupt context.
    pub fn handle_debug(&self, kind: FaultKind) -> bool {
        self.inner.handle_debug(kind)
    }

    /// Resets the hub and waits for it to come back. With `force` the hub
    /// is not given a chance to drain and is not told about the reset.
    pub fn reset(&self, force: bool, reason: &str) -> Result<(), LifecycleError> {
        self.inner.reset(force, reason)
    }

    /// Periodic liveness check. A hub that misses every try is reported as
    /// [`FaultKind::NoResponse`].
    pub fn check_alive(&self) -> Result<(), LifecycleError> {
        let token = self.get_token()?;
        match self.inner.ping_with_retries(&token) {
            Ok(()) => {
                if self.state() == States::NotResponding {
                    let _ = self.inner.transition(Events::AliveOk);
                }
                Ok(())
            }
            Err(err) => {
                drop(token);
                self.inner.handle_debug(FaultKind::NoResponse);
                Err(err)
            }
        }
    }

    pub fn capture_postmortem(&self) -> DumpBlob {
        self.inner.capture("on demand")
    }

    /// Dump taken by the most recent reset.
    pub fn last_dump(&self) -> Option<DumpBlob> {
        self.inner.last_dump.lock().unwrap().clone()
    }

    /// Records the AP sleep state and tells the hub. Waking up with a
    /// latched flush request drains the log.
    pub fn set_ap_sleep(&self, asleep: bool) -> Result<(), LifecycleError> {
        let token = self.get_token()?;
        token.set_ap_sleep(asleep)?;
        if let Err(err) = token.announce_ap_sleep(asleep) {
            drop(token);
            self.inner.handle_debug(err.fault());
            return Err(err.into());
        }
        if !asleep && token.log().flush_requested() {
            self.inner.schedule(Work::DrainLog);
        }
        Ok(())
    }

    /// Stores the hub runtime log level in the persisted block and tells
    /// the hub to pick it up.
    pub fn set_log_level(&self, level: u32) -> Result<(), LifecycleError> {
        let token = self.get_token()?;
        token.persist().set_log_level(level)?;
        if let Err(err) = token.post(EventCode::LogLevel) {
            drop(token);
            self.inner.handle_debug(err.fault());
            return Err(err.into());
        }
        Ok(())
    }

    /// Drains the hub log now. Returns the number of records read.
    pub fn drain_log(&self) -> u32 {
        self.inner.drain_log()
    }

    /// Runs `callback` from the interrupt path for every inbound event
    /// with `code`. Callbacks must not block.
    pub fn register_event_callback<F>(&self, code: EventCode, callback: F)
    where
        F: Fn(&EventDescriptor) + Send + Sync + 'static,
    {
        self.inner
            .callbacks
            .write()
            .unwrap()
            .entry(code)
            .or_default()
            .push(Arc::new(callback));
    }

    /// Waits up to `timeout` for inbound data or the end of a reset.
    pub fn wait_activity<F>(&self, timeout: Duration, ready: F) -> bool
    where
        F: FnMut() -> bool,
    {
        self.inner.activity.wait_for(timeout, DRAIN_POLL, ready)
    }

    pub fn stats(&self) -> LifecycleStats {
        let inner = &self.inner;
        LifecycleStats {
            state: inner.state(),
            resets_scheduled: inner.resets_scheduled.load(Ordering::SeqCst),
            resets_completed: inner.resets_completed.load(Ordering::SeqCst),
            resets_failed: inner.resets_failed.load(Ordering::SeqCst),
            tokens_held: inner.tokens.load(Ordering::SeqCst),
            faults: inner.faults.snapshot(),
        }
    }
}
