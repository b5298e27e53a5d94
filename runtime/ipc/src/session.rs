// Licensed under the Apache-2.0 license

//! One endpoint's view of a negotiated IPC map area.
//!
//! A session is built once per hub boot: on the AP after [`negotiate`],
//! on the hub after [`attach`]. It owns the channel objects for both
//! directions and is dropped when the hub is reset or powered off.
//!
//! [`negotiate`]: crate::layout::negotiate
//! [`attach`]: crate::layout::attach

use crate::alive::AliveHandshake;
use crate::data::DataChannel;
use crate::error::{DataError, EvtError, LayoutError, MemError};
use crate::evt::{EventChannel, EventCode, EventDescriptor};
use crate::fault::FaultKind;
use crate::layout::{LayoutMap, DEBUG_WORDS};
use crate::logbuf::{LogChannel, LogIndices};
use crate::mailbox::{Endpoint, Mailbox, MailboxBus, ALIVE_LINE};
use crate::persist::PersistedBlock;
use crate::shmem::{MemRegion, SharedMemory};
use crate::wait::Notifier;
use hub_config::HubConfig;
use log::error;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ApToHub,
    HubToAp,
}

impl Direction {
    fn index(self) -> usize {
        match self {
            Direction::ApToHub => 0,
            Direction::HubToAp => 1,
        }
    }

    /// Direction `endpoint` produces into.
    pub fn outbound(endpoint: Endpoint) -> Direction {
        match endpoint {
            Endpoint::Ap => Direction::ApToHub,
            Endpoint::Hub => Direction::HubToAp,
        }
    }

    pub fn inbound(endpoint: Endpoint) -> Direction {
        Direction::outbound(endpoint.peer())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingIndices {
    pub enqueue: u32,
    pub dequeue: u32,
}

impl From<(u32, u32)> for RingIndices {
    fn from((enqueue, dequeue): (u32, u32)) -> Self {
        RingIndices { enqueue, dequeue }
    }
}

/// Ring indices and flags of the whole map area, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub evt: [RingIndices; 2],
    pub data: [RingIndices; 2],
    pub log: LogIndices,
    pub ap_sleep: bool,
    pub boot_mode: u32,
    pub log_level: u32,
}

/// What one run of [`IpcSession::handle_irq`] found.
#[derive(Debug, Default)]
pub struct IrqReport {
    pub events: Vec<EventDescriptor>,
    pub faults: Vec<FaultKind>,
    pub alive: bool,
}

pub struct IpcSession {
    endpoint: Endpoint,
    layout: LayoutMap,
    mailbox: Mailbox,
    notifier: Arc<Notifier>,
    events: [Arc<EventChannel>; 2],
    data: [DataChannel; 2],
    log: LogChannel,
    alive: AliveHandshake,
    persist: PersistedBlock,
    ap_sleep: MemRegion,
    debug: MemRegion,
    sensor: MemRegion,
}

impl IpcSession {
    pub fn new(
        endpoint: Endpoint,
        mem: &SharedMemory,
        layout: LayoutMap,
        bus: Arc<dyn MailboxBus>,
        config: &HubConfig,
    ) -> Result<Self, LayoutError> {
        let map = &layout.map;
        let g = &map.geometry;
        let mailbox = Mailbox::new(bus, endpoint);
        let notifier = Arc::new(Notifier::new());

        let event_channel = |dir: Direction| -> Result<Arc<EventChannel>, LayoutError> {
            Ok(Arc::new(EventChannel::new(
                map.evt[dir.index()].region(mem)?,
                g.evt_slots,
                mailbox.clone(),
                notifier.clone(),
                config.retry.clone(),
            )?))
        };
        let events = [
            event_channel(Direction::ApToHub)?,
            event_channel(Direction::HubToAp)?,
        ];
        let data_channel = |dir: Direction| -> Result<DataChannel, LayoutError> {
            Ok(DataChannel::new(
                map.data[dir.index()].region(mem)?,
                g.data_slots,
                g.packet_size,
                events[dir.index()].clone(),
                notifier.clone(),
                config.retry.clone(),
            )?)
        };
        let data = [
            data_channel(Direction::ApToHub)?,
            data_channel(Direction::HubToAp)?,
        ];

        let ap_sleep = map.ap_sleep.region(mem)?;
        let log_events = match endpoint {
            Endpoint::Hub => Some(events[Direction::HubToAp.index()].clone()),
            Endpoint::Ap => None,
        };
        let log = LogChannel::new(
            map.log.region(mem)?,
            ap_sleep.clone(),
            g.log_records,
            g.log_record_size,
            config.log.flush_threshold_pct,
            log_events,
        )?;

        Ok(IpcSession {
            endpoint,
            alive: AliveHandshake::new(mailbox.clone(), notifier.clone()),
            persist: PersistedBlock::new(map.persist.region(mem)?),
            debug: map.debug.region(mem)?,
            sensor: map.sensor.region(mem)?,
            ap_sleep,
            log,
            data,
            events,
            mailbox,
            notifier,
            layout,
        })
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn layout(&self) -> &LayoutMap {
        &self.layout
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Poked on every interrupt this endpoint handles.
    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn events(&self, dir: Direction) -> &EventChannel {
        &self.events[dir.index()]
    }

    pub fn data(&self, dir: Direction) -> &DataChannel {
        &self.data[dir.index()]
    }

    pub fn log(&self) -> &LogChannel {
        &self.log
    }

    pub fn alive(&self) -> &AliveHandshake {
        &self.alive
    }

    pub fn persist(&self) -> &PersistedBlock {
        &self.persist
    }

    /// Writes `payload` to this endpoint's outbound data channel.
    pub fn send(&self, payload: &[u8]) -> Result<(), DataError> {
        self.data(Direction::outbound(self.endpoint)).write(payload)
    }

    /// Copies the next inbound packet out of shared memory.
    pub fn recv(&self) -> Result<Option<Vec<u8>>, DataError> {
        Ok(self
            .data(Direction::inbound(self.endpoint))
            .read()?
            .map(|slot| slot.to_vec()))
    }

    /// Posts an event to the peer.
    pub fn post<C: Into<u32>>(&self, code: C) -> Result<(), EvtError> {
        self.events(Direction::outbound(self.endpoint)).enqueue(code)
    }

    /// Services this endpoint's pending mailbox lines: answers or completes
    /// alive handshakes and dequeues every inbound event. Never waits.
    pub fn handle_irq(&self) -> IrqReport {
        let mut report = IrqReport::default();
        let pending = self.mailbox.read_pending_mask();
        if pending == 0 {
            return report;
        }
        self.mailbox.clear_pending_mask(pending);

        let alive_bit = 1 << ALIVE_LINE;
        if pending & alive_bit != 0 {
            self.alive.on_irq();
            report.alive = true;
        }
        if pending & !alive_bit != 0 {
            let inbound = self.events(Direction::inbound(self.endpoint));
            loop {
                match inbound.dequeue() {
                    Ok(Some(desc)) => report.events.push(desc),
                    Ok(None) => break,
                    Err(err) => {
                        error!("inbound event ring: {err}");
                        report.faults.push(err.fault());
                        break;
                    }
                }
            }
            for _ in 0..inbound.take_integrity_errors() {
                report.faults.push(FaultKind::EventMalformed);
            }
        }
        self.notifier.notify_all();
        report
    }

    pub fn ap_sleep(&self) -> bool {
        self.ap_sleep.read_u32(0).map(|v| v != 0).unwrap_or(false)
    }

    pub fn set_ap_sleep(&self, asleep: bool) -> Result<(), MemError> {
        self.ap_sleep.write_u32(0, asleep as u32)
    }

    pub fn set_debug_value(&self, index: usize, value: u32) -> Result<(), MemError> {
        if index >= DEBUG_WORDS {
            return Err(MemError::OutOfBounds {
                offset: index * 4,
                len: 4,
                size: DEBUG_WORDS * 4,
            });
        }
        self.debug.write_u32(index * 4, value)
    }

    pub fn debug_values(&self) -> Vec<u32> {
        (0..DEBUG_WORDS)
            .map(|i| self.debug.read_u32(i * 4).unwrap_or(0))
            .collect()
    }

    /// Hub side. Publishes the opaque sensor descriptor table.
    pub fn write_sensor_table(&self, table: &[u8]) -> Result<(), MemError> {
        self.sensor.write_bytes(0, table)?;
        let rest = self.sensor.size() - table.len();
        self.sensor.fill(table.len(), rest, 0)
    }

    pub fn sensor_table(&self) -> Vec<u8> {
        self.sensor.to_vec()
    }

    /// AP side. Drains up to `max` hub log records into the `log` facade
    /// under target `hub`.
    pub fn drain_log(&self, max: u32) -> Result<u32, MemError> {
        self.log.flush_active(true)?;
        let drained = self.log.consumer_drain(
            |record| {
                log::log!(target: "hub", record.log_level(), "[{}] {}", record.seq, record.text)
            },
            max,
        );
        self.log.flush_active(false)?;
        drained
    }

    pub fn snapshot(&self) -> Snapshot {
        let ring = |dir: Direction| RingIndices::from(self.events(dir).indices());
        let data = |dir: Direction| RingIndices::from(self.data(dir).indices());
        Snapshot {
            evt: [ring(Direction::ApToHub), ring(Direction::HubToAp)],
            data: [data(Direction::ApToHub), data(Direction::HubToAp)],
            log: self.log.indices(),
            ap_sleep: self.ap_sleep(),
            boot_mode: self
                .persist
                .boot_mode()
                .map(u32::from)
                .unwrap_or(u32::MAX),
            log_level: self.persist.log_level().unwrap_or(u32::MAX),
        }
    }

    /// Posts the notification matching a changed AP sleep state.
    pub fn announce_ap_sleep(&self, asleep: bool) -> Result<(), EvtError> {
        self.post(if asleep {
            EventCode::ApSleep
        } else {
            EventCode::ApWake
        })
    }
}
