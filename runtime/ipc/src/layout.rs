// Licensed under the Apache-2.0 license

//! Boot descriptor parsing and IPC map area placement.
//!
//! The hub boot loader publishes a [`BootDescriptor`] at a fixed offset of
//! shared memory. The AP validates it, derives the region table and lays
//! out the IPC map area inside the IPC region. The map area starts with
//! the persisted block followed by an [`IpcMapHeader`] that the hub reads
//! back in [`attach`].

use crate::data::DataChannel;
use crate::error::LayoutError;
use crate::evt::EventChannel;
use crate::logbuf::LogChannel;
use crate::persist::PERSIST_SIZE;
use crate::shmem::{MemRegion, SharedMemory};
use hub_config::{HubConfig, HubMemoryMap, IpcGeometry};
use log::{debug, error, info};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const BOOT_MAGIC: [u8; 16] = *b"HUB_BOOT_DESC_V1";
pub const IPC_MAGIC: [u8; 16] = *b"HUB_IPC_MAP_AREA";
pub const IPC_VERSION: u32 = 0x0001_0003;

/// Words in the last-known debug value block.
pub const DEBUG_WORDS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct RawRegion {
    pub start: u32,
    pub end: u32,
}

impl RawRegion {
    fn new(offset: u32, size: u32) -> Self {
        RawRegion {
            start: offset,
            end: offset + size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct BootDescriptor {
    pub magic: [u8; 16],
    pub ipc_version: u32,
    pub flags: u32,
    pub bootloader: RawRegion,
    pub firmware: RawRegion,
    pub shared: RawRegion,
    pub ram: RawRegion,
    pub ipc: RawRegion,
    pub dump: RawRegion,
}

impl BootDescriptor {
    /// Descriptor a boot loader publishes for `map`.
    pub fn new(map: &HubMemoryMap) -> Self {
        BootDescriptor {
            magic: BOOT_MAGIC,
            ipc_version: IPC_VERSION,
            flags: 0,
            bootloader: RawRegion::new(map.bootloader_offset, map.bootloader_size),
            firmware: RawRegion::new(map.firmware_offset, map.firmware_size),
            shared: RawRegion::new(map.scratch_offset, map.scratch_size),
            ram: RawRegion::new(map.ram_offset, map.ram_size),
            ipc: RawRegion::new(map.ipc_offset, map.ipc_size),
            dump: RawRegion::new(map.dump_offset, map.dump_size),
        }
    }

    pub fn write_to(&self, mem: &SharedMemory, offset: usize) -> Result<(), LayoutError> {
        mem.whole().write_obj(offset, self)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct IpcMapHeader {
    pub magic: [u8; 16],
    pub version: u32,
    pub evt_slots: u32,
    pub data_slots: u32,
    pub packet_size: u32,
    pub log_records: u32,
    pub log_record_size: u32,
    pub sensor_table_size: u32,
    pub ap_sleep: u32,
    pub data: [u32; 2],
    pub evt: [u32; 2],
    pub debug: u32,
    pub sensor: u32,
    pub log: u32,
    pub total_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Bootloader,
    Firmware,
    SharedScratch,
    Ram,
    Ipc,
    Dump,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionDescriptor {
    pub kind: RegionKind,
    pub base: usize,
    pub size: usize,
}

/// Absolute byte range inside shared memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub base: usize,
    pub size: usize,
}

impl Span {
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    pub fn region(&self, mem: &SharedMemory) -> Result<MemRegion, LayoutError> {
        Ok(mem.region(self.base, self.size)?)
    }
}

/// Placement of every structure of the IPC map area. Channel arrays are
/// indexed by [`crate::Direction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcMapLayout {
    pub geometry: IpcGeometry,
    pub persist: Span,
    pub header: Span,
    pub ap_sleep: Span,
    pub data: [Span; 2],
    pub evt: [Span; 2],
    pub debug: Span,
    pub sensor: Span,
    pub log: Span,
}

impl IpcMapLayout {
    pub fn new(base: usize, geometry: &IpcGeometry) -> Self {
        let mut cursor = base;
        let mut take = |size: usize| {
            let span = Span { base: cursor, size };
            cursor += size.next_multiple_of(4);
            span
        };
        let g = geometry;
        let persist = take(PERSIST_SIZE);
        let header = take(core::mem::size_of::<IpcMapHeader>());
        let ap_sleep = take(4);
        let data_size = DataChannel::footprint(g.data_slots, g.packet_size);
        let data = [take(data_size), take(data_size)];
        let evt_size = EventChannel::footprint(g.evt_slots);
        let evt = [take(evt_size), take(evt_size)];
        let debug = take(DEBUG_WORDS * 4);
        let sensor = take(g.sensor_table_size as usize);
        let log = take(LogChannel::footprint(g.log_records, g.log_record_size));
        IpcMapLayout {
            geometry: g.clone(),
            persist,
            header,
            ap_sleep,
            data,
            evt,
            debug,
            sensor,
            log,
        }
    }

    pub fn base(&self) -> usize {
        self.persist.base
    }

    pub fn total_size(&self) -> usize {
        self.log.end() - self.base()
    }

    fn header_value(&self) -> IpcMapHeader {
        let rel = |span: &Span| (span.base - self.base()) as u32;
        let g = &self.geometry;
        IpcMapHeader {
            magic: IPC_MAGIC,
            version: IPC_VERSION,
            evt_slots: g.evt_slots,
            data_slots: g.data_slots,
            packet_size: g.packet_size,
            log_records: g.log_records,
            log_record_size: g.log_record_size,
            sensor_table_size: g.sensor_table_size,
            ap_sleep: rel(&self.ap_sleep),
            data: [rel(&self.data[0]), rel(&self.data[1])],
            evt: [rel(&self.evt[0]), rel(&self.evt[1])],
            debug: rel(&self.debug),
            sensor: rel(&self.sensor),
            log: rel(&self.log),
            total_size: self.total_size() as u32,
        }
    }
}

/// Result of a successful negotiation: the region table plus the IPC map
/// area placement, all in absolute shared memory offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutMap {
    pub bootloader: RegionDescriptor,
    pub firmware: RegionDescriptor,
    pub shared: RegionDescriptor,
    pub ram: RegionDescriptor,
    pub ipc: RegionDescriptor,
    pub dump: RegionDescriptor,
    pub map: IpcMapLayout,
}

impl LayoutMap {
    pub fn regions(&self) -> [RegionDescriptor; 6] {
        [
            self.bootloader,
            self.firmware,
            self.shared,
            self.ram,
            self.ipc,
            self.dump,
        ]
    }
}

fn read_descriptor(
    mem: &SharedMemory,
    map: &HubMemoryMap,
) -> Result<[RegionDescriptor; 6], LayoutError> {
    let desc: BootDescriptor = mem.whole().read_obj(map.boot_desc_offset as usize)?;
    if desc.magic != BOOT_MAGIC {
        error!("boot descriptor magic mismatch: {:02x?}", desc.magic);
        return Err(LayoutError::BadMagic);
    }
    if desc.ipc_version != IPC_VERSION {
        return Err(LayoutError::VersionMismatch {
            expected: IPC_VERSION,
            found: desc.ipc_version,
        });
    }
    let raw = [
        (RegionKind::Bootloader, desc.bootloader),
        (RegionKind::Firmware, desc.firmware),
        (RegionKind::SharedScratch, desc.shared),
        (RegionKind::Ram, desc.ram),
        (RegionKind::Ipc, desc.ipc),
        (RegionKind::Dump, desc.dump),
    ];
    let mut regions = [RegionDescriptor {
        kind: RegionKind::Bootloader,
        base: 0,
        size: 0,
    }; 6];
    for (slot, (kind, r)) in regions.iter_mut().zip(raw) {
        if r.start > r.end || r.end as usize > mem.len() {
            return Err(LayoutError::InvalidRegion(kind));
        }
        *slot = RegionDescriptor {
            kind,
            base: r.start as usize,
            size: (r.end - r.start) as usize,
        };
    }
    Ok(regions)
}

fn layout_map(regions: [RegionDescriptor; 6], map: IpcMapLayout) -> LayoutMap {
    let [bootloader, firmware, shared, ram, ipc, dump] = regions;
    LayoutMap {
        bootloader,
        firmware,
        shared,
        ram,
        ipc,
        dump,
        map,
    }
}

/// AP side: validate the boot descriptor and initialize the IPC map area.
///
/// Rings, flags and tables are zeroed and the header is stamped. The
/// persisted block at the start of the map area is left untouched, so a
/// call after a soft reset keeps boot mode and log level.
pub fn negotiate(mem: &SharedMemory, config: &HubConfig) -> Result<LayoutMap, LayoutError> {
    let regions = read_descriptor(mem, &config.memory_map)?;
    let ipc = regions[4];
    let map = IpcMapLayout::new(ipc.base, &config.geometry);
    if map.total_size() > ipc.size {
        return Err(LayoutError::RegionTooSmall {
            required: map.total_size(),
            available: ipc.size,
        });
    }

    let area = mem.region(map.header.base, map.log.end() - map.header.base)?;
    area.fill(0, area.size(), 0)?;
    area.write_obj(0, &map.header_value())?;

    info!(
        "IPC map area at 0x{:x}, 0x{:x} of 0x{:x} bytes used",
        map.base(),
        map.total_size(),
        ipc.size
    );
    Ok(layout_map(regions, map))
}

/// Hub side: validate the boot descriptor and read the map area placement
/// stamped by [`negotiate`].
pub fn attach(mem: &SharedMemory, config: &HubConfig) -> Result<LayoutMap, LayoutError> {
    let regions = read_descriptor(mem, &config.memory_map)?;
    let ipc = regions[4];
    let header: IpcMapHeader = mem.whole().read_obj(ipc.base + PERSIST_SIZE)?;
    if header.magic != IPC_MAGIC {
        error!("IPC map area magic mismatch");
        return Err(LayoutError::BadMagic);
    }
    if header.version != IPC_VERSION {
        return Err(LayoutError::VersionMismatch {
            expected: IPC_VERSION,
            found: header.version,
        });
    }
    if header.total_size as usize > ipc.size {
        return Err(LayoutError::RegionTooSmall {
            required: header.total_size as usize,
            available: ipc.size,
        });
    }

    let geometry = IpcGeometry {
        evt_slots: header.evt_slots,
        data_slots: header.data_slots,
        packet_size: header.packet_size,
        log_records: header.log_records,
        log_record_size: header.log_record_size,
        sensor_table_size: header.sensor_table_size,
    };
    if geometry.evt_slots < 2
        || geometry.data_slots < 2
        || geometry.log_records < 2
        || geometry.packet_size == 0
        || geometry.log_record_size == 0
    {
        return Err(LayoutError::InvalidGeometry);
    }
    let at = |rel: u32, size: usize| Span {
        base: ipc.base + rel as usize,
        size,
    };
    let data_size = DataChannel::footprint(geometry.data_slots, geometry.packet_size);
    let evt_size = EventChannel::footprint(geometry.evt_slots);
    let map = IpcMapLayout {
        persist: Span {
            base: ipc.base,
            size: PERSIST_SIZE,
        },
        header: at(PERSIST_SIZE as u32, core::mem::size_of::<IpcMapHeader>()),
        ap_sleep: at(header.ap_sleep, 4),
        data: [at(header.data[0], data_size), at(header.data[1], data_size)],
        evt: [at(header.evt[0], evt_size), at(header.evt[1], evt_size)],
        debug: at(header.debug, DEBUG_WORDS * 4),
        sensor: at(header.sensor, geometry.sensor_table_size as usize),
        log: at(
            header.log,
            LogChannel::footprint(geometry.log_records, geometry.log_record_size),
        ),
        geometry,
    };
    if map.log.end() > ipc.base + ipc.size {
        return Err(LayoutError::RegionTooSmall {
            required: map.log.end() - ipc.base,
            available: ipc.size,
        });
    }
    debug!("attached to IPC map area at 0x{:x}", ipc.base);
    Ok(layout_map(regions, map))
}
