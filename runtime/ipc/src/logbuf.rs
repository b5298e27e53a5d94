// Licensed under the Apache-2.0 license

//! Log channel: text records produced by the hub and drained by the AP.
//!
//! The producer never blocks. When the ring is full it keeps writing over
//! the oldest unread record and counts the overwrite, except while a drain
//! is active: then new records are discarded so the consumer's snapshot
//! stays intact.
//!
//! Every header word has a single writer. The hub owns `EQ`, `NEXT_SEQ`,
//! `OVERWRITE` and raises `FLUSH_REQ`; the AP owns `DQ`, `DQ_SEQ`, `DROP`
//! and `FLUSH_ACTIVE`, and clears `FLUSH_REQ` once a drain ends. Fullness
//! is derived from the two sequence counters.

use crate::error::MemError;
use crate::evt::{EventChannel, EventCode};
use crate::shmem::MemRegion;
use log::{debug, error, warn, Level};
use std::sync::{Arc, Mutex};

const EQ: usize = 0x00;
const DQ: usize = 0x04;
const CAPACITY: usize = 0x08;
const DQ_SEQ: usize = 0x0c;
const FLUSH_REQ: usize = 0x10;
const FLUSH_ACTIVE: usize = 0x14;
const OVERWRITE: usize = 0x18;
const DROP: usize = 0x1c;
const NEXT_SEQ: usize = 0x20;
const HEADER_SIZE: usize = 0x30;

const REC_SEQ: usize = 0;
const REC_LEN: usize = 4;
const REC_LEVEL: usize = 8;
const REC_TEXT: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub seq: u32,
    pub level: u32,
    pub text: String,
}

impl LogRecord {
    pub fn log_level(&self) -> Level {
        match self.level {
            0 | 1 => Level::Error,
            2 => Level::Warn,
            3 => Level::Info,
            4 => Level::Debug,
            _ => Level::Trace,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogIndices {
    pub enqueue: u32,
    pub dequeue: u32,
    pub full: bool,
    pub overwrite_count: u32,
    pub drop_count: u32,
}

pub struct LogChannel {
    region: MemRegion,
    ap_sleep: MemRegion,
    capacity: u32,
    record_size: usize,
    flush_threshold_pct: u32,
    events: Option<Arc<EventChannel>>,
    producer: Mutex<()>,
    consumer: Mutex<()>,
}

impl LogChannel {
    fn stride(record_size: u32) -> usize {
        REC_TEXT + (record_size as usize).next_multiple_of(4)
    }

    pub fn footprint(records: u32, record_size: u32) -> usize {
        HEADER_SIZE + records as usize * Self::stride(record_size)
    }

    /// `events` is the outbound event channel used to ask for a flush; only
    /// the producer side needs it.
    pub fn new(
        region: MemRegion,
        ap_sleep: MemRegion,
        capacity: u32,
        record_size: u32,
        flush_threshold_pct: u32,
        events: Option<Arc<EventChannel>>,
    ) -> Result<Self, MemError> {
        let required = Self::footprint(capacity, record_size);
        if capacity < 2 || region.size() < required {
            return Err(MemError::OutOfBounds {
                offset: region.base(),
                len: required,
                size: region.size(),
            });
        }
        region.write_u32(CAPACITY, capacity)?;
        Ok(LogChannel {
            region,
            ap_sleep,
            capacity,
            record_size: record_size as usize,
            flush_threshold_pct,
            events,
            producer: Mutex::new(()),
            consumer: Mutex::new(()),
        })
    }

    fn record(&self, index: u32) -> usize {
        HEADER_SIZE + index as usize * Self::stride(self.record_size as u32)
    }

    fn bump(&self, offset: usize, by: u32) -> Result<(), MemError> {
        let value = self.region.read_u32(offset)?;
        self.region.write_u32(offset, value.wrapping_add(by))
    }

    fn ap_asleep(&self) -> bool {
        self.ap_sleep.read_u32(0).map(|v| v != 0).unwrap_or(false)
    }

    /// Records written but not yet drained, as seen from the counters.
    /// May exceed the capacity when records were overwritten.
    fn unread(&self) -> Result<u32, MemError> {
        let next = self.region.read_u32(NEXT_SEQ)?;
        let dq_seq = self.region.read_u32(DQ_SEQ)?;
        Ok(next.wrapping_sub(dq_seq))
    }

    fn check_flush(&self, unread: u32) -> Result<(), MemError> {
        let used = unread.min(self.capacity);
        if used * 100 >= self.flush_threshold_pct * self.capacity {
            self.request_flush()?;
        }
        Ok(())
    }

    /// Hub side. Appends a record, overwriting the oldest unread one if the
    /// ring is full. Text longer than a record is truncated.
    pub fn producer_emit(&self, level: u32, text: &str) -> Result<(), MemError> {
        let _guard = self.producer.lock().unwrap();
        let unread = self.unread()?;
        let full = unread >= self.capacity && unread < u32::MAX / 2;
        if full && self.is_flush_active() {
            debug!("log ring full during a drain, record discarded");
            self.bump(OVERWRITE, 1)?;
            return self.check_flush(unread);
        }

        let seq = self.region.read_u32(NEXT_SEQ)?;
        let slot = seq % self.capacity;
        let bytes = text.as_bytes();
        let len = bytes.len().min(self.record_size);
        let rec = self.record(slot);
        // The sequence number goes first so a concurrent reader notices
        // the slot changing under it.
        self.region.write_u32(rec + REC_SEQ, seq)?;
        self.region.write_u32(rec + REC_LEN, len as u32)?;
        self.region.write_u32(rec + REC_LEVEL, level)?;
        self.region.write_bytes(rec + REC_TEXT, &bytes[..len])?;

        if full {
            self.bump(OVERWRITE, 1)?;
        }
        let next = seq.wrapping_add(1);
        self.region.write_u32(EQ, next % self.capacity)?;
        self.region.write_u32(NEXT_SEQ, next)?;
        self.check_flush(unread.wrapping_add(1))
    }

    /// Hub side. Asks the AP to drain the ring. Only one request is
    /// outstanding at a time, and no event is sent while the AP sleeps;
    /// the latched request is picked up when it wakes.
    pub fn request_flush(&self) -> Result<bool, MemError> {
        if self.region.read_u32(FLUSH_REQ)? != 0 {
            return Ok(false);
        }
        self.region.write_u32(FLUSH_REQ, 1)?;
        if self.ap_asleep() {
            debug!("log flush latched while the AP sleeps");
            return Ok(false);
        }
        if let Some(events) = &self.events {
            if let Err(err) = events.try_enqueue(EventCode::LogFlush) {
                warn!("log flush request not sent: {err}");
                self.region.write_u32(FLUSH_REQ, 0)?;
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// AP side. Marks a drain in progress. Ending the drain clears the
    /// outstanding flush request.
    pub fn flush_active(&self, on: bool) -> Result<(), MemError> {
        self.region.write_u32(FLUSH_ACTIVE, on as u32)?;
        if !on {
            self.region.write_u32(FLUSH_REQ, 0)?;
        }
        Ok(())
    }

    fn lapped(&self, seq: u32) -> Result<bool, MemError> {
        let next = self.region.read_u32(NEXT_SEQ)?;
        Ok(next.wrapping_sub(seq) > self.capacity)
    }

    fn set_dequeue(&self, dq_seq: u32) -> Result<(), MemError> {
        self.region.write_u32(DQ, dq_seq % self.capacity)?;
        self.region.write_u32(DQ_SEQ, dq_seq)
    }

    /// AP side. Hands up to `max` records to `sink` and returns how many
    /// were delivered. The end of the ring is sampled once, so records
    /// produced meanwhile are left for the next drain.
    ///
    /// A corrupt dequeue index discards every unread record.
    pub fn consumer_drain<F>(&self, mut sink: F, max: u32) -> Result<u32, MemError>
    where
        F: FnMut(LogRecord),
    {
        let _guard = self.consumer.lock().unwrap();
        let was_active = self.is_flush_active();
        if !was_active {
            self.region.write_u32(FLUSH_ACTIVE, 1)?;
        }
        let drained = self.drain_locked(&mut sink, max);
        if !was_active {
            self.region.write_u32(FLUSH_ACTIVE, 0)?;
        }
        drained
    }

    fn drain_locked<F>(&self, sink: &mut F, max: u32) -> Result<u32, MemError>
    where
        F: FnMut(LogRecord),
    {
        let end = self.region.read_u32(NEXT_SEQ)?;
        let mut seq = self.region.read_u32(DQ_SEQ)?;
        let dq = self.region.read_u32(DQ)?;
        let unread = end.wrapping_sub(seq);
        if dq >= self.capacity || dq != seq % self.capacity || unread >= u32::MAX / 2 {
            error!(
                "log ring indices corrupt (dq {dq}, seq {seq}, end {end}), \
                 discarding unread records"
            );
            self.bump(DROP, unread.min(self.capacity))?;
            self.set_dequeue(end)?;
            return Ok(0);
        }
        if unread > self.capacity {
            let lost = unread - self.capacity;
            warn!("{lost} hub log records lost before {}", seq.wrapping_add(lost));
            self.bump(DROP, lost)?;
            seq = seq.wrapping_add(lost);
        }

        let mut delivered = 0;
        let mut buf = vec![0u8; self.record_size];
        while seq != end && delivered < max {
            let rec = self.record(seq % self.capacity);
            let found = self.region.read_u32(rec + REC_SEQ)?;
            if found != seq {
                if self.lapped(seq)? {
                    // Overwritten since the snapshot; the next drain counts it.
                    break;
                }
                error!("log slot for record {seq} holds record {found}, dropping it");
                self.bump(DROP, 1)?;
                seq = seq.wrapping_add(1);
                continue;
            }
            let len = self.region.read_u32(rec + REC_LEN)? as usize;
            let level = self.region.read_u32(rec + REC_LEVEL)?;
            if len > self.record_size {
                error!("log record {seq} declares {len} bytes, dropping it");
                self.bump(DROP, 1)?;
                seq = seq.wrapping_add(1);
                continue;
            }
            self.region.read_bytes(rec + REC_TEXT, &mut buf[..len])?;
            if self.region.read_u32(rec + REC_SEQ)? != seq {
                break;
            }
            sink(LogRecord {
                seq,
                level,
                text: String::from_utf8_lossy(&buf[..len]).into_owned(),
            });
            delivered += 1;
            seq = seq.wrapping_add(1);
        }

        self.set_dequeue(seq)?;
        Ok(delivered)
    }

    pub fn flush_requested(&self) -> bool {
        self.region.read_u32(FLUSH_REQ).map(|v| v != 0).unwrap_or(false)
    }

    pub fn is_flush_active(&self) -> bool {
        self.region
            .read_u32(FLUSH_ACTIVE)
            .map(|v| v != 0)
            .unwrap_or(false)
    }

    pub fn overwrite_count(&self) -> u32 {
        self.region.read_u32(OVERWRITE).unwrap_or(0)
    }

    pub fn drop_count(&self) -> u32 {
        self.region.read_u32(DROP).unwrap_or(0)
    }

    pub fn indices(&self) -> LogIndices {
        let word = |offset| self.region.read_u32(offset).unwrap_or(u32::MAX);
        LogIndices {
            enqueue: word(EQ),
            dequeue: word(DQ),
            full: self
                .unread()
                .map(|n| n >= self.capacity && n < u32::MAX / 2)
                .unwrap_or(false),
            overwrite_count: word(OVERWRITE),
            drop_count: word(DROP),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::{Endpoint, Mailbox};
    use crate::shmem::SharedMemory;
    use crate::testutil::TestBus;
    use crate::wait::Notifier;
    use hub_config::RetryConfig;

    const RECORD: u32 = 24;

    struct Fixture {
        mem: SharedMemory,
        ap_sleep: MemRegion,
        events: Arc<EventChannel>,
        log: LogChannel,
    }

    fn fixture(records: u32) -> Fixture {
        let log_size = LogChannel::footprint(records, RECORD);
        let evt_size = EventChannel::footprint(16);
        let mem = SharedMemory::new(log_size + evt_size + 4);
        let events = Arc::new(
            EventChannel::new(
                mem.region(log_size, evt_size).unwrap(),
                16,
                Mailbox::new(TestBus::new(), Endpoint::Hub),
                Arc::new(Notifier::new()),
                RetryConfig::default(),
            )
            .unwrap(),
        );
        let ap_sleep = mem.region(log_size + evt_size, 4).unwrap();
        let log = LogChannel::new(
            mem.region(0, log_size).unwrap(),
            ap_sleep.clone(),
            records,
            RECORD,
            50,
            Some(events.clone()),
        )
        .unwrap();
        Fixture {
            mem,
            ap_sleep,
            events,
            log,
        }
    }

    fn drain(log: &LogChannel, max: u32) -> Vec<LogRecord> {
        let mut out = Vec::new();
        log.consumer_drain(|r| out.push(r), max).unwrap();
        out
    }

    fn seqs(records: &[LogRecord]) -> Vec<u32> {
        records.iter().map(|r| r.seq).collect()
    }

    #[test]
    fn test_emit_and_drain() {
        let f = fixture(8);
        f.log.producer_emit(3, "sensor hub up").unwrap();
        f.log.producer_emit(1, "accel self-test failed").unwrap();
        let records = drain(&f.log, 32);
        assert_eq!(seqs(&records), [0, 1]);
        assert_eq!(records[0].text, "sensor hub up");
        assert_eq!(records[0].log_level(), Level::Info);
        assert_eq!(records[1].log_level(), Level::Error);
        assert!(drain(&f.log, 32).is_empty());
    }

    #[test]
    fn test_drain_respects_max() {
        let f = fixture(8);
        for i in 0..3 {
            f.log.producer_emit(3, &format!("record {i}")).unwrap();
        }
        assert_eq!(seqs(&drain(&f.log, 2)), [0, 1]);
        assert_eq!(seqs(&drain(&f.log, 2)), [2]);
        assert_eq!(f.log.drop_count(), 0);
    }

    #[test]
    fn test_long_text_truncated() {
        let f = fixture(8);
        f.log.producer_emit(3, &"x".repeat(100)).unwrap();
        assert_eq!(drain(&f.log, 1)[0].text.len(), RECORD as usize);
    }

    #[test]
    fn test_overwrite_when_full() {
        let f = fixture(4);
        for i in 0..6 {
            f.log.producer_emit(3, &format!("record {i}")).unwrap();
        }
        assert_eq!(f.log.overwrite_count(), 2);
        assert!(f.log.indices().full);

        let records = drain(&f.log, 32);
        assert_eq!(seqs(&records), [2, 3, 4, 5]);
        assert_eq!(records[3].text, "record 5");
        let indices = f.log.indices();
        assert!(!indices.full);
        assert_eq!(indices.enqueue, indices.dequeue);
        assert_eq!(indices.drop_count, 2);
    }

    #[test]
    fn test_exactly_full_ring_drained() {
        let f = fixture(4);
        for i in 0..4 {
            f.log.producer_emit(3, &format!("record {i}")).unwrap();
        }
        assert!(f.log.indices().full);
        assert_eq!(seqs(&drain(&f.log, 32)), [0, 1, 2, 3]);
        assert_eq!(f.log.overwrite_count(), 0);
        assert_eq!(f.log.drop_count(), 0);
        assert!(!f.log.indices().full);
    }

    #[test]
    fn test_records_emitted_during_drain_wait_for_next_drain() {
        let f = fixture(8);
        for i in 0..4 {
            f.log.producer_emit(3, &format!("before {i}")).unwrap();
        }
        let mut first = Vec::new();
        f.log
            .consumer_drain(
                |r| {
                    if r.seq == 0 {
                        for i in 0..3 {
                            f.log.producer_emit(3, &format!("during {i}")).unwrap();
                        }
                    }
                    first.push(r.seq);
                },
                32,
            )
            .unwrap();
        assert_eq!(first, [0, 1, 2, 3]);
        assert_eq!(seqs(&drain(&f.log, 32)), [4, 5, 6]);
        assert_eq!(f.log.drop_count(), 0);
    }

    #[test]
    fn test_full_ring_not_overwritten_during_drain() {
        let f = fixture(4);
        for i in 0..4 {
            f.log.producer_emit(3, &format!("before {i}")).unwrap();
        }
        let mut first = Vec::new();
        f.log
            .consumer_drain(
                |r| {
                    if r.seq == 0 {
                        assert!(f.log.is_flush_active());
                        for i in 0..3 {
                            f.log.producer_emit(3, &format!("during {i}")).unwrap();
                        }
                    }
                    first.push(r.seq);
                },
                32,
            )
            .unwrap();
        assert_eq!(first, [0, 1, 2, 3]);
        assert_eq!(f.log.overwrite_count(), 3);
        assert!(!f.log.is_flush_active());
        assert!(drain(&f.log, 32).is_empty());

        f.log.producer_emit(3, "after").unwrap();
        assert_eq!(seqs(&drain(&f.log, 32)), [4]);
    }

    #[test]
    fn test_overwrite_racing_drain_is_not_read_twice() {
        let f = fixture(4);
        for i in 0..4 {
            f.log.producer_emit(3, &format!("before {i}")).unwrap();
        }
        let mut delivered = Vec::new();
        f.log
            .consumer_drain(
                |r| {
                    if r.seq == 0 {
                        // A producer that missed the drain flag.
                        f.mem.whole().write_u32(FLUSH_ACTIVE, 0).unwrap();
                        for i in 0..3 {
                            f.log.producer_emit(3, &format!("during {i}")).unwrap();
                        }
                    }
                    delivered.push(r.seq);
                },
                32,
            )
            .unwrap();
        assert_eq!(delivered, [0]);

        delivered.extend(seqs(&drain(&f.log, 32)));
        assert_eq!(delivered, [0, 3, 4, 5, 6]);
        assert_eq!(f.log.drop_count(), 2);
    }

    #[test]
    fn test_stale_slot_dropped() {
        let f = fixture(8);
        f.log.producer_emit(3, "stale").unwrap();
        f.log.producer_emit(3, "good").unwrap();
        f.mem
            .whole()
            .write_u32(f.log.record(0) + REC_SEQ, 0x1234)
            .unwrap();
        assert_eq!(seqs(&drain(&f.log, 32)), [1]);
        assert_eq!(f.log.drop_count(), 1);
    }

    #[test]
    fn test_lost_records_counted() {
        let f = fixture(4);
        f.log.producer_emit(3, "first").unwrap();
        assert_eq!(seqs(&drain(&f.log, 32)), [0]);
        for i in 1..=6 {
            f.log.producer_emit(3, &format!("record {i}")).unwrap();
        }
        assert_eq!(seqs(&drain(&f.log, 32)), [3, 4, 5, 6]);
        assert_eq!(f.log.overwrite_count(), 2);
        assert_eq!(f.log.drop_count(), 2);
    }

    #[test]
    fn test_corrupt_indices_reset() {
        let f = fixture(8);
        f.log.producer_emit(3, "lost").unwrap();
        f.mem.whole().write_u32(DQ, 77).unwrap();
        assert!(drain(&f.log, 32).is_empty());
        let indices = f.log.indices();
        assert_eq!(indices.enqueue, indices.dequeue);
        assert_eq!(indices.drop_count, 1);

        f.log.producer_emit(3, "after reset").unwrap();
        let records = drain(&f.log, 32);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text, "after reset");
    }

    #[test]
    fn test_bad_record_length_dropped() {
        let f = fixture(8);
        f.log.producer_emit(3, "bad").unwrap();
        f.log.producer_emit(3, "good").unwrap();
        f.mem
            .whole()
            .write_u32(f.log.record(0) + REC_LEN, 4096)
            .unwrap();
        let records = drain(&f.log, 32);
        assert_eq!(seqs(&records), [1]);
        assert_eq!(f.log.drop_count(), 1);
    }

    #[test]
    fn test_flush_request_latched() {
        let f = fixture(8);
        for _ in 0..3 {
            f.log.producer_emit(3, "below threshold").unwrap();
        }
        assert!(!f.log.flush_requested());
        f.log.producer_emit(3, "at threshold").unwrap();
        f.log.producer_emit(3, "above threshold").unwrap();
        assert!(f.log.flush_requested());
        assert_eq!(f.events.len().unwrap(), 1);
        assert_eq!(
            f.events.dequeue().unwrap().unwrap().event(),
            Ok(EventCode::LogFlush)
        );

        f.log.flush_active(true).unwrap();
        assert!(f.log.is_flush_active());
        assert_eq!(drain(&f.log, 32).len(), 5);
        f.log.flush_active(false).unwrap();
        assert!(!f.log.flush_requested());
    }

    #[test]
    fn test_flush_suppressed_while_ap_sleeps() {
        let f = fixture(8);
        f.ap_sleep.write_u32(0, 1).unwrap();
        for _ in 0..6 {
            f.log.producer_emit(3, "while asleep").unwrap();
        }
        assert!(f.log.flush_requested());
        assert!(f.events.is_empty().unwrap());
    }
}
