// Licensed under the Apache-2.0 license

//! Error classes reported to the lifecycle and their reset thresholds.

use hub_config::ErrorThresholds;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    BusFault,
    AccessViolation,
    FwFault,
    Watchdog,
    HubReboot,
    NoResponse,
    /// Catch-all for corruption; always resets on first occurrence.
    Critical,
    EventMalformed,
    EventLost,
    ReadFail,
    WriteFail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Critical,
    Major,
    Minor,
}

impl FaultKind {
    pub const ALL: [FaultKind; 11] = [
        FaultKind::BusFault,
        FaultKind::AccessViolation,
        FaultKind::FwFault,
        FaultKind::Watchdog,
        FaultKind::HubReboot,
        FaultKind::NoResponse,
        FaultKind::Critical,
        FaultKind::EventMalformed,
        FaultKind::EventLost,
        FaultKind::ReadFail,
        FaultKind::WriteFail,
    ];

    pub fn severity(self) -> Severity {
        match self {
            FaultKind::BusFault
            | FaultKind::AccessViolation
            | FaultKind::FwFault
            | FaultKind::Watchdog
            | FaultKind::HubReboot
            | FaultKind::NoResponse
            | FaultKind::Critical => Severity::Critical,
            FaultKind::EventMalformed | FaultKind::EventLost => Severity::Major,
            FaultKind::ReadFail | FaultKind::WriteFail => Severity::Minor,
        }
    }

    pub fn threshold(self, thresholds: &ErrorThresholds) -> u32 {
        match self.severity() {
            Severity::Critical => thresholds.critical,
            Severity::Major => thresholds.major,
            Severity::Minor => thresholds.minor,
        }
    }
}

/// Occurrence count per [`FaultKind`] since the last successful reset.
#[derive(Default)]
pub struct FaultCounters {
    counts: [AtomicU32; FaultKind::ALL.len()],
}

impl FaultCounters {
    /// Counts one occurrence and returns the new total.
    pub fn bump(&self, kind: FaultKind) -> u32 {
        self.counts[kind as usize].fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self, kind: FaultKind) -> u32 {
        self.counts[kind as usize].load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        for count in &self.counts {
            count.store(0, Ordering::SeqCst);
        }
    }

    pub fn snapshot(&self) -> Vec<(FaultKind, u32)> {
        FaultKind::ALL
            .iter()
            .map(|&kind| (kind, self.get(kind)))
            .filter(|&(_, count)| count != 0)
            .collect()
    }
}
