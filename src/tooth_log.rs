//! Tooth and composite logging.
//!
//! A fixed ring the edge handlers write into and the telemetry reader
//! drains. Two mutually exclusive modes:
//!
//! * tooth mode records the accepted primary gap (microseconds) per entry;
//! * composite mode records the absolute edge time plus a bit-packed sample
//!   of both input levels, whether the entry came from a cam edge, and
//!   whether sync was held.
//!
//! When the ring fills, `ready` latches and writes stop until the reader
//! drains and clears. The drained byte layout is part of the telemetry
//! contract and must not change shape.

use bitflags::bitflags;
use byteorder::{LittleEndian, WriteBytesExt};

pub const TOOTH_LOG_SIZE: usize = 127;

bitflags! {
    /// Per-entry flag byte in composite mode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CompositeFlags: u8 {
        const PRI_LEVEL = 0b0000_0001;
        const SEC_LEVEL = 0b0000_0010;
        const CAM_EDGE = 0b0000_0100;
        const SYNC = 0b0000_1000;
    }
}

/// Which wheel an entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeSource {
    Crank,
    CamSecondary,
    CamTertiary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum LogMode {
    #[default]
    Off,
    Tooth,
    Composite,
}

pub struct ToothLogger {
    mode: LogMode,
    tooth_history: [u32; TOOTH_LOG_SIZE],
    composite_history: [u8; TOOTH_LOG_SIZE],
    index: usize,
    ready: bool,
}

impl ToothLogger {
    pub fn new(mode: LogMode) -> Self {
        ToothLogger {
            mode,
            tooth_history: [0; TOOTH_LOG_SIZE],
            composite_history: [0; TOOTH_LOG_SIZE],
            index: 0,
            ready: false,
        }
    }

    pub fn mode(&self) -> LogMode {
        self.mode
    }

    /// Switch modes, discarding anything buffered.
    pub fn set_mode(&mut self, mode: LogMode) {
        self.mode = mode;
        self.clear();
    }

    /// Record one entry. `value` is the accepted gap in tooth mode and the
    /// absolute edge time in composite mode. Frozen while `ready`.
    pub fn record(
        &mut self,
        value: u32,
        source: EdgeSource,
        pri_level: bool,
        sec_level: bool,
        has_sync: bool,
    ) {
        if self.ready {
            return;
        }

        let logged = match self.mode {
            LogMode::Off => false,
            LogMode::Tooth => {
                // Tooth mode only tracks the crank wheel.
                if source == EdgeSource::Crank {
                    self.tooth_history[self.index] = value;
                    true
                } else {
                    false
                }
            }
            LogMode::Composite => {
                let mut flags = CompositeFlags::empty();
                flags.set(CompositeFlags::PRI_LEVEL, pri_level);
                flags.set(CompositeFlags::SEC_LEVEL, sec_level);
                flags.set(CompositeFlags::CAM_EDGE, source != EdgeSource::Crank);
                flags.set(CompositeFlags::SYNC, has_sync);
                self.composite_history[self.index] = flags.bits();
                self.tooth_history[self.index] = value;
                true
            }
        };

        if logged {
            if self.index < TOOTH_LOG_SIZE - 1 {
                self.index += 1;
            } else {
                self.ready = true;
            }
        }
    }

    /// Buffer has filled and is frozen awaiting a drain.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn len(&self) -> usize {
        if self.ready {
            TOOTH_LOG_SIZE
        } else {
            self.index
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reset the ring and release the freeze.
    pub fn clear(&mut self) {
        self.index = 0;
        self.ready = false;
    }

    /// Serialize buffered entries little-endian for the telemetry reader,
    /// then clear. Tooth mode: `u32` gap per entry. Composite mode: `u32`
    /// time followed by the flag byte per entry.
    pub fn drain(&mut self) -> Vec<u8> {
        let count = self.len();
        let mut out = Vec::with_capacity(count * 5);
        for i in 0..count {
            // Vec writes cannot fail.
            out.write_u32::<LittleEndian>(self.tooth_history[i]).unwrap();
            if self.mode == LogMode::Composite {
                out.write_u8(self.composite_history[i]).unwrap();
            }
        }
        self.clear();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{ByteOrder, LittleEndian};

    #[test]
    fn test_tooth_mode_records_crank_only() {
        let mut log = ToothLogger::new(LogMode::Tooth);
        log.record(5000, EdgeSource::Crank, true, false, false);
        log.record(123, EdgeSource::CamSecondary, false, true, false);
        log.record(5100, EdgeSource::Crank, true, false, false);
        assert_eq!(log.len(), 2);

        let bytes = log.drain();
        assert_eq!(bytes.len(), 8);
        assert_eq!(LittleEndian::read_u32(&bytes[0..4]), 5000);
        assert_eq!(LittleEndian::read_u32(&bytes[4..8]), 5100);
    }

    #[test]
    fn test_composite_mode_packs_flags() {
        let mut log = ToothLogger::new(LogMode::Composite);
        log.record(999, EdgeSource::CamSecondary, true, true, true);
        let bytes = log.drain();
        assert_eq!(bytes.len(), 5);
        assert_eq!(LittleEndian::read_u32(&bytes[0..4]), 999);
        let flags = CompositeFlags::from_bits_truncate(bytes[4]);
        assert!(flags.contains(CompositeFlags::PRI_LEVEL));
        assert!(flags.contains(CompositeFlags::SEC_LEVEL));
        assert!(flags.contains(CompositeFlags::CAM_EDGE));
        assert!(flags.contains(CompositeFlags::SYNC));
    }

    #[test]
    fn test_ready_latches_and_freezes() {
        let mut log = ToothLogger::new(LogMode::Tooth);
        for i in 0..TOOTH_LOG_SIZE {
            log.record(i as u32, EdgeSource::Crank, false, false, false);
        }
        assert!(log.is_ready());
        assert_eq!(log.len(), TOOTH_LOG_SIZE);

        // Further writes are dropped until cleared.
        log.record(0xDEAD, EdgeSource::Crank, false, false, false);
        let bytes = log.drain();
        assert_eq!(bytes.len(), TOOTH_LOG_SIZE * 4);
        assert_eq!(
            LittleEndian::read_u32(&bytes[(TOOTH_LOG_SIZE - 1) * 4..]),
            (TOOTH_LOG_SIZE - 1) as u32
        );
        assert!(!log.is_ready());
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn test_off_mode_records_nothing() {
        let mut log = ToothLogger::new(LogMode::Off);
        log.record(5000, EdgeSource::Crank, false, false, false);
        assert!(log.is_empty());
    }
}
