//! Shared decoder state.
//!
//! In the firmware this lives as `volatile` globals written by the edge ISRs
//! and read by the mainline under `noInterrupts()` brackets. Here the same
//! discipline is expressed through ownership: edge handlers hold the only
//! `&mut` while they run, and mainline angle reads copy an [`AngleSnapshot`]
//! in a single scope before doing any arithmetic. Multi-word reads must go
//! through the snapshot, never through repeated field reads.

use bitflags::bitflags;

bitflags! {
    /// Decoder condition bits, equivalent to the firmware's `decoderState` byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DecoderFlags: u8 {
        /// Last delivered edge passed the filters and advanced the decoder.
        const VALID_TRIGGER = 0b0000_0001;
        /// The active pattern spans the full 720 degree cycle.
        const IS_SEQUENTIAL = 0b0000_0010;
        /// Pattern supports locking cranking timing to the trigger.
        const FIXED_CRANKING = 0b0000_0100;
        /// The most recent tooth interval spans exactly one tooth angle
        /// (false across a missing-tooth gap, where it is 2-3x).
        const TOOTH_ANGLE_CORRECT = 0b0000_1000;
        /// Second-derivative (acceleration) estimation is in use.
        const SECOND_DERIV = 0b0001_0000;
    }
}

/// Everything the edge handlers mutate, plus the per-pattern constants that
/// `setup()` derives from configuration. One cohesive record; zeroed at boot
/// and on every `setup()`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DecoderState {
    /// Index of the last seen primary tooth within the pattern period.
    /// While synced this stays in `1..=pattern_teeth`.
    pub tooth_current_count: u16,
    /// Raw physical tooth count for patterns whose logical indexing diverges
    /// from the physical wheel (the distributor folds its upper half).
    pub tooth_system_count: u8,

    // Primary tooth timestamps (microseconds, wrapping).
    pub tooth_last_time: u32,
    pub tooth_last_minus_one_time: u32,

    // Secondary (cam) tooth timestamps.
    pub tooth_last_sec_time: u32,
    pub tooth_last_minus_one_sec_time: u32,

    // Tertiary (second cam) timestamp.
    pub tooth_last_third_time: u32,

    // The two most recent sightings of tooth #1, for full-revolution RPM.
    pub tooth_one_time: u32,
    pub tooth_one_minus_one_time: u32,

    /// Cam teeth seen since the last cam reference.
    pub secondary_tooth_count: u16,
    /// Tertiary teeth seen since setup.
    pub third_tooth_count: u16,

    /// Which engine revolution of the 720 degree cycle we are on.
    pub revolution_one: bool,
    pub has_sync: bool,
    pub half_sync: bool,

    /// Sync losses since boot. Monotonic.
    pub sync_loss_counter: u16,
    /// Revolutions since boot. Saturates.
    pub start_revolutions: u16,

    // Adaptive minimum-gap thresholds.
    pub trigger_filter_time: u32,
    pub trigger_sec_filter_time: u32,
    pub trigger_third_filter_time: u32,

    /// Degrees per logical tooth.
    pub trigger_tooth_angle: u16,
    /// Physical teeth on the wheel.
    pub trigger_actual_teeth: u16,
    /// Logical positions in the pattern period.
    pub pattern_teeth: u16,

    /// No valid primary edge within this many microseconds means stalled.
    pub max_stall_time: u32,

    /// Time one crank revolution takes at current speed, refreshed by the
    /// RPM estimators. Drives angle interpolation and filter re-alignment.
    pub revolution_time: u32,
    /// Last RPM handed to the mainline; reused as the spike-clamp fallback.
    pub last_rpm: u16,

    /// Most recent accepted primary / secondary gap, kept for the tooth log.
    pub cur_gap: u32,
    pub cur_gap2: u32,

    pub flags: DecoderFlags,
}

/// POD copy of the fields the crank-angle reconstructor needs, captured in
/// one scope so the read cannot tear against a concurrent edge handler.
#[derive(Debug, Clone, Copy)]
pub struct AngleSnapshot {
    pub tooth_current_count: u16,
    pub tooth_last_time: u32,
    pub revolution_one: bool,
}

impl DecoderState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn angle_snapshot(&self) -> AngleSnapshot {
        AngleSnapshot {
            tooth_current_count: self.tooth_current_count,
            tooth_last_time: self.tooth_last_time,
            revolution_one: self.revolution_one,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_starts_zeroed() {
        let state = DecoderState::new();
        assert_eq!(state.tooth_current_count, 0);
        assert!(!state.has_sync);
        assert!(!state.half_sync);
        assert_eq!(state.sync_loss_counter, 0);
        assert_eq!(state.flags, DecoderFlags::empty());
    }

    #[test]
    fn test_snapshot_copies_fields() {
        let mut state = DecoderState::new();
        state.tooth_current_count = 17;
        state.tooth_last_time = 123_456;
        state.revolution_one = true;

        let snap = state.angle_snapshot();
        assert_eq!(snap.tooth_current_count, 17);
        assert_eq!(snap.tooth_last_time, 123_456);
        assert!(snap.revolution_one);
    }
}
