//! Noise Edge Filter
//!
//! Magnetic trigger inputs pick up ignition noise that shows up as pulses
//! arriving far sooner than the wheel geometry allows. The filter tracks a
//! minimum-gap threshold derived from the last accepted gap; anything
//! arriving earlier is dropped before it can touch the tooth counters.
//!
//! The threshold only applies to even-spaced sections of a pattern. Decoders
//! reset it to zero at their reference feature (the missing-tooth gap, the
//! cam resync) because the interval across the feature is a legitimate
//! multiple of the nominal gap.

use serde::{Deserialize, Serialize};

/// Filter strength, as a fraction of the last accepted tooth gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FilterLevel {
    /// No filtering.
    Off,
    /// 25% of the last gap.
    #[default]
    Lite,
    /// 50% of the last gap.
    Medium,
    /// 75% of the last gap.
    Aggressive,
}

/// New minimum-gap threshold after accepting a gap of `cur_gap`
/// microseconds. Shift-based so it stays cheap in the edge handlers.
pub fn filter_time_for_gap(level: FilterLevel, cur_gap: u32) -> u32 {
    match level {
        FilterLevel::Off => 0,
        FilterLevel::Lite => cur_gap >> 2,
        FilterLevel::Medium => cur_gap >> 1,
        FilterLevel::Aggressive => (cur_gap.wrapping_mul(3)) >> 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_fractions() {
        assert_eq!(filter_time_for_gap(FilterLevel::Off, 4000), 0);
        assert_eq!(filter_time_for_gap(FilterLevel::Lite, 4000), 1000);
        assert_eq!(filter_time_for_gap(FilterLevel::Medium, 4000), 2000);
        assert_eq!(filter_time_for_gap(FilterLevel::Aggressive, 4000), 3000);
    }

    #[test]
    fn test_filter_rejects_sub_threshold_gap() {
        // A 500us spike against a 5000us tooth gap must fall under the
        // Lite threshold (1250us).
        let threshold = filter_time_for_gap(FilterLevel::Lite, 5000);
        assert!(500 < threshold);
    }
}
