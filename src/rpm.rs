//! RPM estimation.
//!
//! Two estimators with different variance/latency trade-offs:
//!
//! * [`std_rpm`] measures the time between the last two sightings of tooth
//!   #1 - one full pattern period. Smooth, but lags a whole revolution.
//! * [`cranking_rpm`] extrapolates the most recent single tooth gap. Usable
//!   a few teeth into cranking, long before a full revolution completes,
//!   at the cost of per-tooth jitter.
//!
//! Both refresh `revolution_time`, which the angle interpolator and the
//! secondary filter re-alignment feed off.

use crate::angle::US_PER_MINUTE;
use crate::state::DecoderState;

/// Hard ceiling; anything at or above this is treated as a measurement
/// spike and replaced with the previous reading.
pub const MAX_RPM: u16 = 9000;

/// RPM for a crank revolution taking `revolution_time_us`, rounded to
/// nearest.
pub fn rpm_from_revolution_time(revolution_time_us: u32) -> u16 {
    if revolution_time_us == 0 {
        return 0;
    }
    let rpm = (US_PER_MINUTE + revolution_time_us / 2) / revolution_time_us;
    rpm.min(u32::from(u16::MAX)) as u16
}

/// Full-revolution estimator. `degrees_over` is 360 for crank-speed
/// patterns and 720 for cam-speed patterns (whose tooth-one period spans
/// two crank revolutions).
pub fn std_rpm(state: &mut DecoderState, degrees_over: u16, cranking_threshold: u16) -> u16 {
    if !(state.has_sync || state.half_sync) {
        return 0;
    }
    // Below cranking speed with no completed revolution the tooth-one pair
    // is garbage from the first partial turn.
    if state.last_rpm < cranking_threshold && state.start_revolutions == 0 {
        return 0;
    }
    if state.tooth_one_time == 0 || state.tooth_one_minus_one_time == 0 {
        return 0;
    }

    let mut revolution_time = state
        .tooth_one_time
        .wrapping_sub(state.tooth_one_minus_one_time);
    if degrees_over == 720 {
        revolution_time >>= 1;
    }
    state.revolution_time = revolution_time;

    let rpm = rpm_from_revolution_time(revolution_time);
    if rpm >= MAX_RPM {
        state.last_rpm
    } else {
        rpm
    }
}

/// Two-tooth estimator for cranking. Holds the previous reading until
/// `start_revolutions` clears the staging-cycle count.
pub fn cranking_rpm(
    state: &mut DecoderState,
    total_teeth: u16,
    degrees_over: u16,
    stage_cycles: u16,
) -> u16 {
    if state.start_revolutions < stage_cycles || !(state.has_sync || state.half_sync) {
        return state.last_rpm;
    }
    if state.tooth_last_minus_one_time == 0
        || state.tooth_last_time == state.tooth_last_minus_one_time
    {
        return 0;
    }

    let gap = state
        .tooth_last_time
        .wrapping_sub(state.tooth_last_minus_one_time);
    let mut revolution_time = gap.wrapping_mul(u32::from(total_teeth));
    if degrees_over == 720 {
        revolution_time >>= 1;
    }
    state.revolution_time = revolution_time;

    let rpm = rpm_from_revolution_time(revolution_time);
    if rpm >= MAX_RPM {
        state.last_rpm
    } else {
        rpm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synced_state() -> DecoderState {
        let mut state = DecoderState::new();
        state.has_sync = true;
        state.start_revolutions = 3;
        state.last_rpm = 500;
        state
    }

    #[test]
    fn test_rpm_from_revolution_time() {
        assert_eq!(rpm_from_revolution_time(20_000), 3000);
        assert_eq!(rpm_from_revolution_time(60_000_000), 1);
        assert_eq!(rpm_from_revolution_time(0), 0);
    }

    #[test]
    fn test_std_rpm_requires_sync() {
        let mut state = DecoderState::new();
        state.tooth_one_time = 40_000;
        state.tooth_one_minus_one_time = 20_000;
        assert_eq!(std_rpm(&mut state, 360, 400), 0);
    }

    #[test]
    fn test_std_rpm_full_revolution() {
        let mut state = synced_state();
        state.tooth_one_minus_one_time = 100_000;
        state.tooth_one_time = 120_000;
        assert_eq!(std_rpm(&mut state, 360, 400), 3000);
        assert_eq!(state.revolution_time, 20_000);
    }

    #[test]
    fn test_std_rpm_halves_cam_period() {
        let mut state = synced_state();
        state.tooth_one_minus_one_time = 100_000;
        state.tooth_one_time = 140_000;
        // 40ms over 720 degrees is a 20ms crank revolution.
        assert_eq!(std_rpm(&mut state, 720, 400), 3000);
    }

    #[test]
    fn test_std_rpm_zero_before_first_revolution() {
        let mut state = synced_state();
        state.last_rpm = 0;
        state.start_revolutions = 0;
        state.tooth_one_minus_one_time = 100_000;
        state.tooth_one_time = 120_000;
        assert_eq!(std_rpm(&mut state, 360, 400), 0);
    }

    #[test]
    fn test_std_rpm_spike_returns_previous() {
        let mut state = synced_state();
        state.last_rpm = 3000;
        state.tooth_one_minus_one_time = 100_000;
        state.tooth_one_time = 100_100; // 100us "revolution"
        assert_eq!(std_rpm(&mut state, 360, 400), 3000);
    }

    #[test]
    fn test_std_rpm_handles_counter_wrap() {
        let mut state = synced_state();
        state.tooth_one_minus_one_time = u32::MAX - 9_999;
        state.tooth_one_time = 10_000;
        assert_eq!(std_rpm(&mut state, 360, 400), 3000);
    }

    #[test]
    fn test_cranking_rpm_extrapolates_tooth_gap() {
        let mut state = synced_state();
        state.tooth_last_minus_one_time = 50_000;
        state.tooth_last_time = 55_000;
        // 5ms per tooth on a 4-tooth wheel is a 20ms revolution.
        assert_eq!(cranking_rpm(&mut state, 4, 360, 0), 3000);
    }

    #[test]
    fn test_cranking_rpm_holds_previous_during_staging() {
        let mut state = synced_state();
        state.start_revolutions = 1;
        state.tooth_last_minus_one_time = 50_000;
        state.tooth_last_time = 55_000;
        assert_eq!(cranking_rpm(&mut state, 4, 360, 3), 500);
    }
}
