//! Per-channel ignition end-tooth tracking and live compare patching.
//!
//! The scheduler owns when a coil charge starts; the decoder owns the last
//! deterministic reference before it ends. Each channel carries an "end
//! tooth": the latest tooth whose detection still precedes the target spark
//! angle. When the crank crosses a channel's end tooth, the decoder rewrites
//! that channel's timer compare from the freshest angle estimate, squeezing
//! out the drift accumulated since the schedule was laid down.

use crate::angle;
use crate::traits::IgnitionTimer;

pub const IGN_CHANNELS: usize = 8;

/// Revolutions of spin-up to complete before the decoder is allowed to
/// pre-stage end compares on schedules that have not started yet.
pub const MIN_CYCLES_FOR_ENDCOMPARE: u16 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScheduleStatus {
    #[default]
    Off,
    Pending,
    Running,
}

/// Decoder-facing view of one ignition channel's schedule.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnitionSchedule {
    pub status: ScheduleStatus,
    /// Crank angle at which the coil charge must end (spark fires).
    pub end_angle: i16,
    /// Latest deterministic tooth before `end_angle`.
    pub end_tooth: u16,
    /// Pre-staged compare value for schedules the decoder patched before
    /// they started running.
    pub end_compare: u32,
    pub end_set_by_decoder: bool,
}

/// All channels plus the fixed-cranking override latch that disables
/// per-tooth adjustment while timing is locked for cranking.
#[derive(Debug, Clone, Default)]
pub struct IgnitionChannels {
    pub schedules: [IgnitionSchedule; IGN_CHANNELS],
    pub fixed_cranking_override: u32,
}

impl IgnitionChannels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn end_tooth(&self, channel: usize) -> u16 {
        self.schedules[channel].end_tooth
    }

    pub fn set_end_angle(&mut self, channel: usize, end_angle: i16) {
        self.schedules[channel].end_angle = end_angle;
    }
}

/// Map a channel end angle onto a tooth index in `1..=period`, stepping
/// back one tooth so the reference lands before the angle, not on it.
pub fn end_tooth_for_angle(
    end_angle: i16,
    trigger_angle: i16,
    tooth_angle: u16,
    period: u16,
) -> u16 {
    let period = i32::from(period.max(1));
    let mut tooth =
        (i32::from(end_angle) - i32::from(trigger_angle)) / i32::from(tooth_angle.max(1)) - 1;
    while tooth > period {
        tooth -= period;
    }
    while tooth <= 0 {
        tooth += period;
    }
    tooth as u16
}

/// Called from the primary edge handlers on every tooth once per-tooth
/// ignition is active. `crank_angle` is the angle of the tooth just seen,
/// `current_tooth` its index in the ignition period.
pub fn check_per_tooth_timing<T: IgnitionTimer>(
    timer: &mut T,
    channels: &mut IgnitionChannels,
    crank_angle: i32,
    current_tooth: u16,
    rpm: u16,
    revolution_time: u32,
    start_revolutions: u16,
    crank_angle_max: i32,
) {
    if channels.fixed_cranking_override != 0 || rpm == 0 {
        return;
    }

    for (channel, schedule) in channels.schedules.iter_mut().enumerate() {
        if current_tooth != schedule.end_tooth {
            continue;
        }

        let delta = angle::ignition_limit(i32::from(schedule.end_angle) - crank_angle, crank_angle_max);
        let ticks = timer.us_to_ticks(angle::degrees_to_us(delta, revolution_time));
        let compare = timer.counter(channel).wrapping_add(ticks);

        if schedule.status == ScheduleStatus::Running {
            timer.set_compare(channel, compare);
        } else if start_revolutions > MIN_CYCLES_FOR_ENDCOMPARE {
            schedule.end_compare = compare;
            schedule.end_set_by_decoder = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::MockIgnitionTimer;
    use mockall::predicate::*;

    #[test]
    fn test_end_tooth_for_angle_basic() {
        // 355 degrees on a 10 degree wheel with no offset: tooth 34.
        assert_eq!(end_tooth_for_angle(355, 0, 10, 36), 34);
    }

    #[test]
    fn test_end_tooth_for_angle_wraps_low() {
        // An end angle right at the offset walks back past tooth 0 and
        // wraps to the top of the period.
        assert_eq!(end_tooth_for_angle(5, 0, 10, 36), 35);
    }

    #[test]
    fn test_end_tooth_for_angle_negative_offset() {
        assert_eq!(end_tooth_for_angle(100, -20, 10, 36), 11);
    }

    fn channels_with_end_tooth(tooth: u16, status: ScheduleStatus) -> IgnitionChannels {
        let mut channels = IgnitionChannels::new();
        channels.schedules[0].end_tooth = tooth;
        channels.schedules[0].end_angle = 350;
        channels.schedules[0].status = status;
        channels
    }

    #[test]
    fn test_running_schedule_gets_live_compare() {
        let mut timer = MockIgnitionTimer::new();
        let mut channels = channels_with_end_tooth(34, ScheduleStatus::Running);

        // Tooth at 340 degrees, end angle 350: 10 degrees at 20ms/rev is
        // 555us, 1:1 ticks on top of a counter at 1000.
        timer.expect_us_to_ticks().returning(|us| us);
        timer.expect_counter().with(eq(0)).return_const(1000u32);
        timer
            .expect_set_compare()
            .with(eq(0), eq(1555u32))
            .times(1)
            .return_const(());

        check_per_tooth_timing(&mut timer, &mut channels, 340, 34, 3000, 20_000, 10, 360);
    }

    #[test]
    fn test_idle_schedule_prestaged_after_spinup() {
        let mut timer = MockIgnitionTimer::new();
        let mut channels = channels_with_end_tooth(34, ScheduleStatus::Pending);

        timer.expect_us_to_ticks().returning(|us| us);
        timer.expect_counter().return_const(1000u32);
        timer.expect_set_compare().times(0);

        check_per_tooth_timing(&mut timer, &mut channels, 340, 34, 3000, 20_000, 10, 360);
        assert!(channels.schedules[0].end_set_by_decoder);
        assert_eq!(channels.schedules[0].end_compare, 1555);
    }

    #[test]
    fn test_idle_schedule_not_staged_during_spinup() {
        let mut timer = MockIgnitionTimer::new();
        let mut channels = channels_with_end_tooth(34, ScheduleStatus::Pending);

        timer.expect_us_to_ticks().returning(|us| us);
        timer.expect_counter().return_const(1000u32);

        check_per_tooth_timing(&mut timer, &mut channels, 340, 34, 3000, 20_000, 3, 360);
        assert!(!channels.schedules[0].end_set_by_decoder);
    }

    #[test]
    fn test_inactive_while_fixed_cranking_or_stopped() {
        let mut timer = MockIgnitionTimer::new();
        timer.expect_set_compare().times(0);

        let mut channels = channels_with_end_tooth(34, ScheduleStatus::Running);
        channels.fixed_cranking_override = 10;
        check_per_tooth_timing(&mut timer, &mut channels, 340, 34, 3000, 20_000, 10, 360);

        let mut channels = channels_with_end_tooth(34, ScheduleStatus::Running);
        check_per_tooth_timing(&mut timer, &mut channels, 340, 34, 0, 20_000, 10, 360);
    }

    #[test]
    fn test_other_teeth_ignored() {
        let mut timer = MockIgnitionTimer::new();
        timer.expect_set_compare().times(0);
        let mut channels = channels_with_end_tooth(34, ScheduleStatus::Running);
        check_per_tooth_timing(&mut timer, &mut channels, 100, 11, 3000, 20_000, 10, 360);
    }
}
