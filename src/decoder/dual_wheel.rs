//! Dual even-spaced wheel decoder.
//!
//! The primary wheel has no reference feature of its own; a cam-mounted
//! secondary provides the once-per-cycle reference. Before sync (or during
//! the staging revolutions) a cam edge hard-resyncs the primary count and
//! back-dates the previous tooth time so the first RPM reading comes out at
//! a safe 10 RPM floor instead of garbage. Afterwards the cam only checks
//! the primary count, counting mismatches and optionally snapping the count
//! back.
//!
//! The non-360 variant shares both edge handlers; its tooth angle carries
//! the `angle_multiplier` scaling so only setup, angle reconstruction and
//! end-tooth mapping differ.

use log::debug;

use crate::angle::{self, MICROS_PER_DEG_AT_1_RPM, US_PER_MINUTE, US_PER_SECOND};
use crate::config::{SparkMode, TriggerSpeed};
use crate::filter::filter_time_for_gap;
use crate::ignition::{end_tooth_for_angle, IGN_CHANNELS};
use crate::rpm::{self, MAX_RPM};
use crate::state::DecoderFlags;
use crate::traits::{IgnitionTimer, TriggerClock, TriggerInputs};

use super::TriggerDecoder;

/// Pre-sync marker for the tooth count; any accepted primary edge wraps it
/// into range.
const TOOTH_COUNT_UNSET: u16 = u16::MAX;

pub(super) fn setup<C, I, T>(dec: &mut TriggerDecoder<C, I, T>)
where
    C: TriggerClock,
    I: TriggerInputs,
    T: IgnitionTimer,
{
    let wheel = &dec.cfg.wheel;
    let state = &mut dec.state;

    state.pattern_teeth = wheel.trigger_teeth;
    state.trigger_tooth_angle = if wheel.trigger_speed == TriggerSpeed::Cam {
        720 / wheel.trigger_teeth
    } else {
        360 / wheel.trigger_teeth
    };
    state.trigger_actual_teeth = wheel.trigger_teeth;
    state.tooth_current_count = TOOTH_COUNT_UNSET;

    state.trigger_filter_time =
        US_PER_SECOND / (u32::from(MAX_RPM) / 60 * u32::from(wheel.trigger_teeth));
    // Fixed two teeth on the secondary, halved for cam speed.
    state.trigger_sec_filter_time = (US_PER_SECOND / (u32::from(MAX_RPM) / 60 * 2)) / 2;

    state.flags.insert(DecoderFlags::IS_SEQUENTIAL);
    // Even spacing: every interval is exactly one tooth angle.
    state.flags.insert(DecoderFlags::TOOTH_ANGLE_CORRECT);

    state.max_stall_time = (MICROS_PER_DEG_AT_1_RPM / 50) * u32::from(state.trigger_tooth_angle);
}

pub(super) fn setup_non360<C, I, T>(dec: &mut TriggerDecoder<C, I, T>)
where
    C: TriggerClock,
    I: TriggerInputs,
    T: IgnitionTimer,
{
    setup(dec);
    // Logical tooth angle is scaled up by the multiplier; the angle
    // reconstructor divides it back out.
    dec.state.trigger_tooth_angle =
        ((360 * dec.cfg.wheel.angle_multiplier) / dec.cfg.wheel.trigger_teeth).max(1);
    dec.state.max_stall_time =
        (MICROS_PER_DEG_AT_1_RPM / 50) * u32::from(dec.state.trigger_tooth_angle);
}

pub(super) fn primary<C, I, T>(dec: &mut TriggerDecoder<C, I, T>, cur_time: u32)
where
    C: TriggerClock,
    I: TriggerInputs,
    T: IgnitionTimer,
{
    let cur_gap = cur_time.wrapping_sub(dec.state.tooth_last_time);
    if cur_gap < dec.state.trigger_filter_time {
        return;
    }

    dec.state.cur_gap = cur_gap;
    dec.state.tooth_current_count = dec.state.tooth_current_count.wrapping_add(1);
    dec.state.flags.insert(DecoderFlags::VALID_TRIGGER);

    dec.state.tooth_last_minus_one_time = dec.state.tooth_last_time;
    dec.state.tooth_last_time = cur_time;

    if dec.state.has_sync
        && (dec.state.tooth_current_count == 1
            || dec.state.tooth_current_count > dec.state.pattern_teeth)
    {
        dec.state.tooth_current_count = 1;
        dec.state.revolution_one = !dec.state.revolution_one;
        dec.state.tooth_one_minus_one_time = dec.state.tooth_one_time;
        dec.state.tooth_one_time = cur_time;
        let per_pattern = if dec.cfg.wheel.trigger_speed == TriggerSpeed::Cam {
            2
        } else {
            1
        };
        dec.state.start_revolutions = dec.state.start_revolutions.saturating_add(per_pattern);
    }

    dec.state.trigger_filter_time = filter_time_for_gap(dec.cfg.edges.filter_level, cur_gap);

    if dec.cfg.ignition.per_tooth && !dec.is_cranking() {
        let mut crank_angle = (i32::from(dec.state.tooth_current_count) - 1)
            * i32::from(dec.state.trigger_tooth_angle)
            + i32::from(dec.cfg.wheel.trigger_angle);
        crank_angle = angle::ignition_limit(crank_angle, dec.crank_angle_max);

        if dec.cfg.ignition.spark_mode == SparkMode::Sequential && dec.state.revolution_one {
            crank_angle = angle::ignition_limit(crank_angle + 360, dec.crank_angle_max);
            let tooth = dec.cfg.wheel.trigger_teeth + dec.state.tooth_current_count;
            dec.per_tooth_patch(crank_angle, tooth);
        } else {
            let tooth = dec.state.tooth_current_count;
            dec.per_tooth_patch(crank_angle, tooth);
        }
    }
}

pub(super) fn secondary<C, I, T>(dec: &mut TriggerDecoder<C, I, T>, cur_time: u32)
where
    C: TriggerClock,
    I: TriggerInputs,
    T: IgnitionTimer,
{
    let cur_gap2 = cur_time.wrapping_sub(dec.state.tooth_last_sec_time);
    if cur_gap2 >= dec.state.trigger_sec_filter_time {
        dec.state.cur_gap2 = cur_gap2;
        dec.state.tooth_last_sec_time = cur_time;
        dec.state.trigger_sec_filter_time = cur_gap2 >> 2;

        if !dec.state.has_sync || dec.state.start_revolutions <= dec.cfg.edges.stage_cycles {
            // Hard resync: place the primary at its last tooth and fake the
            // previous gap so the first RPM reading floors at 10 RPM.
            dec.state.tooth_last_time = cur_time;
            dec.state.tooth_last_minus_one_time = cur_time
                .wrapping_sub(US_PER_MINUTE / (10 * u32::from(dec.cfg.wheel.trigger_teeth)));
            dec.state.tooth_current_count = dec.cfg.wheel.trigger_teeth;
            // A stale primary filter here would swallow the first tooth
            // after sync.
            dec.state.trigger_filter_time = 0;
            if !dec.state.has_sync {
                debug!("[Sync] acquired from cam reference");
            }
            dec.state.has_sync = true;
        } else {
            if dec.state.tooth_current_count != dec.cfg.wheel.trigger_teeth
                && dec.state.start_revolutions > 2
            {
                dec.state.sync_loss_counter = dec.state.sync_loss_counter.wrapping_add(1);
                debug!(
                    "[Sync] cam mismatch: primary at tooth {} of {}",
                    dec.state.tooth_current_count, dec.cfg.wheel.trigger_teeth
                );
            }
            if dec.cfg.edges.use_resync {
                dec.state.tooth_current_count = dec.cfg.wheel.trigger_teeth;
            }
        }

        dec.state.revolution_one = true;
    } else {
        // Rejected edge: re-align the threshold to the current speed, a
        // quarter of the cam period.
        dec.state.trigger_sec_filter_time = dec.state.revolution_time >> 1;
    }
}

pub(super) fn get_rpm<C, I, T>(dec: &mut TriggerDecoder<C, I, T>) -> u16
where
    C: TriggerClock,
    I: TriggerInputs,
    T: IgnitionTimer,
{
    if !dec.state.has_sync {
        return 0;
    }
    let degrees_over = if dec.cfg.wheel.trigger_speed == TriggerSpeed::Cam {
        720
    } else {
        360
    };
    let cranking_threshold = dec.cfg.ignition.cranking_rpm;
    if dec.state.last_rpm < cranking_threshold {
        rpm::cranking_rpm(
            &mut dec.state,
            dec.cfg.wheel.trigger_teeth,
            degrees_over,
            dec.cfg.edges.stage_cycles,
        )
    } else {
        rpm::std_rpm(&mut dec.state, degrees_over, cranking_threshold)
    }
}

pub(super) fn get_rpm_non360<C, I, T>(dec: &mut TriggerDecoder<C, I, T>) -> u16
where
    C: TriggerClock,
    I: TriggerInputs,
    T: IgnitionTimer,
{
    if !dec.state.has_sync || dec.state.tooth_current_count == 0 {
        return 0;
    }
    let cranking_threshold = dec.cfg.ignition.cranking_rpm;
    if dec.state.last_rpm < cranking_threshold {
        rpm::cranking_rpm(
            &mut dec.state,
            dec.cfg.wheel.trigger_teeth,
            360,
            dec.cfg.edges.stage_cycles,
        )
    } else {
        rpm::std_rpm(&mut dec.state, 360, cranking_threshold)
    }
}

pub(super) fn set_end_teeth<C, I, T>(dec: &mut TriggerDecoder<C, I, T>)
where
    C: TriggerClock,
    I: TriggerInputs,
    T: IgnitionTimer,
{
    let tooth_adder = if dec.cfg.ignition.spark_mode == SparkMode::Sequential
        && dec.cfg.wheel.trigger_speed == TriggerSpeed::Crank
    {
        dec.cfg.wheel.trigger_teeth
    } else {
        0
    };
    let period = dec.cfg.wheel.trigger_teeth + tooth_adder;

    for channel in 0..IGN_CHANNELS {
        let end_angle = dec.channels.schedules[channel].end_angle;
        dec.channels.schedules[channel].end_tooth = end_tooth_for_angle(
            end_angle,
            dec.cfg.wheel.trigger_angle,
            dec.state.trigger_tooth_angle,
            period,
        );
    }
}

pub(super) fn set_end_teeth_non360<C, I, T>(dec: &mut TriggerDecoder<C, I, T>)
where
    C: TriggerClock,
    I: TriggerInputs,
    T: IgnitionTimer,
{
    let period = dec.cfg.wheel.trigger_teeth;
    let multiplier = i32::from(dec.cfg.wheel.angle_multiplier);

    for channel in 0..IGN_CHANNELS {
        // Scale the angle delta up by the multiplier so dividing by the
        // (already multiplied) tooth angle lands on a physical tooth.
        let end_angle = i32::from(dec.channels.schedules[channel].end_angle)
            - i32::from(dec.cfg.wheel.trigger_angle);
        let scaled = end_angle * multiplier;
        let mut tooth = scaled / i32::from(dec.state.trigger_tooth_angle.max(1)) - 1;
        let period = i32::from(period);
        while tooth > period {
            tooth -= period;
        }
        while tooth <= 0 {
            tooth += period;
        }
        dec.channels.schedules[channel].end_tooth = tooth as u16;
    }
}
