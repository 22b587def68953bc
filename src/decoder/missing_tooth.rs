//! Missing-tooth wheel decoder.
//!
//! The wheel has `trigger_teeth` logical positions with one or two
//! consecutive teeth absent; the gap is the angular reference. Sync is a
//! matter of recognizing a tooth interval larger than the running gap
//! estimate (1.5x for one missing tooth, 2x for two) at the point in the
//! pattern where the gap is due. A gap seen anywhere else is a signal fault
//! and drops sync.
//!
//! Works at crank or cam speed. At crank speed a cam input (4-1 wheel,
//! single tooth, or a polled level) disambiguates the two revolutions of
//! the 720 degree cycle for sequential operation.

use log::debug;

use crate::angle::{self, MICROS_PER_DEG_AT_1_RPM, US_PER_MINUTE, US_PER_SECOND};
use crate::config::{SecondaryPattern, SparkMode, TriggerSpeed};
use crate::filter::filter_time_for_gap;
use crate::ignition::{end_tooth_for_angle, IGN_CHANNELS};
use crate::rpm::{self, MAX_RPM};
use crate::state::DecoderFlags;
use crate::traits::{IgnitionTimer, TriggerClock, TriggerInputs};
use crate::vvt;

use super::TriggerDecoder;

/// Gap detection is skipped while synced above this RPM until the last
/// quarter of the wheel, where the gap is actually due.
const GAP_SEARCH_MAX_RPM: u16 = 2000;

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
    if wheel.trigger_speed == TriggerSpeed::Cam {
        state.flags.insert(DecoderFlags::IS_SEQUENTIAL);
    }
    state.trigger_actual_teeth = wheel.trigger_teeth - wheel.missing_teeth;

    // Shortest gap physically possible, at the ceiling RPM.
    state.trigger_filter_time =
        US_PER_SECOND / (u32::from(MAX_RPM) / 60 * u32::from(wheel.trigger_teeth));
    state.trigger_sec_filter_time = match dec.cfg.edges.secondary_pattern {
        SecondaryPattern::FourMinusOne => US_PER_MINUTE / u32::from(MAX_RPM) / 4 / 2,
        _ => US_PER_SECOND / (u32::from(MAX_RPM) / 60),
    };

    // Stall when the gap interval itself overruns the 50 RPM floor.
    state.max_stall_time = (MICROS_PER_DEG_AT_1_RPM / 50)
        * u32::from(state.trigger_tooth_angle)
        * (u32::from(wheel.missing_teeth) + 1);
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

    let cam_speed = dec.cfg.wheel.trigger_speed == TriggerSpeed::Cam;
    let poll_mode = dec.cfg.edges.secondary_pattern == SecondaryPattern::PollLevel;

    if dec.state.tooth_last_time > 0 && dec.state.tooth_last_minus_one_time > 0 {
        let mut is_gap = false;

        // The gap cannot occur in the first three quarters of a synced
        // revolution, so only search there when unsynced or turning slowly.
        if !dec.state.has_sync
            || dec.state.last_rpm < GAP_SEARCH_MAX_RPM
            || dec.state.tooth_current_count >= (3 * dec.state.trigger_actual_teeth) >> 2
        {
            let last_gap = dec
                .state
                .tooth_last_time
                .wrapping_sub(dec.state.tooth_last_minus_one_time);
            let target_gap = if dec.cfg.wheel.missing_teeth == 1 {
                (3 * last_gap) >> 1
            } else {
                last_gap * u32::from(dec.cfg.wheel.missing_teeth)
            };

            if cur_gap > target_gap || dec.state.tooth_current_count > dec.state.trigger_actual_teeth
            {
                is_gap = true;

                if dec.state.tooth_current_count < dec.state.trigger_actual_teeth
                    && dec.state.has_sync
                {
                    // Gap arrived before all teeth were seen: signal fault.
                    dec.state.has_sync = false;
                    dec.state.half_sync = false;
                    dec.state.sync_loss_counter = dec.state.sync_loss_counter.wrapping_add(1);
                    debug!(
                        "[Sync] lost: gap at tooth {} of {}",
                        dec.state.tooth_current_count, dec.state.trigger_actual_teeth
                    );
                } else {
                    if dec.state.has_sync || dec.state.half_sync {
                        let per_pattern = if cam_speed { 2 } else { 1 };
                        dec.state.start_revolutions =
                            dec.state.start_revolutions.saturating_add(per_pattern);
                    } else {
                        dec.state.start_revolutions = 0;
                    }

                    dec.state.tooth_current_count = 1;
                    if poll_mode {
                        dec.state.revolution_one =
                            dec.inputs.secondary_level() == dec.cfg.edges.poll_level_high;
                    } else {
                        dec.state.revolution_one = !dec.state.revolution_one;
                    }
                    dec.state.tooth_one_minus_one_time = dec.state.tooth_one_time;
                    dec.state.tooth_one_time = cur_time;

                    if dec.cfg.sequential() {
                        // Sequential needs the cam seen, unless the wheel is
                        // itself cam-mounted or the cam level is polled.
                        if dec.state.secondary_tooth_count > 0 || cam_speed || poll_mode {
                            if !dec.state.has_sync {
                                debug!("[Sync] acquired (full)");
                            }
                            dec.state.has_sync = true;
                            dec.state.half_sync = false;
                            if dec.cfg.edges.secondary_pattern == SecondaryPattern::Single {
                                dec.state.secondary_tooth_count = 0;
                            }
                        } else if !dec.state.has_sync {
                            if !dec.state.half_sync {
                                debug!("[Sync] acquired (half, cam not yet seen)");
                            }
                            dec.state.half_sync = true;
                        }
                    } else {
                        if !dec.state.has_sync {
                            debug!("[Sync] acquired");
                        }
                        dec.state.has_sync = true;
                        dec.state.half_sync = false;
                    }

                    // A stale threshold here would reject the first tooth
                    // after the gap.
                    dec.state.trigger_filter_time = 0;
                    // The interval just measured spans the gap, 2-3x the
                    // nominal tooth angle.
                    dec.state.flags.remove(DecoderFlags::TOOTH_ANGLE_CORRECT);
                }
            }
        }

        if !is_gap {
            dec.state.trigger_filter_time =
                filter_time_for_gap(dec.cfg.edges.filter_level, cur_gap);
            dec.state.flags.insert(DecoderFlags::TOOTH_ANGLE_CORRECT);
        }
    }

    dec.state.tooth_last_minus_one_time = dec.state.tooth_last_time;
    dec.state.tooth_last_time = cur_time;

    if dec.cfg.ignition.per_tooth && !dec.is_cranking() {
        let mut crank_angle = (i32::from(dec.state.tooth_current_count) - 1)
            * i32::from(dec.state.trigger_tooth_angle)
            + i32::from(dec.cfg.wheel.trigger_angle);
        crank_angle = angle::ignition_limit(crank_angle, dec.crank_angle_max);

        if dec.cfg.ignition.spark_mode == SparkMode::Sequential
            && dec.state.revolution_one
            && !cam_speed
        {
            crank_angle = angle::ignition_limit(crank_angle + 360, dec.crank_angle_max);
            let tooth = dec.state.pattern_teeth + dec.state.tooth_current_count;
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
    if cur_gap2 < dec.state.trigger_sec_filter_time {
        return;
    }
    dec.state.cur_gap2 = cur_gap2;

    match dec.cfg.edges.secondary_pattern {
        SecondaryPattern::FourMinusOne => {
            let target_gap2 = (3
                * dec
                    .state
                    .tooth_last_sec_time
                    .wrapping_sub(dec.state.tooth_last_minus_one_sec_time))
                >> 1;
            dec.state.tooth_last_minus_one_sec_time = dec.state.tooth_last_sec_time;
            if cur_gap2 >= target_gap2 || dec.state.secondary_tooth_count > 3 {
                dec.state.secondary_tooth_count = 1;
                dec.state.revolution_one = true;
                dec.state.trigger_sec_filter_time = 0;
                record_vvt1_angle(dec);
            } else {
                dec.state.trigger_sec_filter_time = cur_gap2 >> 2;
                dec.state.secondary_tooth_count = dec.state.secondary_tooth_count.wrapping_add(1);
            }
        }
        SecondaryPattern::Single => {
            dec.state.revolution_one = true;
            dec.state.trigger_sec_filter_time = cur_gap2 >> 1;
            dec.state.secondary_tooth_count = dec.state.secondary_tooth_count.wrapping_add(1);
            record_vvt1_angle(dec);
        }
        // The level is polled at tooth #1 instead; edges carry no
        // information here.
        SecondaryPattern::PollLevel => {}
    }

    dec.state.tooth_last_sec_time = cur_time;
}

/// Second cam input. Exists only to measure VVT2 phase; takes no part in
/// sync.
pub(super) fn tertiary<C, I, T>(dec: &mut TriggerDecoder<C, I, T>, cur_time: u32)
where
    C: TriggerClock,
    I: TriggerInputs,
    T: IgnitionTimer,
{
    let mut cur_gap3 = cur_time.wrapping_sub(dec.state.tooth_last_third_time);
    if dec.state.tooth_last_third_time == 0 {
        cur_gap3 = 0;
    }

    if cur_gap3 >= dec.state.trigger_third_filter_time {
        dec.state.third_tooth_count = dec.state.third_tooth_count.wrapping_add(1);
        dec.state.tooth_last_third_time = cur_time;
        dec.state.trigger_third_filter_time = cur_gap3 >> 1;

        if dec.cfg.vvt.enabled {
            let sample = vvt::cam_phase_sample(
                dec.get_crank_angle(),
                dec.cfg.wheel.trigger_angle,
                dec.cfg.vvt.mode,
                dec.cfg.vvt.vvt2_cl0_duty_angle,
            );
            dec.vvt2_angle = vvt::angle_filter(sample, dec.cfg.vvt.angle_filter, dec.vvt2_angle);
        }
    }
}

fn record_vvt1_angle<C, I, T>(dec: &mut TriggerDecoder<C, I, T>)
where
    C: TriggerClock,
    I: TriggerInputs,
    T: IgnitionTimer,
{
    if dec.cfg.vvt.enabled && dec.state.revolution_one {
        let sample = vvt::cam_phase_sample(
            dec.get_crank_angle(),
            dec.cfg.wheel.trigger_angle,
            dec.cfg.vvt.mode,
            dec.cfg.vvt.cl0_duty_angle,
        );
        dec.vvt1_angle = vvt::angle_filter(sample, dec.cfg.vvt.angle_filter, dec.vvt1_angle);
    }
}

pub(super) fn get_rpm<C, I, T>(dec: &mut TriggerDecoder<C, I, T>) -> u16
where
    C: TriggerClock,
    I: TriggerInputs,
    T: IgnitionTimer,
{
    let degrees_over = if dec.cfg.wheel.trigger_speed == TriggerSpeed::Cam {
        720
    } else {
        360
    };
    let cranking_threshold = dec.cfg.ignition.cranking_rpm;

    if dec.state.last_rpm < cranking_threshold {
        if dec.state.tooth_current_count != 1 {
            rpm::cranking_rpm(
                &mut dec.state,
                dec.cfg.wheel.trigger_teeth,
                degrees_over,
                dec.cfg.edges.stage_cycles,
            )
        } else {
            // At tooth #1 the last gap spans the missing teeth and would
            // read low.
            dec.state.last_rpm
        }
    } else {
        rpm::std_rpm(&mut dec.state, degrees_over, cranking_threshold)
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
        dec.state.pattern_teeth
    } else {
        0
    };
    let period = dec.state.pattern_teeth + tooth_adder;
    let actual = dec.state.trigger_actual_teeth;

    for channel in 0..IGN_CHANNELS {
        let end_angle = dec.channels.schedules[channel].end_angle;
        let mut tooth = end_tooth_for_angle(
            end_angle,
            dec.cfg.wheel.trigger_angle,
            dec.state.trigger_tooth_angle,
            period,
        );
        // Never park an end tooth in the missing slot: neither the first
        // revolution's gap nor (sequentially) the second's.
        if tooth > actual && tooth <= dec.state.pattern_teeth {
            tooth = actual;
        }
        if tooth > actual + tooth_adder {
            tooth = actual + tooth_adder;
        }
        dec.channels.schedules[channel].end_tooth = tooth;
    }
}
