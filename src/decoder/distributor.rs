//! Basic distributor decoder.
//!
//! One tooth per cylinder on a cam-speed wheel and nothing else: there is
//! no angular reference feature, so "sync" just means the counter is
//! running - declared as soon as teeth are arriving. Absolute cycle
//! position is unknowable; per-tooth ignition indices fold into the lower
//! half of the wheel, which is why this pattern also keeps the raw physical
//! count in `tooth_system_count`.

use log::debug;

use crate::angle::{self, MICROS_PER_DEG_AT_1_RPM};
use crate::filter::filter_time_for_gap;
use crate::ignition::IGN_CHANNELS;
use crate::rpm;
use crate::state::DecoderFlags;
use crate::traits::{IgnitionTimer, TriggerClock, TriggerInputs};

use super::TriggerDecoder;

/// Dynamic stall floor: never less than 50 RPM worth of rotation.
const MIN_STALL_TIME: u32 = 366_667;

pub(super) fn setup<C, I, T>(dec: &mut TriggerDecoder<C, I, T>)
where
    C: TriggerClock,
    I: TriggerInputs,
    T: IgnitionTimer,
{
    let cylinders = u16::from(dec.cfg.wheel.n_cylinders.max(1));
    let state = &mut dec.state;

    state.trigger_actual_teeth = cylinders;
    state.pattern_teeth = cylinders;
    state.trigger_tooth_angle = 720 / cylinders;

    // Filter starts open; it adapts once sync is declared.
    state.trigger_filter_time = 0;
    state.trigger_sec_filter_time = 0;

    state.flags.insert(DecoderFlags::IS_SEQUENTIAL);
    state.flags.insert(DecoderFlags::FIXED_CRANKING);
    state.flags.insert(DecoderFlags::TOOTH_ANGLE_CORRECT);

    // Small engines idle the starter faster; hold them to a 90 RPM floor.
    state.max_stall_time = if dec.cfg.wheel.n_cylinders <= 4 {
        (MICROS_PER_DEG_AT_1_RPM / 90) * u32::from(state.trigger_tooth_angle)
    } else {
        (MICROS_PER_DEG_AT_1_RPM / 50) * u32::from(state.trigger_tooth_angle)
    };
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
    dec.state.flags.insert(DecoderFlags::VALID_TRIGGER);
    dec.state.tooth_system_count = dec.state.tooth_system_count.wrapping_add(1);

    if dec.state.has_sync {
        dec.state.trigger_filter_time = filter_time_for_gap(dec.cfg.edges.filter_level, cur_gap);
    } else {
        dec.state.trigger_filter_time = 0;
    }

    if dec.state.tooth_current_count == dec.state.trigger_actual_teeth || !dec.state.has_sync {
        // Back at the top of the wheel (or first tooth ever seen).
        dec.state.tooth_current_count = 1;
        dec.state.tooth_one_minus_one_time = dec.state.tooth_one_time;
        dec.state.tooth_one_time = cur_time;
        if !dec.state.has_sync {
            debug!("[Sync] acquired (distributor)");
        }
        dec.state.has_sync = true;
        dec.state.start_revolutions = dec.state.start_revolutions.saturating_add(1);
    } else if dec.state.tooth_current_count < dec.state.trigger_actual_teeth {
        dec.state.tooth_current_count += 1;
    } else {
        // Over-ran the wheel without finding the top: recover on this
        // tooth and count the loss.
        dec.state.tooth_current_count = 1;
        dec.state.revolution_one = !dec.state.revolution_one;
        dec.state.tooth_one_minus_one_time = dec.state.tooth_one_time;
        dec.state.tooth_one_time = cur_time;
        dec.state.sync_loss_counter = dec.state.sync_loss_counter.wrapping_add(1);
        debug!("[Sync] distributor overrun, recovering at tooth 1");
    }

    // Cranklock: while cranking, every tooth fires whatever is charging,
    // locking timing to the mechanical reference.
    if dec.cfg.ignition.cranklock && dec.is_cranking() {
        for channel in 0..IGN_CHANNELS {
            dec.timer.end_coil_charge(channel);
        }
    }

    if dec.cfg.ignition.per_tooth {
        let mut crank_angle = (i32::from(dec.state.tooth_current_count) - 1)
            * i32::from(dec.state.trigger_tooth_angle)
            + i32::from(dec.cfg.wheel.trigger_angle);
        crank_angle = angle::ignition_limit(crank_angle, dec.crank_angle_max);

        let half = dec.state.trigger_actual_teeth / 2;
        let tooth = if half > 0 && dec.state.tooth_current_count > half {
            dec.state.tooth_current_count - half
        } else {
            dec.state.tooth_current_count
        };
        dec.per_tooth_patch(crank_angle, tooth);
    }

    dec.state.tooth_last_minus_one_time = dec.state.tooth_last_time;
    dec.state.tooth_last_time = cur_time;
}

pub(super) fn get_rpm<C, I, T>(dec: &mut TriggerDecoder<C, I, T>) -> u16
where
    C: TriggerClock,
    I: TriggerInputs,
    T: IgnitionTimer,
{
    let cranking_threshold = dec.cfg.ignition.cranking_rpm;
    let teeth = dec.state.trigger_actual_teeth;
    let rpm = if dec.state.last_rpm < cranking_threshold || dec.state.last_rpm < 1500 {
        // Distributors turn slowly enough that the full-period estimate
        // lags badly; stay on the per-tooth estimate well past cranking.
        rpm::cranking_rpm(&mut dec.state, teeth, 720, dec.cfg.edges.stage_cycles)
    } else {
        rpm::std_rpm(&mut dec.state, 720, cranking_threshold)
    };

    // Stall window tracks the actual speed, floored at 50 RPM worth.
    if dec.state.revolution_time > 0 {
        dec.state.max_stall_time = (dec.state.revolution_time << 1).max(MIN_STALL_TIME);
    }

    rpm
}

pub(super) fn set_end_teeth<C, I, T>(dec: &mut TriggerDecoder<C, I, T>)
where
    C: TriggerClock,
    I: TriggerInputs,
    T: IgnitionTimer,
{
    let period = i32::from(dec.state.trigger_actual_teeth.max(1));
    let half = dec.state.trigger_actual_teeth / 2;

    for channel in 0..IGN_CHANNELS {
        let end_angle = i32::from(dec.channels.schedules[channel].end_angle)
            - i32::from(dec.cfg.wheel.trigger_angle);
        let mut tooth = end_angle / i32::from(dec.state.trigger_tooth_angle.max(1)) - 1;
        while tooth > period {
            tooth -= period;
        }
        while tooth <= 0 {
            tooth += period;
        }
        // Fold into the lower half, matching the per-tooth indices the
        // primary handler reports.
        let mut tooth = tooth as u16;
        if half > 0 && tooth > half {
            tooth -= half;
        }
        dec.channels.schedules[channel].end_tooth = tooth;
    }
}
