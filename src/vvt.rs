//! VVT cam phase measurement.
//!
//! The cam edge handlers sample the crank angle at each cam reference; the
//! offset between that and the configured trigger angle is the cam phase.
//! Raw samples are jittery at the half-degree scale, so they run through an
//! integer exponential filter before publication. Angles are carried in
//! 0.5 degree units (one left shift) to keep the extra resolution without
//! floating point.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VvtMode {
    #[default]
    OpenLoop,
    ClosedLoop,
}

/// Exponential smoothing: `alpha` of 0 passes the input straight through,
/// 255 freezes on the prior value.
pub fn angle_filter(input: i16, alpha: u8, prior: i16) -> i16 {
    let alpha = i32::from(alpha);
    ((i32::from(input) * (256 - alpha) + i32::from(prior) * alpha) >> 8) as i16
}

/// Raw cam phase sample in 0.5 degree units, from a crank angle read at the
/// cam reference edge.
pub fn cam_phase_sample(
    crank_angle: i32,
    trigger_angle: i16,
    mode: VvtMode,
    cl0_duty_angle: i16,
) -> i16 {
    let mut angle = crank_angle;
    while angle >= 360 {
        angle -= 360;
    }
    angle -= i32::from(trigger_angle);
    if mode == VvtMode::ClosedLoop {
        angle -= i32::from(cl0_duty_angle);
    }
    (angle << 1) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_angle_filter_passthrough_at_zero_alpha() {
        assert_eq!(angle_filter(100, 0, -40), 100);
    }

    #[test]
    fn test_angle_filter_blends() {
        // alpha 128 is an even split.
        assert_eq!(angle_filter(100, 128, 0), 50);
        assert_eq!(angle_filter(0, 128, 100), 50);
    }

    #[test]
    fn test_angle_filter_converges() {
        let mut value = 0;
        for _ in 0..64 {
            value = angle_filter(80, 64, value);
        }
        assert!((value - 80).abs() <= 1);
    }

    #[test]
    fn test_cam_phase_sample_normalizes() {
        // 370 degrees folds to 10, minus a 4 degree trigger angle, doubled.
        assert_eq!(cam_phase_sample(370, 4, VvtMode::OpenLoop, 0), 12);
        // Exactly 360 folds to 0, not 360.
        assert_eq!(cam_phase_sample(360, 0, VvtMode::OpenLoop, 0), 0);
        assert_eq!(cam_phase_sample(360, 4, VvtMode::OpenLoop, 0), -8);
    }

    #[test]
    fn test_cam_phase_sample_closed_loop_subtracts_duty_angle() {
        assert_eq!(cam_phase_sample(100, 0, VvtMode::ClosedLoop, 20), 160);
        assert_eq!(cam_phase_sample(100, 0, VvtMode::OpenLoop, 20), 200);
    }
}
