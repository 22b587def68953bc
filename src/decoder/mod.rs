//! Decoder runtime: pattern dispatch, edge routing and the operations the
//! mainline calls.
//!
//! The firmware selects its active decoder by assigning function pointers at
//! configuration time. Here the selection is a pattern tag on
//! [`TriggerDecoder`]; each entry point is a match on that tag into the
//! per-pattern module, so an edge costs one tag compare and a direct call.

use log::{debug, info};

use crate::angle;
use crate::config::{EdgeSelect, TriggerConfig, TriggerSpeed, WheelPattern};
use crate::ignition::{self, IgnitionChannels};
use crate::state::{DecoderFlags, DecoderState};
use crate::status::EngineStatus;
use crate::tooth_log::{EdgeSource, LogMode, ToothLogger};
use crate::traits::{IgnitionTimer, TriggerClock, TriggerInputs};

pub mod distributor;
pub mod dual_wheel;
pub mod missing_tooth;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerChannel {
    Primary,
    Secondary,
    Tertiary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeDirection {
    Rising,
    Falling,
}

/// One hardware edge event, timestamped by the platform from the same
/// counter [`TriggerClock::micros`] reads.
#[derive(Debug, Clone, Copy)]
pub struct TriggerEdge {
    pub channel: TriggerChannel,
    pub direction: EdgeDirection,
    pub timestamp: u32,
}

/// The decoder instance: per-pattern constants, shared state, ignition
/// channel views and the tooth log, generic over the three hardware seams.
pub struct TriggerDecoder<C, I, T> {
    cfg: TriggerConfig,
    pub(crate) state: DecoderState,
    pub(crate) channels: IgnitionChannels,
    pub log: ToothLogger,
    pub(crate) clock: C,
    pub(crate) inputs: I,
    pub(crate) timer: T,
    pub(crate) crank_angle_max: i32,
    pub(crate) vvt1_angle: i16,
    pub(crate) vvt2_angle: i16,
}

fn edge_selected(select: EdgeSelect, direction: EdgeDirection) -> bool {
    match select {
        EdgeSelect::Rising => direction == EdgeDirection::Rising,
        EdgeSelect::Falling => direction == EdgeDirection::Falling,
        EdgeSelect::Both => true,
    }
}

impl<C, I, T> TriggerDecoder<C, I, T>
where
    C: TriggerClock,
    I: TriggerInputs,
    T: IgnitionTimer,
{
    pub fn new(cfg: TriggerConfig, clock: C, inputs: I, timer: T) -> Self {
        info!("=== Trigger Decoder Initialization ===");
        info!(
            "Pattern: {:?}, {} teeth ({} missing), {:?} speed",
            cfg.wheel.pattern, cfg.wheel.trigger_teeth, cfg.wheel.missing_teeth, cfg.wheel.trigger_speed
        );
        info!(
            "Secondary: {:?}, filter {:?}, sequential {}",
            cfg.edges.secondary_pattern,
            cfg.edges.filter_level,
            cfg.sequential()
        );
        info!("=== Ready ===");

        let mut decoder = TriggerDecoder {
            cfg,
            state: DecoderState::new(),
            channels: IgnitionChannels::new(),
            log: ToothLogger::new(LogMode::Off),
            clock,
            inputs,
            timer,
            crank_angle_max: 360,
            vvt1_angle: 0,
            vvt2_angle: 0,
        };
        decoder.setup();
        decoder
    }

    // ========================================================================
    // DECODER OPERATIONS
    // ========================================================================

    /// (Re)initialize all decoder state from configuration. Called at boot
    /// and by the stall supervisor; never depends on prior state.
    pub fn setup(&mut self) {
        self.state = DecoderState::new();
        self.vvt1_angle = 0;
        self.vvt2_angle = 0;
        self.crank_angle_max = if self.cfg.sequential() { 720 } else { 360 };

        match self.cfg.wheel.pattern {
            WheelPattern::MissingTooth => missing_tooth::setup(self),
            WheelPattern::DualWheel => dual_wheel::setup(self),
            WheelPattern::Non360 => dual_wheel::setup_non360(self),
            WheelPattern::BasicDistributor => distributor::setup(self),
        }

        debug!(
            "decoder setup: {} deg/tooth, {} physical teeth, stall {}us",
            self.state.trigger_tooth_angle, self.state.trigger_actual_teeth, self.state.max_stall_time
        );
    }

    /// Route one edge event: clear/seed the valid-trigger flag, apply the
    /// configured polarity selection, run the pattern handler, feed the log.
    pub fn handle_edge(&mut self, edge: TriggerEdge) {
        match edge.channel {
            TriggerChannel::Primary => {
                self.state.flags.remove(DecoderFlags::VALID_TRIGGER);
                if edge_selected(self.cfg.edges.primary_edge, edge.direction) {
                    match self.cfg.wheel.pattern {
                        WheelPattern::MissingTooth => missing_tooth::primary(self, edge.timestamp),
                        WheelPattern::DualWheel | WheelPattern::Non360 => {
                            dual_wheel::primary(self, edge.timestamp)
                        }
                        WheelPattern::BasicDistributor => {
                            distributor::primary(self, edge.timestamp)
                        }
                    }
                }

                let valid = self.state.flags.contains(DecoderFlags::VALID_TRIGGER);
                match self.log.mode() {
                    LogMode::Tooth if valid => self.log_entry(self.state.cur_gap, EdgeSource::Crank),
                    LogMode::Composite => self.log_entry(edge.timestamp, EdgeSource::Crank),
                    _ => {}
                }
            }
            TriggerChannel::Secondary => {
                // Secondary edges always count as valid for composite
                // capture, whether or not they clear the filter.
                self.state.flags.remove(DecoderFlags::VALID_TRIGGER);
                self.state.flags.insert(DecoderFlags::VALID_TRIGGER);
                if edge_selected(self.cfg.edges.secondary_edge, edge.direction) {
                    match self.cfg.wheel.pattern {
                        WheelPattern::MissingTooth => {
                            missing_tooth::secondary(self, edge.timestamp)
                        }
                        WheelPattern::DualWheel | WheelPattern::Non360 => {
                            dual_wheel::secondary(self, edge.timestamp)
                        }
                        WheelPattern::BasicDistributor => {}
                    }
                }

                if self.log.mode() == LogMode::Composite
                    && self.state.flags.contains(DecoderFlags::VALID_TRIGGER)
                {
                    self.log_entry(edge.timestamp, EdgeSource::CamSecondary);
                }
            }
            TriggerChannel::Tertiary => {
                self.state.flags.remove(DecoderFlags::VALID_TRIGGER);
                self.state.flags.insert(DecoderFlags::VALID_TRIGGER);
                if edge_selected(self.cfg.edges.tertiary_edge, edge.direction) {
                    if self.cfg.wheel.pattern == WheelPattern::MissingTooth {
                        missing_tooth::tertiary(self, edge.timestamp);
                    }
                }

                if self.log.mode() == LogMode::Composite
                    && self.state.flags.contains(DecoderFlags::VALID_TRIGGER)
                {
                    self.log_entry(edge.timestamp, EdgeSource::CamTertiary);
                }
            }
        }
    }

    /// Current RPM. 0 until synced; spikes are clamped to the previous
    /// reading.
    pub fn get_rpm(&mut self) -> u16 {
        let rpm = match self.cfg.wheel.pattern {
            WheelPattern::MissingTooth => missing_tooth::get_rpm(self),
            WheelPattern::DualWheel => dual_wheel::get_rpm(self),
            WheelPattern::Non360 => dual_wheel::get_rpm_non360(self),
            WheelPattern::BasicDistributor => distributor::get_rpm(self),
        };
        self.state.last_rpm = rpm;
        rpm
    }

    /// Current crank angle, degrees ATDC in `[0, crank_angle_max)`:
    /// tooth-count base plus time interpolation since the last tooth.
    pub fn get_crank_angle(&self) -> i32 {
        let snapshot = self.state.angle_snapshot();
        let now = self.clock.micros();

        let mut tooth_count = i32::from(snapshot.tooth_current_count);
        if matches!(
            self.cfg.wheel.pattern,
            WheelPattern::DualWheel | WheelPattern::Non360
        ) && tooth_count == 0
        {
            // The cam reference was the last edge seen.
            tooth_count = i32::from(self.cfg.wheel.trigger_teeth);
        }

        let mut crank_angle = (tooth_count - 1) * i32::from(self.state.trigger_tooth_angle);
        if self.cfg.wheel.pattern == WheelPattern::Non360 {
            crank_angle /= i32::from(self.cfg.wheel.angle_multiplier);
        }
        crank_angle += i32::from(self.cfg.wheel.trigger_angle);

        if self.cfg.sequential()
            && snapshot.revolution_one
            && self.cfg.wheel.trigger_speed == TriggerSpeed::Crank
        {
            crank_angle += 360;
        }

        let elapsed = now.wrapping_sub(snapshot.tooth_last_time);
        crank_angle += angle::time_to_angle(elapsed, self.state.revolution_time);

        angle::wrap_angle(crank_angle, self.crank_angle_max)
    }

    /// Recompute every channel's end tooth from its end angle. Called from
    /// the mainline after each advance recomputation.
    pub fn set_end_teeth(&mut self) {
        match self.cfg.wheel.pattern {
            WheelPattern::MissingTooth => missing_tooth::set_end_teeth(self),
            WheelPattern::DualWheel => dual_wheel::set_end_teeth(self),
            WheelPattern::Non360 => dual_wheel::set_end_teeth_non360(self),
            WheelPattern::BasicDistributor => distributor::set_end_teeth(self),
        }
    }

    // ========================================================================
    // MAINLINE QUERIES
    // ========================================================================

    /// No valid primary edge within the stall window; the supervisor should
    /// call `setup()` to reinitialize.
    pub fn is_stalled(&self) -> bool {
        self.clock.micros().wrapping_sub(self.state.tooth_last_time) > self.state.max_stall_time
    }

    pub fn status(&self) -> EngineStatus {
        let state = &self.state;
        let mode = if state.has_sync {
            if self.is_cranking() {
                "CRANK"
            } else {
                "RUN"
            }
        } else if state.half_sync {
            "HALF"
        } else {
            "STOP"
        };

        EngineStatus {
            rpm: state.last_rpm,
            has_sync: state.has_sync,
            half_sync: state.half_sync,
            sync_loss_counter: state.sync_loss_counter,
            start_revolutions: state.start_revolutions,
            crank_angle: self.get_crank_angle(),
            tooth_count: state.tooth_current_count,
            vvt1_angle: self.vvt1_angle,
            vvt2_angle: self.vvt2_angle,
            mode: mode.to_string(),
            updated_ts: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }

    pub fn state(&self) -> &DecoderState {
        &self.state
    }

    pub fn config(&self) -> &TriggerConfig {
        &self.cfg
    }

    pub fn ignition(&self) -> &IgnitionChannels {
        &self.channels
    }

    pub fn ignition_mut(&mut self) -> &mut IgnitionChannels {
        &mut self.channels
    }

    pub fn timer(&self) -> &T {
        &self.timer
    }

    pub fn timer_mut(&mut self) -> &mut T {
        &mut self.timer
    }

    pub fn vvt1_angle(&self) -> i16 {
        self.vvt1_angle
    }

    pub fn vvt2_angle(&self) -> i16 {
        self.vvt2_angle
    }

    // ========================================================================
    // SHARED HELPERS
    // ========================================================================

    pub(crate) fn is_cranking(&self) -> bool {
        self.state.last_rpm < self.cfg.ignition.cranking_rpm
    }

    pub(crate) fn per_tooth_patch(&mut self, crank_angle: i32, current_tooth: u16) {
        ignition::check_per_tooth_timing(
            &mut self.timer,
            &mut self.channels,
            crank_angle,
            current_tooth,
            self.state.last_rpm,
            self.state.revolution_time,
            self.state.start_revolutions,
            self.crank_angle_max,
        );
    }

    fn log_entry(&mut self, value: u32, source: EdgeSource) {
        let pri = self.inputs.primary_level();
        let sec = self.inputs.secondary_level();
        self.log
            .record(value, source, pri, sec, self.state.has_sync);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{MockIgnitionTimer, MockTriggerClock, MockTriggerInputs};

    fn mock_decoder(
        cfg: TriggerConfig,
    ) -> TriggerDecoder<MockTriggerClock, MockTriggerInputs, MockIgnitionTimer> {
        let mut clock = MockTriggerClock::new();
        clock.expect_micros().return_const(0u32);
        let mut inputs = MockTriggerInputs::new();
        inputs.expect_primary_level().return_const(false);
        inputs.expect_secondary_level().return_const(false);
        TriggerDecoder::new(cfg, clock, inputs, MockIgnitionTimer::new())
    }

    #[test]
    fn test_setup_is_idempotent() {
        let mut decoder = mock_decoder(TriggerConfig::default());
        decoder.setup();
        let first = decoder.state.clone();
        decoder.setup();
        assert_eq!(decoder.state, first);
    }

    #[test]
    fn test_falling_edges_ignored_when_rising_selected() {
        let mut decoder = mock_decoder(TriggerConfig::default());
        decoder.handle_edge(TriggerEdge {
            channel: TriggerChannel::Primary,
            direction: EdgeDirection::Falling,
            timestamp: 1000,
        });
        assert_eq!(decoder.state.tooth_current_count, 0);
        assert!(!decoder.state.flags.contains(DecoderFlags::VALID_TRIGGER));

        decoder.handle_edge(TriggerEdge {
            channel: TriggerChannel::Primary,
            direction: EdgeDirection::Rising,
            timestamp: 2000,
        });
        assert_eq!(decoder.state.tooth_current_count, 1);
        assert!(decoder.state.flags.contains(DecoderFlags::VALID_TRIGGER));
    }

    #[test]
    fn test_stall_detection_uses_stall_window() {
        let cfg = TriggerConfig::default();
        let mut clock = MockTriggerClock::new();
        // 36-1 crank wheel: stall window is (166667/50) * 10 * 2 = 66660us.
        clock.expect_micros().return_const(1_000_000u32);
        let mut inputs = MockTriggerInputs::new();
        inputs.expect_primary_level().return_const(false);
        inputs.expect_secondary_level().return_const(false);
        let mut decoder = TriggerDecoder::new(cfg, clock, inputs, MockIgnitionTimer::new());

        decoder.state.tooth_last_time = 990_000;
        assert!(!decoder.is_stalled());
        decoder.state.tooth_last_time = 900_000;
        assert!(decoder.is_stalled());
    }

    #[test]
    fn test_crank_angle_stays_in_range_without_sync() {
        let decoder = mock_decoder(TriggerConfig::default());
        let angle = decoder.get_crank_angle();
        assert!((0..360).contains(&angle));
    }
}
