use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::filter::FilterLevel;
use crate::vvt::VvtMode;

/// Which decoder runs. Non360 shares the dual-wheel edge handlers; only its
/// setup, angle reconstruction and end-tooth mapping differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WheelPattern {
    #[default]
    MissingTooth,
    DualWheel,
    BasicDistributor,
    Non360,
}

/// Whether the primary wheel turns at crank or cam speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TriggerSpeed {
    #[default]
    Crank,
    Cam,
}

/// Cam input pattern for the missing-tooth decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SecondaryPattern {
    /// One tooth per cam revolution.
    #[default]
    Single,
    /// Four teeth, one missing.
    FourMinusOne,
    /// No edges; the static level is polled at tooth #1.
    PollLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EdgeSelect {
    #[default]
    Rising,
    Falling,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SparkMode {
    #[default]
    Wasted,
    Sequential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InjectionLayout {
    #[default]
    Paired,
    Sequential,
}

/// Trigger wheel geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WheelConfig {
    pub pattern: WheelPattern,
    /// Logical tooth positions in the pattern (including missing ones).
    pub trigger_teeth: u16,
    /// Consecutive missing teeth (missing-tooth pattern only).
    pub missing_teeth: u16,
    /// Degrees ATDC of tooth #1.
    pub trigger_angle: i16,
    pub trigger_speed: TriggerSpeed,
    /// Non-360 angle multiplier.
    pub angle_multiplier: u16,
    pub n_cylinders: u8,
}

impl Default for WheelConfig {
    fn default() -> Self {
        WheelConfig {
            pattern: WheelPattern::MissingTooth,
            trigger_teeth: 36,
            missing_teeth: 1,
            trigger_angle: 0,
            trigger_speed: TriggerSpeed::Crank,
            angle_multiplier: 1,
            n_cylinders: 4,
        }
    }
}

/// Edge selection, filtering and sync-related tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    pub primary_edge: EdgeSelect,
    pub secondary_edge: EdgeSelect,
    pub tertiary_edge: EdgeSelect,
    pub filter_level: FilterLevel,
    pub secondary_pattern: SecondaryPattern,
    /// Level that marks revolution one in poll-level mode.
    pub poll_level_high: bool,
    /// Revolutions of cranking before the per-tooth RPM estimate is trusted.
    pub stage_cycles: u16,
    /// Snap the primary count back to the cam reference on mismatch.
    pub use_resync: bool,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        EdgeConfig {
            primary_edge: EdgeSelect::Rising,
            secondary_edge: EdgeSelect::Rising,
            tertiary_edge: EdgeSelect::Rising,
            filter_level: FilterLevel::Lite,
            secondary_pattern: SecondaryPattern::Single,
            poll_level_high: true,
            stage_cycles: 0,
            use_resync: true,
        }
    }
}

/// Ignition-facing options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IgnitionConfig {
    /// Re-arm the timer compare from every end tooth.
    pub per_tooth: bool,
    pub spark_mode: SparkMode,
    pub injection_layout: InjectionLayout,
    /// Lock cranking timing to the trigger (distributor only).
    pub cranklock: bool,
    /// Below this RPM the engine counts as cranking.
    pub cranking_rpm: u16,
}

impl Default for IgnitionConfig {
    fn default() -> Self {
        IgnitionConfig {
            per_tooth: false,
            spark_mode: SparkMode::Wasted,
            injection_layout: InjectionLayout::Paired,
            cranklock: false,
            cranking_rpm: 400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VvtConfig {
    pub enabled: bool,
    pub mode: VvtMode,
    /// Closed-loop zero-duty cam angle, subtracted from VVT1 samples.
    pub cl0_duty_angle: i16,
    /// Same, for the second cam.
    pub vvt2_cl0_duty_angle: i16,
    /// Exponential filter strength (0 = unfiltered, 255 = frozen).
    pub angle_filter: u8,
}

impl Default for VvtConfig {
    fn default() -> Self {
        VvtConfig {
            enabled: false,
            mode: VvtMode::OpenLoop,
            cl0_duty_angle: 0,
            vvt2_cl0_duty_angle: 0,
            angle_filter: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(default)]
    pub wheel: WheelConfig,
    #[serde(default)]
    pub edges: EdgeConfig,
    #[serde(default)]
    pub ignition: IgnitionConfig,
    #[serde(default)]
    pub vvt: VvtConfig,
}

impl TriggerConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading trigger config {}", path))?;
        let cfg: TriggerConfig = serde_json::from_str(&content)
            .with_context(|| format!("parsing trigger config {}", path))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Sequential operation (spark or fuel) widens the cycle to 720 degrees
    /// and demands cam-backed sync.
    pub fn sequential(&self) -> bool {
        self.ignition.spark_mode == SparkMode::Sequential
            || self.ignition.injection_layout == InjectionLayout::Sequential
    }

    pub fn validate(&self) -> Result<()> {
        let w = &self.wheel;
        if w.trigger_teeth == 0 {
            bail!("trigger_teeth must be at least 1");
        }
        match w.pattern {
            WheelPattern::MissingTooth => {
                if !(1..=2).contains(&w.missing_teeth) {
                    bail!("missing_teeth must be 1 or 2, got {}", w.missing_teeth);
                }
                if w.missing_teeth >= w.trigger_teeth {
                    bail!(
                        "wheel needs more positions ({}) than missing teeth ({})",
                        w.trigger_teeth,
                        w.missing_teeth
                    );
                }
            }
            WheelPattern::BasicDistributor => {
                if !(1..=8).contains(&w.n_cylinders) {
                    bail!("distributor supports 1-8 cylinders, got {}", w.n_cylinders);
                }
            }
            WheelPattern::Non360 => {
                if w.angle_multiplier == 0 {
                    bail!("angle_multiplier must be at least 1");
                }
            }
            WheelPattern::DualWheel => {}
        }
        if !(-360..=360).contains(&w.trigger_angle) {
            bail!("trigger_angle out of range: {}", w.trigger_angle);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = TriggerConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.wheel.trigger_teeth, 36);
        assert!(!cfg.sequential());
    }

    #[test]
    fn test_validate_rejects_bad_missing_teeth() {
        let mut cfg = TriggerConfig::default();
        cfg.wheel.missing_teeth = 3;
        assert!(cfg.validate().is_err());

        cfg.wheel.missing_teeth = 1;
        cfg.wheel.trigger_teeth = 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_distributor() {
        let mut cfg = TriggerConfig::default();
        cfg.wheel.pattern = WheelPattern::BasicDistributor;
        cfg.wheel.n_cylinders = 12;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_sequential_from_either_side() {
        let mut cfg = TriggerConfig::default();
        cfg.ignition.spark_mode = SparkMode::Sequential;
        assert!(cfg.sequential());

        let mut cfg = TriggerConfig::default();
        cfg.ignition.injection_layout = InjectionLayout::Sequential;
        assert!(cfg.sequential());
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut cfg = TriggerConfig::default();
        cfg.wheel.trigger_teeth = 60;
        cfg.wheel.missing_teeth = 2;
        cfg.edges.filter_level = FilterLevel::Medium;
        cfg.vvt.enabled = true;

        let json = serde_json::to_string(&cfg).expect("serialize failed");
        let restored: TriggerConfig = serde_json::from_str(&json).expect("deserialize failed");
        assert_eq!(restored.wheel.trigger_teeth, 60);
        assert_eq!(restored.wheel.missing_teeth, 2);
        assert_eq!(restored.edges.filter_level, FilterLevel::Medium);
        assert!(restored.vvt.enabled);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile failed");
        write!(
            file,
            r#"{{ "wheel": {{ "pattern": "DualWheel", "trigger_teeth": 24,
                 "missing_teeth": 0, "trigger_angle": 0,
                 "trigger_speed": "Crank", "angle_multiplier": 1,
                 "n_cylinders": 6 }} }}"#
        )
        .expect("write failed");

        let cfg = TriggerConfig::from_file(file.path().to_str().unwrap()).expect("load failed");
        assert_eq!(cfg.wheel.pattern, WheelPattern::DualWheel);
        assert_eq!(cfg.wheel.trigger_teeth, 24);

        assert!(TriggerConfig::from_file("/nonexistent/trigger.json").is_err());
    }
}
