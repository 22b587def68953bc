use serde::{Deserialize, Serialize};

/// Decoder status snapshot published to the rest of the controller
///
/// This carries everything the dash/telemetry side needs to display engine
/// state: speed, position, sync quality and the VVT phase angles. It is a
/// plain copy taken on the mainline; the decoder itself never blocks on it.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EngineStatus {
    /// Current engine speed.
    pub rpm: u16,

    /// Full sync: tooth-to-angle mapping known for the whole cycle.
    pub has_sync: bool,

    /// Crank position known modulo 360 but cam phase not yet confirmed.
    pub half_sync: bool,

    /// Sync losses since boot.
    pub sync_loss_counter: u16,

    /// Revolutions since boot (saturating).
    pub start_revolutions: u16,

    /// Current crank angle, degrees ATDC.
    pub crank_angle: i32,

    /// Tooth index at the time of the snapshot.
    pub tooth_count: u16,

    /// Cam phase angles in 0.5 degree units.
    pub vvt1_angle: i16,
    pub vvt2_angle: i16,

    /// Operating mode: "STOP", "CRANK", "HALF" or "RUN".
    pub mode: String,

    /// Unix timestamp of the snapshot.
    pub updated_ts: u64,
}

impl Default for EngineStatus {
    fn default() -> Self {
        EngineStatus {
            rpm: 0,
            has_sync: false,
            half_sync: false,
            sync_loss_counter: 0,
            start_revolutions: 0,
            crank_angle: 0,
            tooth_count: 0,
            vvt1_angle: 0,
            vvt2_angle: 0,
            mode: "STOP".to_string(),
            updated_ts: 0,
        }
    }
}
