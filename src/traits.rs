/// Hardware seams the decoder is generic over. The platform layer provides
/// real implementations; tests and the simulator provide synthetic ones.

#[cfg_attr(test, mockall::automock)]
pub trait TriggerClock {
    /// Current value of the monotonic microsecond counter. Wraps at 2^32.
    /// Edge timestamps are drawn from the same counter.
    fn micros(&self) -> u32;
}

#[cfg_attr(test, mockall::automock)]
pub trait TriggerInputs {
    /// Instantaneous level of the primary (crank) input.
    fn primary_level(&self) -> bool;

    /// Instantaneous level of the secondary (cam) input.
    fn secondary_level(&self) -> bool;

    /// Instantaneous level of the tertiary (second cam) input.
    fn tertiary_level(&self) -> bool {
        false
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait IgnitionTimer {
    /// Free-running counter for the given ignition channel, in timer ticks.
    fn counter(&self, channel: usize) -> u32;

    /// Write the live compare register for the given channel.
    fn set_compare(&mut self, channel: usize, compare: u32);

    /// Immediately end the coil charge on the given channel (fire now).
    /// Used by the distributor cranklock.
    fn end_coil_charge(&mut self, channel: usize);

    /// Convert microseconds to timer ticks.
    fn us_to_ticks(&self, us: u32) -> u32;
}
