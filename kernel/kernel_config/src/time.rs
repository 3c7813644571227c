//! Time bases for the scheduler and the timer-event machinery.

/// The chosen tick frequency (in Hertz) of the system clock.
pub const CONFIG_CLOCK_FREQUENCY_HZ: u64 = 1000;

/// Nanoseconds per clock tick at the configured frequency.
pub const NS_PER_TICK: u64 = 1_000_000_000 / CONFIG_CLOCK_FREQUENCY_HZ;

/// Length of one scheduling quantum, in clock ticks.
/// A thread runs for this many ticks before the time-slice event preempts it.
pub const TSK_TIMESLICE_LEN: u64 = 10;
