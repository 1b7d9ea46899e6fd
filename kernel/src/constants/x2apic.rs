//! Local APIC configuration constants.

/// CPU timer frequency in Hertz.
/// Determines how often timer interrupts occur.
pub const CPU_FREQUENCY: u32 = 100;

/// Initial count used when PIT calibration fails.
pub const FALLBACK_INITIAL_COUNT: u32 = 10_000_000;
