//! Local APIC: enable, periodic timer, end-of-interrupt.
//!
//! Register access goes through the `x2apic` driver, which uses x2APIC mode
//! when the CPU supports it and the xAPIC register window otherwise. The
//! window is addressed through the direct map. Timer calibration runs
//! against PIT channel 0.

use log::{debug, info, warn};
use raw_cpuid::CpuId;
use x2apic::lapic::{xapic_base, LocalApicBuilder, TimerDivide, TimerMode};
use x86_64::{instructions::port::Port, PhysAddr};

use crate::{
    constants::{
        idt::{APIC_ERROR_VECTOR, SPURIOUS_VECTOR, TIMER_VECTOR},
        ports::{PIC1_DATA, PIC2_DATA, PIT_CHANNEL_0, PIT_MODE_COMMAND},
        x2apic::FALLBACK_INITIAL_COUNT,
    },
    memory::DirectMap,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ApicError {
    #[error("local APIC setup failed: {0}")]
    InitFailed(&'static str),
    #[error("timer count overflows 32 bits")]
    TimerOverflow,
    #[error("timer calibration produced an implausible rate")]
    CalibrationFailed,
    #[error("PIT never counted down")]
    PitTimeout,
}

// PIT constants
const PIT_FREQ: u32 = 1193182;
const PIT_TICKS: u16 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApicMode {
    X2Apic,
    XApic { window: PhysAddr },
}

pub struct LocalApic {
    driver: x2apic::lapic::LocalApic,
    mode: ApicMode,
}

// The driver holds only the register window address, and there is one CPU.
unsafe impl Send for LocalApic {}

impl LocalApic {
    /// Builds the driver for this CPU. Nothing is written to the APIC yet,
    /// so this is safe to call before the xAPIC window is mapped.
    pub fn new(map: DirectMap) -> Result<Self, ApicError> {
        let window = PhysAddr::new(unsafe { xapic_base() });
        let mode = if CpuId::new()
            .get_feature_info()
            .is_some_and(|features| features.has_x2apic())
        {
            ApicMode::X2Apic
        } else {
            ApicMode::XApic { window }
        };

        let driver = LocalApicBuilder::new()
            .set_xapic_base(map.virt(window).as_u64())
            .timer_vector(usize::from(TIMER_VECTOR))
            .error_vector(usize::from(APIC_ERROR_VECTOR))
            .spurious_vector(usize::from(SPURIOUS_VECTOR))
            .timer_mode(TimerMode::Periodic)
            .timer_divide(TimerDivide::Div16)
            .timer_initial(0)
            .build()
            .map_err(ApicError::InitFailed)?;

        debug!("local APIC mode: {:?}", mode);
        Ok(Self { driver, mode })
    }

    pub fn mode(&self) -> ApicMode {
        self.mode
    }

    /// Physical register window that has to be mapped, if any.
    pub fn mmio_window(&self) -> Option<PhysAddr> {
        match self.mode {
            ApicMode::X2Apic => None,
            ApicMode::XApic { window } => Some(window),
        }
    }

    /// # Safety
    /// In xAPIC mode the register window must be mapped.
    pub unsafe fn id(&self) -> u32 {
        self.driver.id()
    }

    /// Enables the APIC with the spurious vector. The timer stays idle with
    /// an initial count of zero until [`LocalApic::start_periodic_timer`].
    pub fn enable(&mut self) {
        unsafe { self.driver.enable() };
    }

    #[inline(always)]
    pub fn end_of_interrupt(&mut self) {
        unsafe { self.driver.end_of_interrupt() };
    }

    /// Periodic timer on the timer vector. Programmed while masked and
    /// unmasked last, so no tick fires with a half-written configuration.
    pub fn start_periodic_timer(&mut self, initial_count: u32) {
        unsafe {
            self.driver.disable_timer();
            self.driver.set_timer_mode(TimerMode::Periodic);
            self.driver.set_timer_divide(TimerDivide::Div16);
            self.driver.set_timer_initial(initial_count);
            self.driver.enable_timer();
        }
        info!("APIC timer running, initial count {}", initial_count);
    }

    /// Measures timer ticks per millisecond against the PIT.
    pub fn calibrate(&mut self) -> Result<u32, ApicError> {
        let mut pit = Pit::new();

        unsafe {
            // Counting continues while the LVT entry is masked.
            self.driver.disable_timer();
            self.driver.set_timer_mode(TimerMode::OneShot);
            self.driver.set_timer_divide(TimerDivide::Div16);

            let pit_ticks = ((PIT_FREQ as u64 * PIT_TICKS as u64) / 1000) as u16;
            pit.configure_for_calibration(pit_ticks);

            // Start APIC timer with maximum value
            self.driver.set_timer_initial(u32::MAX);
            let waited = pit.wait_for_completion(pit_ticks);
            let elapsed = u32::MAX - self.driver.timer_current();
            self.driver.set_timer_initial(0);
            pit.reset();
            waited?;

            let ticks_per_ms = elapsed / (PIT_TICKS as u32);

            // Divided by 16, expect between 100 and 10M ticks per millisecond
            if !(100..=10_000_000).contains(&ticks_per_ms) {
                return Err(ApicError::CalibrationFailed);
            }
            Ok(ticks_per_ms)
        }
    }

    /// Initial count for `hz` interrupts per second, falling back to a fixed
    /// count when calibration fails.
    pub fn timer_count_for(&mut self, hz: u32) -> u32 {
        let period_ms = (1000 / hz.max(1)).max(1);
        match self
            .calibrate()
            .and_then(|per_ms| per_ms.checked_mul(period_ms).ok_or(ApicError::TimerOverflow))
        {
            Ok(count) => count,
            Err(e) => {
                warn!("APIC timer calibration failed ({}), using {}", e, FALLBACK_INITIAL_COUNT);
                FALLBACK_INITIAL_COUNT
            }
        }
    }
}

/// Masks every line of both legacy 8259 PICs so only the APIC delivers.
pub fn mask_legacy_pic() {
    unsafe {
        Port::<u8>::new(PIC1_DATA).write(0xFF);
        Port::<u8>::new(PIC2_DATA).write(0xFF);
    }
}

struct Pit {
    channel0: Port<u8>,
    mode_cmd: Port<u8>,
}

impl Pit {
    const fn new() -> Self {
        Self {
            channel0: Port::new(PIT_CHANNEL_0),
            mode_cmd: Port::new(PIT_MODE_COMMAND),
        }
    }

    unsafe fn configure_for_calibration(&mut self, count: u16) {
        // Channel 0, access mode LSB/MSB, mode 2 (rate generator)
        self.mode_cmd.write(0x34);

        // Write count value - LSB first, then MSB
        self.channel0.write((count & 0xFF) as u8);
        self.channel0.write((count >> 8) as u8);
    }

    unsafe fn read_count(&mut self) -> u16 {
        // Latch count value command for channel 0
        self.mode_cmd.write(0x00);

        // Read count - LSB then MSB
        let low = self.channel0.read() as u16;
        let high = self.channel0.read() as u16;
        (high << 8) | low
    }

    unsafe fn wait_for_completion(&mut self, original_count: u16) -> Result<(), ApicError> {
        let mut prev_count = self.read_count();
        let mut total_ticks = 0;

        for _ in 0..1_000_000 {
            let current = self.read_count();

            total_ticks += pit_ticks_between(prev_count, current, original_count);
            if total_ticks >= original_count as u32 {
                return Ok(());
            }

            prev_count = current;
            core::hint::spin_loop();
        }

        Err(ApicError::PitTimeout)
    }

    unsafe fn reset(&mut self) {
        // Channel 0, LSB/MSB, mode 3
        self.mode_cmd.write(0x36);
        self.channel0.write(0);
        self.channel0.write(0);
    }
}

/// PIT ticks between two reads of a rate-generator counter that reloads
/// with `reload` after reaching zero.
fn pit_ticks_between(prev: u16, current: u16, reload: u16) -> u32 {
    if current > prev {
        u32::from(prev) + u32::from(reload).saturating_sub(u32::from(current))
    } else {
        u32::from(prev - current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pit_countdown_without_reload() {
        assert_eq!(pit_ticks_between(900, 850, 1000), 50);
        assert_eq!(pit_ticks_between(900, 900, 1000), 0);
    }

    #[test]
    fn pit_reload_counts_across_zero() {
        assert_eq!(pit_ticks_between(10, 990, 1000), 20);
    }

    #[test]
    fn pit_reading_above_the_reload_value_does_not_underflow() {
        // Latched before the new reload value took effect.
        assert_eq!(pit_ticks_between(10, 0xFFFF, 1000), 10);
    }
}
