//! I/O port definitions.

/// Base I/O port address for the first serial port (COM1).
pub const SERIAL_PORT: u16 = 0x3F8;

/// Data ports of the legacy 8259 PIC pair.
pub const PIC1_DATA: u16 = 0x21;
pub const PIC2_DATA: u16 = 0xA1;

pub const PIT_CHANNEL_0: u16 = 0x40;
pub const PIT_MODE_COMMAND: u16 = 0x43;
