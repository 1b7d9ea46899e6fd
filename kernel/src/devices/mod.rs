//! Device access used by the core: the serial console.

pub mod serial;
