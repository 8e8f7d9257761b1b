//! AArch64 (Raspberry Pi 3 class) support: boot stub, exception vectors,
//! context-switch primitives, generic-timer access.

pub mod boot;
pub mod switch;
pub mod timer;
pub mod vectors;
