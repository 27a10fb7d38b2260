//! Thin architecture layer for 32-bit protected-mode x86.
//!
//! Everything the rest of the kernel needs from the CPU lives here: typed
//! addresses, port I/O, and the handful of privileged instructions (interrupt
//! flag control, `hlt`, CR3, `invlpg`).

pub mod addr;
pub mod instructions;
pub mod port;

pub use addr::{PhysAddr, VirtAddr};
