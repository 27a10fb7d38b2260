//! Physical/virtual memory management.
//!
//! - [`bitmap`]: the bit-tracking primitive shared with the filesystem.
//! - [`pool`]: physical frame pools and virtual-address pools.
//! - [`paging`]: PDE/PTE edits through the recursive self-map.
//! - [`heap`]: size-class arena model for the small-block allocator.
//! - [`vm`]: init, the page-granular API, `sys_malloc`/`sys_free`, and the
//!   kernel's `#[global_allocator]`.

pub mod bitmap;
pub mod heap;

#[cfg(target_arch = "x86")]
pub mod paging;
#[cfg(target_arch = "x86")]
pub mod pool;
#[cfg(target_arch = "x86")]
mod vm;

#[cfg(target_arch = "x86")]
pub use vm::*;
