// Virtual memory core: lazy page materialization, anonymous and file-backed
// pages, mmap'ed file I/O, stack growth, and clock eviction with swap.
//
// The scheduler, trap entry path, and real block/filesystem drivers live
// outside this crate; `drivers` and `fs` carry the seams this core consumes.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod drivers;
pub mod fs;
pub mod memory;
pub mod process;

#[cfg(test)]
mod tests;

pub use memory::vm::{vm, vm_init};
