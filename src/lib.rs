//! crabohci - OHCI (USB 1.1) host controller transfer engine
//!
//! A `no_std` driver core for embedding in firmware or a small kernel. The
//! embedder supplies register access, DMA memory and a few platform
//! services; the engine builds descriptor chains, schedules them, retires
//! them from the done list and aborts them safely.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod dma;
pub mod drivers;
pub mod logger;
pub mod platform;

#[cfg(test)]
mod testing;
