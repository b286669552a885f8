//! Hardware drivers
//!
//! Host controller drivers built on the platform DMA and register seams.

pub mod usb;
