//! xHCI (USB 3.x host controller) driver core: MMIO register access,
//! Command/Event/Transfer ring protocol, device slot and context lifecycle,
//! and a control-transfer engine for standard and HID boot-protocol enumeration.
//!
//! This crate owns none of the platform's PCI enumeration, interrupt
//! controller programming, or physical memory allocation — those live
//! behind the [`Platform`] trait an embedder implements once per target.
//! Everything else — from `HCRESET` through steady-state HID report
//! delivery — lives here.
//!
//! Grounded throughout on `crates/kernel/src/drivers/xhci/` (see
//! `DESIGN.md` for the per-module ledger); generalized from one PCI-bound
//! kernel driver instance into a `no_std`, allocator-free crate any
//! `Platform` implementer can drive.
#![no_std]

pub mod addr;
pub mod class;
pub mod command;
pub mod config;
pub mod context;
pub mod controller;
pub mod device;
pub mod dma;
pub mod error;
pub mod extended_caps;
pub mod locks;
pub mod logging;
pub mod mmio;
pub mod platform;
pub mod regs;
pub mod rings;
pub mod slots;
pub mod trb;
pub mod usb;
pub mod wait;

pub use class::{ClassDriver, ClassEndpoint};
pub use config::XhciConfig;
pub use controller::{Controller, DriverProbeFn};
pub use error::{Result, XhciError};
pub use platform::{IrqHandler, Platform};
