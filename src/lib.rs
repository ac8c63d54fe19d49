//! # sdspi-disk
//!
//! > An SD/MMC over SPI block driver written in Embedded Rust
//!
//! This crate drives an SD or MMC card over an SPI bus that may be shared
//! with other peripherals (for example a dot-matrix display), and exposes it
//! to a filesystem through the classic five-function disk-I/O contract
//! (`init`, `status`, `read`, `write`, `control`). It is written in
//! pure-Rust, is `#![no_std]` and does not use `alloc` or `collections`.
//!
//! ## Using the crate
//!
//! You will need something that implements the [`Transport`] trait. For a
//! plain `embedded-hal` SPI bus and chip-select pin, use one of the
//! provided adapters.
//!
//! ```rust
//! use sdspi_disk::{DiskIo, ExclusiveTransport, SdCard, BLOCK_LEN};
//!
//! fn example<S, CS, D>(spi: S, cs: CS, delay: D)
//! where
//!     S: embedded_hal::spi::SpiBus,
//!     CS: embedded_hal::digital::OutputPin,
//!     D: embedded_hal::delay::DelayNs,
//! {
//!     let sdcard = SdCard::new(ExclusiveTransport::new(spi, cs), delay);
//!     let status = sdcard.init(0);
//!     if status.is_empty() {
//!         let mut buffer = [0u8; BLOCK_LEN];
//!         let _ = sdcard.read(0, &mut buffer, 0, 1);
//!     }
//! }
//! ```
//!
//! ## Features
//!
//! * `log`: Enabled by default. Generates log messages using the `log` crate.
//! * `defmt-log`: By turning off the default features and enabling the
//!   `defmt-log` feature you can configure this crate to log messages over defmt
//!   instead.
//! * `embassy-sync-06`: Enabled by default. Provides a transport that holds an
//!   `embassy-sync` blocking mutex for the whole of each card operation.
//!
//! You cannot enable both the `log` feature and the `defmt-log` feature.

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

#[cfg(test)]
#[macro_use]
extern crate hex_literal;

#[macro_use]
mod structure;

pub mod blockdevice;
pub mod diskio;
pub mod sdcard;

#[doc(inline)]
pub use blockdevice::{Block, BlockCount, BlockDevice, BlockIdx, BLOCK_LEN, BLOCK_LEN_U32};

#[doc(inline)]
pub use diskio::{CardStatus, ControlCode, DiskError, DiskIo};

#[doc(inline)]
pub use sdcard::Error as SdCardError;

#[doc(inline)]
pub use sdcard::{
    AcquireOpts, CardGeometry, CardVariant, ErrorKind, RegisterKind, Response, ResponseKind,
    SdCard, TimeoutKind,
};

#[doc(inline)]
pub use sdcard::transport::{
    ClockProfile, Exchange, ExclusiveTransport, RefCellTransport, Transport, TransportError,
};

#[cfg(feature = "embassy-sync-06")]
#[doc(inline)]
pub use sdcard::transport::EmbassyMutexTransport;

#[doc(inline)]
pub use structure::extract_bits;

#[cfg(all(feature = "defmt-log", feature = "log"))]
compile_error!("Cannot enable both log and defmt-log");

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::debug! but does nothing at all
macro_rules! debug {
    ($($arg:tt)+) => {};
}

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::trace! but does nothing at all
macro_rules! trace {
    ($($arg:tt)+) => {};
}

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::warn! but does nothing at all
macro_rules! warn {
    ($($arg:tt)+) => {};
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
