//! The core, UI-agnostic library for the `usbflash` disk imaging utility.
//!
//! `usbflash-core` streams disk images to removable block devices and serial
//! boot targets, and backs devices up to image files. Images may be raw or
//! wrapped in gzip, bzip2, xz, zstd, zip or a boxed container, optionally with
//! a single-member tar or cpio archive inside; the format is detected from the
//! file's content, never its name, and decoded block by block with bounded
//! memory.
//!
//! The library is structured into several key modules:
//! - [`format`], [`codec`] and [`archive`]: content sniffing, incremental
//!   decoders and archive member location.
//! - [`stream`]: [`stream::ImageReader`] and [`stream::ImageWriter`], the
//!   streaming sessions built on top of them.
//! - [`platform`]: target discovery and exclusive device acquisition, with an
//!   optional [`helper::PrivilegedHelper`] fallback.
//! - [`mod@write`] and [`mod@read`]: the transfer orchestrators.
//!
//! The primary entry points are [`write::run`] and [`read::run`]. They block
//! until the transfer ends, check a shared liveness flag between blocks and
//! report progress through a callback, so any front-end can drive them from a
//! worker thread.
//!
//! ## Example: Writing an Image with Progress Reporting
//!
//! ```rust,no_run
//! use usbflash_core::{config::Config, platform::Devices, transfer::Event, write};
//! use std::path::Path;
//! use std::sync::{Arc, atomic::AtomicBool};
//!
//! fn main() -> usbflash_core::Result<()> {
//!     let config = Config::default();
//!     let mut devices = Devices::new();
//!     devices.list_targets(&config)?;
//!     let target = devices.target(0)?.clone();
//!
//!     // Cleared from a signal handler to cancel between blocks.
//!     let running = Arc::new(AtomicBool::new(true));
//!
//!     let summary = write::run(
//!         Path::new("path/to/image.img.xz"),
//!         &devices,
//!         &target,
//!         &config,
//!         running,
//!         |event| {
//!             if let Event::Progress(status) = event {
//!                 println!("{}% {}", status.percent, status.text);
//!             }
//!         },
//!     )?;
//!     println!("{}", summary.status.text);
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod format;
pub mod helper;
pub mod platform;
pub mod progress;
pub mod read;
pub mod serial;
pub mod stream;
pub mod transfer;
pub mod write;

pub use error::{DeviceError, Error, Result, SourceError};
