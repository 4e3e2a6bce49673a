//! Provides platform-specific functionality.
//!
//! This module contains the logic for interacting with the operating system:
//! discovering candidate targets, keeping the running system's disks out of
//! reach, unmounting and exclusively opening devices, and configuring serial
//! ports. Only Linux is supported; the optional UDisks2 helper is compiled in
//! with the `udisks` feature.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;

#[cfg(all(target_os = "linux", feature = "udisks"))]
mod udisks;
#[cfg(all(target_os = "linux", feature = "udisks"))]
pub use self::udisks::UDisks2Helper;
