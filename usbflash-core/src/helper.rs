//! Privileged fallback for unmounting and opening devices.
//!
//! When the process lacks the rights to unmount a file system or to open a
//! disk node for writing, a [`PrivilegedHelper`] is asked to do it instead.
//! Devices are identified by their kernel `dev_t`, the same number `stat`
//! reports as `st_dev` for a mounted path and `st_rdev` for a device node.
use std::os::fd::OwnedFd;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HelperError {
    #[error("no device with number {0:#x} is known to the helper")]
    UnknownDevice(u64),

    #[error("helper refused the request: {0}")]
    Refused(String),

    #[error("helper is unavailable: {0}")]
    Unavailable(String),
}

/// How a device node is opened through the helper. The access mode travels
/// separately from the `open(2)` flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    ReadWrite,
}

/// Something that can unmount and open devices on our behalf.
pub trait PrivilegedHelper: Send + Sync {
    /// Forcibly unmounts the file system on device `dev`.
    fn unmount(&self, dev: u64) -> Result<(), HelperError>;

    /// Opens device `dev` with `access` and extra `open(2)` flags such as
    /// `O_SYNC`. `flags` never carries an access mode.
    fn open_device(&self, dev: u64, access: Access, flags: i32) -> Result<OwnedFd, HelperError>;
}
