//! Error types shared by every stage of a transfer.
//!
//! Errors are grouped the way a front-end reports them: problems with the
//! source image ([`SourceError`]), problems acquiring the device
//! ([`DeviceError`]) and failures in the middle of a transfer (the remaining
//! [`Error`] variants). The underlying OS error, when there is one, is kept as
//! the `source()` so callers can show it next to the message.
use std::io;
use thiserror::Error;

/// Reasons an image cannot be opened for streaming.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("invalid source image")]
    InvalidSource,

    #[error("encrypted or unsupported zip/archive entry")]
    EncryptedOrUnsupportedZip,

    #[error("unsupported compression method inside the archive")]
    UnsupportedInnerCodec,

    #[error("{0} images are not supported")]
    RejectedFormat(&'static str),

    #[error("corrupt header: {0}")]
    CorruptHeader(&'static str),

    #[error("unable to open source: {0}")]
    SourceOpenFailed(#[source] io::Error),
}

/// Reasons a target device cannot be acquired.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("no such target device")]
    NoSuchTarget,

    #[error("image ({expected} bytes) does not fit on the target ({capacity} bytes)")]
    SizeExceedsCapacity { expected: u64, capacity: u64 },

    #[error("refusing to touch {0}, it is mounted as a system partition")]
    MountSafety(String),

    #[error("target device is busy")]
    Busy,

    #[error("unable to unmount {path}")]
    UmountFailed {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("serial communication error: {0}")]
    Comm(String),

    #[error("unable to open target device {path}")]
    OpenFailed {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Top-level error returned by the streaming and transfer entry points.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("decompression error: {0}")]
    Codec(String),

    #[error("error writing target")]
    Write(#[source] io::Error),

    #[error("error reading source")]
    Read(#[source] io::Error),

    #[error("verification failed at offset {offset}")]
    VerifyMismatch { offset: u64 },

    #[error("not enough free space on the destination")]
    SpaceExhausted,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("operation cancelled by user")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn codec(err: impl std::fmt::Display) -> Self {
        Error::Codec(err.to_string())
    }
}
