//! Types shared by the write and backup orchestrators.
use crate::error::{Error, Result};
use crate::progress::Status;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Where a transfer currently is. Verification is interleaved with writing,
/// so there is no separate verify phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Opening,
    Transferring,
    Closing,
    Done,
    Failed,
}

/// Notifications sent to the front-end while a transfer runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Phase(Phase),
    Progress(Status),
}

/// Outcome of a successful transfer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub elapsed: Duration,
    /// Plaintext bytes moved, including sector padding.
    pub bytes: u64,
    /// Bytes physically written to the destination.
    pub written: u64,
    /// Bytes left alone because the destination already held them.
    pub skipped: u64,
    /// The backup file, for the read direction.
    pub output: Option<PathBuf>,
    /// Final status line.
    pub status: Status,
}

pub(crate) fn check_running(running: &AtomicBool) -> Result<()> {
    if running.load(Ordering::SeqCst) {
        Ok(())
    } else {
        Err(Error::Cancelled)
    }
}
