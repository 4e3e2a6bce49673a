//! Run-time knobs consumed by the core.
//!
//! A [`Config`] is built once by the front-end and handed to every entry
//! point. Nothing in the library keeps process-wide state.
use crate::error::{Error, Result};
use std::path::PathBuf;

/// Size of one MiB in bytes.
pub const MIB: usize = 1024 * 1024;

/// Largest selectable transfer block, in MiB.
pub const MAX_BLOCK_MIB: usize = 512;

/// Baud rates a serial target can be driven at, in ascending order.
pub const BAUD_RATES: [u32; 15] = [
    57600, 115200, 230400, 460800, 500000, 576000, 921600, 1000000, 1152000, 1500000, 2000000,
    2500000, 3000000, 3500000, 4000000,
];

/// How serial-capable character devices are treated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SerialMode {
    /// Serial ports are not listed as targets.
    #[default]
    Off,
    /// Serial ports are listed and the image is sent verbatim.
    Raw,
    /// Serial ports are listed and the bootloader handshake runs before the
    /// image is sent.
    Handshake,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Bytes moved per transfer step. Always a power-of-two number of MiB.
    pub block_size: usize,
    /// List every disk, including the ones backing system mount points.
    pub show_all_disks: bool,
    /// Always write, never compare against the current device content first.
    pub force: bool,
    /// Read every written block back and compare it.
    pub verify: bool,
    /// Skip disks larger than this many bytes when listing (ignored when
    /// `show_all_disks` is set).
    pub max_disk_size: Option<u64>,
    pub serial: SerialMode,
    pub baud: u32,
    /// Preferred directory for backups.
    pub backup_dir: Option<PathBuf>,
    /// Compress backups with zstd.
    pub compress_backup: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: MIB,
            show_all_disks: false,
            force: false,
            verify: true,
            max_disk_size: None,
            serial: SerialMode::Off,
            baud: 115200,
            backup_dir: None,
            compress_backup: false,
        }
    }
}

impl Config {
    /// Selects the transfer block size in MiB.
    ///
    /// Only powers of two between 1 and [`MAX_BLOCK_MIB`] are accepted.
    pub fn set_block_size_mib(&mut self, mib: usize) -> Result<()> {
        if mib == 0 || mib > MAX_BLOCK_MIB || !mib.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "block size must be a power of two between 1 and {MAX_BLOCK_MIB} MiB, got {mib}"
            )));
        }
        self.block_size = mib * MIB;
        Ok(())
    }

    /// Sets the serial baud rate, rounding down to the closest supported rate.
    /// A rate below every supported one leaves the current rate in place.
    pub fn set_baud(&mut self, rate: u32) {
        if let Some(baud) = snap_baud(rate) {
            self.baud = baud;
        }
    }
}

/// Returns the highest supported baud rate not above `rate`.
pub fn snap_baud(rate: u32) -> Option<u32> {
    BAUD_RATES.iter().copied().take_while(|&b| b <= rate).last()
}
