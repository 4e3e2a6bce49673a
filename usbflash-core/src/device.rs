use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const GIB: u64 = 1 << 30;
const MIB: u64 = 1 << 20;

/// How a target is addressed by the platform layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetId {
    /// A whole-disk block device, by kernel name (e.g. `sdb`, `mmcblk0`).
    Block { name: String },
    /// A serial port, by device node (e.g. `/dev/ttyUSB0`).
    Serial { port: PathBuf },
    /// A regular file standing in for a disk.
    File(PathBuf),
}

/// A device an image can be written to or read from.
///
/// Targets are produced by [`crate::platform::Devices::list_targets`] and are
/// only valid until the next refresh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub id: TargetId,
    /// Size in bytes, 0 for serial ports.
    pub capacity: u64,
    /// Human-readable description shown in pickers.
    pub label: String,
}

impl Target {
    /// A regular file used as a disk of `capacity` bytes.
    pub fn file(path: impl Into<PathBuf>, capacity: u64) -> Self {
        let path = path.into();
        Self {
            label: format!("{} [{}]", path.display(), format_capacity(capacity)),
            id: TargetId::File(path),
            capacity,
        }
    }

    pub fn is_serial(&self) -> bool {
        matches!(self.id, TargetId::Serial { .. })
    }

    /// Device node path, e.g. `/dev/sdb`.
    pub fn path(&self, dev_root: &Path) -> PathBuf {
        match &self.id {
            TargetId::Block { name } => dev_root.join(name),
            TargetId::Serial { port } => port.clone(),
            TargetId::File(path) => path.clone(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// Formats a size with one decimal, in GiB, or in MiB below 1 GiB.
pub fn format_capacity(bytes: u64) -> String {
    let tenths = bytes.saturating_mul(10) / GIB;
    if tenths >= 10 {
        return format!("{}.{} GiB", tenths / 10, tenths % 10);
    }
    let tenths = bytes.saturating_mul(10).saturating_add(MIB - 1) / MIB;
    format!("{}.{} MiB", tenths / 10, tenths % 10)
}

/// Builds the picker label for a block device.
pub(crate) fn block_label(name: &str, capacity: u64, vendor: &str, model: &str) -> String {
    let mut label = format!("{name} [{}]", format_capacity(capacity));
    for part in [vendor, model] {
        if !part.is_empty() {
            label.push(' ');
            label.push_str(part);
        }
    }
    label
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleKind {
    Block,
    Serial,
    File,
}

/// An open target, exclusively held for one transfer.
#[derive(Debug)]
pub struct DeviceHandle {
    pub(crate) file: File,
    pub(crate) path: PathBuf,
    pub(crate) kind: HandleKind,
    pub(crate) capacity: u64,
}

impl DeviceHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    pub fn is_serial(&self) -> bool {
        self.kind == HandleKind::Serial
    }

    /// Size in bytes, 0 when unknown (serial ports).
    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

impl Read for DeviceHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for DeviceHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for DeviceHandle {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}
