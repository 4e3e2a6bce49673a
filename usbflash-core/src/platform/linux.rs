use crate::config::{Config, SerialMode};
use crate::device::{DeviceHandle, HandleKind, Target, TargetId, block_label};
use crate::error::{DeviceError, Error, Result};
use crate::helper::{Access, PrivilegedHelper};
use crate::serial;
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::ioctl_read;
use nix::mount::{MntFlags, umount2};
use nix::sys::termios::{self, BaudRate, ControlFlags, SetArg, SpecialCharacterIndices};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use tracing::{debug, warn};

ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// Mount points whose backing disk is never listed nor opened.
const CRITICAL_MOUNTS: [&str; 2] = ["/", "/boot"];

/// Mount points whose backing disk is only listed with "show all disks".
const SYSTEM_MOUNTS: [&str; 6] = ["/", "/boot", "/home", "/var", "/usr", "/srv"];

/// Extra `open(2)` flags for writing a whole disk. The access mode is given
/// separately, which is also what the privileged helper expects.
const WRITE_FLAGS: i32 = libc::O_SYNC | libc::O_EXCL;

/// Sysfs block device prefixes that can be targets.
const BLOCK_PREFIXES: [&str; 2] = ["sd", "mmcblk"];

/// One line of the mount table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct MountEntry {
    /// Mount point, still escaped the way the kernel prints it.
    pub mount_point: String,
    /// Mount source, e.g. `/dev/sdb1`.
    pub source: String,
}

impl MountEntry {
    /// Kernel name of the whole disk behind this mount, if it is a disk.
    fn disk(&self) -> Option<&str> {
        self.source.strip_prefix("/dev/").map(parent_device)
    }
}

/// Whether `mount_point` is `root` itself or lies below it. The root file
/// system only protects itself, not everything mounted beneath it.
fn is_under(mount_point: &str, root: &str) -> bool {
    if root == "/" {
        mount_point == "/"
    } else {
        Path::new(mount_point).starts_with(root)
    }
}

/// The protected root in `roots` that `mount_point` falls under.
fn protected_by<'a>(mount_point: &str, roots: &[&'a str]) -> Option<&'a str> {
    roots.iter().copied().find(|root| is_under(mount_point, root))
}

/// Parses `/proc/self/mountinfo`.
///
/// The mount point is the fifth field; the source follows the file system
/// type after the `-` separator.
pub(crate) fn parse_mountinfo(text: &str) -> Vec<MountEntry> {
    text.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let mount_point = fields.get(4)?;
            let sep = fields.iter().skip(5).position(|&f| f == "-")? + 5;
            let source = fields.get(sep + 2)?;
            Some(MountEntry {
                mount_point: mount_point.to_string(),
                source: source.to_string(),
            })
        })
        .collect()
}

/// Undoes the escaping of mount points in the mount table (`\040` for a
/// space and so on).
pub(crate) fn unescape(path: &str) -> PathBuf {
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' || i + 1 >= bytes.len() {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        let octal = bytes
            .get(i + 1..i + 4)
            .filter(|d| d.iter().all(|b| (b'0'..=b'7').contains(b)));
        match (bytes[i + 1], octal) {
            (_, Some(d)) => {
                out.push(d.iter().fold(0u8, |acc, b| (acc << 3) | (b - b'0')));
                i += 4;
                continue;
            }
            (b't', _) => out.push(b'\t'),
            (b'r', _) => out.push(b'\r'),
            (b'n', _) => out.push(b'\n'),
            (other, _) => out.push(other),
        }
        i += 2;
    }
    PathBuf::from(OsString::from_vec(out))
}

/// Helper to find the whole disk of a partition (e.g. `sda1` -> `sda`,
/// `mmcblk0p1` -> `mmcblk0`).
fn parent_device(name: &str) -> &str {
    if name.starts_with("sd") {
        return name.trim_end_matches(|c: char| c.is_ascii_digit());
    }
    if name.starts_with("mmcblk") || name.starts_with("nvme") {
        if let Some(index) = name.find('p') {
            return &name[..index];
        }
    }
    name
}

/// Size of an open block device in bytes.
pub fn device_size(file: &File) -> io::Result<u64> {
    let mut size: u64 = 0;
    // SAFETY: BLKGETSIZE64 writes a single u64 through the pointer.
    unsafe { blkgetsize64(file.as_raw_fd(), &mut size) }?;
    Ok(size)
}

fn baud_rate(rate: u32) -> BaudRate {
    match rate {
        57600 => BaudRate::B57600,
        230400 => BaudRate::B230400,
        460800 => BaudRate::B460800,
        500000 => BaudRate::B500000,
        576000 => BaudRate::B576000,
        921600 => BaudRate::B921600,
        1000000 => BaudRate::B1000000,
        1152000 => BaudRate::B1152000,
        1500000 => BaudRate::B1500000,
        2000000 => BaudRate::B2000000,
        2500000 => BaudRate::B2500000,
        3000000 => BaudRate::B3000000,
        3500000 => BaudRate::B3500000,
        4000000 => BaudRate::B4000000,
        _ => BaudRate::B115200,
    }
}

/// Puts a tty into raw 8N1 mode with non-blocking reads.
fn configure_serial(file: &File, baud: u32) -> nix::Result<()> {
    let mut t = termios::tcgetattr(file)?;
    termios::cfmakeraw(&mut t);
    t.control_flags |= ControlFlags::CS8 | ControlFlags::CREAD | ControlFlags::CLOCAL;
    t.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
    t.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    termios::cfsetspeed(&mut t, baud_rate(baud))?;
    termios::tcsetattr(file, SetArg::TCSANOW, &t)
}

fn set_blocking(file: &File) -> io::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(file, FcntlArg::F_GETFL)?);
    fcntl(file, FcntlArg::F_SETFL(flags - OFlag::O_NONBLOCK))?;
    Ok(())
}

fn open_failed(path: &Path, source: io::Error) -> Error {
    DeviceError::OpenFailed {
        path: path.display().to_string(),
        source,
    }
    .into()
}

/// Discovers targets and acquires them for a transfer.
///
/// The target list is rebuilt from scratch by every
/// [`Devices::list_targets`] call.
pub struct Devices {
    sys_root: PathBuf,
    proc_root: PathBuf,
    dev_root: PathBuf,
    helper: Option<Box<dyn PrivilegedHelper>>,
    targets: Vec<Target>,
}

impl Default for Devices {
    fn default() -> Self {
        Self::new()
    }
}

impl Devices {
    /// Uses the live `/sys`, `/proc` and `/dev`, with the UDisks2 helper
    /// when it is compiled in and the system bus is reachable.
    pub fn new() -> Self {
        let devices = Self::with_roots("/sys", "/proc", "/dev");
        #[cfg(feature = "udisks")]
        let devices = match super::UDisks2Helper::connect() {
            Ok(helper) => devices.with_helper(Box::new(helper)),
            Err(e) => {
                debug!(error = %e, "privileged helper not available");
                devices
            }
        };
        devices
    }

    /// Reads device information below the given roots instead of the live
    /// system.
    pub fn with_roots(sys: impl Into<PathBuf>, proc: impl Into<PathBuf>, dev: impl Into<PathBuf>) -> Self {
        Self {
            sys_root: sys.into(),
            proc_root: proc.into(),
            dev_root: dev.into(),
            helper: None,
            targets: Vec::new(),
        }
    }

    pub fn with_helper(mut self, helper: Box<dyn PrivilegedHelper>) -> Self {
        self.helper = Some(helper);
        self
    }

    /// Targets found by the last refresh.
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Looks up a target from the last refresh by position.
    pub fn target(&self, index: usize) -> Result<&Target> {
        self.targets
            .get(index)
            .ok_or_else(|| DeviceError::NoSuchTarget.into())
    }

    fn mounts(&self) -> Vec<MountEntry> {
        let path = self.proc_root.join("self/mountinfo");
        match fs::read_to_string(&path) {
            Ok(text) => parse_mountinfo(&text),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unable to read the mount table");
                Vec::new()
            }
        }
    }

    fn read_sys(&self, device: &str, file: &str) -> Option<String> {
        let path = self.sys_root.join("block").join(device).join(file);
        fs::read_to_string(path).ok().map(|s| s.trim().to_string())
    }

    /// Rebuilds the target list.
    pub fn list_targets(&mut self, config: &Config) -> Result<&[Target]> {
        self.targets.clear();

        let hidden: Vec<String> = self
            .mounts()
            .iter()
            .filter(|m| {
                protected_by(&m.mount_point, &CRITICAL_MOUNTS).is_some()
                    || (!config.show_all_disks && protected_by(&m.mount_point, &SYSTEM_MOUNTS).is_some())
            })
            .filter_map(|m| m.disk().map(str::to_string))
            .collect();

        let block_dir = self.sys_root.join("block");
        let mut names: Vec<String> = fs::read_dir(&block_dir)
            .map_err(|e| open_failed(&block_dir, e))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .filter(|name| BLOCK_PREFIXES.iter().any(|p| name.starts_with(p)))
            .collect();
        names.sort();

        let mut targets = Vec::new();
        for name in names {
            if hidden.contains(&name) {
                debug!(name, "skipping disk backing a system mount");
                continue;
            }
            if self.read_sys(&name, "ro").as_deref() != Some("0") {
                continue;
            }
            let capacity = self
                .read_sys(&name, "size")
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0)
                * 512;
            if capacity == 0 {
                continue;
            }
            if let Some(cap) = config.max_disk_size.filter(|_| !config.show_all_disks) {
                if capacity > cap {
                    debug!(name, capacity, cap, "skipping disk above the size cap");
                    continue;
                }
            }
            let vendor = self.read_sys(&name, "device/vendor").unwrap_or_default();
            let model = self.read_sys(&name, "device/model").unwrap_or_default();
            targets.push(Target {
                label: block_label(&name, capacity, &vendor, &model),
                id: TargetId::Block { name },
                capacity,
            });
        }

        if config.serial != SerialMode::Off {
            targets.extend(self.serial_ports());
        }
        debug!(count = targets.len(), "refreshed target list");
        self.targets = targets;
        Ok(&self.targets)
    }

    /// Character devices belonging to a tty driver of type `serial`.
    fn serial_ports(&self) -> Vec<Target> {
        let Ok(drivers) = fs::read_to_string(self.proc_root.join("tty/drivers")) else {
            return Vec::new();
        };
        let prefixes: Vec<String> = drivers
            .lines()
            .filter_map(|line| {
                let fields: Vec<&str> = line.split_whitespace().collect();
                (fields.get(4) == Some(&"serial"))
                    .then(|| fields.get(1)?.strip_prefix("/dev/").map(str::to_string))
                    .flatten()
            })
            .collect();

        let Ok(entries) = fs::read_dir(&self.dev_root) else {
            return Vec::new();
        };
        let mut ports: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .filter(|name| {
                prefixes.iter().any(|p| {
                    name.strip_prefix(p.as_str())
                        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
                })
            })
            .collect();
        ports.sort();

        ports
            .into_iter()
            .map(|name| {
                let port = self.dev_root.join(&name);
                Target {
                    label: format!("{} serial port", port.display()),
                    id: TargetId::Serial { port },
                    capacity: 0,
                }
            })
            .collect()
    }

    /// Acquires `target` exclusively.
    ///
    /// `expected_size` is the number of bytes about to be written, 0 when
    /// unknown. It is checked against the cached capacity before anything
    /// touches the device.
    pub fn open(
        &self,
        target: &Target,
        expected_size: u64,
        config: &Config,
        running: &AtomicBool,
    ) -> Result<DeviceHandle> {
        if target.capacity > 0 && expected_size > target.capacity {
            return Err(DeviceError::SizeExceedsCapacity {
                expected: expected_size,
                capacity: target.capacity,
            }
            .into());
        }
        match &target.id {
            TargetId::Block { name } => self.open_block(name, target.capacity),
            TargetId::Serial { port } => self.open_serial(port, expected_size, config, running),
            TargetId::File(path) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(path)
                    .map_err(|e| open_failed(path, e))?;
                Ok(DeviceHandle {
                    file,
                    path: path.clone(),
                    kind: HandleKind::File,
                    capacity: target.capacity,
                })
            }
        }
    }

    /// Mounts of disk `name`, refusing a disk that holds the running system.
    fn disk_mounts(&self, name: &str) -> Result<Vec<MountEntry>> {
        let mounts: Vec<MountEntry> = self
            .mounts()
            .into_iter()
            .filter(|m| m.disk() == Some(name))
            .collect();
        if let Some(m) = mounts
            .iter()
            .find(|m| protected_by(&m.mount_point, &CRITICAL_MOUNTS).is_some())
        {
            return Err(DeviceError::MountSafety(m.mount_point.clone()).into());
        }
        Ok(mounts)
    }

    fn open_block(&self, name: &str, capacity: u64) -> Result<DeviceHandle> {
        for m in &self.disk_mounts(name)? {
            self.unmount(&unescape(&m.mount_point))?;
        }

        let path = self.dev_root.join(name);
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(WRITE_FLAGS)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                return Err(DeviceError::Busy.into());
            }
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                self.open_with_helper(&path, Access::ReadWrite, WRITE_FLAGS, e)?
            }
            Err(e) => return Err(open_failed(&path, e)),
        };

        let capacity = if capacity > 0 {
            capacity
        } else {
            device_size(&file).unwrap_or(0)
        };
        debug!(path = %path.display(), capacity, "opened block device");
        Ok(DeviceHandle {
            file,
            path,
            kind: HandleKind::Block,
            capacity,
        })
    }

    /// Acquires `target` as a backup source.
    ///
    /// Nothing is unmounted and the node is opened read-only, but a disk
    /// holding the running system is still refused. File targets must
    /// already exist.
    pub fn open_readonly(&self, target: &Target) -> Result<DeviceHandle> {
        match &target.id {
            TargetId::Block { name } => {
                self.disk_mounts(name)?;
                let path = self.dev_root.join(name);
                let file = match File::open(&path) {
                    Ok(file) => file,
                    Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                        self.open_with_helper(&path, Access::Read, 0, e)?
                    }
                    Err(e) => return Err(open_failed(&path, e)),
                };
                let capacity = match target.capacity {
                    0 => device_size(&file).unwrap_or(0),
                    known => known,
                };
                debug!(path = %path.display(), capacity, "opened block device for reading");
                Ok(DeviceHandle {
                    file,
                    path,
                    kind: HandleKind::Block,
                    capacity,
                })
            }
            TargetId::Serial { .. } => Err(Error::InvalidConfig("serial targets cannot be read".into())),
            TargetId::File(path) => {
                let file = File::open(path).map_err(|e| open_failed(path, e))?;
                let capacity = match target.capacity {
                    0 => file.metadata().map(|m| m.len()).unwrap_or(0),
                    known => known,
                };
                Ok(DeviceHandle {
                    file,
                    path: path.clone(),
                    kind: HandleKind::File,
                    capacity,
                })
            }
        }
    }

    fn open_with_helper(&self, path: &Path, access: Access, flags: i32, denied: io::Error) -> Result<File> {
        let Some(helper) = self.helper.as_deref() else {
            return Err(open_failed(path, denied));
        };
        let rdev = nix::sys::stat::stat(path)
            .map_err(|e| open_failed(path, e.into()))?
            .st_rdev;
        debug!(path = %path.display(), rdev, ?access, "opening through the privileged helper");
        let fd = helper
            .open_device(rdev, access, flags)
            .map_err(|e| open_failed(path, io::Error::other(e)))?;
        Ok(File::from(fd))
    }

    fn unmount(&self, mount_point: &Path) -> Result<()> {
        let failed = |source: io::Error| DeviceError::UmountFailed {
            path: mount_point.display().to_string(),
            source,
        };
        match umount2(mount_point, MntFlags::MNT_FORCE) {
            Ok(()) => {
                debug!(path = %mount_point.display(), "unmounted");
                Ok(())
            }
            Err(errno @ (Errno::EPERM | Errno::EACCES)) => {
                let Some(helper) = self.helper.as_deref() else {
                    return Err(failed(errno.into()).into());
                };
                let dev = nix::sys::stat::stat(mount_point)
                    .map_err(|e| failed(e.into()))?
                    .st_dev;
                helper
                    .unmount(dev)
                    .map_err(|e| failed(io::Error::other(e)))?;
                debug!(path = %mount_point.display(), dev, "unmounted through the privileged helper");
                Ok(())
            }
            Err(errno) => Err(failed(errno.into()).into()),
        }
    }

    fn open_serial(
        &self,
        port: &Path,
        expected_size: u64,
        config: &Config,
        running: &AtomicBool,
    ) -> Result<DeviceHandle> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK | libc::O_EXCL)
            .open(port)
            .map_err(|e| open_failed(port, e))?;
        configure_serial(&file, config.baud).map_err(|e| DeviceError::Comm(e.to_string()))?;

        if config.serial == SerialMode::Handshake {
            serial::bootloader_handshake(&mut file, expected_size, running, |f: &mut File| set_blocking(f))?;
        } else {
            set_blocking(&file).map_err(|e| DeviceError::Comm(e.to_string()))?;
        }
        debug!(port = %port.display(), baud = config.baud, "opened serial port");
        Ok(DeviceHandle {
            file,
            path: port.to_path_buf(),
            kind: HandleKind::Serial,
            capacity: 0,
        })
    }

    /// Flushes the target to stable storage and releases it. A failed flush
    /// is logged; the handle is released regardless.
    pub fn close(&self, handle: DeviceHandle) {
        if handle.kind != HandleKind::Serial {
            if let Err(e) = handle.file.sync_data() {
                warn!(path = %handle.path.display(), error = %e, "unable to flush target");
            }
        }
        debug!(path = %handle.path.display(), "closed target");
    }
}
