//! Contains the logic for backing a device up to an image file.
use crate::config::Config;
use crate::device::{DeviceHandle, Target};
use crate::error::{Error, Result};
use crate::platform::Devices;
use crate::stream::ImageWriter;
use crate::transfer::{Event, Phase, Summary, check_running};
use chrono::{DateTime, Local};
use std::env;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Picks the directory a backup is written to.
///
/// An existing `preferred` directory wins. Otherwise the user's `Desktop`,
/// then `Downloads` folder is used, falling back to the current directory.
pub fn backup_dir(preferred: Option<&Path>) -> PathBuf {
    resolve_backup_dir(
        preferred,
        env::var_os("HOME").map(PathBuf::from),
        env::var_os("LOGNAME").map(|name| Path::new("/home").join(name)),
    )
}

fn resolve_backup_dir(preferred: Option<&Path>, home: Option<PathBuf>, login_home: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = preferred.filter(|d| d.exists()) {
        return dir.to_path_buf();
    }
    let Some(home) = home.or(login_home) else {
        return PathBuf::from(".");
    };
    ["Desktop", "Downloads"]
        .iter()
        .map(|sub| home.join(sub))
        .find(|dir| dir.exists())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Backup file name for a backup started at `now`.
pub fn backup_file_name(compressed: bool, now: DateTime<Local>) -> String {
    format!(
        "usbflash-{}.dd{}",
        now.format("%Y%m%dT%H%M"),
        if compressed { ".zst" } else { "" }
    )
}

/// Reads the entire contents of a target into a new image file.
///
/// The file is created in [`backup_dir`] and is removed again if the
/// destination runs out of space or the operation is cancelled.
///
/// # Errors
///
/// Serial targets cannot be read. Any device, I/O or space error aborts the
/// backup.
pub fn run(
    devices: &Devices,
    target: &Target,
    config: &Config,
    running: Arc<AtomicBool>,
    on_event: impl FnMut(Event),
) -> Result<Summary> {
    run_with(devices, target, config, running, on_event, |writer| writer)
}

/// [`run`], with a chance to adjust the output writer once it is created.
fn run_with(
    devices: &Devices,
    target: &Target,
    config: &Config,
    running: Arc<AtomicBool>,
    mut on_event: impl FnMut(Event),
    prepare: impl FnOnce(ImageWriter) -> ImageWriter,
) -> Result<Summary> {
    if target.is_serial() {
        return Err(Error::InvalidConfig("serial targets cannot be backed up".into()));
    }
    let start = Instant::now();
    on_event(Event::Phase(Phase::Opening));

    let path = backup_dir(config.backup_dir.as_deref())
        .join(backup_file_name(config.compress_backup, Local::now()));
    let result = backup(devices, target, config, &running, &path, prepare, &mut on_event);

    match &result {
        Ok(summary) => {
            info!(path = %path.display(), bytes = summary.bytes, elapsed = ?start.elapsed(), "backup written");
            on_event(Event::Phase(Phase::Done));
        }
        Err(e) => {
            if matches!(e, Error::SpaceExhausted | Error::Cancelled) && path.exists() {
                if let Err(rm) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %rm, "unable to remove incomplete backup");
                }
            }
            debug!(error = %e, "backup failed");
            on_event(Event::Phase(Phase::Failed));
        }
    }
    result.map(|summary| Summary {
        elapsed: start.elapsed(),
        output: Some(path),
        ..summary
    })
}

fn backup(
    devices: &Devices,
    target: &Target,
    config: &Config,
    running: &AtomicBool,
    path: &Path,
    prepare: impl FnOnce(ImageWriter) -> ImageWriter,
    on_event: &mut impl FnMut(Event),
) -> Result<Summary> {
    let mut device = devices.open_readonly(target)?;
    let size = device.capacity();
    if size == 0 {
        devices.close(device);
        return Err(Error::Read(std::io::Error::other("target size is unknown")));
    }
    debug!(path = %path.display(), size, compress = config.compress_backup, "starting backup");

    let mut writer = match ImageWriter::create(path, config.compress_backup, size, config.block_size) {
        Ok(writer) => prepare(writer),
        Err(e) => {
            devices.close(device);
            return Err(e);
        }
    };

    on_event(Event::Phase(Phase::Transferring));
    let copied = copy(&mut device, &mut writer, size, config.block_size, running, on_event);

    on_event(Event::Phase(Phase::Closing));
    let status = writer.status(true);
    let closed = writer.close();
    devices.close(device);

    let bytes = copied?;
    closed?;
    Ok(Summary {
        bytes,
        written: bytes,
        status,
        ..Default::default()
    })
}

fn copy(
    device: &mut DeviceHandle,
    writer: &mut ImageWriter,
    size: u64,
    block_size: usize,
    running: &AtomicBool,
    on_event: &mut impl FnMut(Event),
) -> Result<u64> {
    let mut buffer = vec![0u8; block_size];
    let mut done: u64 = 0;
    while done < size {
        check_running(running)?;
        let n = (size - done).min(block_size as u64) as usize;
        device.read_exact(&mut buffer[..n]).map_err(Error::Read)?;
        writer.write(&buffer[..n])?;
        done += n as u64;
        on_event(Event::Progress(writer.status(false)));
    }
    Ok(done)
}
