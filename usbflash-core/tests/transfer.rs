mod common;

use common::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use usbflash_core::config::{Config, MIB};
use usbflash_core::device::{Target, TargetId};
use usbflash_core::platform::Devices;
use usbflash_core::transfer::{Event, Phase, Summary};
use usbflash_core::{DeviceError, Error, read, write};

const LEN: usize = 3 * 1024 * 1024 + 1000;
const DISK: u64 = 8 * MIB as u64;

fn running() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(true))
}

fn devices(root: &Path) -> Devices {
    Devices::with_roots(root, root, root)
}

fn flash(image: &Path, disk: &Path, config: &Config) -> (usbflash_core::Result<Summary>, Vec<Event>) {
    let mut events = Vec::new();
    let root = disk.parent().unwrap();
    let result = write::run(
        image,
        &devices(root),
        &Target::file(disk, DISK),
        config,
        running(),
        |e| events.push(e),
    );
    (result, events)
}

fn phases(events: &[Event]) -> Vec<Phase> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Phase(p) => Some(*p),
            Event::Progress(_) => None,
        })
        .collect()
}

#[test]
fn write_then_rewrite_skips_unchanged_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(LEN);
    let image = write_file(dir.path(), "disk.img.gz", &gzip(&data));
    let disk = dir.path().join("disk.bin");

    let (first, events) = flash(&image, &disk, &Config::default());
    let first = first.unwrap();
    assert_eq!(first.bytes, round_up(LEN) as u64);
    assert_eq!(first.written, round_up(LEN) as u64);
    assert_eq!(first.skipped, 0);
    assert_eq!(
        phases(&events),
        [Phase::Opening, Phase::Transferring, Phase::Closing, Phase::Done]
    );
    assert!(events.iter().any(|e| matches!(e, Event::Progress(_))));
    assert_padded(&std::fs::read(&disk).unwrap(), &data);

    let (again, _) = flash(&image, &disk, &Config::default());
    let again = again.unwrap();
    assert_eq!(again.written, 0);
    assert_eq!(again.skipped, round_up(LEN) as u64);

    let forced = Config {
        force: true,
        ..Default::default()
    };
    let (forced, _) = flash(&image, &disk, &forced);
    let forced = forced.unwrap();
    assert_eq!(forced.written, round_up(LEN) as u64);
    assert_eq!(forced.skipped, 0);
    assert_padded(&std::fs::read(&disk).unwrap(), &data);
}

#[test]
fn only_changed_blocks_are_rewritten() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(LEN);
    let image = write_file(dir.path(), "disk.img", &data);
    let disk = dir.path().join("disk.bin");
    flash(&image, &disk, &Config::default()).0.unwrap();

    let mut stale = std::fs::read(&disk).unwrap();
    stale[MIB + 10] ^= 0xff;
    std::fs::write(&disk, &stale).unwrap();

    let summary = flash(&image, &disk, &Config::default()).0.unwrap();
    assert_eq!(summary.written, MIB as u64);
    assert_eq!(summary.skipped, (round_up(LEN) - MIB) as u64);
    assert_padded(&std::fs::read(&disk).unwrap(), &data);
}

#[test]
fn oversized_image_leaves_the_target_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_file(dir.path(), "big.img", &payload(2 * MIB));
    let disk = dir.path().join("small.bin");
    let mut events = Vec::new();

    let result = write::run(
        &image,
        &devices(dir.path()),
        &Target::file(&disk, MIB as u64),
        &Config::default(),
        running(),
        |e| events.push(e),
    );
    assert!(matches!(
        result,
        Err(Error::Device(DeviceError::SizeExceedsCapacity { expected, capacity }))
            if expected == 2 * MIB as u64 && capacity == MIB as u64
    ));
    assert!(!disk.exists());
    assert_eq!(phases(&events), [Phase::Opening, Phase::Failed]);
}

#[test]
fn cleared_flag_cancels_a_write() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_file(dir.path(), "disk.img", &payload(LEN));
    let disk = dir.path().join("disk.bin");

    let result = write::run(
        &image,
        &devices(dir.path()),
        &Target::file(&disk, DISK),
        &Config::default(),
        Arc::new(AtomicBool::new(false)),
        |_| {},
    );
    assert!(matches!(result, Err(Error::Cancelled)));
}

fn backup_config(dir: &Path, compress: bool) -> Config {
    Config {
        backup_dir: Some(dir.to_path_buf()),
        compress_backup: compress,
        ..Default::default()
    }
}

fn backups(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect()
}

#[test]
fn compressed_backup_decodes_to_the_disk() {
    let disk_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    let data = payload(LEN);
    let disk = write_file(disk_dir.path(), "disk.bin", &data);

    let summary = read::run(
        &devices(disk_dir.path()),
        &Target::file(&disk, LEN as u64),
        &backup_config(out_dir.path(), true),
        running(),
        |_| {},
    )
    .unwrap();

    assert_eq!(summary.bytes, LEN as u64);
    let output = summary.output.unwrap();
    assert_eq!(backups(out_dir.path()), [output.clone()]);
    let name = output.file_name().unwrap().to_str().unwrap();
    assert!(name.starts_with("usbflash-") && name.ends_with(".dd.zst"), "{name}");

    let frame = std::fs::read(&output).unwrap();
    assert_eq!(
        zstd::zstd_safe::get_frame_content_size(&frame).ok().flatten(),
        Some(LEN as u64)
    );
    assert!(zstd::decode_all(&frame[..]).unwrap() == data);
}

#[test]
fn plain_backup_is_a_copy() {
    let disk_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    let data = payload(LEN);
    let disk = write_file(disk_dir.path(), "disk.bin", &data);
    let mut events = Vec::new();

    let summary = read::run(
        &devices(disk_dir.path()),
        &Target::file(&disk, LEN as u64),
        &backup_config(out_dir.path(), false),
        running(),
        |e| events.push(e),
    )
    .unwrap();

    let output = summary.output.unwrap();
    assert!(output.extension().is_some_and(|e| e == "dd"));
    assert!(std::fs::read(&output).unwrap() == data);
    assert_eq!(phases(&events).last(), Some(&Phase::Done));
}

#[test]
fn cancelled_backup_is_removed() {
    let disk_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    let disk = write_file(disk_dir.path(), "disk.bin", &payload(LEN));

    let result = read::run(
        &devices(disk_dir.path()),
        &Target::file(&disk, LEN as u64),
        &backup_config(out_dir.path(), true),
        Arc::new(AtomicBool::new(false)),
        |_| {},
    );
    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(backups(out_dir.path()).is_empty());
}

#[test]
fn serial_targets_cannot_be_backed_up() {
    let dir = tempfile::tempdir().unwrap();
    let target = Target {
        id: TargetId::Serial {
            port: dir.path().join("ttyUSB0"),
        },
        capacity: 0,
        label: "ttyUSB0".into(),
    };
    let result = read::run(
        &devices(dir.path()),
        &target,
        &backup_config(dir.path(), false),
        running(),
        |_| {},
    );
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
}
