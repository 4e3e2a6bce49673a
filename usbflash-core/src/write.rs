//! Contains the logic for writing an image file to a device.
//!
//! Each block of plaintext goes through the same steps:
//! 1.  Unless forced, the destination is read first; a block that already
//!     matches is not written again, which makes re-running a flash cheap.
//! 2.  The block is written.
//! 3.  If verification is on, it is read back and compared.
//!
//! Serial targets cannot be read back, so they only get step 2 and receive
//! the image file verbatim.
use crate::config::Config;
use crate::device::{DeviceHandle, Target};
use crate::error::{Error, Result};
use crate::platform::Devices;
use crate::stream::{ImageReader, read_up_to};
use crate::transfer::{Event, Phase, Summary, check_running};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;
use tracing::{debug, info, trace};

#[derive(Default)]
struct Tally {
    written: u64,
    skipped: u64,
}

/// Writes an image file to a target, reporting progress via `on_event`.
///
/// # Arguments
///
/// * `image_path` - Path to the source image, in any supported format.
/// * `devices` - The device manager `target` was listed by.
/// * `target` - Where to write.
/// * `config` - Block size, force and verify settings.
/// * `running` - Cleared by the caller to cancel between blocks.
/// * `on_event` - Receives phase changes and progress snapshots.
///
/// # Errors
///
/// Any failure aborts the transfer. Both ends are closed before the error is
/// returned.
pub fn run(
    image_path: &Path,
    devices: &Devices,
    target: &Target,
    config: &Config,
    running: Arc<AtomicBool>,
    mut on_event: impl FnMut(Event),
) -> Result<Summary> {
    let start = Instant::now();
    on_event(Event::Phase(Phase::Opening));
    let result = transfer(image_path, devices, target, config, &running, &mut on_event);
    match &result {
        Ok(summary) => {
            info!(bytes = summary.bytes, written = summary.written, skipped = summary.skipped, elapsed = ?start.elapsed(), "image written");
            on_event(Event::Phase(Phase::Done));
        }
        Err(e) => {
            debug!(error = %e, "write failed");
            on_event(Event::Phase(Phase::Failed));
        }
    }
    result.map(|summary| Summary {
        elapsed: start.elapsed(),
        ..summary
    })
}

fn transfer(
    image_path: &Path,
    devices: &Devices,
    target: &Target,
    config: &Config,
    running: &AtomicBool,
    on_event: &mut impl FnMut(Event),
) -> Result<Summary> {
    let mut image = if target.is_serial() {
        ImageReader::open_verbatim(image_path, config)?
    } else {
        ImageReader::open(image_path, config)?
    };
    let mut device = match devices.open(target, image.total_size(), config, running) {
        Ok(device) => device,
        Err(e) => {
            image.close();
            return Err(e);
        }
    };

    on_event(Event::Phase(Phase::Transferring));
    let copied = copy(&mut image, &mut device, config, running, on_event);

    on_event(Event::Phase(Phase::Closing));
    devices.close(device);
    let status = image.status(true);
    let bytes = image.produced();
    image.close();

    let tally = copied?;
    Ok(Summary {
        bytes,
        written: tally.written,
        skipped: tally.skipped,
        status,
        ..Default::default()
    })
}

fn copy(
    image: &mut ImageReader,
    device: &mut DeviceHandle,
    config: &Config,
    running: &AtomicBool,
    on_event: &mut impl FnMut(Event),
) -> Result<Tally> {
    let seekable = !device.is_serial();
    let mut tally = Tally::default();
    let mut offset: u64 = 0;

    loop {
        check_running(running)?;
        let n = image.read()?;
        if n == 0 {
            break;
        }
        let (chunk, scratch) = image.chunk_and_scratch(n);

        let unchanged = seekable && !config.force && {
            let got = read_up_to(device, scratch).map_err(Error::Read)?;
            let same = got == n && chunk == &scratch[..];
            if !same {
                device.seek(SeekFrom::Start(offset)).map_err(Error::Write)?;
            }
            same
        };

        if unchanged {
            trace!(offset, len = n, "block already up to date");
            tally.skipped += n as u64;
        } else {
            device.write_all(chunk).map_err(Error::Write)?;
            if seekable && config.verify {
                verify(device, offset, chunk, scratch)?;
            }
            trace!(offset, len = n, "wrote block");
            tally.written += n as u64;
        }
        offset += n as u64;
        on_event(Event::Progress(image.status(false)));
    }
    Ok(tally)
}

/// Reads back the block just written at `offset` and compares it.
fn verify<D: Read + Seek>(device: &mut D, offset: u64, expected: &[u8], scratch: &mut [u8]) -> Result<()> {
    device.seek(SeekFrom::Start(offset)).map_err(Error::Read)?;
    let got = read_up_to(device, scratch).map_err(Error::Read)?;
    let mismatch = expected
        .iter()
        .zip(&scratch[..got])
        .position(|(a, b)| a != b)
        .or((got < expected.len()).then_some(got));
    match mismatch {
        Some(at) => Err(Error::VerifyMismatch {
            offset: offset + at as u64,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};

    /// A disk that silently drops writes to one byte.
    struct StuckByte {
        disk: Cursor<Vec<u8>>,
        at: u64,
    }

    impl Read for StuckByte {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let start = self.disk.position();
            let n = self.disk.read(buf)?;
            if (start..start + n as u64).contains(&self.at) {
                buf[(self.at - start) as usize] ^= 0x5a;
            }
            Ok(n)
        }
    }

    impl Seek for StuckByte {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.disk.seek(pos)
        }
    }

    #[test]
    fn read_back_mismatch_reports_its_offset() {
        let block = vec![0xa5u8; 4096];
        let mut scratch = vec![0u8; 4096];
        let mut disk = StuckByte {
            disk: Cursor::new(vec![0xa5u8; 3 * 4096]),
            at: 4096 + 1234,
        };

        verify(&mut disk, 0, &block, &mut scratch).unwrap();
        assert!(matches!(
            verify(&mut disk, 4096, &block, &mut scratch),
            Err(Error::VerifyMismatch { offset: 5330 })
        ));
    }

    #[test]
    fn short_read_back_is_a_mismatch() {
        let block = vec![1u8; 1024];
        let mut scratch = vec![0u8; 1024];
        let mut disk = Cursor::new(vec![1u8; 1536]);
        assert!(matches!(
            verify(&mut disk, 1024, &block, &mut scratch),
            Err(Error::VerifyMismatch { offset: 1536 })
        ));
    }
}
