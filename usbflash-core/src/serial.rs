//! Bootloader handshake for serial targets.
//!
//! A board waiting for an image signals readiness by sending `0x03` three
//! times. The host answers with the image size as a little-endian `u32` and
//! the board acknowledges with `OK`, after which the raw image follows.
use crate::error::{DeviceError, Error, Result};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::debug;

pub const READY_BYTE: u8 = 0x03;
const READY_COUNT: usize = 3;
const POLL_INTERVAL: Duration = Duration::from_millis(1);

fn comm(msg: impl Into<String>) -> Error {
    DeviceError::Comm(msg.into()).into()
}

/// Runs the handshake on a port opened non-blocking.
///
/// `make_blocking` is called once the board is ready, before the size is
/// sent. Clearing `running` while waiting aborts with [`Error::Cancelled`].
pub fn bootloader_handshake<P: Read + Write>(
    port: &mut P,
    image_size: u64,
    running: &AtomicBool,
    make_blocking: impl FnOnce(&mut P) -> io::Result<()>,
) -> Result<()> {
    let size = u32::try_from(image_size)
        .map_err(|_| comm(format!("image of {image_size} bytes is too large for the bootloader")))?;

    debug!("waiting for the bootloader to become ready");
    let mut seen = 0;
    let mut byte = [0u8; 1];
    while seen < READY_COUNT {
        if !running.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        match port.read(&mut byte) {
            Ok(1) if byte[0] == READY_BYTE => seen += 1,
            Ok(1) => seen = 0,
            Ok(_) => thread::sleep(POLL_INTERVAL),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                thread::sleep(POLL_INTERVAL)
            }
            Err(e) => return Err(comm(format!("reading from the port failed: {e}"))),
        }
    }

    make_blocking(port).map_err(|e| comm(format!("unable to configure the port: {e}")))?;
    port.write_all(&size.to_le_bytes())
        .map_err(|e| comm(format!("unable to send the image size: {e}")))?;
    let mut ack = [0u8; 2];
    port.read_exact(&mut ack)
        .map_err(|e| comm(format!("no acknowledgement from the bootloader: {e}")))?;
    if &ack != b"OK" {
        return Err(comm("bootloader rejected the image size"));
    }
    debug!(size, "bootloader accepted the image");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// A port that yields scripted reads and records writes.
    struct MockPort {
        reads: VecDeque<io::Result<u8>>,
        written: Vec<u8>,
        blocking: bool,
    }

    impl MockPort {
        fn new(script: Vec<io::Result<u8>>) -> Self {
            Self {
                reads: script.into(),
                written: Vec::new(),
                blocking: false,
            }
        }
    }

    impl Read for MockPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(Ok(b)) => {
                    buf[0] = b;
                    Ok(1)
                }
                Some(Err(e)) => Err(e),
                None => Ok(0),
            }
        }
    }

    impl Write for MockPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn would_block() -> io::Result<u8> {
        Err(io::ErrorKind::WouldBlock.into())
    }

    #[test]
    fn handshake_sends_size_after_three_ready_bytes() {
        let mut port = MockPort::new(vec![
            would_block(),
            Ok(READY_BYTE),
            Ok(b'x'),
            Ok(READY_BYTE),
            would_block(),
            Ok(READY_BYTE),
            Ok(READY_BYTE),
            Ok(b'O'),
            Ok(b'K'),
        ]);
        let running = AtomicBool::new(true);
        bootloader_handshake(&mut port, 0x0102_0304, &running, |p| {
            p.blocking = true;
            Ok(())
        })
        .unwrap();
        assert!(port.blocking);
        assert_eq!(port.written, [0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn bad_acknowledgement_is_a_comm_error() {
        let mut port = MockPort::new(vec![
            Ok(READY_BYTE),
            Ok(READY_BYTE),
            Ok(READY_BYTE),
            Ok(b'N'),
            Ok(b'O'),
        ]);
        let running = AtomicBool::new(true);
        let err = bootloader_handshake(&mut port, 10, &running, |_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::Device(DeviceError::Comm(_))));
    }

    #[test]
    fn cancellation_stops_the_wait() {
        let mut port = MockPort::new(vec![]);
        let running = AtomicBool::new(false);
        let err = bootloader_handshake(&mut port, 10, &running, |_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(port.written.is_empty());
    }
}
