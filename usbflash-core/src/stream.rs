//! Streaming access to image files.
//!
//! - [`ImageReader`] opens an image in any supported format and hands out
//!   plaintext one block at a time.
//! - [`ImageWriter`] creates a backup image, either raw (sparse where the
//!   data is zero) or zstd-compressed.
use std::io::{self, Read};

mod reader;
mod writer;

pub use reader::{ImageReader, SessionState, source_path};
pub use writer::ImageWriter;

/// Sector size every produced chunk is padded to.
pub const SECTOR: usize = 512;

/// Reads until `buf` is full or the source hits end of file.
pub(crate) fn read_up_to<R: Read + ?Sized>(src: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Rounds `len` up to a whole sector.
pub(crate) fn sector_align(len: usize) -> usize {
    (len + SECTOR - 1) & !(SECTOR - 1)
}
