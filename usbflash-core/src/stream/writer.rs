use crate::error::{Error, Result};
use crate::progress::{Counters, Progress, Status};
use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};
use zstd::stream::raw::{Encoder as ZstdEncoder, InBuffer, Operation, OutBuffer};

/// zstd level used for backups; speed matters more than ratio here.
const BACKUP_LEVEL: i32 = 1;

type SpaceCheck = Box<dyn Fn(&File) -> Option<u64> + Send>;

/// A backup image being written.
pub struct ImageWriter {
    file: File,
    path: PathBuf,
    encoder: Option<ZstdEncoder<'static>>,
    comp_buf: Vec<u8>,
    block_size: usize,
    total: u64,
    written: u64,
    /// The file ends in a hole that has not been materialised yet.
    trailing_hole: bool,
    space_check: SpaceCheck,
    progress: Progress,
}

impl ImageWriter {
    /// Creates `path` for a backup of `size` bytes.
    ///
    /// Compressed backups record `size` in the zstd frame header.
    pub fn create(path: impl AsRef<Path>, compress: bool, size: u64, block_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if size == 0 {
            return Err(Error::InvalidConfig("backup size is unknown".into()));
        }
        let encoder = if compress {
            let mut enc = ZstdEncoder::new(BACKUP_LEVEL).map_err(Error::codec)?;
            enc.set_pledged_src_size(Some(size)).map_err(Error::codec)?;
            Some(enc)
        } else {
            None
        };
        let file = File::create(&path).map_err(Error::Write)?;
        debug!(path = %path.display(), compress, size, "created backup image");

        Ok(Self {
            file,
            path,
            encoder,
            comp_buf: vec![0u8; zstd::zstd_safe::CCtx::out_size().max(block_size)],
            block_size,
            total: size,
            written: 0,
            trailing_hole: false,
            space_check: Box::new(free_space),
            progress: Progress::new(),
        })
    }

    /// Replaces the free-space check run before every write.
    pub fn with_space_check(mut self, check: impl Fn(&File) -> Option<u64> + Send + 'static) -> Self {
        self.space_check = Box::new(check);
        self
    }

    /// Appends `buf` to the image and returns its length.
    ///
    /// Fails with [`Error::SpaceExhausted`] once the destination has two
    /// blocks or less of free space left.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if let Some(avail) = (self.space_check)(&self.file) {
            if avail <= 2 * self.block_size as u64 {
                warn!(avail, path = %self.path.display(), "destination is running out of space");
                return Err(Error::SpaceExhausted);
            }
        }
        self.written += buf.len() as u64;
        self.append(buf).map_err(|e| match e.raw_os_error() {
            Some(libc::ENOSPC) => Error::SpaceExhausted,
            _ => Error::Write(e),
        })?;
        trace!(len = buf.len(), written = self.written, "wrote backup block");
        Ok(buf.len())
    }

    fn append(&mut self, buf: &[u8]) -> io::Result<()> {
        let Self {
            file,
            encoder,
            comp_buf,
            ..
        } = self;

        let Some(enc) = encoder.as_mut() else {
            if buf.iter().all(|&b| b == 0) {
                file.seek(SeekFrom::Current(buf.len() as i64))?;
                self.trailing_hole = true;
            } else {
                file.write_all(buf)?;
                self.trailing_hole = false;
            }
            return Ok(());
        };

        let mut input = InBuffer::around(buf);
        while input.pos() < buf.len() {
            let mut out = OutBuffer::around(&mut comp_buf[..]);
            enc.run(&mut input, &mut out)?;
            let n = out.pos();
            file.write_all(&comp_buf[..n])?;
        }
        if self.written >= self.total {
            loop {
                let mut out = OutBuffer::around(&mut comp_buf[..]);
                let left = enc.finish(&mut out, true)?;
                let n = out.pos();
                file.write_all(&comp_buf[..n])?;
                if left == 0 {
                    break;
                }
            }
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn counters(&self) -> Counters {
        Counters {
            produced: self.written,
            total: self.total,
            ..Default::default()
        }
    }

    pub fn status(&mut self, done: bool) -> Status {
        let counters = self.counters();
        if done {
            self.progress.finished(&counters, true)
        } else {
            self.progress.status(&counters)
        }
    }

    /// Flushes the image. A raw image ending in zeros is extended to its
    /// full length.
    pub fn close(mut self) -> Result<()> {
        if self.trailing_hole {
            let len = self.file.stream_position().map_err(Error::Write)?;
            self.file.set_len(len).map_err(Error::Write)?;
        }
        self.file.flush().map_err(Error::Write)?;
        debug!(path = %self.path.display(), written = self.written, "closed backup image");
        Ok(())
    }
}

/// Free bytes on the file system holding `file`. Only regular files are
/// checked.
fn free_space(file: &File) -> Option<u64> {
    if !file.metadata().ok()?.is_file() {
        return None;
    }
    let st = nix::sys::statvfs::fstatvfs(file).ok()?;
    Some(st.blocks_available() as u64 * st.fragment_size() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    const BLOCK: usize = 4096;

    #[test]
    fn unknown_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ImageWriter::create(dir.path().join("a.dd"), false, 0, BLOCK).is_err());
    }

    #[test]
    fn raw_backup_keeps_trailing_zeros() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.dd");
        let mut w = ImageWriter::create(&path, false, 3 * BLOCK as u64, BLOCK)
            .unwrap()
            .with_space_check(|_| None);
        w.write(&[0xab; BLOCK]).unwrap();
        w.write(&[0; BLOCK]).unwrap();
        w.write(&[0; BLOCK]).unwrap();
        assert_eq!(w.status(true).percent, 100);
        w.close().unwrap();

        let mut data = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data.len(), 3 * BLOCK);
        assert!(data[..BLOCK].iter().all(|&b| b == 0xab));
        assert!(data[BLOCK..].iter().all(|&b| b == 0));
    }

    #[test]
    fn compressed_backup_declares_its_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.dd.zst");
        let size = 2 * BLOCK as u64;
        let mut w = ImageWriter::create(&path, true, size, BLOCK)
            .unwrap()
            .with_space_check(|_| None);
        w.write(&[1; BLOCK]).unwrap();
        w.write(&[2; BLOCK]).unwrap();
        w.close().unwrap();

        let compressed = std::fs::read(&path).unwrap();
        assert_eq!(
            zstd::zstd_safe::get_frame_content_size(&compressed)
                .ok()
                .flatten(),
            Some(size)
        );
        let plain = zstd::decode_all(&compressed[..]).unwrap();
        assert_eq!(plain.len(), 2 * BLOCK);
        assert!(plain[BLOCK..].iter().all(|&b| b == 2));
    }

    #[test]
    fn low_space_stops_the_backup() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = ImageWriter::create(dir.path().join("a.dd"), false, 1 << 20, BLOCK)
            .unwrap()
            .with_space_check(|_| Some(2 * BLOCK as u64));
        assert!(matches!(w.write(&[1; BLOCK]), Err(Error::SpaceExhausted)));
    }
}
