use super::{read_up_to, sector_align};
use crate::archive;
use crate::codec::Codec;
use crate::config::Config;
use crate::error::{Error, Result, SourceError};
use crate::format::{self, CodecKind, Container, Detected, HEADER_SIZE};
use crate::progress::{Counters, Progress, Status};
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Lifecycle of a read session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Compressed input remains in the file.
    Decoding,
    /// All compressed input has been read; the codec is emptying its buffers.
    Draining,
    /// The source is exhausted.
    Done,
    /// A read or decode error occurred; the codec has been torn down.
    Failed,
}

/// A source image opened for streaming.
///
/// The reader owns the file, the decoder state and three buffers of the
/// configured block size: the compressed lookahead, the plaintext block
/// returned by [`ImageReader::read`], and a scratch block callers can use to
/// read the device back for comparison.
pub struct ImageReader {
    file: File,
    path: PathBuf,
    detected: Detected,
    codec: Option<Codec>,
    /// The codec reported the end of its stream.
    ended: bool,
    state: SessionState,

    comp_buf: Vec<u8>,
    in_pos: usize,
    in_len: usize,
    buffer: Vec<u8>,
    verify_buf: Vec<u8>,
    /// Plaintext decoded at open time and not yet returned.
    avail: usize,

    compressed_read: u64,
    compressed_end: u64,
    plain_size: u64,
    produced: u64,
    progress: Progress,
}

impl ImageReader {
    /// Opens an image, detecting its format and locating its payload.
    pub fn open(path: impl AsRef<Path>, config: &Config) -> Result<Self> {
        Self::open_with(path.as_ref(), config, true)
    }

    /// Opens an image without format detection; its bytes are streamed
    /// verbatim. Used for targets that receive the file as-is.
    pub fn open_verbatim(path: impl AsRef<Path>, config: &Config) -> Result<Self> {
        Self::open_with(path.as_ref(), config, false)
    }

    fn open_with(path: &Path, config: &Config, detect: bool) -> Result<Self> {
        let path = source_path(path)?;
        debug!(path = %path.display(), detect, "opening source image");

        let mut file = File::open(&path).map_err(SourceError::SourceOpenFailed)?;
        let file_len = file
            .metadata()
            .map_err(SourceError::SourceOpenFailed)?
            .len();

        let block = config.block_size.max(HEADER_SIZE);
        let mut comp_buf = vec![0u8; block];
        let (header_len, detected) = if detect {
            let n = read_up_to(&mut file, &mut comp_buf[..HEADER_SIZE])
                .map_err(SourceError::SourceOpenFailed)?;
            (n, format::sniff(&comp_buf[..n], file_len)?)
        } else {
            (0, format::sniff(&[], file_len)?)
        };
        debug!(
            container = ?detected.container,
            codec = %detected.codec,
            payload_offset = detected.payload_offset,
            compressed_end = detected.compressed_end,
            plain_size = detected.plain_size,
            "detected source format"
        );

        let mut reader = Self {
            file,
            path,
            detected,
            codec: Codec::new(detected.codec)?,
            ended: false,
            state: SessionState::Decoding,
            comp_buf,
            in_pos: 0,
            in_len: 0,
            buffer: vec![0u8; block],
            verify_buf: vec![0u8; block],
            avail: 0,
            compressed_read: 0,
            compressed_end: detected.compressed_end,
            plain_size: detected.plain_size,
            produced: 0,
            progress: Progress::new(),
        };

        match detected.container {
            Container::Raw => {
                reader.buffer[..header_len].copy_from_slice(&reader.comp_buf[..header_len]);
                reader.avail = header_len;
            }
            _ if detected.codec == CodecKind::Stored => {
                reader.seek_source(detected.payload_offset)?;
            }
            container => {
                reader.position_input(header_len)?;
                // Only whole-file streams are primed; their first block may
                // hold an archive header.
                if matches!(
                    container,
                    Container::Gzip | Container::Bzip2 | Container::Xz | Container::Zstd
                ) {
                    let primed = HEADER_SIZE.min(reader.buffer.len());
                    reader.avail = reader.decode_into(0, primed)?;
                }
            }
        }

        reader.locate_member()?;

        if reader.compressed_end == 0 && reader.plain_size == 0 {
            return Err(SourceError::InvalidSource.into());
        }
        reader.progress = Progress::new();
        Ok(reader)
    }

    /// Points the codec input at the compressed bytes already sitting in the
    /// header, or seeks to the payload if it starts beyond them.
    fn position_input(&mut self, header_len: usize) -> Result<()> {
        let start = self.detected.payload_offset;
        if start < header_len as u64 {
            self.in_pos = start as usize;
            self.in_len = (header_len as u64).min(self.compressed_end).max(start) as usize;
            // Bytes past the payload end are never handed to the codec.
            self.compressed_read = self.in_len as u64;
        } else {
            self.seek_source(start)?;
            self.compressed_read = start;
        }
        Ok(())
    }

    fn seek_source(&mut self, offset: u64) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(SourceError::SourceOpenFailed)?;
        Ok(())
    }

    fn locate_member(&mut self) -> Result<()> {
        if self.avail == 0 {
            return Ok(());
        }
        let member = archive::locate(&self.buffer[..self.avail])?;
        if self.codec.is_none() {
            // Raw sources are re-read from the file, starting at the payload.
            let offset = member.map_or(0, |m| m.header_len);
            self.seek_source(offset)?;
            self.avail = 0;
        }
        let Some(member) = member else {
            return Ok(());
        };
        debug!(kind = ?member.kind, header_len = member.header_len, size = member.size, "found archive member");

        if self.codec.is_some() {
            if member.size == 0 {
                return Err(SourceError::CorruptHeader("archive member has no size").into());
            }
            // Headers are assumed to fit in the first decoded block.
            if member.header_len > self.avail as u64 {
                return Err(
                    SourceError::CorruptHeader("archive header exceeds the first block").into(),
                );
            }
            let skip = member.header_len as usize;
            self.buffer.copy_within(skip..self.avail, 0);
            self.avail -= skip;
        }
        self.plain_size = member.size;
        Ok(())
    }

    /// Runs the codec until `buffer[start..end]` is full or the stream ends,
    /// and returns the end of the decoded data.
    fn decode_into(&mut self, start: usize, end: usize) -> Result<usize> {
        let Some(codec) = self.codec.as_mut().filter(|_| !self.ended) else {
            return Ok(start);
        };
        let mut pos = start;
        while pos < end {
            if self.in_pos == self.in_len && self.compressed_read < self.compressed_end {
                let want = (self.compressed_end - self.compressed_read).min(self.comp_buf.len() as u64);
                let n = read_up_to(&mut self.file, &mut self.comp_buf[..want as usize])
                    .map_err(Error::Read)?;
                if n == 0 {
                    return Err(Error::Read(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "compressed stream ends before its declared size",
                    )));
                }
                trace!(offset = self.compressed_read, len = n, "refilled compressed input");
                self.in_pos = 0;
                self.in_len = n;
                self.compressed_read += n as u64;
                if self.compressed_read >= self.compressed_end {
                    self.state = SessionState::Draining;
                }
            }

            let input = &self.comp_buf[self.in_pos..self.in_len];
            let step = codec.decode(input, &mut self.buffer[pos..end])?;
            self.in_pos += step.consumed;
            pos += step.produced;

            if step.finished {
                self.ended = true;
                self.state = SessionState::Draining;
                self.in_pos = self.in_len;
                self.compressed_read = self.compressed_end.max(self.compressed_read);
                break;
            }
            if step.consumed == 0 && step.produced == 0 {
                if input.is_empty() {
                    // Input exhausted and nothing left inside the codec.
                    self.state = SessionState::Draining;
                    break;
                }
                return Err(Error::Codec(format!("{} decoder stalled", codec.kind())));
            }
        }
        Ok(pos)
    }

    /// Produces the next block of plaintext into [`ImageReader::chunk`].
    ///
    /// Returns the number of bytes produced, rounded up to a whole sector
    /// with zero padding, or 0 once the source is exhausted.
    pub fn read(&mut self) -> Result<usize> {
        match self.state {
            SessionState::Done => return Ok(0),
            SessionState::Failed => {
                return Err(Error::Codec("stream is unusable after an earlier error".into()));
            }
            _ => {}
        }
        match self.read_block() {
            Ok(n) => Ok(n),
            Err(e) => {
                self.state = SessionState::Failed;
                self.codec = None;
                Err(e)
            }
        }
    }

    fn read_block(&mut self) -> Result<usize> {
        let limit = if self.plain_size > 0 {
            let left = self.plain_size.saturating_sub(self.produced);
            left.min(self.buffer.len() as u64) as usize
        } else {
            self.buffer.len()
        };

        let len = if limit == 0 {
            0
        } else if self.codec.is_none() {
            read_up_to(&mut self.file, &mut self.buffer[..limit]).map_err(Error::Read)?
        } else if self.avail >= limit {
            limit
        } else {
            self.decode_into(self.avail, limit)?
        };
        self.avail = 0;

        if len == 0 {
            if self.plain_size == 0 {
                self.plain_size = self.produced;
            }
            self.state = SessionState::Done;
            debug!(produced = self.produced, "source exhausted");
            return Ok(0);
        }

        let padded = sector_align(len);
        self.buffer[len..padded].fill(0);
        self.produced += padded as u64;
        trace!(len, padded, produced = self.produced, "read block");
        Ok(padded)
    }

    /// The plaintext produced by the last [`ImageReader::read`].
    pub fn chunk(&self, len: usize) -> &[u8] {
        &self.buffer[..len]
    }

    /// The last plaintext chunk together with a scratch buffer of the same
    /// length for reading the destination back.
    pub fn chunk_and_scratch(&mut self, len: usize) -> (&[u8], &mut [u8]) {
        (&self.buffer[..len], &mut self.verify_buf[..len])
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> &Detected {
        &self.detected
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Declared plaintext size, 0 while unknown.
    pub fn total_size(&self) -> u64 {
        self.plain_size
    }

    /// Plaintext bytes produced so far, including sector padding.
    pub fn produced(&self) -> u64 {
        self.produced
    }

    pub fn counters(&self) -> Counters {
        Counters {
            produced: self.produced,
            total: self.plain_size,
            consumed: self.compressed_read,
            compressed_total: self.compressed_end,
        }
    }

    /// Progress snapshot. With `done` set, returns the final status line.
    pub fn status(&mut self, done: bool) -> Status {
        let counters = self.counters();
        if done {
            self.progress.finished(&counters, self.state != SessionState::Failed)
        } else {
            self.progress.status(&counters)
        }
    }

    /// Releases the file and decoder.
    pub fn close(self) {
        debug!(path = %self.path.display(), produced = self.produced, "closing source image");
    }
}

/// Turns a `file://` URL, as produced by desktop drag and drop, into a path.
/// Other paths are returned unchanged.
pub fn source_path(path: &Path) -> std::result::Result<PathBuf, SourceError> {
    let Some(rest) = path.to_str().and_then(|s| s.strip_prefix("file://")) else {
        if path.as_os_str().is_empty() {
            return Err(SourceError::InvalidSource);
        }
        return Ok(path.to_path_buf());
    };
    let end = rest
        .find(|c: char| c <= ' ' || c == '?' || c == '#')
        .unwrap_or(rest.len());
    let raw = rest[..end].as_bytes();

    let mut decoded = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        let hex = raw
            .get(i + 1..i + 3)
            .and_then(|h| std::str::from_utf8(h).ok())
            .and_then(|h| u8::from_str_radix(h, 16).ok());
        match (raw[i], hex) {
            (b'%', Some(byte)) => {
                decoded.push(byte);
                i += 3;
            }
            (b, _) => {
                decoded.push(b);
                i += 1;
            }
        }
    }
    if decoded.is_empty() {
        return Err(SourceError::InvalidSource);
    }
    Ok(PathBuf::from(OsString::from_vec(decoded)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config() -> Config {
        Config::default()
    }

    fn write_temp(data: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(data).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn file_urls_are_decoded() {
        assert_eq!(
            source_path(Path::new("file:///tmp/my%20image.img?x=1")).unwrap(),
            PathBuf::from("/tmp/my image.img")
        );
        assert_eq!(
            source_path(Path::new("/tmp/plain.img")).unwrap(),
            PathBuf::from("/tmp/plain.img")
        );
        assert!(source_path(Path::new("file://")).is_err());
        assert!(source_path(Path::new("")).is_err());
    }

    #[test]
    fn raw_source_is_padded_to_sectors() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 200 + 1) as u8).collect();
        let f = write_temp(&data);
        let mut r = ImageReader::open(f.path(), &config()).unwrap();
        assert_eq!(r.format().container, Container::Raw);
        assert_eq!(r.total_size(), 1000);
        let n = r.read().unwrap();
        assert_eq!(n, 1024);
        assert_eq!(&r.chunk(n)[..1000], &data[..]);
        assert!(r.chunk(n)[1000..].iter().all(|&b| b == 0));
        assert_eq!(r.read().unwrap(), 0);
        assert_eq!(r.state(), SessionState::Done);
        assert_eq!(r.status(true).percent, 100);
    }

    #[test]
    fn empty_source_is_invalid() {
        let f = write_temp(&[]);
        assert!(matches!(
            ImageReader::open(f.path(), &config()),
            Err(Error::Source(SourceError::InvalidSource))
        ));
    }

    #[test]
    fn missing_source_fails_to_open() {
        assert!(matches!(
            ImageReader::open("/nonexistent/usbflash.img", &config()),
            Err(Error::Source(SourceError::SourceOpenFailed(_)))
        ));
    }

    #[test]
    fn verbatim_mode_skips_detection() {
        let mut data = vec![0x1f, 0x8b, 8, 0];
        data.resize(600, 0x55);
        let f = write_temp(&data);
        let mut r = ImageReader::open_verbatim(f.path(), &config()).unwrap();
        assert_eq!(r.format().container, Container::Raw);
        let n = r.read().unwrap();
        assert_eq!(&r.chunk(n)[..600], &data[..]);
    }

    #[test]
    fn corrupt_deflate_fails_while_priming() {
        let mut data = vec![0x1f, 0x8b, 8, 0, 0, 0, 0, 0, 0, 3];
        data.extend_from_slice(&[0xff; 64]);
        data.extend_from_slice(&[0; 8]);
        let f = write_temp(&data);
        assert!(matches!(
            ImageReader::open(f.path(), &config()),
            Err(Error::Codec(_))
        ));
    }
}
