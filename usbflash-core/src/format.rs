//! Source format detection.
//!
//! The first [`HEADER_SIZE`] bytes of an image are read once and classified by
//! their magic bytes. The result tells the stream reader which codec to run,
//! where the compressed payload starts and ends in the file, and how large
//! the plaintext is when the format states it up front.
use crate::error::SourceError;
use std::fmt;

/// Number of bytes read from the start of a source for classification.
pub const HEADER_SIZE: usize = 65536;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const BZIP2_MAGIC: &[u8] = b"BZh";
const XZ_MAGIC: &[u8] = &[0xfd, b'7', b'z', b'X', b'Z'];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
pub(crate) const BOXED_MAGIC: &[u8] = b"ZZz\x1a";
const SEVENZIP_MAGIC: &[u8] = &[b'7', b'z', 0xbc, 0xaf];

const ZIP_FLAG_ENCRYPTED: u16 = 1;
const ZIP_FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;
const ZIP_FLAG_STRONG_ENCRYPTION: u16 = 1 << 6;
const ZIP_LOCAL_HEADER_LEN: usize = 30;
const ZIP64_EXTRA_ID: u16 = 1;

/// The decoder needed to turn the payload into plaintext.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecKind {
    Stored,
    Deflate,
    Bzip2,
    Xz,
    Zstd,
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CodecKind::Stored => "stored",
            CodecKind::Deflate => "deflate",
            CodecKind::Bzip2 => "bzip2",
            CodecKind::Xz => "xz",
            CodecKind::Zstd => "zstd",
        };
        f.write_str(name)
    }
}

/// The outer wrapper recognised in the header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Container {
    Raw,
    Gzip,
    Bzip2,
    Xz,
    Zstd,
    Zip,
    Boxed,
}

/// Result of classifying a source header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Detected {
    pub container: Container,
    pub codec: CodecKind,
    /// File offset of the first payload byte.
    pub payload_offset: u64,
    /// File offset one past the last compressed payload byte.
    pub compressed_end: u64,
    /// Declared plaintext size, 0 when the format does not state it safely.
    pub plain_size: u64,
}

fn le16(buf: &[u8], at: usize) -> Option<u16> {
    buf.get(at..at + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn le32(buf: &[u8], at: usize) -> Option<u32> {
    buf.get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn le64(buf: &[u8], at: usize) -> Option<u64> {
    buf.get(at..at + 8).map(|b| {
        let mut v = [0u8; 8];
        v.copy_from_slice(b);
        u64::from_le_bytes(v)
    })
}

/// Classifies a source from its header.
///
/// `header` holds the bytes actually read (possibly fewer than
/// [`HEADER_SIZE`] for small files) and `file_len` is the size of the whole
/// source. Anything past `header.len()` is treated as absent.
pub fn sniff(header: &[u8], file_len: u64) -> Result<Detected, SourceError> {
    if header.starts_with(GZIP_MAGIC) {
        return sniff_gzip(header, file_len);
    }
    if header.starts_with(BZIP2_MAGIC) {
        return Ok(whole_file(Container::Bzip2, CodecKind::Bzip2, file_len));
    }
    if header.starts_with(XZ_MAGIC) {
        return Ok(whole_file(Container::Xz, CodecKind::Xz, file_len));
    }
    if header.starts_with(ZSTD_MAGIC) {
        let mut detected = whole_file(Container::Zstd, CodecKind::Zstd, file_len);
        detected.plain_size = zstd::zstd_safe::get_frame_content_size(header)
            .ok()
            .flatten()
            .unwrap_or(0);
        return Ok(detected);
    }
    if header.starts_with(ZIP_MAGIC) {
        return sniff_zip(header);
    }
    if header.starts_with(BOXED_MAGIC) {
        return sniff_boxed(header);
    }
    if header.starts_with(SEVENZIP_MAGIC) {
        // No safe, terminable parser exists for this format; refuse it rather
        // than writing the container verbatim.
        return Err(SourceError::RejectedFormat("7z"));
    }
    Ok(Detected {
        container: Container::Raw,
        codec: CodecKind::Stored,
        payload_offset: 0,
        compressed_end: 0,
        plain_size: file_len,
    })
}

fn whole_file(container: Container, codec: CodecKind, file_len: u64) -> Detected {
    Detected {
        container,
        codec,
        payload_offset: 0,
        compressed_end: file_len,
        plain_size: 0,
    }
}

fn sniff_gzip(header: &[u8], file_len: u64) -> Result<Detected, SourceError> {
    const FHCRC: u8 = 1 << 1;
    const FEXTRA: u8 = 1 << 2;
    const FNAME: u8 = 1 << 3;
    const FCOMMENT: u8 = 1 << 4;

    if header.len() < 10 || file_len < 18 {
        return Err(SourceError::CorruptHeader("truncated gzip header"));
    }
    if header[2] != 8 {
        return Err(SourceError::UnsupportedInnerCodec);
    }
    let flags = header[3];
    let mut pos = 10usize;
    if flags & FEXTRA != 0 {
        let xlen = le16(header, pos).ok_or(SourceError::CorruptHeader("gzip extra field"))?;
        pos += 2 + xlen as usize;
    }
    for flag in [FNAME, FCOMMENT] {
        if flags & flag != 0 {
            let rest = header
                .get(pos..)
                .ok_or(SourceError::CorruptHeader("gzip name/comment field"))?;
            let nul = rest
                .iter()
                .position(|&b| b == 0)
                .ok_or(SourceError::CorruptHeader("gzip name/comment field"))?;
            pos += nul + 1;
        }
    }
    if flags & FHCRC != 0 {
        pos += 2;
    }
    if pos > header.len() {
        return Err(SourceError::CorruptHeader("gzip header exceeds the first block"));
    }

    // The trailer's ISIZE field wraps above 4 GiB, so the plaintext size is
    // left unknown and inferred once the stream is exhausted.
    Ok(Detected {
        container: Container::Gzip,
        codec: CodecKind::Deflate,
        payload_offset: pos as u64,
        compressed_end: file_len - 8,
        plain_size: 0,
    })
}

fn zip_codec(method: u16) -> Result<CodecKind, SourceError> {
    match method {
        0 => Ok(CodecKind::Stored),
        8 => Ok(CodecKind::Deflate),
        12 => Ok(CodecKind::Bzip2),
        93 => Ok(CodecKind::Zstd),
        95 => Ok(CodecKind::Xz),
        _ => Err(SourceError::UnsupportedInnerCodec),
    }
}

fn sniff_zip(header: &[u8]) -> Result<Detected, SourceError> {
    if header.len() < ZIP_LOCAL_HEADER_LEN {
        return Err(SourceError::CorruptHeader("truncated zip local header"));
    }
    let flags = le16(header, 6).unwrap_or(0);
    if flags & (ZIP_FLAG_ENCRYPTED | ZIP_FLAG_DATA_DESCRIPTOR | ZIP_FLAG_STRONG_ENCRYPTION) != 0 {
        return Err(SourceError::EncryptedOrUnsupportedZip);
    }
    let codec = zip_codec(le16(header, 8).unwrap_or(0))?;

    let name_len = le16(header, 26).unwrap_or(0) as usize;
    let extra_len = le16(header, 28).unwrap_or(0) as usize;
    let payload_offset = ZIP_LOCAL_HEADER_LEN + name_len + extra_len;

    let mut compressed = le32(header, 18).unwrap_or(0) as u64;
    let mut plain = le32(header, 22).unwrap_or(0) as u64;
    if compressed == u32::MAX as u64 || plain == u32::MAX as u64 {
        let extra_start = ZIP_LOCAL_HEADER_LEN + name_len;
        let (c, p) = zip64_sizes(header, extra_start, extra_start + extra_len)
            .ok_or(SourceError::EncryptedOrUnsupportedZip)?;
        compressed = c;
        plain = p;
    }
    if compressed == 0 || plain == 0 {
        return Err(SourceError::EncryptedOrUnsupportedZip);
    }

    Ok(Detected {
        container: Container::Zip,
        codec,
        payload_offset: payload_offset as u64,
        compressed_end: (payload_offset as u64).saturating_add(compressed),
        plain_size: plain,
    })
}

/// Walks the extra fields looking for the zip64 record and returns
/// `(compressed, uncompressed)`.
fn zip64_sizes(header: &[u8], start: usize, end: usize) -> Option<(u64, u64)> {
    let end = end.min(header.len());
    let mut at = start;
    while at + 4 <= end {
        let id = le16(header, at)?;
        let len = le16(header, at + 2)? as usize;
        if id == ZIP64_EXTRA_ID && len >= 16 {
            let plain = le64(header, at + 4)?;
            let compressed = le64(header, at + 12)?;
            return Some((compressed, plain));
        }
        at += 4 + len;
    }
    None
}

fn boxed_codec(id: u8) -> Result<CodecKind, SourceError> {
    match id {
        2 => Ok(CodecKind::Deflate),
        3 => Ok(CodecKind::Bzip2),
        5 => Ok(CodecKind::Xz),
        7 => Ok(CodecKind::Zstd),
        _ => Err(SourceError::UnsupportedInnerCodec),
    }
}

/// Parsed fixed part of a boxed container header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BoxedHeader {
    /// Header plus name length; the payload starts here.
    pub data_offset: u64,
    pub compressed: bool,
    pub plain_size: u64,
    pub compressed_size: u64,
}

pub(crate) fn parse_boxed(buf: &[u8]) -> Result<BoxedHeader, SourceError> {
    let corrupt = || SourceError::CorruptHeader("boxed container header");
    if buf.len() < 40 || !buf.starts_with(BOXED_MAGIC) {
        return Err(corrupt());
    }
    let header_len = le16(buf, 4).ok_or_else(corrupt)? as u64;
    let name_len = (le16(buf, 6).ok_or_else(corrupt)? & 0x7fff) as u64;
    let mode = buf[15];
    if name_len < 2 || mode & 0xf0 != 0 || mode & 0x0f > 1 {
        return Err(SourceError::EncryptedOrUnsupportedZip);
    }
    Ok(BoxedHeader {
        data_offset: header_len + name_len,
        compressed: mode & 0x0f == 1,
        plain_size: le64(buf, 16).unwrap_or(0),
        compressed_size: le64(buf, 32).unwrap_or(0),
    })
}

fn sniff_boxed(header: &[u8]) -> Result<Detected, SourceError> {
    let boxed = parse_boxed(header)?;
    if boxed.plain_size == 0 || boxed.compressed_size == 0 {
        return Err(SourceError::EncryptedOrUnsupportedZip);
    }
    let codec = if boxed.compressed {
        let id = *header
            .get(48)
            .ok_or(SourceError::CorruptHeader("boxed container header"))?;
        boxed_codec(id)?
    } else {
        CodecKind::Stored
    };
    Ok(Detected {
        container: Container::Boxed,
        codec,
        payload_offset: boxed.data_offset,
        compressed_end: boxed.data_offset.saturating_add(boxed.compressed_size),
        plain_size: boxed.plain_size,
    })
}
