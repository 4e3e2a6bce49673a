//! Single-member archive detection.
//!
//! Images are often shipped as a tarball or cpio archive holding exactly one
//! file. Once the first plaintext block is available, the archive header is
//! recognised at its fixed offsets and skipped so only the member's payload
//! reaches the device.
use crate::error::SourceError;
use crate::format::{self, BOXED_MAGIC};

const USTAR_MAGIC_AT: usize = 257;
const TAR_BLOCK: u64 = 512;
const TAR_TYPEFLAG_AT: usize = 156;
const TAR_SIZE_AT: usize = 0x7c;

const CPIO_ODC_HEADER_LEN: u64 = 76;
const CPIO_NEWC_HEADER_LEN: u64 = 110;

/// Location of the member payload inside the first plaintext block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Member {
    pub kind: ArchiveKind,
    /// Bytes to skip before the payload starts.
    pub header_len: u64,
    /// Declared size of the member.
    pub size: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveKind {
    Ustar,
    CpioOdc,
    CpioNewc,
    Boxed,
}

fn octal(field: &[u8]) -> u64 {
    field
        .iter()
        .take_while(|b| (b'0'..=b'7').contains(b))
        .fold(0u64, |acc, b| (acc << 3) + (b - b'0') as u64)
}

fn hex(field: &[u8]) -> u64 {
    field.iter().fold(0u64, |acc, &b| {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => 0,
        };
        (acc << 4) + digit as u64
    })
}

fn field(buf: &[u8], at: usize, len: usize) -> Result<&[u8], SourceError> {
    buf.get(at..at + len)
        .ok_or(SourceError::CorruptHeader("archive header exceeds the first block"))
}

/// Looks for a single-member archive header at the start of `plain`.
///
/// `plain` must only contain bytes that were actually decoded. Returns
/// `Ok(None)` when the data is not an archive.
pub fn locate(plain: &[u8]) -> Result<Option<Member>, SourceError> {
    if plain.get(USTAR_MAGIC_AT..USTAR_MAGIC_AT + 5) == Some(b"ustar") {
        let typeflag = plain[TAR_TYPEFLAG_AT];
        if typeflag != 0 && typeflag != b'0' {
            return Err(SourceError::EncryptedOrUnsupportedZip);
        }
        return Ok(Some(Member {
            kind: ArchiveKind::Ustar,
            header_len: TAR_BLOCK,
            size: octal(field(plain, TAR_SIZE_AT, 11)?),
        }));
    }

    if plain.starts_with(b"07070") && plain.len() > 5 {
        return match plain[5] {
            b'7' => {
                let name_len = octal(field(plain, 59, 6)?);
                Ok(Some(Member {
                    kind: ArchiveKind::CpioOdc,
                    header_len: CPIO_ODC_HEADER_LEN + name_len,
                    size: octal(field(plain, 65, 11)?),
                }))
            }
            b'1' | b'2' => {
                let name_len = hex(field(plain, 94, 8)?);
                Ok(Some(Member {
                    kind: ArchiveKind::CpioNewc,
                    header_len: (CPIO_NEWC_HEADER_LEN + name_len + 3) & !3,
                    size: hex(field(plain, 54, 8)?),
                }))
            }
            _ => Err(SourceError::CorruptHeader("unknown cpio variant")),
        };
    }

    if plain.starts_with(BOXED_MAGIC) {
        let boxed = format::parse_boxed(plain)?;
        if boxed.compressed {
            return Err(SourceError::EncryptedOrUnsupportedZip);
        }
        return Ok(Some(Member {
            kind: ArchiveKind::Boxed,
            header_len: boxed.data_offset,
            size: boxed.plain_size,
        }));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tar_header(typeflag: u8, size: u64) -> Vec<u8> {
        let mut h = vec![0u8; 1024];
        h[..5].copy_from_slice(b"a.img");
        let size = format!("{size:011o}");
        h[TAR_SIZE_AT..TAR_SIZE_AT + 11].copy_from_slice(size.as_bytes());
        h[TAR_TYPEFLAG_AT] = typeflag;
        h[257..263].copy_from_slice(b"ustar\0");
        h
    }

    #[test]
    fn plain_data_is_not_an_archive() {
        assert_eq!(locate(&[0xaa; 4096]).unwrap(), None);
        assert_eq!(locate(&[]).unwrap(), None);
    }

    #[test]
    fn ustar_regular_file() {
        let m = locate(&tar_header(b'0', 10 << 20)).unwrap().unwrap();
        assert_eq!(m.kind, ArchiveKind::Ustar);
        assert_eq!(m.header_len, 512);
        assert_eq!(m.size, 10 << 20);

        let m = locate(&tar_header(0, 1234)).unwrap().unwrap();
        assert_eq!(m.size, 1234);
    }

    #[test]
    fn ustar_directory_is_rejected() {
        assert!(locate(&tar_header(b'5', 0)).is_err());
    }

    #[test]
    fn cpio_odc_header() {
        let mut h = String::from("070707");
        h.push_str(&"0".repeat(6 * 7));
        h.push_str(&"0".repeat(11));
        h.push_str("000006");
        h.push_str("00000001750");
        h.push_str("a.img\0");
        let m = locate(h.as_bytes()).unwrap().unwrap();
        assert_eq!(m.kind, ArchiveKind::CpioOdc);
        assert_eq!(m.header_len, 82);
        assert_eq!(m.size, 1000);
    }

    #[test]
    fn cpio_newc_header_is_padded() {
        let mut h = String::from("070701");
        for i in 0..13 {
            h.push_str(match i {
                6 => "000003E8",
                11 => "00000006",
                _ => "00000000",
            });
        }
        h.push_str("a.img\0");
        let m = locate(h.as_bytes()).unwrap().unwrap();
        assert_eq!(m.kind, ArchiveKind::CpioNewc);
        assert_eq!(m.header_len, 116);
        assert_eq!(m.size, 1000);
    }

    #[test]
    fn truncated_cpio_header_is_corrupt() {
        assert!(matches!(
            locate(b"0707070000"),
            Err(SourceError::CorruptHeader(_))
        ));
    }
}
