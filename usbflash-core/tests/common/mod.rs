//! Fixture builders shared by the integration tests.
#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use usbflash_core::config::Config;
use usbflash_core::stream::ImageReader;

/// Deterministic, mildly compressible test data.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len as u64)
        .map(|i| ((i.wrapping_mul(2_654_435_761) >> 13) % 61) as u8 + (i % 7) as u8)
        .collect()
}

pub fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

pub fn round_up(len: usize) -> usize {
    len.div_ceil(512) * 512
}

/// Reads a source to exhaustion.
pub fn drain(path: &Path, config: &Config) -> (Vec<u8>, ImageReader) {
    let mut reader = ImageReader::open(path, config).unwrap();
    let mut out = Vec::new();
    loop {
        let n = reader.read().unwrap();
        if n == 0 {
            break;
        }
        assert_eq!(n % 512, 0);
        out.extend_from_slice(reader.chunk(n));
    }
    (out, reader)
}

/// Asserts that `out` is `data` followed by zero padding to a sector.
pub fn assert_padded(out: &[u8], data: &[u8]) {
    assert_eq!(out.len(), round_up(data.len()));
    assert!(out[..data.len()] == *data, "payload differs");
    assert!(out[data.len()..].iter().all(|&b| b == 0));
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

pub fn deflate(data: &[u8]) -> Vec<u8> {
    let mut enc = flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::fast());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

pub fn bzip2(data: &[u8]) -> Vec<u8> {
    let mut enc = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::fast());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

pub fn xz(data: &[u8]) -> Vec<u8> {
    let mut enc = xz2::write::XzEncoder::new(Vec::new(), 1);
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

/// A single zstd frame that records its content size.
pub fn zstd_sized(data: &[u8]) -> Vec<u8> {
    zstd::bulk::compress(data, 3).unwrap()
}

/// A zip file holding one entry, compressed with `method`.
pub fn zip(method: u16, flags: u16, compressed: &[u8], plain_len: usize) -> Vec<u8> {
    let name = b"disk.img";
    let mut z = Vec::new();
    z.extend_from_slice(b"PK\x03\x04");
    z.extend_from_slice(&20u16.to_le_bytes());
    z.extend_from_slice(&flags.to_le_bytes());
    z.extend_from_slice(&method.to_le_bytes());
    z.extend_from_slice(&[0; 8]);
    z.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
    z.extend_from_slice(&(plain_len as u32).to_le_bytes());
    z.extend_from_slice(&(name.len() as u16).to_le_bytes());
    z.extend_from_slice(&0u16.to_le_bytes());
    z.extend_from_slice(name);
    z.extend_from_slice(compressed);
    // Central directory stand-in; only the local header is ever read.
    z.extend_from_slice(b"PK\x01\x02");
    z.extend_from_slice(&[0; 42]);
    z
}

/// A boxed container around `payload`, stored or compressed with `codec_id`.
pub fn boxed(payload: &[u8], plain_len: usize, codec_id: Option<u8>) -> Vec<u8> {
    let mut h = vec![0u8; 64];
    h[..4].copy_from_slice(b"ZZz\x1a");
    h[4..6].copy_from_slice(&64u16.to_le_bytes());
    h[6..8].copy_from_slice(&8u16.to_le_bytes());
    h[15] = codec_id.is_some() as u8;
    h[16..24].copy_from_slice(&(plain_len as u64).to_le_bytes());
    h[32..40].copy_from_slice(&(payload.len() as u64).to_le_bytes());
    h[48] = codec_id.unwrap_or(0);
    h.extend_from_slice(b"disk.im\0");
    h.extend_from_slice(payload);
    h
}

/// A ustar archive with one regular file.
pub fn tar(data: &[u8]) -> Vec<u8> {
    let mut t = vec![0u8; 512];
    t[..8].copy_from_slice(b"disk.img");
    t[124..135].copy_from_slice(format!("{:011o}", data.len()).as_bytes());
    t[156] = b'0';
    t[257..263].copy_from_slice(b"ustar\0");
    t[263..265].copy_from_slice(b"00");
    t.extend_from_slice(data);
    t.resize(round_up(t.len()) + 1024, 0);
    t
}

/// A newc cpio archive with one regular file.
pub fn cpio_newc(data: &[u8]) -> Vec<u8> {
    let name = b"disk.img\0";
    let mut c = String::from("070701");
    for i in 0..13 {
        let v = match i {
            1 => 0o100644,
            6 => data.len(),
            11 => name.len(),
            _ => 0,
        };
        c.push_str(&format!("{v:08X}"));
    }
    let mut c = c.into_bytes();
    c.extend_from_slice(name);
    c.resize((c.len() + 3) & !3, 0);
    c.extend_from_slice(data);
    c.resize((c.len() + 3) & !3, 0);
    c.extend_from_slice(b"07070100000000000000000000000000000000000000000100000000000000000000000000000000000000000000000b00000000TRAILER!!!\0");
    c
}
