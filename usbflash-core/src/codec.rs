//! Incremental decoders behind one interface.
//!
//! Each [`Codec`] variant wraps the low-level streaming state of one
//! compression library. The stream reader owns the input and output buffers
//! and calls [`Codec::decode`] repeatedly; the codec never allocates output
//! on its own, so a single call can never produce more than the caller's
//! buffer holds.
use crate::error::{Error, Result};
use crate::format::CodecKind;
use flate2::{Decompress, FlushDecompress};
use xz2::stream::{Action, Stream};
use zstd::stream::raw::{Decoder as ZstdDecoder, InBuffer, Operation, OutBuffer};

/// Outcome of one [`Codec::decode`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Step {
    /// Input bytes consumed.
    pub consumed: usize,
    /// Output bytes produced.
    pub produced: usize,
    /// The codec reached the end of its stream.
    pub finished: bool,
}

pub enum Codec {
    Deflate(Box<Decompress>),
    Bzip2(Box<bzip2::Decompress>),
    Xz(Box<Stream>),
    Zstd(Box<ZstdDecoder<'static>>),
}

impl Codec {
    /// Creates a decoder for `kind`. Stored payloads need no decoder and
    /// yield `None`.
    pub fn new(kind: CodecKind) -> Result<Option<Self>> {
        let codec = match kind {
            CodecKind::Stored => return Ok(None),
            // Raw deflate: gzip, zip and boxed containers carry their own framing.
            CodecKind::Deflate => Codec::Deflate(Box::new(Decompress::new(false))),
            CodecKind::Bzip2 => Codec::Bzip2(Box::new(bzip2::Decompress::new(false))),
            CodecKind::Xz => {
                let stream = Stream::new_stream_decoder(u64::MAX, 0).map_err(Error::codec)?;
                Codec::Xz(Box::new(stream))
            }
            CodecKind::Zstd => Codec::Zstd(Box::new(ZstdDecoder::new().map_err(Error::codec)?)),
        };
        Ok(Some(codec))
    }

    pub fn kind(&self) -> CodecKind {
        match self {
            Codec::Deflate(_) => CodecKind::Deflate,
            Codec::Bzip2(_) => CodecKind::Bzip2,
            Codec::Xz(_) => CodecKind::Xz,
            Codec::Zstd(_) => CodecKind::Zstd,
        }
    }

    /// Feeds `input` to the decoder and writes plaintext into `output`.
    ///
    /// An empty `input` drains output the decoder is still holding. A step
    /// that neither consumes nor produces anything means the decoder has
    /// nothing more to give for the input seen so far.
    pub fn decode(&mut self, input: &[u8], output: &mut [u8]) -> Result<Step> {
        match self {
            Codec::Deflate(d) => {
                let (in0, out0) = (d.total_in(), d.total_out());
                let status = d
                    .decompress(input, output, FlushDecompress::None)
                    .map_err(Error::codec)?;
                Ok(Step {
                    consumed: (d.total_in() - in0) as usize,
                    produced: (d.total_out() - out0) as usize,
                    finished: status == flate2::Status::StreamEnd,
                })
            }
            Codec::Bzip2(d) => {
                let (in0, out0) = (d.total_in(), d.total_out());
                let status = d.decompress(input, output).map_err(Error::codec)?;
                if status == bzip2::Status::MemNeeded {
                    return Err(Error::Codec("bzip2 decoder ran out of memory".into()));
                }
                Ok(Step {
                    consumed: (d.total_in() - in0) as usize,
                    produced: (d.total_out() - out0) as usize,
                    finished: status == bzip2::Status::StreamEnd,
                })
            }
            Codec::Xz(s) => {
                let (in0, out0) = (s.total_in(), s.total_out());
                // A "buffer error" (reported as MemNeeded) only means no
                // progress was possible; the caller decides what that implies.
                let status = s.process(input, output, Action::Run).map_err(Error::codec)?;
                Ok(Step {
                    consumed: (s.total_in() - in0) as usize,
                    produced: (s.total_out() - out0) as usize,
                    finished: status == xz2::stream::Status::StreamEnd,
                })
            }
            Codec::Zstd(d) => {
                let mut src = InBuffer::around(input);
                let mut dst = OutBuffer::around(output);
                d.run(&mut src, &mut dst).map_err(Error::codec)?;
                // Frames may be concatenated; the end of input decides when
                // the stream is over.
                Ok(Step {
                    consumed: src.pos(),
                    produced: dst.pos(),
                    finished: false,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn drain(codec: &mut Codec, compressed: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 333];
        let mut pos = 0;
        loop {
            let input = &compressed[pos..(pos + 100).min(compressed.len())];
            let step = codec.decode(input, &mut buf).unwrap();
            pos += step.consumed;
            out.extend_from_slice(&buf[..step.produced]);
            if step.finished || (step.consumed == 0 && step.produced == 0 && input.is_empty()) {
                break;
            }
        }
        out
    }

    fn sample() -> Vec<u8> {
        (0..20_000u32).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn stored_has_no_decoder() {
        assert!(Codec::new(CodecKind::Stored).unwrap().is_none());
    }

    #[test]
    fn deflate_decodes_in_small_steps() {
        let mut enc = flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(&sample()).unwrap();
        let compressed = enc.finish().unwrap();
        let mut codec = Codec::new(CodecKind::Deflate).unwrap().unwrap();
        assert_eq!(drain(&mut codec, &compressed), sample());
    }

    #[test]
    fn zstd_decodes_in_small_steps() {
        let compressed = zstd::encode_all(&sample()[..], 3).unwrap();
        let mut codec = Codec::new(CodecKind::Zstd).unwrap().unwrap();
        assert_eq!(codec.kind(), CodecKind::Zstd);
        assert_eq!(drain(&mut codec, &compressed), sample());
    }

    #[test]
    fn corrupt_input_is_a_codec_error() {
        let mut codec = Codec::new(CodecKind::Xz).unwrap().unwrap();
        let mut out = [0u8; 64];
        let err = codec.decode(b"definitely not xz data", &mut out).unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }
}
