//! Streaming compression with an integrated running checksum.
//!
//! Each direction of a connection owns one [`Deflater`] (sender side) or
//! [`Inflater`] (receiver side). The deflate stream and the CRC32 both
//! span the whole direction: compressed frames of different messages share
//! dictionary state in transmission order, and the checksum accumulates
//! over every uncompressed payload byte, never resetting at frame
//! boundaries. Each frame carries the CRC value current at its end.
//!
//! Compressed frames end on a deflate sync flush. The flush trailer
//! `00 00 FF FF` is stripped before transmission and re-appended by the
//! receiver before inflating.

use blip_core::constants::CHECKSUM_SIZE;
use blip_core::{ErrorKind, Result};
use byteorder::{BigEndian, ByteOrder};
use crc32fast::Hasher;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

/// The four bytes a deflate sync flush leaves at the end of its output.
pub const SYNC_FLUSH_TRAILER: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Step size for growing the inflate output buffer.
const INFLATE_CHUNK: usize = 8 * 1024;

/// How a frame's payload bytes pass through the codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Plain copy; only the checksum observes the bytes.
    Raw,
    /// Through the deflate engine, ending the frame on a sync flush.
    SyncFlush,
}

/// Sender-side codec: streaming deflate plus the running CRC32 over the
/// uncompressed bytes consumed.
pub struct Deflater {
    compress: Compress,
    checksum: Hasher,
    unflushed: usize,
}

impl Deflater {
    /// Creates a codec with a fresh raw-deflate stream and zeroed CRC.
    pub fn new() -> Deflater {
        Deflater {
            compress: Compress::new(Compression::default(), false),
            checksum: Hasher::new(),
            unflushed: 0,
        }
    }

    /// Consumes bytes from `src` (advancing it) and appends output to
    /// `dst` without letting it grow past `limit`. In `SyncFlush` mode
    /// the deflate stream is flushed to a byte boundary so the frame can
    /// be decompressed independently of later input.
    pub fn write(&mut self, src: &mut &[u8], dst: &mut Vec<u8>, limit: usize, mode: Mode) -> Result<()> {
        match mode {
            Mode::Raw => {
                let room = limit.saturating_sub(dst.len());
                let n = src.len().min(room);
                self.checksum.update(&src[..n]);
                dst.extend_from_slice(&src[..n]);
                *src = &src[n..];
                Ok(())
            }
            Mode::SyncFlush => self.deflate_sync(src, dst, limit),
        }
    }

    fn deflate_sync(&mut self, src: &mut &[u8], dst: &mut Vec<u8>, limit: usize) -> Result<()> {
        loop {
            let out_start = dst.len();
            if out_start >= limit {
                // Output budget exhausted with the flush possibly incomplete.
                self.unflushed += src.len().max(1);
                return Ok(());
            }
            dst.resize(limit, 0);

            let in_before = self.compress.total_in();
            let out_before = self.compress.total_out();
            self.compress
                .compress(src, &mut dst[out_start..], FlushCompress::Sync)
                .map_err(|e| ErrorKind::Compression(e.to_string()))?;
            let consumed = (self.compress.total_in() - in_before) as usize;
            let produced = (self.compress.total_out() - out_before) as usize;

            self.checksum.update(&src[..consumed]);
            self.unflushed += consumed;
            *src = &src[consumed..];
            dst.truncate(out_start + produced);

            if src.is_empty() && dst.len() < limit {
                // zlib only returns with spare output room once every
                // pending byte has been flushed.
                self.unflushed = 0;
                return Ok(());
            }
        }
    }

    /// Appends the big-endian CRC32 of all uncompressed bytes consumed so
    /// far. The running state is not reset; it spans the connection.
    pub fn write_checksum(&self, dst: &mut Vec<u8>) {
        let mut suffix = [0u8; CHECKSUM_SIZE];
        BigEndian::write_u32(&mut suffix, self.checksum.clone().finalize());
        dst.extend_from_slice(&suffix);
    }

    /// Bytes consumed by the deflate engine but not yet flushed to
    /// output. Must be zero after a sync flush before a frame is emitted.
    pub fn unflushed_bytes(&self) -> usize {
        self.unflushed
    }
}

impl Default for Deflater {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver-side codec: streaming inflate plus the running CRC32 over the
/// uncompressed bytes produced.
pub struct Inflater {
    decompress: Decompress,
    checksum: Hasher,
}

impl Inflater {
    /// Creates a codec with a fresh raw-inflate stream and zeroed CRC.
    pub fn new() -> Inflater {
        Inflater { decompress: Decompress::new(false), checksum: Hasher::new() }
    }

    /// Decodes one frame payload (its checksum suffix already stripped),
    /// appending uncompressed bytes to `dst`. In `SyncFlush` mode the
    /// trailer the sender stripped is re-appended before inflating.
    /// Output beyond `max_output` total bytes in `dst` is a failure.
    pub fn write(&mut self, src: &[u8], dst: &mut Vec<u8>, max_output: usize, mode: Mode) -> Result<()> {
        match mode {
            Mode::Raw => {
                if dst.len() + src.len() > max_output {
                    return Err(ErrorKind::Compression("inflate output over budget".into()));
                }
                self.checksum.update(src);
                dst.extend_from_slice(src);
                Ok(())
            }
            Mode::SyncFlush => {
                self.inflate(src, dst, max_output)?;
                self.inflate(&SYNC_FLUSH_TRAILER, dst, max_output)
            }
        }
    }

    fn inflate(&mut self, mut src: &[u8], dst: &mut Vec<u8>, max_output: usize) -> Result<()> {
        while !src.is_empty() {
            let out_start = dst.len();
            if out_start >= max_output {
                return Err(ErrorKind::Compression("inflate output over budget".into()));
            }
            let grow = INFLATE_CHUNK.min(max_output - out_start);
            dst.resize(out_start + grow, 0);

            let in_before = self.decompress.total_in();
            let out_before = self.decompress.total_out();
            self.decompress
                .decompress(src, &mut dst[out_start..], FlushDecompress::Sync)
                .map_err(|e| ErrorKind::Compression(e.to_string()))?;
            let consumed = (self.decompress.total_in() - in_before) as usize;
            let produced = (self.decompress.total_out() - out_before) as usize;

            if consumed == 0 && produced == 0 {
                return Err(ErrorKind::Compression("inflate made no progress".into()));
            }
            self.checksum.update(&dst[out_start..out_start + produced]);
            dst.truncate(out_start + produced);
            src = &src[consumed..];
        }
        Ok(())
    }

    /// Verifies a frame's 4-byte checksum suffix against the running CRC.
    pub fn read_checksum(&self, tail: &[u8]) -> Result<()> {
        if tail.len() != CHECKSUM_SIZE {
            return Err(ErrorKind::Protocol("frame too short for checksum"));
        }
        let actual = BigEndian::read_u32(tail);
        let expected = self.checksum.clone().finalize();
        if expected != actual {
            return Err(ErrorKind::ChecksumMismatch { expected, actual });
        }
        Ok(())
    }
}

impl Default for Inflater {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUDGET: usize = 1 << 20;

    /// Sender-side helper: produce one frame payload (with checksum) the
    /// way MessageOut does, consuming as much of `src` as fits.
    fn send_frame(deflater: &mut Deflater, src: &mut &[u8], limit: usize, mode: Mode) -> Vec<u8> {
        let mut dst = Vec::new();
        let body_limit = limit - CHECKSUM_SIZE;
        deflater.write(src, &mut dst, body_limit, mode).unwrap();
        assert_eq!(deflater.unflushed_bytes(), 0);
        if mode == Mode::SyncFlush && !dst.is_empty() {
            assert!(dst.ends_with(&SYNC_FLUSH_TRAILER));
            dst.truncate(dst.len() - SYNC_FLUSH_TRAILER.len());
        }
        deflater.write_checksum(&mut dst);
        dst
    }

    /// Receiver-side helper: verify and decode one frame payload.
    fn receive_frame(inflater: &mut Inflater, frame: &[u8], mode: Mode) -> Vec<u8> {
        let (body, tail) = frame.split_at(frame.len() - CHECKSUM_SIZE);
        let mut out = Vec::new();
        inflater.write(body, &mut out, BUDGET, mode).unwrap();
        inflater.read_checksum(tail).unwrap();
        out
    }

    #[test]
    fn test_raw_round_trip_over_multiple_frames() {
        let mut deflater = Deflater::new();
        let mut inflater = Inflater::new();

        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let mut src = &data[..];
        let mut reassembled = Vec::new();
        while !src.is_empty() {
            let frame = send_frame(&mut deflater, &mut src, 16 * 1024, Mode::Raw);
            reassembled.extend_from_slice(&receive_frame(&mut inflater, &frame, Mode::Raw));
        }
        assert_eq!(reassembled, data);
    }

    #[test]
    fn test_compressed_round_trip_over_multiple_frames() {
        let mut deflater = Deflater::new();
        let mut inflater = Inflater::new();

        let data = "the quick brown fox jumps over the lazy dog ".repeat(4000);
        let data = data.as_bytes();
        let mut src = data;
        let mut reassembled = Vec::new();
        let mut wire_bytes = 0;
        while !src.is_empty() {
            let frame = send_frame(&mut deflater, &mut src, 4 * 1024, Mode::SyncFlush);
            wire_bytes += frame.len();
            reassembled.extend_from_slice(&receive_frame(&mut inflater, &frame, Mode::SyncFlush));
        }
        assert_eq!(reassembled, data);
        assert!(wire_bytes < data.len() / 4, "repetitive text should compress well");
    }

    #[test]
    fn test_crc_spans_frames_in_both_modes() {
        // Alternate raw and compressed frames through one codec pair; the
        // checksum must stay consistent across the whole stream.
        let mut deflater = Deflater::new();
        let mut inflater = Inflater::new();

        for (i, mode) in [Mode::Raw, Mode::SyncFlush, Mode::Raw, Mode::SyncFlush]
            .into_iter()
            .enumerate()
        {
            let chunk = vec![i as u8 + 1; 2000];
            let mut src = &chunk[..];
            let frame = send_frame(&mut deflater, &mut src, 16 * 1024, mode);
            assert!(src.is_empty());
            assert_eq!(receive_frame(&mut inflater, &frame, mode), chunk);
        }
    }

    #[test]
    fn test_corrupted_checksum_detected() {
        let mut deflater = Deflater::new();
        let mut inflater = Inflater::new();

        let mut src: &[u8] = b"payload bytes";
        let mut frame = send_frame(&mut deflater, &mut src, 1024, Mode::Raw);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;

        let (body, tail) = frame.split_at(frame.len() - CHECKSUM_SIZE);
        let mut out = Vec::new();
        inflater.write(body, &mut out, BUDGET, Mode::Raw).unwrap();
        assert!(matches!(
            inflater.read_checksum(tail),
            Err(ErrorKind::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_dropped_frame_breaks_the_running_crc() {
        let mut deflater = Deflater::new();
        let mut inflater = Inflater::new();

        let chunk = vec![7u8; 500];
        let mut src = &chunk[..];
        let _lost = send_frame(&mut deflater, &mut src, 1024, Mode::Raw);
        let mut src = &chunk[..];
        let second = send_frame(&mut deflater, &mut src, 1024, Mode::Raw);

        // The receiver never saw the first frame, so the second one's
        // checksum cannot match its running CRC.
        let (body, tail) = second.split_at(second.len() - CHECKSUM_SIZE);
        let mut out = Vec::new();
        inflater.write(body, &mut out, BUDGET, Mode::Raw).unwrap();
        assert!(inflater.read_checksum(tail).is_err());
    }

    #[test]
    fn test_inflate_output_budget_enforced() {
        let mut deflater = Deflater::new();
        let mut inflater = Inflater::new();

        let data = vec![0u8; 100_000];
        let mut src = &data[..];
        let mut dst = Vec::new();
        deflater.write(&mut src, &mut dst, 1 << 20, Mode::SyncFlush).unwrap();
        dst.truncate(dst.len() - SYNC_FLUSH_TRAILER.len());

        let mut out = Vec::new();
        assert!(matches!(
            inflater.write(&dst, &mut out, 10_000, Mode::SyncFlush),
            Err(ErrorKind::Compression(_))
        ));
    }

    #[test]
    fn test_garbage_input_fails_inflate() {
        let mut inflater = Inflater::new();
        let mut out = Vec::new();
        // 0x06 = reserved deflate block type; rejected immediately.
        let garbage = [0x06u8, 0x00, 0x00, 0x00];
        assert!(inflater.write(&garbage, &mut out, BUDGET, Mode::SyncFlush).is_err());
    }
}
