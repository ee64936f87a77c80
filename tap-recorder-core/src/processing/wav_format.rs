//! WAV file format utilities for 32-bit float recordings.
//!
//! Generates the 44-byte RIFF header used by `WavFileWriter`, patches its
//! size fields on close, and reads such files back.

use std::fs;
use std::path::Path;

use crate::models::error::CaptureError;

/// Size of the standard WAV RIFF header in bytes.
pub const WAV_HEADER_SIZE: usize = 44;

/// `WAVE_FORMAT_IEEE_FLOAT`.
pub const FORMAT_IEEE_FLOAT: u16 = 3;

/// Bits per float32 sample.
pub const FLOAT_BIT_DEPTH: u16 = 32;

/// Generate a 44-byte WAV RIFF header.
///
/// Layout:
/// ```text
/// [0-3]    "RIFF"
/// [4-7]    file size - 8 (36 + data_size)
/// [8-11]   "WAVE"
/// [12-15]  "fmt "
/// [16-19]  16 (format chunk size)
/// [20-21]  format code (3 = IEEE float)
/// [22-23]  channels
/// [24-27]  sample_rate
/// [28-31]  byte_rate = sample_rate * channels * bit_depth / 8
/// [32-33]  block_align = channels * bit_depth / 8
/// [34-35]  bit_depth
/// [36-39]  "data"
/// [40-43]  data_size
/// ```
pub fn generate_wav_header(
    format_code: u16,
    sample_rate: u32,
    bit_depth: u16,
    channels: u16,
    data_size: u32,
) -> [u8; WAV_HEADER_SIZE] {
    let byte_rate = sample_rate * channels as u32 * bit_depth as u32 / 8;
    let block_align = channels * bit_depth / 8;
    let chunk_size = 36 + data_size;

    let mut header = [0u8; WAV_HEADER_SIZE];

    // RIFF chunk descriptor
    header[0..4].copy_from_slice(b"RIFF");
    header[4..8].copy_from_slice(&chunk_size.to_le_bytes());
    header[8..12].copy_from_slice(b"WAVE");

    // fmt sub-chunk
    header[12..16].copy_from_slice(b"fmt ");
    header[16..20].copy_from_slice(&16u32.to_le_bytes());
    header[20..22].copy_from_slice(&format_code.to_le_bytes());
    header[22..24].copy_from_slice(&channels.to_le_bytes());
    header[24..28].copy_from_slice(&sample_rate.to_le_bytes());
    header[28..32].copy_from_slice(&byte_rate.to_le_bytes());
    header[32..34].copy_from_slice(&block_align.to_le_bytes());
    header[34..36].copy_from_slice(&bit_depth.to_le_bytes());

    // data sub-chunk
    header[36..40].copy_from_slice(b"data");
    header[40..44].copy_from_slice(&data_size.to_le_bytes());

    header
}

/// Header for an IEEE float32 stream.
pub fn generate_float_header(sample_rate: u32, channels: u16, data_size: u32) -> [u8; WAV_HEADER_SIZE] {
    generate_wav_header(FORMAT_IEEE_FLOAT, sample_rate, FLOAT_BIT_DEPTH, channels, data_size)
}

/// Patch the file-size field at offset 4 (RIFF chunk size = file_size - 8).
pub fn patch_file_size(header: &mut [u8], total_file_size: u64) {
    let chunk_size = (total_file_size - 8) as u32;
    header[4..8].copy_from_slice(&chunk_size.to_le_bytes());
}

/// Patch the data-size field at offset 40.
pub fn patch_data_size(header: &mut [u8], data_size: u64) {
    let data_size_u32 = data_size as u32;
    header[40..44].copy_from_slice(&data_size_u32.to_le_bytes());
}

/// Format fields of a parsed WAV file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavInfo {
    pub format_code: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub bit_depth: u16,
    pub data_size: u32,
}

impl WavInfo {
    pub fn frame_count(&self) -> u64 {
        let block_align = self.channels as u64 * self.bit_depth as u64 / 8;
        if block_align == 0 {
            return 0;
        }
        self.data_size as u64 / block_align
    }
}

/// Parse the `fmt ` and `data` chunks of a RIFF/WAVE image.
///
/// Unknown chunks are skipped. Returns the format and the byte range of the data chunk.
pub fn parse_wav(bytes: &[u8]) -> Result<(WavInfo, std::ops::Range<usize>), CaptureError> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(CaptureError::InvalidFormat("not a RIFF/WAVE file".into()));
    }

    let mut fmt: Option<(u16, u16, u32, u16)> = None;
    let mut offset = 12;
    while offset + 8 <= bytes.len() {
        let id = &bytes[offset..offset + 4];
        let size = u32::from_le_bytes([bytes[offset + 4], bytes[offset + 5], bytes[offset + 6], bytes[offset + 7]])
            as usize;
        let body = offset + 8;

        match id {
            b"fmt " => {
                if size < 16 || body + 16 > bytes.len() {
                    return Err(CaptureError::InvalidFormat("truncated fmt chunk".into()));
                }
                let b = &bytes[body..body + 16];
                fmt = Some((
                    u16::from_le_bytes([b[0], b[1]]),
                    u16::from_le_bytes([b[2], b[3]]),
                    u32::from_le_bytes([b[4], b[5], b[6], b[7]]),
                    u16::from_le_bytes([b[14], b[15]]),
                ));
            }
            b"data" => {
                let (format_code, channels, sample_rate, bit_depth) =
                    fmt.ok_or_else(|| CaptureError::InvalidFormat("data chunk before fmt chunk".into()))?;
                let end = (body + size).min(bytes.len());
                let info = WavInfo {
                    format_code,
                    channels,
                    sample_rate,
                    bit_depth,
                    data_size: (end - body) as u32,
                };
                return Ok((info, body..end));
            }
            _ => {}
        }

        // Chunks are word aligned.
        offset = body + size + (size & 1);
    }

    Err(CaptureError::InvalidFormat("missing data chunk".into()))
}

/// Read a 32-bit float WAV file back into interleaved samples.
pub fn read_wav_f32(path: &Path) -> Result<(WavInfo, Vec<f32>), CaptureError> {
    let bytes = fs::read(path)
        .map_err(|e| CaptureError::StorageError(format!("failed to read {}: {}", path.display(), e)))?;
    let (info, range) = parse_wav(&bytes)?;

    if info.format_code != FORMAT_IEEE_FLOAT || info.bit_depth != FLOAT_BIT_DEPTH {
        return Err(CaptureError::InvalidFormat(format!(
            "expected 32-bit float samples, found format {} at {} bits",
            info.format_code, info.bit_depth
        )));
    }

    let samples = bytes[range]
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok((info, samples))
}

/// Encode samples as little-endian bytes.
pub fn f32_to_le_bytes(samples: &[f32], out: &mut Vec<u8>) {
    out.reserve(samples.len() * 4);
    for &sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
}
