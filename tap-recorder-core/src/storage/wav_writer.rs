use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::models::error::CaptureError;
use crate::models::stream::{SampleFormat, StreamDescription, SAMPLE_SIZE};
use crate::processing::wav_format;
use crate::traits::file_sink::{FileSink, SinkSummary};

/// Write buffer size; large enough for several I/O cycles between syscalls.
const WRITE_BUFFER_BYTES: usize = 64 * 1024;

/// Seekable byte storage underneath a `WavFileWriter`.
pub trait RecordingStorage: Write + Seek + Send {
    fn set_len(&mut self, len: u64) -> io::Result<()>;

    fn sync_all(&mut self) -> io::Result<()>;
}

impl RecordingStorage for File {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }

    fn sync_all(&mut self) -> io::Result<()> {
        File::sync_all(self)
    }
}

/// Streaming 32-bit float WAV writer.
///
/// ## File Format
///
/// ```text
/// [44-byte WAV header, format 3 (IEEE float), sizes patched on close]
/// [interleaved little-endian f32 frames...]
/// ```
///
/// The file is created with `create_new`, so a path is written at most once.
///
/// Frames are staged in a preallocated buffer and committed in bulk. A
/// `write_frames` call either queues all of its frames or none. If storage
/// runs out, `close` still finalizes the header over the whole frames that
/// reached the file and truncates any partial frame.
pub struct WavFileWriter {
    file_path: PathBuf,
    storage: Option<Box<dyn RecordingStorage>>,
    pending: Vec<u8>,
    frame_bytes: u64,
    /// Data bytes that reached storage, excluding the header.
    committed: u64,
}

impl WavFileWriter {
    /// Write a WAV stream for `format` into `storage`, starting with the header.
    pub fn with_storage(
        path: &Path,
        mut storage: Box<dyn RecordingStorage>,
        format: &StreamDescription,
    ) -> Result<Self, CaptureError> {
        let channels = header_channels(format)?;
        let header = wav_format::generate_float_header(format.sample_rate as u32, channels, 0);
        storage
            .write_all(&header)
            .map_err(|e| CaptureError::StorageError(format!("failed to write header: {}", e)))?;

        Ok(Self {
            file_path: path.to_path_buf(),
            storage: Some(storage),
            pending: Vec::with_capacity(WRITE_BUFFER_BYTES),
            frame_bytes: channels as u64 * SAMPLE_SIZE as u64,
            committed: 0,
        })
    }

    /// Frames accepted so far, whether or not they have reached storage yet.
    pub fn frames_written(&self) -> u64 {
        (self.committed + self.pending.len() as u64) / self.frame_bytes
    }

    /// Move staged bytes to storage. Whatever could not be written stays staged.
    fn commit_pending(&mut self) -> Result<(), CaptureError> {
        let storage = self
            .storage
            .as_mut()
            .ok_or_else(|| CaptureError::StorageError("file is not open for writing".into()))?;

        let mut written = 0;
        let outcome = loop {
            if written == self.pending.len() {
                break Ok(());
            }
            match storage.write(&self.pending[written..]) {
                Ok(0) => break Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => break Err(e),
            }
        };

        self.committed += written as u64;
        self.pending.drain(..written);
        outcome.map_err(|e| CaptureError::StorageError(format!("write failed: {}", e)))
    }

    /// Commit what storage accepts, then patch the header. Returns the frames lost.
    fn finalize(&mut self) -> Result<u64, CaptureError> {
        if self.storage.is_none() {
            return Err(CaptureError::StorageError("file is not open".into()));
        }

        let committed_in_full = match self.commit_pending() {
            Ok(()) => true,
            Err(e) => {
                log::error!("Could not flush {}: {}", self.file_path.display(), e);
                false
            }
        };

        let accepted = self.committed + self.pending.len() as u64;
        let data_bytes = self.committed - self.committed % self.frame_bytes;
        let frames_lost = (accepted - data_bytes) / self.frame_bytes;
        self.pending.clear();
        self.committed = data_bytes;

        let mut storage = self
            .storage
            .take()
            .ok_or_else(|| CaptureError::StorageError("file is not open".into()))?;

        let header_size = wav_format::WAV_HEADER_SIZE as u64;
        if !committed_in_full {
            storage
                .set_len(header_size + data_bytes)
                .map_err(|e| CaptureError::StorageError(format!("truncate failed: {}", e)))?;
            log::warn!(
                "{} frames did not fit in {}; header covers {} frames",
                frames_lost,
                self.file_path.display(),
                data_bytes / self.frame_bytes
            );
        }

        let mut header = [0u8; 8];
        wav_format::patch_file_size(&mut header, header_size + data_bytes);

        // Patch RIFF chunk size at offset 4
        storage
            .seek(SeekFrom::Start(4))
            .map_err(|e| CaptureError::StorageError(e.to_string()))?;
        storage
            .write_all(&header[4..8])
            .map_err(|e| CaptureError::StorageError(e.to_string()))?;

        // Patch data size at offset 40
        storage
            .seek(SeekFrom::Start(40))
            .map_err(|e| CaptureError::StorageError(e.to_string()))?;
        storage
            .write_all(&(data_bytes as u32).to_le_bytes())
            .map_err(|e| CaptureError::StorageError(e.to_string()))?;

        storage
            .flush()
            .map_err(|e| CaptureError::StorageError(format!("flush failed: {}", e)))?;
        storage
            .sync_all()
            .map_err(|e| CaptureError::StorageError(format!("sync failed: {}", e)))?;
        Ok(frames_lost)
    }
}

/// Channel count for the header, rejecting formats a float WAV cannot describe.
fn header_channels(format: &StreamDescription) -> Result<u16, CaptureError> {
    format.validate()?;
    if format.format != SampleFormat::Float32Interleaved {
        return Err(CaptureError::InvalidFormat(format!(
            "WAV output needs interleaved samples, got {:?}",
            format.format
        )));
    }
    if format.sample_rate.fract() != 0.0 || format.sample_rate > u32::MAX as f64 {
        return Err(CaptureError::InvalidFormat(format!(
            "sample rate {} cannot be stored in a WAV header",
            format.sample_rate
        )));
    }
    u16::try_from(format.channels)
        .map_err(|_| CaptureError::InvalidFormat(format!("too many channels: {}", format.channels)))
}

impl FileSink for WavFileWriter {
    /// Create the file and write the initial 44-byte header.
    fn open(path: &Path, format: &StreamDescription) -> Result<Self, CaptureError> {
        let channels = header_channels(format)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                return Err(CaptureError::StorageError(format!(
                    "output directory does not exist: {}",
                    parent.display()
                )));
            }
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| CaptureError::StorageError(format!("failed to create {}: {}", path.display(), e)))?;

        let writer = Self::with_storage(path, Box::new(file), format).map_err(|e| {
            discard(path);
            e
        })?;

        log::debug!(
            "Opened {} for {} Hz, {} channel float32",
            path.display(),
            format.sample_rate,
            channels
        );
        Ok(writer)
    }

    /// Append interleaved samples. The slice must hold whole frames.
    ///
    /// On error none of `samples` is kept.
    fn write_frames(&mut self, samples: &[f32]) -> Result<(), CaptureError> {
        if samples.len() as u64 * SAMPLE_SIZE as u64 % self.frame_bytes != 0 {
            return Err(CaptureError::InvalidFormat(format!(
                "{} samples is not a whole number of {}-byte frames",
                samples.len(),
                self.frame_bytes
            )));
        }
        if self.storage.is_none() {
            return Err(CaptureError::StorageError("file is not open for writing".into()));
        }

        let bytes = samples.len() * SAMPLE_SIZE;
        if !self.pending.is_empty() && self.pending.len() + bytes > WRITE_BUFFER_BYTES {
            self.commit_pending()?;
        }

        self.pending.reserve(bytes);
        for sample in samples {
            self.pending.extend_from_slice(&sample.to_le_bytes());
        }
        Ok(())
    }

    /// Finalize the header and compute the SHA-256 checksum.
    fn close(&mut self) -> Result<SinkSummary, CaptureError> {
        let frames_lost = self.finalize()?;
        let checksum = sha256_file(&self.file_path)?;
        Ok(SinkSummary {
            path: self.file_path.clone(),
            frames_written: self.frames_written(),
            frames_lost,
            checksum,
        })
    }

    fn path(&self) -> &Path {
        &self.file_path
    }
}

impl Drop for WavFileWriter {
    fn drop(&mut self) {
        if self.storage.is_some() {
            if let Err(e) = self.finalize() {
                log::error!("Failed to finalize {}: {}", self.file_path.display(), e);
            }
        }
    }
}

/// Compute SHA-256 hex digest of a file.
pub fn sha256_file(path: &Path) -> Result<String, CaptureError> {
    let mut file = File::open(path)
        .map_err(|e| CaptureError::StorageError(format!("failed to read file for checksum: {}", e)))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| CaptureError::StorageError(format!("failed to read file for checksum: {}", e)))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_encode(&hasher.finalize()))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Remove a partially written recording after a failed start.
pub fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        log::warn!("Failed to remove partial recording {}: {}", path.display(), e);
    }
}
