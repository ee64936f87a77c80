//! `multipart/form-data` bodies for recording uploads.

use std::fs;
use std::path::Path;

use crate::models::error::UploadError;

/// Form field carrying the recording.
pub const FILE_FIELD: &str = "file";

/// Declared content type of the recording part.
pub const AUDIO_CONTENT_TYPE: &str = "audio/wav";

/// A boundary-delimited body ready to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartBody {
    pub boundary: String,
    pub body: Vec<u8>,
}

impl MultipartBody {
    /// Value for the request's `Content-Type` header.
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }
}

fn new_boundary() -> String {
    format!("----TapRecorderBoundary{}", uuid::Uuid::new_v4().simple())
}

/// Quotes and line breaks would end the header parameter early.
fn escape_filename(name: &str) -> String {
    name.replace('"', "%22").replace('\r', "%0D").replace('\n', "%0A")
}

/// Build a body with a single file part.
pub fn single_file_part(field: &str, filename: &str, content_type: &str, data: &[u8]) -> MultipartBody {
    let boundary = new_boundary();
    let mut body = Vec::with_capacity(data.len() + 256);

    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
            field,
            escape_filename(filename)
        )
        .as_bytes(),
    );
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
    body.extend_from_slice(data);
    body.extend_from_slice(b"\r\n");

    // End boundary
    body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());

    MultipartBody { boundary, body }
}

/// Read a finished recording and wrap it as the `file` part, named after its base name.
pub fn recording_body(path: &Path) -> Result<MultipartBody, UploadError> {
    let data = fs::read(path).map_err(|e| UploadError::Io(format!("{}: {}", path.display(), e)))?;
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("recording.wav");
    Ok(single_file_part(FILE_FIELD, filename, AUDIO_CONTENT_TYPE, &data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_part_layout() {
        let part = single_file_part("file", "take-1.wav", "audio/wav", b"RIFFDATA");
        let text = String::from_utf8(part.body.clone()).unwrap();

        let expected = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"take-1.wav\"\r\n\
             Content-Type: audio/wav\r\n\r\nRIFFDATA\r\n--{b}--\r\n",
            b = part.boundary
        );
        assert_eq!(text, expected);
        assert_eq!(
            part.content_type(),
            format!("multipart/form-data; boundary={}", part.boundary)
        );
    }

    #[test]
    fn boundaries_are_unique() {
        let a = single_file_part("file", "a.wav", "audio/wav", b"");
        let b = single_file_part("file", "a.wav", "audio/wav", b"");
        assert_ne!(a.boundary, b.boundary);
    }

    #[test]
    fn filename_quotes_are_escaped() {
        let part = single_file_part("file", "we\"ird.wav", "audio/wav", b"x");
        let text = String::from_utf8(part.body).unwrap();
        assert!(text.contains("filename=\"we%22ird.wav\""));
    }

    #[test]
    fn recording_body_uses_base_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meeting.wav");
        fs::write(&path, b"abc").unwrap();

        let part = recording_body(&path).unwrap();
        let text = String::from_utf8(part.body).unwrap();
        assert!(text.contains("name=\"file\"; filename=\"meeting.wav\""));
        assert!(text.contains("Content-Type: audio/wav\r\n\r\nabc\r\n"));
    }

    #[test]
    fn missing_recording_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            recording_body(&dir.path().join("gone.wav")),
            Err(UploadError::Io(_))
        ));
    }
}
