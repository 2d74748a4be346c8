/// Request bodies and Server-Sent Events framing shared by the HTTP client and
/// the sandbox backend
use crate::error::FetchError;
use crate::types::{ClientToken, ImageFile};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

pub const PARTICIPANT_HEADER: &str = "x-participant-id";

/// Base64-encoded image inside a send request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUpload {
    pub file_name: String,
    pub mime_type: String,
    pub data: String,
}

impl ImageUpload {
    pub fn encode(image: &ImageFile) -> Self {
        Self {
            file_name: image.file_name.clone(),
            mime_type: image.mime_type.clone(),
            data: general_purpose::STANDARD.encode(&image.data),
        }
    }

    pub fn decode(&self) -> Result<ImageFile, FetchError> {
        let data = general_purpose::STANDARD
            .decode(&self.data)
            .map_err(|e| FetchError::Decode(format!("invalid base64 image: {}", e)))?;
        Ok(ImageFile::new(self.file_name.clone(), self.mime_type.clone(), data))
    }
}

/// Body of `POST /api/conversations/{id}/messages`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageUpload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<ClientToken>,
}

/// Error body returned by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Formats one payload as an SSE `data:` event.
pub fn sse_frame(payload: &str) -> String {
    let mut out = String::with_capacity(payload.len() + 8);
    for line in payload.lines() {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

/// Incremental SSE parser. Feed it body chunks; it yields the `data` of each
/// complete event. Comment lines and other fields are ignored.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        // Bytes before this point hold no delimiter.
        let mut from = self.buf.len().saturating_sub(1);
        self.buf.extend(chunk.iter().copied().filter(|&b| b != b'\r'));
        let mut payloads = Vec::new();
        while let Some(rel) = self.buf[from..].windows(2).position(|w| w == b"\n\n") {
            let end = from + rel;
            from = 0;
            let block: Vec<u8> = self.buf.drain(..end + 2).collect();
            let block = String::from_utf8_lossy(&block);
            let data: Vec<&str> = block
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
                .collect();
            if !data.is_empty() {
                payloads.push(data.join("\n"));
            }
        }
        payloads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_events_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b": connected\n\n").is_empty());
        assert!(decoder.push(b"data: {\"a\":").is_empty());
        assert_eq!(decoder.push(b"1}\n\ndata: x\r\n\r\n"), vec!["{\"a\":1}", "x"]);
    }

    #[test]
    fn test_sse_delimiter_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: a\n").is_empty());
        assert_eq!(decoder.push(b"\ndata: b\n"), vec!["a"]);
        assert!(decoder.push(b"data: c").is_empty());
        assert_eq!(decoder.push(b"\n\n"), vec!["b\nc"]);
    }

    #[test]
    fn test_sse_long_frame_in_small_chunks() {
        let mut decoder = SseDecoder::new();
        let body = "x".repeat(4096);
        let frame = format!("data: {}\n\n", body);
        let mut out = Vec::new();
        for chunk in frame.as_bytes().chunks(7) {
            out.extend(decoder.push(chunk));
        }
        assert_eq!(out, vec![body]);
    }

    #[test]
    fn test_multiline_data_is_joined() {
        let mut decoder = SseDecoder::new();
        let frame = sse_frame("line one\nline two");
        assert_eq!(decoder.push(frame.as_bytes()), vec!["line one\nline two"]);
    }

    #[test]
    fn test_image_upload_base64() {
        let image = ImageFile::new("a.png", "image/png", vec![0u8, 255, 10]);
        let upload = ImageUpload::encode(&image);
        assert_eq!(upload.data, "AP8K");
        assert_eq!(upload.decode().unwrap(), image);

        let bad = ImageUpload {
            data: "%%%".into(),
            ..upload
        };
        assert!(matches!(bad.decode(), Err(FetchError::Decode(_))));
    }
}
