//! Blob - immutable byte payload with optional image metadata
//!
//! Blobs travel from loaders through the processor chain to the HTTP
//! response. Cloning is cheap (refcounted `Bytes`), so storage sinks and
//! coalesced waiters share one allocation.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Image metadata attached to a processed blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub format: String,
    pub content_type: String,
    pub width: u32,
    pub height: u32,
    pub orientation: u32,
}

/// Immutable byte container passed between loaders, processors and storages
#[derive(Debug, Clone, Default)]
pub struct Blob {
    bytes: Bytes,
    meta: Option<Meta>,
}

impl Blob {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            meta: None,
        }
    }

    pub fn with_meta(bytes: impl Into<Bytes>, meta: Meta) -> Self {
        Self {
            bytes: bytes.into(),
            meta: Some(meta),
        }
    }

    /// Empty blob, used as the "nothing loaded" marker
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn meta(&self) -> Option<&Meta> {
        self.meta.as_ref()
    }

    /// True for formats whose bytes may contain multiple frames (GIF, WebP)
    pub fn supports_animation(&self) -> bool {
        let b = &self.bytes;
        if b.len() >= 6 && (&b[..6] == b"GIF87a" || &b[..6] == b"GIF89a") {
            return true;
        }
        b.len() >= 12 && &b[..4] == b"RIFF" && &b[8..12] == b"WEBP"
    }

    /// Content type from a magic-number sniff of the payload
    pub fn sniff_content_type(&self) -> &'static str {
        sniff(&self.bytes)
    }
}

/// Detect a content type from leading magic bytes
pub fn sniff(b: &[u8]) -> &'static str {
    if b.len() >= 3 && b[..3] == [0xff, 0xd8, 0xff] {
        return "image/jpeg";
    }
    if b.len() >= 8 && b[..8] == [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a] {
        return "image/png";
    }
    if b.len() >= 6 && (&b[..6] == b"GIF87a" || &b[..6] == b"GIF89a") {
        return "image/gif";
    }
    if b.len() >= 12 && &b[..4] == b"RIFF" && &b[8..12] == b"WEBP" {
        return "image/webp";
    }
    if b.len() >= 2 && &b[..2] == b"BM" {
        return "image/bmp";
    }
    if b.len() >= 4 && (b[..4] == [0x49, 0x49, 0x2a, 0x00] || b[..4] == [0x4d, 0x4d, 0x00, 0x2a]) {
        return "image/tiff";
    }
    if b.len() >= 12 && &b[4..8] == b"ftyp" && (&b[8..12] == b"avif" || &b[8..12] == b"avis") {
        return "image/avif";
    }
    if b.len() >= 5 && &b[..5] == b"%PDF-" {
        return "application/pdf";
    }
    let head = &b[..b.len().min(256)];
    if head.starts_with(b"<svg") || (head.starts_with(b"<?xml") && contains(head, b"<svg")) {
        return "image/svg+xml";
    }
    "application/octet-stream"
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
