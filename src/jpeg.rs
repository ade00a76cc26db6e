//! JPEG classification.
//!
//! Walks the marker segments after SOI until the first start-of-frame marker
//! and reports which coding process the image uses. Only baseline images are
//! safe to hand to the panel's decoder.

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum JpegKind {
    /// Not a JPEG, truncated, or no frame header found.
    Invalid,
    /// SOF0, baseline DCT.
    Baseline,
    /// SOF2, progressive DCT.
    Progressive,
    /// Any other SOFn (extended, lossless, arithmetic, hierarchical).
    Other,
}

const SOI: u8 = 0xD8;
const EOI: u8 = 0xD9;

pub fn classify(data: &[u8]) -> JpegKind {
    if data.len() < 4 || data[0] != 0xFF || data[1] != SOI {
        return JpegKind::Invalid;
    }

    let mut pos = 2;
    while pos + 3 < data.len() {
        if data[pos] != 0xFF {
            pos += 1;
            continue;
        }
        // fill bytes
        while pos < data.len() && data[pos] == 0xFF {
            pos += 1;
        }
        let Some(&marker) = data.get(pos) else {
            return JpegKind::Invalid;
        };
        pos += 1;

        // standalone markers carry no length
        if marker == SOI || marker == EOI || (0xD0..=0xD7).contains(&marker) {
            continue;
        }

        if pos + 1 >= data.len() {
            return JpegKind::Invalid;
        }
        let seg_len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
        if seg_len < 2 || pos + seg_len > data.len() {
            return JpegKind::Invalid;
        }

        match marker {
            0xC0 => return JpegKind::Baseline,
            0xC2 => return JpegKind::Progressive,
            // DHT (C4), JPG (C8) and DAC (CC) share the range but are not frames
            0xC1..=0xCF if !matches!(marker, 0xC4 | 0xC8 | 0xCC) => return JpegKind::Other,
            _ => {}
        }

        pos += seg_len;
    }

    JpegKind::Invalid
}
