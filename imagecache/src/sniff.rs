use crate::ports::ContentTypeSniffer;

/// Content type detection from leading magic bytes
#[derive(Clone, Copy, Debug, Default)]
pub struct MagicSniffer;

impl ContentTypeSniffer for MagicSniffer {
    fn sniff(&self, bytes: &[u8]) -> Option<&'static str> {
        if bytes.starts_with(b"\xFF\xD8\xFF") {
            return Some("image/jpeg");
        }
        if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
            return Some("image/png");
        }
        if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            return Some("image/gif");
        }
        if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            return Some("image/webp");
        }
        if bytes.starts_with(b"II*\x00") || bytes.starts_with(b"MM\x00*") {
            return Some("image/tiff");
        }
        if bytes.starts_with(b"BM") && bytes.len() >= 14 {
            return Some("image/bmp");
        }
        if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
            return match &bytes[8..12] {
                b"avif" | b"avis" => Some("image/avif"),
                b"heic" | b"heix" | b"mif1" | b"msf1" => Some("image/heif"),
                _ => Some("video/mp4"),
            };
        }
        if looks_like_svg(bytes) {
            return Some("image/svg+xml");
        }
        None
    }
}

fn looks_like_svg(bytes: &[u8]) -> bool {
    // SVG can open with an XML prolog or comments, so only the head is inspected
    let head = &bytes[..bytes.len().min(512)];
    let head = String::from_utf8_lossy(head);
    let head = head.trim_start();
    (head.starts_with("<?xml") || head.starts_with("<svg") || head.starts_with("<!--"))
        && head.contains("<svg")
}
