#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ContainerFormat {
    Mp4,
    Matroska, // MKV/WebM
    TransportStream,
    Jpeg,
    Png,
    Gif,
    Webp,
    Bmp,
    Unknown,
}

impl ContainerFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            ContainerFormat::Mp4 => "video/mp4",
            ContainerFormat::Matroska => "video/webm",
            ContainerFormat::TransportStream => "video/mp2t",
            ContainerFormat::Jpeg => "image/jpeg",
            ContainerFormat::Png => "image/png",
            ContainerFormat::Gif => "image/gif",
            ContainerFormat::Webp => "image/webp",
            ContainerFormat::Bmp => "image/bmp",
            ContainerFormat::Unknown => "application/octet-stream",
        }
    }
}

/// Detect container format from the first bytes of a payload.
pub fn detect_container(header: &[u8]) -> ContainerFormat {
    // MP4/MOV: bytes 4..8 == "ftyp"
    if header.len() >= 8 && &header[4..8] == b"ftyp" {
        return ContainerFormat::Mp4;
    }

    // MKV/WebM: EBML magic bytes at offset 0
    if header.len() >= 4 && header[0..4] == [0x1A, 0x45, 0xDF, 0xA3] {
        return ContainerFormat::Matroska;
    }

    // MPEG-TS: sync byte 0x47 at offset 0 and offset 188
    if header.len() > 188 && header[0] == 0x47 && header[188] == 0x47 {
        return ContainerFormat::TransportStream;
    }

    if header.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return ContainerFormat::Jpeg;
    }

    if header.starts_with(b"\x89PNG\r\n\x1a\n") {
        return ContainerFormat::Png;
    }

    if header.starts_with(b"GIF87a") || header.starts_with(b"GIF89a") {
        return ContainerFormat::Gif;
    }

    // RIFF....WEBP
    if header.len() >= 12 && &header[0..4] == b"RIFF" && &header[8..12] == b"WEBP" {
        return ContainerFormat::Webp;
    }

    if header.starts_with(b"BM") && header.len() >= 14 {
        return ContainerFormat::Bmp;
    }

    ContainerFormat::Unknown
}

/// Content type to advertise for a payload: the upstream's answer when it is
/// specific, otherwise whatever the magic bytes say.
pub fn sniff_content_type(reported: Option<&str>, data: &[u8]) -> String {
    match reported {
        Some(ct) if !ct.is_empty() && !ct.starts_with("application/octet-stream") => {
            ct.to_string()
        }
        _ => detect_container(data).content_type().to_string(),
    }
}
