//! Magic-byte sniffing for the audio containers the backends produce.

use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

/// Bytes read from the start of the file.
const HEAD_LEN: usize = 12;

/// Size of an ID3v1 trailer.
const ID3V1_LEN: u64 = 128;
const ID3V1_OFFSET: i64 = -128;

/// Recognized container families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Mp3,
    Flac,
    Ogg,
    Wav,
    Mp4,
}

/// Classifies a file head.
///
/// Accepts ID3v2, a raw MPEG audio frame sync, `fLaC`, `OggS`,
/// `RIFF....WAVE` and ISO-BMFF `....ftyp`.
#[must_use]
pub fn sniff(head: &[u8]) -> Option<AudioFormat> {
    if head.starts_with(b"ID3") || is_mpeg_frame_sync(head) {
        Some(AudioFormat::Mp3)
    } else if head.starts_with(b"fLaC") {
        Some(AudioFormat::Flac)
    } else if head.starts_with(b"OggS") {
        Some(AudioFormat::Ogg)
    } else if head.len() >= 12 && &head[..4] == b"RIFF" && &head[8..12] == b"WAVE" {
        Some(AudioFormat::Wav)
    } else if head.len() >= 8 && &head[4..8] == b"ftyp" {
        Some(AudioFormat::Mp4)
    } else {
        None
    }
}

/// 11 set sync bits, a valid version and a non-reserved layer.
fn is_mpeg_frame_sync(head: &[u8]) -> bool {
    match head {
        [first, second, ..] => {
            let version = (second >> 3) & 0b11;
            let layer = (second >> 1) & 0b11;
            *first == 0xFF && second & 0xE0 == 0xE0 && version != 0b01 && layer != 0b00
        }
        _ => false,
    }
}

/// Reads the head (and, for MP3 without a recognizable head, the ID3v1
/// trailer) of `path` and reports the container.
///
/// # Errors
///
/// Any IO error opening or reading the file.
pub async fn detect(path: &Path) -> std::io::Result<Option<AudioFormat>> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut head = [0u8; HEAD_LEN];
    let mut filled = 0;
    while filled < HEAD_LEN {
        let n = file.read(&mut head[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if let Some(format) = sniff(&head[..filled]) {
        return Ok(Some(format));
    }

    let len = file.metadata().await?.len();
    if len >= ID3V1_LEN {
        file.seek(SeekFrom::End(ID3V1_OFFSET)).await?;
        let mut tag = [0u8; 3];
        file.read_exact(&mut tag).await?;
        if &tag == b"TAG" {
            return Ok(Some(AudioFormat::Mp3));
        }
    }
    Ok(None)
}
