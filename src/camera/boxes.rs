//! Length-prefixed box framing.
//!
//! Transcoder output and recording packets share one framing, and it must
//! be reproduced byte-for-byte for interop with both the subprocess and
//! the consuming host:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |              total length (big-endian, incl. header)          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |              type tag (4 ASCII bytes, e.g. "moof")            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |              payload (length - 8 bytes)                       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Tags are treated as opaque pairing/ordering markers; the pipeline never
//! inspects box payloads.

use std::io::Read;
use std::time::Instant;

use crate::error::{BridgeError, FramingErrorKind, Result};

/// Size of the fixed box header.
pub const BOX_HEADER_LEN: usize = 8;

/// Sanity cap on a declared box length. A fragmented stream never carries
/// boxes near this size; anything above it means the reader lost framing.
pub const MAX_BOX_LEN: u32 = 32 * 1024 * 1024;

/// Container-level box tags the pipeline reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxKind {
    /// File type (`ftyp`) — part of the one-shot init segment.
    Ftyp,
    /// Movie metadata (`moov`) — part of the one-shot init segment.
    Moov,
    /// Movie fragment header (`moof`) — pairs with the following `mdat`.
    Moof,
    /// Media data (`mdat`) — completes the preceding `moof`.
    Mdat,
    /// Any other tag; carried through but never paired.
    Other([u8; 4]),
}

impl BoxKind {
    pub fn from_tag(tag: [u8; 4]) -> Self {
        match &tag {
            b"ftyp" => Self::Ftyp,
            b"moov" => Self::Moov,
            b"moof" => Self::Moof,
            b"mdat" => Self::Mdat,
            _ => Self::Other(tag),
        }
    }

    pub fn tag(&self) -> [u8; 4] {
        match self {
            Self::Ftyp => *b"ftyp",
            Self::Moov => *b"moov",
            Self::Moof => *b"moof",
            Self::Mdat => *b"mdat",
            Self::Other(tag) => *tag,
        }
    }

    /// Whether this box belongs to the init segment (`ftyp`/`moov`).
    pub fn is_init(&self) -> bool {
        matches!(self, Self::Ftyp | Self::Moov)
    }
}

impl std::fmt::Display for BoxKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = self.tag();
        f.write_str(&String::from_utf8_lossy(&tag))
    }
}

/// One parsed box: the raw framed bytes (header included) plus the capture
/// time used for windowed eviction.
#[derive(Debug, Clone)]
pub struct MediaBox {
    pub kind: BoxKind,
    /// Complete wire bytes: 8-byte header followed by payload.
    pub data: Vec<u8>,
    pub captured_at: Instant,
}

impl MediaBox {
    /// Wrap already-framed bytes captured now.
    pub fn new(kind: BoxKind, data: Vec<u8>) -> Self {
        Self {
            kind,
            data,
            captured_at: Instant::now(),
        }
    }

    /// Wrap already-framed bytes with an explicit capture time.
    pub fn with_timestamp(kind: BoxKind, data: Vec<u8>, captured_at: Instant) -> Self {
        Self {
            kind,
            data,
            captured_at,
        }
    }

    /// Frame a payload under a tag (header written byte-for-byte).
    pub fn build(tag: &[u8; 4], payload: &[u8]) -> Self {
        let total = BOX_HEADER_LEN + payload.len();
        let mut data = Vec::with_capacity(total);
        data.extend_from_slice(&(total as u32).to_be_bytes());
        data.extend_from_slice(tag);
        data.extend_from_slice(payload);
        Self::new(BoxKind::from_tag(*tag), data)
    }

    /// Total framed length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Streaming box decoder over any byte source (subprocess stdout pipe).
///
/// `read_box` returns `Ok(None)` on clean end-of-stream. A stream that
/// ends mid-box or declares an impossible length yields a
/// [`BridgeError::Framing`]; that condition is terminal for the source.
pub struct BoxReader<R: Read> {
    inner: R,
}

impl<R: Read> BoxReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next box, or `None` at a clean stream boundary.
    pub fn read_box(&mut self) -> Result<Option<MediaBox>> {
        let mut header = [0u8; BOX_HEADER_LEN];
        let mut filled = 0usize;

        while filled < BOX_HEADER_LEN {
            match self.inner.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(BridgeError::Framing {
                        kind: FramingErrorKind::TruncatedHeader,
                    });
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let total = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        if (total as usize) < BOX_HEADER_LEN {
            return Err(BridgeError::Framing {
                kind: FramingErrorKind::LengthTooSmall,
            });
        }
        if total > MAX_BOX_LEN {
            return Err(BridgeError::Framing {
                kind: FramingErrorKind::LengthTooLarge,
            });
        }

        let tag = [header[4], header[5], header[6], header[7]];
        let kind = BoxKind::from_tag(tag);

        let mut data = Vec::with_capacity(total as usize);
        data.extend_from_slice(&header);
        data.resize(total as usize, 0);
        if let Err(e) = self.inner.read_exact(&mut data[BOX_HEADER_LEN..]) {
            return if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Err(BridgeError::Framing {
                    kind: FramingErrorKind::TruncatedPayload,
                })
            } else {
                Err(e.into())
            };
        }

        tracing::trace!(kind = %kind, bytes = total, "box read");
        Ok(Some(MediaBox::new(kind, data)))
    }
}
