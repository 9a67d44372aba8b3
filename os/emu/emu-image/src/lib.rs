//! # Segmented executable container format
//!
//! The image is a stream of records. Every record starts with a packed,
//! little-endian 6-byte header:
//!
//! ```text
//!  0        1          2              4              6
//! +--------+----------+--------------+--------------+----------------+
//! |  type  | reserved | data_nbytes  |    spare     | payload ...    |
//! +--------+----------+--------------+--------------+----------------+
//! ```
//!
//! The first record is always a [`RecordType::Header`] whose payload is the
//! 48-byte [`ImageHeader`] followed by one 32-bit word per declared segment
//! (see [`SegmentDecl`]). The remaining records load bytes into segments and
//! the stream ends with a [`RecordType::ImageEnd`] record.
//!
//! | Type | Name            | Handling                       |
//! |------|-----------------|--------------------------------|
//! | 0    | header          | first record only              |
//! | 1    | comment         | skipped                        |
//! | 2    | load            | `segment u16, offset u32, ...` |
//! | 3    | fixup           | unsupported                    |
//! | 4    | 8087 fixup      | skipped                        |
//! | 5    | image end       | terminates the stream          |
//! | 6    | resource        | skipped                        |
//! | 7    | rw end          | marks end of read/write data   |
//! | 8    | linear fixup    | unsupported                    |

#![cfg_attr(not(any(test, feature = "writer")), no_std)]

#[cfg(feature = "reader")]
mod reader;
#[cfg(any(test, feature = "writer"))]
mod writer;

#[cfg(feature = "reader")]
pub use reader::{Image, Record, Records};
#[cfg(any(test, feature = "writer"))]
pub use writer::ImageWriter;

/// Size of the per-record header in bytes.
pub const RECORD_HEADER_SIZE: usize = 6;

/// Size of the fixed image header (without the segment table) in bytes.
pub const IMAGE_HEADER_SIZE: usize = 48;

/// Size of the segment/offset prefix of a load record.
pub const LOAD_PREFIX_SIZE: usize = 6;

/// The only image version this crate understands.
pub const IMAGE_VERSION: u16 = 400;

/// Image contains 32-bit code.
pub const CFLAG_32BIT: u16 = 0x0002;

/// Image was linked for the flat memory model.
pub const CFLAG_FLAT: u16 = 0x0010;

/// Largest payload a single record can carry.
pub const MAX_RECORD_PAYLOAD: usize = u16::MAX as usize;

/// Bits of a segment table word that hold the segment size.
pub const SEGMENT_SIZE_MASK: u32 = 0x0FFF_FFFF;

/// Record discriminator.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum RecordType {
    Header = 0,
    Comment = 1,
    Load = 2,
    Fixup = 3,
    Fixup8087 = 4,
    ImageEnd = 5,
    Resource = 6,
    RwEnd = 7,
    LinearFixup = 8,
}

impl RecordType {
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits {
            0 => Self::Header,
            1 => Self::Comment,
            2 => Self::Load,
            3 => Self::Fixup,
            4 => Self::Fixup8087,
            5 => Self::ImageEnd,
            6 => Self::Resource,
            7 => Self::RwEnd,
            8 => Self::LinearFixup,
            _ => return None,
        })
    }

    #[inline]
    #[must_use]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }
}

/// CPU an image was built for.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Cpu {
    I386,
    I486,
}

impl Cpu {
    #[must_use]
    pub const fn from_bits(bits: u16) -> Option<Self> {
        match bits {
            386 => Some(Self::I386),
            486 => Some(Self::I486),
            _ => None,
        }
    }

    #[must_use]
    pub const fn into_bits(self) -> u16 {
        match self {
            Self::I386 => 386,
            Self::I486 => 486,
        }
    }
}

/// Type tag in the high nibble of a segment table word.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum SegmentKind {
    ReadWrite = 0,
    ReadOnly = 1,
    ExecRead = 2,
    ExecOnly = 3,
}

impl SegmentKind {
    #[must_use]
    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::ReadWrite),
            1 => Some(Self::ReadOnly),
            2 => Some(Self::ExecRead),
            3 => Some(Self::ExecOnly),
            _ => None,
        }
    }

    #[must_use]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    /// Whether the segment holds code.
    #[must_use]
    pub const fn is_code(self) -> bool {
        matches!(self, Self::ExecRead | Self::ExecOnly)
    }
}

/// One declared segment: byte size plus type.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SegmentDecl {
    pub size: u32,
    pub kind: SegmentKind,
}

impl SegmentDecl {
    /// Decode a segment table word (`size | kind << 28`).
    pub fn decode(index: usize, word: u32) -> Result<Self, ImageError> {
        #[allow(clippy::cast_possible_truncation)]
        let tag = (word >> 28) as u8;
        let kind = SegmentKind::from_bits(tag).ok_or(ImageError::BadSegmentType { index, tag })?;
        Ok(Self {
            size: word & SEGMENT_SIZE_MASK,
            kind,
        })
    }

    #[must_use]
    pub const fn encode(self) -> u32 {
        (self.size & SEGMENT_SIZE_MASK) | ((self.kind.into_bits() as u32) << 28)
    }
}

/// Fixed header following the first record header.
///
/// All fields are little-endian on disk; offsets in the comments are relative
/// to the start of the header payload.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ImageHeader {
    /// Format version (`0`), must be [`IMAGE_VERSION`].
    pub version: u16,
    /// Code flags (`2`), see [`CFLAG_32BIT`] and [`CFLAG_FLAT`].
    pub cflags: u16,
    /// CPU tag (`4`).
    pub cpu: u16,
    /// FPU tag (`6`), informational.
    pub fpu: u16,
    /// Segment index of the entry point (`8`).
    pub code_index: u16,
    /// Segment index of the stack (`10`).
    pub stack_index: u16,
    /// Segment index of the heap / default data segment (`12`).
    pub heap_index: u16,
    /// Segment index holding the argument area (`14`).
    pub argv_index: u16,
    /// Entry point offset within the code segment (`24`).
    pub code_offset: u32,
    /// Stack size in bytes (`28`).
    pub stack_nbytes: u32,
    /// Initial heap size in bytes (`32`).
    pub heap_nbytes: u32,
    /// Linear base the image was linked at (`36`).
    pub image_base: u32,
}

impl ImageHeader {
    /// Whether the image was linked for the flat memory model: all segments
    /// share one linear address space starting at [`image_base`](Self::image_base).
    #[inline]
    #[must_use]
    pub const fn is_flat(&self) -> bool {
        self.cflags & CFLAG_FLAT != 0
    }
}

impl Default for ImageHeader {
    fn default() -> Self {
        Self {
            version: IMAGE_VERSION,
            cflags: CFLAG_32BIT,
            cpu: Cpu::I386.into_bits(),
            fpu: 0,
            code_index: 0,
            stack_index: 0,
            heap_index: 0,
            argv_index: 0,
            code_offset: 0,
            stack_nbytes: 0,
            heap_nbytes: 0,
            image_base: 0,
        }
    }
}

/// Errors raised while decoding an image.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ImageError {
    #[error("image truncated at offset {offset:#x}")]
    Truncated { offset: usize },
    #[error("first record has type {0}, expected a header record")]
    NotAHeader(u8),
    #[error("malformed header record")]
    MalformedHeader,
    #[error("unsupported image version {0}")]
    BadVersion(u16),
    #[error("not a 32-bit image (cflags {0:#06x})")]
    Not32Bit(u16),
    #[error("unsupported cpu {0}")]
    BadCpu(u16),
    #[error("segment table of {0} bytes is not a whole number of entries")]
    MisalignedSegmentTable(usize),
    #[error("segment {index} has invalid type tag {tag}")]
    BadSegmentType { index: usize, tag: u8 },
    #[error("load record at offset {offset:#x} is too short")]
    ShortLoadRecord { offset: usize },
}

#[inline]
pub(crate) fn read_u16_le(buf: &[u8], off: usize) -> Result<u16, ImageError> {
    let end = off.checked_add(2).ok_or(ImageError::Truncated { offset: off })?;
    let s = buf.get(off..end).ok_or(ImageError::Truncated { offset: off })?;
    Ok(u16::from_le_bytes([s[0], s[1]]))
}

#[inline]
pub(crate) fn read_u32_le(buf: &[u8], off: usize) -> Result<u32, ImageError> {
    let end = off.checked_add(4).ok_or(ImageError::Truncated { offset: off })?;
    let s = buf.get(off..end).ok_or(ImageError::Truncated { offset: off })?;
    Ok(u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_word_roundtrip() {
        let decl = SegmentDecl {
            size: 0x0123_4567,
            kind: SegmentKind::ExecOnly,
        };
        assert_eq!(decl.encode(), 0x3123_4567);
        assert_eq!(SegmentDecl::decode(0, decl.encode()), Ok(decl));
    }

    #[test]
    fn segment_word_rejects_unknown_tag() {
        assert_eq!(
            SegmentDecl::decode(4, 0x8000_0010),
            Err(ImageError::BadSegmentType { index: 4, tag: 8 })
        );
    }

    #[test]
    fn record_types_decode() {
        for bits in 0..=8u8 {
            let ty = RecordType::from_bits(bits).unwrap();
            assert_eq!(ty.into_bits(), bits);
        }
        assert_eq!(RecordType::from_bits(9), None);
    }

    #[test]
    fn short_reads_report_offset() {
        let buf = [1u8, 2, 3];
        assert_eq!(read_u16_le(&buf, 1), Ok(0x0302));
        assert_eq!(read_u32_le(&buf, 0), Err(ImageError::Truncated { offset: 0 }));
    }
}
