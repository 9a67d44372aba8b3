use crate::{
    CFLAG_32BIT, Cpu, IMAGE_HEADER_SIZE, IMAGE_VERSION, ImageError, ImageHeader,
    LOAD_PREFIX_SIZE, RECORD_HEADER_SIZE, RecordType, SegmentDecl, read_u16_le, read_u32_le,
};

/// Parsed image view over an in-memory blob.
///
/// Parsing validates the header record and the segment table only; the
/// record stream is decoded lazily by [`Image::records`].
pub struct Image<'a> {
    blob: &'a [u8],
    header: ImageHeader,
    segment_table: &'a [u8],
    records_off: usize,
}

/// One decoded record of the stream.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Record<'a> {
    /// Copy `data` into `segment` starting at `offset`.
    Load {
        segment: u16,
        offset: u32,
        data: &'a [u8],
    },
    /// End of the read/write portion of the image.
    RwEnd,
    /// Relocation records; the payload is not interpreted.
    Fixup { kind: RecordType },
    /// Anything the loader does not act on, skipped by its length.
    Skipped { rec_type: u8, len: usize },
}

/// Iterator over the record stream; yields a `Result` per record and stops
/// after the end-of-image record.
pub struct Records<'a> {
    blob: &'a [u8],
    off: usize,
    done: bool,
}

struct RecordHeader {
    rec_type: u8,
    reserved: u8,
    data_nbytes: u16,
    spare: u16,
}

fn record_header(blob: &[u8], off: usize) -> Result<RecordHeader, ImageError> {
    let end = off
        .checked_add(RECORD_HEADER_SIZE)
        .ok_or(ImageError::Truncated { offset: off })?;
    let s = blob.get(off..end).ok_or(ImageError::Truncated { offset: off })?;
    Ok(RecordHeader {
        rec_type: s[0],
        reserved: s[1],
        data_nbytes: u16::from_le_bytes([s[2], s[3]]),
        spare: u16::from_le_bytes([s[4], s[5]]),
    })
}

impl<'a> Image<'a> {
    /// Parse and validate an image blob.
    pub fn parse(blob: &'a [u8]) -> Result<Self, ImageError> {
        use ImageError::{
            BadCpu, BadVersion, MalformedHeader, MisalignedSegmentTable,
            NotAHeader, Not32Bit, Truncated,
        };

        let rec = record_header(blob, 0)?;
        if rec.rec_type != RecordType::Header.into_bits() {
            return Err(NotAHeader(rec.rec_type));
        }
        let payload_len = usize::from(rec.data_nbytes);
        if rec.reserved != 0 || rec.spare != 0 || payload_len < IMAGE_HEADER_SIZE {
            return Err(MalformedHeader);
        }

        let payload_end = RECORD_HEADER_SIZE + payload_len;
        let payload = blob
            .get(RECORD_HEADER_SIZE..payload_end)
            .ok_or(Truncated { offset: blob.len() })?;

        let header = ImageHeader {
            version: read_u16_le(payload, 0)?,
            cflags: read_u16_le(payload, 2)?,
            cpu: read_u16_le(payload, 4)?,
            fpu: read_u16_le(payload, 6)?,
            code_index: read_u16_le(payload, 8)?,
            stack_index: read_u16_le(payload, 10)?,
            heap_index: read_u16_le(payload, 12)?,
            argv_index: read_u16_le(payload, 14)?,
            code_offset: read_u32_le(payload, 24)?,
            stack_nbytes: read_u32_le(payload, 28)?,
            heap_nbytes: read_u32_le(payload, 32)?,
            image_base: read_u32_le(payload, 36)?,
        };

        if header.version != IMAGE_VERSION {
            return Err(BadVersion(header.version));
        }
        if header.cflags & CFLAG_32BIT == 0 {
            return Err(Not32Bit(header.cflags));
        }
        if Cpu::from_bits(header.cpu).is_none() {
            return Err(BadCpu(header.cpu));
        }

        let segment_table = &payload[IMAGE_HEADER_SIZE..];
        if segment_table.len() % 4 != 0 {
            return Err(MisalignedSegmentTable(segment_table.len()));
        }

        let image = Image {
            blob,
            header,
            segment_table,
            records_off: payload_end,
        };

        // Reject bad type tags up front rather than halfway through a load.
        for decl in image.segments() {
            decl?;
        }

        Ok(image)
    }

    #[inline]
    #[must_use]
    pub const fn header(&self) -> &ImageHeader {
        &self.header
    }

    /// Number of declared segments.
    #[inline]
    #[must_use]
    pub const fn segment_count(&self) -> usize {
        self.segment_table.len() / 4
    }

    /// Declared segments in table order.
    pub fn segments(&self) -> impl Iterator<Item = Result<SegmentDecl, ImageError>> + '_ {
        self.segment_table
            .chunks_exact(4)
            .enumerate()
            .map(|(index, w)| SegmentDecl::decode(index, u32::from_le_bytes([w[0], w[1], w[2], w[3]])))
    }

    /// Iterate the record stream following the header record.
    #[must_use]
    pub const fn records(&self) -> Records<'a> {
        Records {
            blob: self.blob,
            off: self.records_off,
            done: false,
        }
    }
}

impl<'a> Records<'a> {
    fn decode(&mut self) -> Result<Option<Record<'a>>, ImageError> {
        let start = self.off;
        let rec = record_header(self.blob, start)?;
        let body = start + RECORD_HEADER_SIZE;
        let end = body + usize::from(rec.data_nbytes);
        let data = self
            .blob
            .get(body..end)
            .ok_or(ImageError::Truncated { offset: start })?;
        self.off = end;

        let record = match RecordType::from_bits(rec.rec_type) {
            Some(RecordType::ImageEnd) => {
                self.done = true;
                return Ok(None);
            }
            Some(RecordType::Load) => {
                if data.len() < LOAD_PREFIX_SIZE {
                    return Err(ImageError::ShortLoadRecord { offset: start });
                }
                Record::Load {
                    segment: read_u16_le(data, 0)?,
                    offset: read_u32_le(data, 2)?,
                    data: &data[LOAD_PREFIX_SIZE..],
                }
            }
            Some(RecordType::RwEnd) => Record::RwEnd,
            Some(kind @ (RecordType::Fixup | RecordType::LinearFixup)) => Record::Fixup { kind },
            _ => Record::Skipped {
                rec_type: rec.rec_type,
                len: data.len(),
            },
        };
        Ok(Some(record))
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<Record<'a>, ImageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.decode() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
