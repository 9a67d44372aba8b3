use crate::{
    CFLAG_FLAT, IMAGE_HEADER_SIZE, ImageHeader, LOAD_PREFIX_SIZE, MAX_RECORD_PAYLOAD, RecordType,
    SegmentDecl, SegmentKind,
};

/// Assembles an image from segment declarations and load records.
///
/// Used by the packing tool and by tests that need synthetic images.
#[derive(Default)]
pub struct ImageWriter {
    header: ImageHeader,
    segments: Vec<SegmentDecl>,
    records: Vec<u8>,
}

impl ImageWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct access to the header, e.g. to produce invalid images.
    pub const fn header_mut(&mut self) -> &mut ImageHeader {
        &mut self.header
    }

    /// Declare a segment and return its index.
    ///
    /// # Panics
    /// Panics if more than `u16::MAX` segments are declared.
    pub fn segment(&mut self, kind: SegmentKind, size: u32) -> u16 {
        let index = u16::try_from(self.segments.len()).expect("too many segments");
        self.segments.push(SegmentDecl { size, kind });
        index
    }

    pub const fn code(&mut self, segment: u16, offset: u32) -> &mut Self {
        self.header.code_index = segment;
        self.header.code_offset = offset;
        self
    }

    pub const fn stack(&mut self, segment: u16, nbytes: u32) -> &mut Self {
        self.header.stack_index = segment;
        self.header.stack_nbytes = nbytes;
        self
    }

    pub const fn heap(&mut self, segment: u16, nbytes: u32) -> &mut Self {
        self.header.heap_index = segment;
        self.header.heap_nbytes = nbytes;
        self
    }

    pub const fn argv(&mut self, segment: u16) -> &mut Self {
        self.header.argv_index = segment;
        self
    }

    /// Link for the flat model at `image_base`.
    pub const fn flat(&mut self, image_base: u32) -> &mut Self {
        self.header.cflags |= CFLAG_FLAT;
        self.header.image_base = image_base;
        self
    }

    /// Append load records for `data`, split to fit the record size limit.
    pub fn load(&mut self, segment: u16, offset: u32, data: &[u8]) -> &mut Self {
        let chunk = MAX_RECORD_PAYLOAD - LOAD_PREFIX_SIZE;
        let mut at = offset;
        for piece in data.chunks(chunk) {
            let mut payload = Vec::with_capacity(LOAD_PREFIX_SIZE + piece.len());
            payload.extend_from_slice(&segment.to_le_bytes());
            payload.extend_from_slice(&at.to_le_bytes());
            payload.extend_from_slice(piece);
            self.raw_record(RecordType::Load.into_bits(), &payload);
            at = at.wrapping_add(u32::try_from(piece.len()).unwrap_or(u32::MAX));
        }
        self
    }

    pub fn comment(&mut self, text: &[u8]) -> &mut Self {
        self.raw_record(RecordType::Comment.into_bits(), text)
    }

    pub fn rw_end(&mut self) -> &mut Self {
        self.raw_record(RecordType::RwEnd.into_bits(), &[])
    }

    /// Append an arbitrary record.
    ///
    /// # Panics
    /// Panics if `payload` exceeds [`MAX_RECORD_PAYLOAD`].
    pub fn raw_record(&mut self, rec_type: u8, payload: &[u8]) -> &mut Self {
        let len = u16::try_from(payload.len()).expect("record payload too large");
        push_record_header(&mut self.records, rec_type, len);
        self.records.extend_from_slice(payload);
        self
    }

    /// Serialize header, segment table and records, then the end record.
    ///
    /// # Panics
    /// Panics if the segment table does not fit into a single header record.
    #[must_use]
    pub fn finish(&self) -> Vec<u8> {
        let h = &self.header;
        let header_len = IMAGE_HEADER_SIZE + self.segments.len() * 4;
        let header_len = u16::try_from(header_len).expect("segment table too large");

        let mut out = Vec::with_capacity(usize::from(header_len) + self.records.len() + 12);
        push_record_header(&mut out, RecordType::Header.into_bits(), header_len);
        for half in [
            h.version,
            h.cflags,
            h.cpu,
            h.fpu,
            h.code_index,
            h.stack_index,
            h.heap_index,
            h.argv_index,
        ] {
            out.extend_from_slice(&half.to_le_bytes());
        }
        out.extend_from_slice(&[0; 8]); // spare
        for word in [h.code_offset, h.stack_nbytes, h.heap_nbytes, h.image_base] {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out.extend_from_slice(&[0; 8]); // spare
        for decl in &self.segments {
            out.extend_from_slice(&decl.encode().to_le_bytes());
        }

        out.extend_from_slice(&self.records);
        push_record_header(&mut out, RecordType::ImageEnd.into_bits(), 0);
        out
    }
}

fn push_record_header(out: &mut Vec<u8>, rec_type: u8, len: u16) {
    out.push(rec_type);
    out.push(0);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&[0, 0]);
}
