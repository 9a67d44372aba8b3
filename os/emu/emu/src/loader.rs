//! # Image loader
//!
//! Turns a container image into live guest segments:
//!
//! 1. parse and validate the header record ([`emu_image::Image::parse`]),
//! 2. allocate one segment per declared entry, committed read-write,
//! 3. copy every load record into its segment,
//! 4. apply each segment's declared access and publish it in a descriptor.
//!
//! Flat-model images get a single segment instead. Every selector covers
//! all of it, and the declared segments are ranges placed one after the
//! other from the image base, with the stack right below:
//!
//! ```text
//! 0          skip           image_base                     heap end
//! |-- none --|--- stack --->|-- seg 0 --|-- seg 1 --|-- heap -->|
//!                       ESP ^
//! ```
//!
//! Any structural problem aborts the load. Segments are only published once
//! all records were applied, so a failed load leaves the session untouched;
//! the caller decides to terminate.

use crate::descriptor::DescriptorError;
use crate::far_ptr::FarPointer;
use crate::session::Session;
use emu_image::{Image, ImageError, ImageHeader, Record, RecordType, SegmentDecl, SegmentKind};
use emu_memory::page::{self, PAGE_SIZE};
use emu_memory::{Access, Segment, SegmentError, SegmentId};
use emu_registers::{Eflags, Registers, Selector};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::{fs, io};

/// Which role an image plays in the guest.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ImageKind {
    /// The program being run.
    Main,
    /// The shared system library loaded before it.
    SystemLibrary,
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error("{field} segment {index} is not declared ({count} segments)")]
    BadSegmentIndex {
        field: &'static str,
        index: u16,
        count: usize,
    },
    #[error("load record targets undeclared segment {0}")]
    UnknownSegment(u16),
    #[error("load record {offset:#x}+{len:#x} overruns segment {segment} of {size:#x} bytes")]
    Overrun {
        segment: u16,
        offset: u32,
        len: usize,
        size: usize,
    },
    #[error("{0:?} records are not supported")]
    Fixup(RecordType),
    #[error("stack of {stack:#x} bytes does not fit below image base {image_base:#x}")]
    StackDoesNotFit { stack: usize, image_base: usize },
    #[error("flat image layout does not fit a 32-bit address space")]
    FlatLayoutOverflow,
    #[error(transparent)]
    Segment(#[from] SegmentError),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

/// What the loader learned about one image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoadInfo {
    pub kind: ImageKind,
    /// Entry point.
    pub entry: FarPointer,
    /// One selector per declared segment, in table order.
    pub selectors: Vec<Selector>,
    pub stack_segment: SegmentId,
    pub heap_segment: SegmentId,
    pub stack_selector: Selector,
    pub data_selector: Selector,
    pub argv_selector: Selector,
    /// Initial stack pointer: the top of the stack segment.
    pub stack_top: u32,
    pub stack_nbytes: u32,
    pub heap_nbytes: u32,
    pub image_base: u32,
}

impl LoadInfo {
    /// Registers to enter the image with.
    ///
    /// `DS` is the heap segment, `SS` the stack segment and `ES`/`FS`/`GS`
    /// point at the argument segment. `EDX` holds the lowest valid stack
    /// address.
    #[must_use]
    pub fn startup_registers(&self) -> Registers {
        Registers {
            eip: self.entry.offset,
            cs: self.entry.selector,
            ds: self.data_selector.to_u16(),
            ss: self.stack_selector.to_u16(),
            es: self.argv_selector.to_u16(),
            fs: self.argv_selector.to_u16(),
            gs: self.argv_selector.to_u16(),
            esp: self.stack_top,
            edx: self.stack_top.saturating_sub(self.stack_nbytes),
            eflags: Eflags::new(),
            ..Registers::default()
        }
    }
}

pub struct Loader<'s> {
    session: &'s Session,
}

impl<'s> Loader<'s> {
    #[must_use]
    pub const fn new(session: &'s Session) -> Self {
        Self { session }
    }

    /// Read and load an image file.
    pub fn load_file(&self, path: &Path, kind: ImageKind) -> Result<LoadInfo, LoadError> {
        let blob = fs::read(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!(target: "loader", "loading {} ({} bytes)", path.display(), blob.len());
        self.load(&blob, kind)
    }

    /// Load an image from memory.
    pub fn load(&self, blob: &[u8], kind: ImageKind) -> Result<LoadInfo, LoadError> {
        let image = Image::parse(blob)?;
        let header = *image.header();
        let decls = image.segments().collect::<Result<Vec<_>, _>>()?;
        check_indices(&header, decls.len())?;
        if header.is_flat() {
            return self.load_flat(&image, &header, &decls, kind);
        }

        let mut segments = Vec::with_capacity(decls.len());
        for decl in &decls {
            let segment = self
                .session
                .allocate_for_load(access_of(decl.kind), decl.size as usize)?;
            log::debug!(
                target: "loader",
                "segment {}: {:#x} bytes {:?} at {:#x}",
                segments.len(),
                decl.size,
                decl.kind,
                segment.linear_base()
            );
            segments.push(segment);
        }

        let targets: Vec<_> = segments
            .iter()
            .map(|segment| LoadTarget {
                segment,
                start: 0,
                size: segment.size(),
            })
            .collect();
        apply_records(&image, &targets)?;

        for (segment, decl) in segments.iter().zip(&decls) {
            segment.change_access(access_of(decl.kind))?;
        }

        let selectors = self.publish(&segments, &decls)?;
        let at = |index: u16| selectors[usize::from(index)];
        let stack = &segments[usize::from(header.stack_index)];

        #[allow(clippy::cast_possible_truncation)]
        let stack_top = (stack.size() & !3) as u32;

        let info = LoadInfo {
            kind,
            entry: FarPointer::new(at(header.code_index).to_u16(), header.code_offset),
            stack_segment: stack.id(),
            heap_segment: segments[usize::from(header.heap_index)].id(),
            stack_selector: at(header.stack_index),
            data_selector: at(header.heap_index),
            argv_selector: at(header.argv_index),
            stack_top,
            stack_nbytes: header.stack_nbytes,
            heap_nbytes: header.heap_nbytes,
            image_base: header.image_base,
            selectors,
        };
        log::debug!(target: "loader", "{kind:?} entry {}", info.entry);
        self.session.register_image(info.clone());
        Ok(info)
    }

    fn load_flat(
        &self,
        image: &Image<'_>,
        header: &ImageHeader,
        decls: &[SegmentDecl],
        kind: ImageKind,
    ) -> Result<LoadInfo, LoadError> {
        let layout = FlatLayout::new(header, decls)?;
        let memory = self.session.allocate_segment(Access::ReadWrite, 0)?;
        memory.skip(layout.skip)?;
        memory.grow(Access::ReadWrite, layout.segments_end)?;
        memory.grow(Access::ReadWrite, layout.heap_end)?;
        log::debug!(
            target: "loader",
            "flat image at {:#x}: stack {:#x}..{:#x}, segments end {:#x}, heap end {:#x}",
            memory.linear_base(),
            layout.skip,
            layout.image_base,
            layout.segments_end,
            layout.heap_end
        );

        let targets: Vec<_> = layout
            .ranges
            .iter()
            .map(|range| LoadTarget {
                segment: &memory,
                start: range.start,
                size: range.size,
            })
            .collect();
        apply_records(image, &targets)?;

        for (range, decl) in layout.ranges.iter().zip(decls) {
            if range.size > 0 {
                memory.change_range_access(range.start, range.size, access_of(decl.kind))?;
            }
        }

        let segments = vec![memory.clone(); decls.len()];
        let selectors = self.publish(&segments, decls)?;
        let at = |index: u16| selectors[usize::from(index)];
        let code = &layout.ranges[usize::from(header.code_index)];
        let entry = u32::try_from(code.start)
            .ok()
            .and_then(|start| start.checked_add(header.code_offset))
            .ok_or(LoadError::FlatLayoutOverflow)?;
        let stack_top = u32::try_from(layout.image_base).map_err(|_| LoadError::FlatLayoutOverflow)?;

        let info = LoadInfo {
            kind,
            entry: FarPointer::new(at(header.code_index).to_u16(), entry),
            stack_segment: memory.id(),
            heap_segment: memory.id(),
            stack_selector: at(header.stack_index),
            data_selector: at(header.heap_index),
            argv_selector: at(header.argv_index),
            stack_top,
            stack_nbytes: header.stack_nbytes,
            heap_nbytes: header.heap_nbytes,
            image_base: header.image_base,
            selectors,
        };
        log::debug!(target: "loader", "{kind:?} entry {} (flat)", info.entry);
        self.session.register_image(info.clone());
        Ok(info)
    }

    /// Publish every segment. On failure the already published descriptors
    /// are withdrawn again.
    fn publish(&self, segments: &[Rc<Segment>], decls: &[SegmentDecl]) -> Result<Vec<Selector>, LoadError> {
        let mut selectors = Vec::with_capacity(segments.len());
        for (segment, decl) in segments.iter().zip(decls) {
            match self
                .session
                .create_descriptor(access_of(decl.kind), segment.clone())
            {
                Ok(sel) => selectors.push(sel),
                Err(e) => {
                    for sel in selectors {
                        drop(self.session.detach(sel));
                    }
                    return Err(e.into());
                }
            }
        }
        Ok(selectors)
    }
}

/// Access mode for a declared segment type.
#[must_use]
pub const fn access_of(kind: SegmentKind) -> Access {
    match kind {
        SegmentKind::ReadWrite => Access::ReadWrite,
        SegmentKind::ReadOnly => Access::ReadOnly,
        SegmentKind::ExecRead => Access::ExecRead,
        SegmentKind::ExecOnly => Access::ExecOnly,
    }
}

/// Where a declared segment's load records go.
struct LoadTarget<'a> {
    segment: &'a Rc<Segment>,
    start: usize,
    size: usize,
}

/// One declared segment of a flat image.
#[derive(Copy, Clone, Debug)]
struct FlatRange {
    start: usize,
    size: usize,
}

/// Offsets of a flat image within its segment, all page aligned except the
/// heap end.
#[derive(Debug)]
struct FlatLayout {
    skip: usize,
    image_base: usize,
    segments_end: usize,
    heap_end: usize,
    ranges: Vec<FlatRange>,
}

impl FlatLayout {
    fn new(header: &ImageHeader, decls: &[SegmentDecl]) -> Result<Self, LoadError> {
        let overflow = || LoadError::FlatLayoutOverflow;
        let image_base = page::align_up(header.image_base as usize).ok_or_else(overflow)?;

        let mut pos = image_base;
        let mut ranges = Vec::with_capacity(decls.len());
        for decl in decls {
            let size = page::align_up(decl.size as usize).ok_or_else(overflow)?;
            ranges.push(FlatRange { start: pos, size });
            pos = pos.checked_add(size).ok_or_else(overflow)?;
        }

        let stack = page::align_up(header.stack_nbytes as usize).ok_or_else(overflow)?;
        if stack.saturating_add(PAGE_SIZE) > image_base {
            return Err(LoadError::StackDoesNotFit { stack, image_base });
        }

        let heap_end = pos.checked_add(header.heap_nbytes as usize).ok_or_else(overflow)?;
        if u32::try_from(heap_end).is_err() {
            return Err(overflow());
        }

        Ok(Self {
            skip: image_base - stack,
            image_base,
            segments_end: pos,
            heap_end,
            ranges,
        })
    }
}

fn check_indices(header: &ImageHeader, count: usize) -> Result<(), LoadError> {
    for (field, index) in [
        ("code", header.code_index),
        ("stack", header.stack_index),
        ("heap", header.heap_index),
        ("argv", header.argv_index),
    ] {
        if usize::from(index) >= count {
            return Err(LoadError::BadSegmentIndex {
                field,
                index,
                count,
            });
        }
    }
    Ok(())
}

fn apply_records(image: &Image<'_>, targets: &[LoadTarget<'_>]) -> Result<(), LoadError> {
    for record in image.records() {
        match record? {
            Record::Load {
                segment,
                offset,
                data,
            } => {
                let target = targets
                    .get(usize::from(segment))
                    .ok_or(LoadError::UnknownSegment(segment))?;
                let fits = (offset as usize)
                    .checked_add(data.len())
                    .is_some_and(|end| end <= target.size);
                if !fits || !target.segment.check_bounds(target.start + offset as usize, data.len()) {
                    return Err(LoadError::Overrun {
                        segment,
                        offset,
                        len: data.len(),
                        size: target.size,
                    });
                }
                target.segment.write_bytes(target.start + offset as usize, data)?;
            }
            Record::RwEnd => log::debug!(target: "loader", "end of read/write data"),
            Record::Fixup { kind } => return Err(LoadError::Fixup(kind)),
            Record::Skipped { rec_type, len } => {
                log::trace!(target: "loader", "skipping record type {rec_type} ({len} bytes)");
            }
        }
    }
    Ok(())
}
