// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Debug sections of ELF and mach-O files.
//!
//! Sections are handed out decompressed. Relocatable objects additionally
//! get their absolute relocations applied, which is all that DWARF in `.o`
//! files uses to point into other debug sections.

use crate::regs::Arch;
use crate::AnyError;

use std::io::Read as _;
use std::{fmt, fs, io, ops, path};

use flate2::read::ZlibDecoder;
use memmap2::{Mmap, MmapMut};
use object::{CompressionFormat, Object as _, ObjectSection as _, ObjectSymbol as _};
use zstd::stream::read::Decoder as ZstdDecoder;

/// Decompressed sections of at least this size are kept in an anonymous
/// temporary file instead of on the heap.
const SWAP_THRESHOLD: usize = 16 * 1024 * 1024;

/// Result type shorthand.
pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Errors that can occur while loading object files.
#[non_exhaustive]
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Section is compressed in an unsupported format")]
    UnsupportedCompression,

    #[error("Unsupported relocation at section offset {0:#x}")]
    UnsupportedRelocation(u64),

    #[error("Relocation at section offset {0:#x} is out of bounds")]
    RelocationOutOfBounds(u64),

    #[error("Relocation at section offset {0:#x} has an invalid target")]
    BadRelocationTarget(u64),

    #[error("Section is too big to be loaded")]
    SectionTooBig,

    #[error("IO error")]
    IO(#[from] io::Error),

    #[error(transparent)]
    Other(AnyError),
}

impl From<object::Error> for Error {
    fn from(e: object::Error) -> Self {
        Self::Other(Box::new(e))
    }
}

/// Memory-mapped object file.
pub struct File(Mmap);

impl File {
    /// Maps the file at the given path into memory.
    pub fn load(path: &path::Path) -> Result<Self> {
        let file = fs::File::open(path)?;
        Ok(Self(unsafe { Mmap::map(&file)? }))
    }

    /// Parses the header and creates a reader.
    pub fn parse(&self) -> Result<Reader<'_>> {
        Ok(Reader(object::File::parse(&self.0[..])?))
    }
}

/// Read access to the sections of an object file.
///
/// Created via [`File::parse`].
pub struct Reader<'obj>(object::File<'obj>);

impl<'obj> Reader<'obj> {
    /// Loads the section with the given name as stored in the file.
    pub fn load_section(&self, name: &[u8]) -> Result<Option<Section<'obj>>> {
        match self.0.section_by_name_bytes(name) {
            Some(sec) => Section::load(&sec).map(Some),
            None => Ok(None),
        }
    }

    /// Like [`Self::load_section`], but relocated if the file is a
    /// relocatable object.
    pub fn load_section_reloc(&self, name: &[u8]) -> Result<Option<Section<'obj>>> {
        let Some(sec) = self.0.section_by_name_bytes(name) else {
            return Ok(None);
        };

        let mut section = Section::load(&sec)?;
        if self.0.kind() != object::ObjectKind::Relocatable {
            return Ok(Some(section));
        }

        let mut relocations = sec.relocations().peekable();
        if relocations.peek().is_none() {
            return Ok(Some(section));
        }

        let data = section.data.make_mut()?;
        for (offset, reloc) in relocations {
            let target = self.relocation_target(offset, &reloc)?;
            apply_relocation(data, offset, &reloc, target)?;
        }

        Ok(Some(section))
    }

    /// Address that a relocation refers to, without its addend.
    fn relocation_target(&self, offset: u64, reloc: &object::Relocation) -> Result<u64> {
        let address = match reloc.target() {
            object::RelocationTarget::Absolute => return Ok(0),
            object::RelocationTarget::Symbol(idx) => {
                self.0.symbol_by_index(idx).map(|sym| sym.address())
            }
            object::RelocationTarget::Section(idx) => {
                self.0.section_by_index(idx).map(|sec| sec.address())
            }
            _ => return Err(Error::UnsupportedRelocation(offset)),
        };

        address.map_err(|_| Error::BadRelocationTarget(offset))
    }

    /// Checks whether this file has little-endian byte-order.
    pub fn is_little_endian(&self) -> bool {
        self.0.is_little_endian()
    }

    /// Returns the architecture, or [`None`] if there is no register table
    /// for it.
    pub fn arch(&self) -> Option<Arch> {
        match self.0.architecture() {
            object::Architecture::I386 => Some(Arch::X86),
            object::Architecture::X86_64 => Some(Arch::X86_64),
            _ => None,
        }
    }
}

/// Patches the little-endian field at `offset` with `target` plus addend.
///
/// REL-style relocations keep their addend in the field itself.
fn apply_relocation(
    data: &mut [u8],
    offset: u64,
    reloc: &object::Relocation,
    target: u64,
) -> Result {
    let supported = reloc.kind() == object::RelocationKind::Absolute
        && reloc.encoding() == object::RelocationEncoding::Generic;

    let width = match reloc.size() {
        32 if supported => 4,
        64 if supported => 8,
        _ => return Err(Error::UnsupportedRelocation(offset)),
    };

    let field = usize::try_from(offset)
        .ok()
        .and_then(|start| data.get_mut(start..start.checked_add(width)?))
        .ok_or(Error::RelocationOutOfBounds(offset))?;

    let mut raw = [0; 8];
    if reloc.has_implicit_addend() {
        raw[..width].copy_from_slice(field);
    }

    let value = u64::from_le_bytes(raw)
        .wrapping_add(target)
        .wrapping_add_signed(reloc.addend());

    field.copy_from_slice(&value.to_le_bytes()[..width]);
    Ok(())
}

/// Raw data of an object file section.
#[derive(Debug)]
pub struct Section<'obj> {
    data: SectionData<'obj>,
}

impl<'obj> Section<'obj> {
    /// Wraps section data that was produced in memory, e.g. by a DWARF writer.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Section {
            data: SectionData::Owned(data),
        }
    }

    fn load(sec: &object::Section<'obj, '_>) -> Result<Self> {
        Ok(Section {
            data: SectionData::load(sec)?,
        })
    }
}

impl ops::Deref for Section<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match &self.data {
            SectionData::Borrowed(x) => x,
            SectionData::Owned(x) => &x[..],
            SectionData::Mapped(x) => &x[..],
        }
    }
}

/// Storage of a section's bytes.
enum SectionData<'obj> {
    /// Stored uncompressed in the mapped file.
    Borrowed(&'obj [u8]),

    /// Decompressed, copied or built on the heap.
    Owned(Vec<u8>),

    /// Decompressed into a mapped temporary file.
    Mapped(MmapMut),
}

impl<'obj> SectionData<'obj> {
    fn load(sec: &object::Section<'obj, '_>) -> Result<Self> {
        let stored = sec.compressed_data()?;
        let size = usize::try_from(stored.uncompressed_size).map_err(|_| Error::SectionTooBig)?;

        match stored.format {
            CompressionFormat::None => Ok(Self::Borrowed(stored.data)),
            CompressionFormat::Zlib => Self::buffer(size, ZlibDecoder::new(stored.data)),
            CompressionFormat::Zstandard => Self::buffer(size, ZstdDecoder::new(stored.data)?),
            _ => Err(Error::UnsupportedCompression),
        }
    }

    /// Reads `size` bytes from `reader` into owned storage.
    fn buffer(size: usize, reader: impl io::Read) -> Result<Self> {
        Self::read(size, size >= SWAP_THRESHOLD, reader)
    }

    fn read(size: usize, swap: bool, reader: impl io::Read) -> Result<Self> {
        let mut reader = reader.take(size as u64);

        if !swap {
            let mut buf = Vec::with_capacity(size);
            reader.read_to_end(&mut buf)?;
            return Ok(Self::Owned(buf));
        }

        let mut file = tempfile::tempfile()?;
        io::copy(&mut reader, &mut file)?;
        Ok(Self::Mapped(unsafe { MmapMut::map_mut(&file)? }))
    }

    /// Mutable view of the data, copying borrowed bytes on first use.
    fn make_mut(&mut self) -> Result<&mut [u8]> {
        match self {
            Self::Owned(x) => Ok(&mut x[..]),
            Self::Mapped(x) => Ok(&mut x[..]),
            Self::Borrowed(bytes) => {
                *self = Self::buffer(bytes.len(), *bytes)?;
                self.make_mut()
            }
        }
    }
}

impl fmt::Debug for SectionData<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (storage, len) = match self {
            Self::Borrowed(x) => ("borrowed", x.len()),
            Self::Owned(x) => ("owned", x.len()),
            Self::Mapped(x) => ("mapped", x.len()),
        };

        write!(f, "SectionData({len} bytes, {storage})")
    }
}
