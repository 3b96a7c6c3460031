// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Lazily decoded view of the DWARF debugging information entry tree.
//!
//! [`Sections`] owns the raw section data. [`Sections::debug_info`] builds a
//! [`DebugInfo`] index over all units of the `.debug_info` section that hands
//! out [`Die`] accessors by global section offset. Every unit is decoded into
//! an offset-indexed arena once and then kept in an LRU cache, so resolving
//! cross-references never requires holding on to decoder cursors.

// Compiler complains about using the gimli constants in match patterns.
#![allow(non_upper_case_globals)]

mod die;
mod location;
mod tree;

pub use die::*;
pub use location::*;

use crate::{objfile, AnyError};
use fallible_iterator::FallibleIterator;
use lru::LruCache;
use std::cell::RefCell;
use std::convert::Infallible;
use std::num::NonZeroUsize;
use std::ops::Range;
use std::rc::Rc;
use std::slice;
use tree::DieTree;

/// Shorthand for the [`gimli`] reader type that we use everywhere.
///
/// Until BE binaries come back into favor we simply hard-code LE at
/// compile time, getting rid of a ton of unnecessary branching.
type R<'dwarf> = gimli::EndianSlice<'dwarf, gimli::LittleEndian>;

/// Maximum number of compilation units to process per object file.
const MAX_COMP_UNITS: usize = 256 * 1024;

/// Maximum size of the LRU cache for decoded units.
const UNIT_CACHE_SIZE: usize = 64;

/// Result type shorthand.
pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Errors that can occur while reading DWARF data.
#[non_exhaustive]
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Reader currently doesn't support big endian binaries")]
    BigEndian,

    #[error("No DIE starts at .debug_info offset {0:#x}")]
    NotFound(u64),

    #[error("Mandatory attribute {0} is missing")]
    MissingAttribute(gimli::DwAt),

    #[error("Attribute {0} is encoded in an unsupported form")]
    UnsupportedForm(gimli::DwAt),

    #[error("The input file has too many translation units")]
    UnitLimitExceeded,

    #[error("The DIE tree of a unit is too deep")]
    TreeTooDeep,

    #[error("objfile error")]
    Objfile(#[from] objfile::Error),

    #[error("DWARF decoding failed: {0}")]
    Decode(AnyError),
}

/// Conversion of [`gimli`] errors into ours.
///
/// We erase the type here to prevent leaking [`gimli`] library types into our
/// public interface.
impl From<gimli::Error> for Error {
    fn from(e: gimli::Error) -> Self {
        Self::Decode(Box::new(e))
    }
}

/// Collection of DWARF sections of an object file.
pub struct Sections<'obj> {
    main: gimli::DwarfSections<Option<objfile::Section<'obj>>>,
}

impl<'obj> Sections<'obj> {
    /// Reads the DWARF sections from the given object file.
    pub fn load(obj: &objfile::Reader<'obj>) -> Result<Self> {
        if !obj.is_little_endian() {
            return Err(Error::BigEndian);
        }

        Ok(Self {
            main: gimli::DwarfSections::load(|id| obj.load_section_reloc(id.name().as_bytes()))?,
        })
    }

    /// Builds the sections from in-memory data, e.g. the output of a DWARF
    /// writer. Sections for which `section` returns [`None`] are left empty.
    pub fn from_raw(mut section: impl FnMut(gimli::SectionId) -> Option<Vec<u8>>) -> Self {
        let main = gimli::DwarfSections::load(|id| {
            Ok::<_, Infallible>(section(id).map(objfile::Section::from_vec))
        });

        match main {
            Ok(main) => Self { main },
            Err(never) => match never {},
        }
    }

    /// Index all units of the `.debug_info` section.
    pub fn debug_info(&self) -> Result<DebugInfo<'_>> {
        // Create a borrowing DWARF instance from our owned one.
        fn borrow<'a>(section: &'a Option<objfile::Section<'a>>) -> R<'a> {
            let data = match section {
                Some(x) => x,
                None => &[][..],
            };

            R::new(data, gimli::LittleEndian)
        }

        let dwarf = self.main.borrow(borrow);

        // Collect all units now. We later need this to quickly seek to
        // different units when we encounter cross-unit references.
        let headers = collect_unit_headers(&dwarf)?;

        let cache_size = NonZeroUsize::new(UNIT_CACHE_SIZE).expect("UNIT_CACHE_SIZE must be >0");

        Ok(DebugInfo {
            dwarf,
            headers,
            unit_cache: RefCell::new(LruCache::new(cache_size)),
        })
    }
}

/// Decoded unit together with its DIE arena.
struct UnitData<'dwarf> {
    gimli_unit: gimli::Unit<R<'dwarf>>,

    /// Offset of the unit header within `.debug_info`.
    start: u64,

    tree: DieTree,
}

/// Index over all units in the `.debug_info` section.
///
/// Units can contain references to each other and this object serves as an
/// index that permits efficient lookups of DIEs by their global offset.
pub struct DebugInfo<'dwarf> {
    /// Borrowed view into the DWARF sections held in the [`Sections`] object.
    dwarf: gimli::Dwarf<R<'dwarf>>,

    /// List of all unit headers, ordered by offset.
    headers: Vec<gimli::UnitHeader<R<'dwarf>>>,

    /// Cache of decoded units.
    ///
    /// Out-of-band type resolution jumps between units a lot; this keeps
    /// us from rebuilding the DIE arena for every hop.
    unit_cache: RefCell<
        LruCache<
            /* key:   */ u64,
            /* value: */ Rc<UnitData<'dwarf>>,
        >,
    >,
}

impl<'dwarf> DebugInfo<'dwarf> {
    /// Number of units in the section.
    pub fn unit_count(&self) -> usize {
        self.headers.len()
    }

    /// Iterate over the root DIEs of all units.
    pub fn units<'info>(&'info self) -> UnitIter<'dwarf, 'info> {
        UnitIter {
            info: self,
            iter: self.headers.iter(),
        }
    }

    /// Looks up the DIE starting at the given `.debug_info` offset.
    pub fn die_at<'info>(&'info self, offset: u64) -> Result<Die<'dwarf, 'info>> {
        let Some(header) = self.header_for_offset(offset) else {
            return Err(Error::NotFound(offset));
        };

        let unit = self.unit_for_header(header)?;
        let Some(node) = unit.tree.find(offset - unit.start) else {
            return Err(Error::NotFound(offset));
        };

        Ok(Die::new(self, unit, node))
    }

    /// Locates the header of the unit containing the given offset.
    fn header_for_offset(&self, offset: u64) -> Option<&gimli::UnitHeader<R<'dwarf>>> {
        let headers = &self.headers;

        let header = match headers.binary_search_by_key(&offset, unit_start) {
            // Exact match: offset points at a unit header, not at a DIE.
            // The tree lookup will reject it.
            Ok(idx) => Some(&headers[idx]),

            // Our unit array is empty.
            Err(0) => None,

            // Either found somewhere within a unit or outside of valid range.
            Err(idx) => {
                let matched = &headers[idx - 1];
                if unit_range(matched).contains(&offset) {
                    Some(matched)
                } else {
                    None
                }
            }
        };

        // Compare with the result of a dumb linear search when compiled in debug mode.
        debug_assert_eq!(
            header.map(|x| x as *const _),
            headers
                .iter()
                .find(|unit| unit_range(unit).contains(&offset))
                .map(|x| x as *const _)
        );

        header
    }

    /// Decodes the unit for the given header or takes it from the cache.
    fn unit_for_header(
        &self,
        header: &gimli::UnitHeader<R<'dwarf>>,
    ) -> Result<Rc<UnitData<'dwarf>>> {
        let mut cache = self.unit_cache.borrow_mut();
        let start = unit_start(header);

        if let Some(cached) = cache.get(&start) {
            return Ok(cached.clone());
        }

        let gimli_unit = self.dwarf.unit(*header)?;
        let tree = DieTree::build(&gimli_unit)?;
        let unit = Rc::new(UnitData {
            gimli_unit,
            start,
            tree,
        });

        cache.put(start, unit.clone());

        Ok(unit)
    }
}

/// Iterator over the root DIEs of the units in a [`DebugInfo`].
///
/// Created using [`DebugInfo::units`]. Continuing iteration on errors is
/// well-defined: units that fail to decode are simply skipped.
#[derive(Clone)]
pub struct UnitIter<'dwarf, 'info> {
    info: &'info DebugInfo<'dwarf>,
    iter: slice::Iter<'info, gimli::UnitHeader<R<'dwarf>>>,
}

impl<'dwarf, 'info> FallibleIterator for UnitIter<'dwarf, 'info> {
    type Item = Die<'dwarf, 'info>;
    type Error = Error;

    fn next(&mut self) -> Result<Option<Self::Item>> {
        loop {
            let Some(header) = self.iter.next() else {
                return Ok(None);
            };

            let unit = self.info.unit_for_header(header)?;
            if let Some(root) = unit.tree.root() {
                return Ok(Some(Die::new(self.info, unit, root)));
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.iter.len()))
    }
}

/// Offset of the unit header within `.debug_info`.
fn unit_start(unit: &gimli::UnitHeader<R<'_>>) -> u64 {
    let offset = unit
        .offset()
        .as_debug_info_offset()
        .expect("we only collect .debug_info units");

    offset.0 as u64
}

/// Constructs the offset [`Range`] for a unit.
fn unit_range(unit: &gimli::UnitHeader<R<'_>>) -> Range<u64> {
    let start = unit_start(unit);
    start..start + unit.length_including_self() as u64
}

/// Collect list of all unit headers in a DWARF file.
fn collect_unit_headers<'obj>(
    dwarf: &gimli::Dwarf<R<'obj>>,
) -> Result<Vec<gimli::UnitHeader<R<'obj>>>> {
    let mut unit_iter = dwarf.units().enumerate();
    let mut units = Vec::with_capacity(unit_iter.size_hint().0);

    while let Some((i, unit)) = unit_iter.next()? {
        if i >= MAX_COMP_UNITS {
            return Err(Error::UnitLimitExceeded);
        }

        units.push(unit);
    }

    Ok(units)
}
