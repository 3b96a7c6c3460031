// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

use super::tree::{Node, NodeIdx};
use super::{DebugInfo, Error, Result, UnitData, R};
use gimli::{constants::*, AttributeValue as AV};
use smallvec::SmallVec;
use std::cell::OnceCell;
use std::fmt;
use std::rc::Rc;

/// Decoded attribute list of a DIE.
type AttrList<'dwarf> = SmallVec<[(gimli::DwAt, AV<R<'dwarf>>); 8]>;

/// Accessor for a single debugging information entry.
///
/// Tree navigation is served from the unit's arena. The attribute list and
/// the name are decoded on first use and memoized for the lifetime of the
/// accessor; everything the accessor obtains is owned and released when it
/// is dropped.
pub struct Die<'dwarf, 'info> {
    pub(super) info: &'info DebugInfo<'dwarf>,
    pub(super) unit: Rc<UnitData<'dwarf>>,
    pub(super) node: NodeIdx,
    attrs: OnceCell<AttrList<'dwarf>>,
    name: OnceCell<Option<String>>,
}

impl fmt::Debug for Die<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Die({} @ {:#x})", self.tag(), self.offset())
    }
}

impl<'dwarf, 'info> Die<'dwarf, 'info> {
    pub(super) fn new(
        info: &'info DebugInfo<'dwarf>,
        unit: Rc<UnitData<'dwarf>>,
        node: NodeIdx,
    ) -> Self {
        Die {
            info,
            unit,
            node,
            attrs: OnceCell::new(),
            name: OnceCell::new(),
        }
    }

    fn node(&self) -> &Node {
        self.unit.tree.node(self.node)
    }

    fn relative(&self, node: Option<NodeIdx>) -> Option<Self> {
        node.map(|node| Die::new(self.info, self.unit.clone(), node))
    }

    /// Global offset of this DIE within `.debug_info`.
    pub fn offset(&self) -> u64 {
        self.unit.start + self.node().offset
    }

    /// The DIE's tag.
    pub fn tag(&self) -> gimli::DwTag {
        self.node().tag
    }

    /// Offset of the enclosing unit's header within `.debug_info`.
    pub fn unit_offset(&self) -> u64 {
        self.unit.start
    }

    /// Length of the enclosing unit, including its header.
    pub fn unit_length(&self) -> u64 {
        self.unit.gimli_unit.header.length_including_self() as u64
    }

    /// Address size of the enclosing unit.
    pub fn address_size(&self) -> u8 {
        self.unit.gimli_unit.encoding().address_size
    }

    /// The index that resolves references to DIEs in other units.
    pub fn info(&self) -> &'info DebugInfo<'dwarf> {
        self.info
    }

    /// Enclosing DIE; [`None`] for unit roots.
    pub fn parent(&self) -> Option<Self> {
        self.relative(self.node().parent)
    }

    /// First child, if any.
    pub fn first_child(&self) -> Option<Self> {
        self.relative(self.node().first_child)
    }

    /// Next DIE with the same parent, if any.
    pub fn next_sibling(&self) -> Option<Self> {
        self.relative(self.node().next_sibling)
    }

    /// Iterate over the direct children of this DIE.
    pub fn children(&self) -> Children<'dwarf, 'info> {
        Children {
            info: self.info,
            unit: self.unit.clone(),
            next: self.node().first_child,
        }
    }

    /// Decodes the attribute list on first use.
    fn attrs(&self) -> Result<&AttrList<'dwarf>> {
        if let Some(attrs) = self.attrs.get() {
            return Ok(attrs);
        }

        let offset = gimli::UnitOffset(self.node().offset as usize);
        let entry = self.unit.gimli_unit.entry(offset)?;

        let mut decoded = AttrList::new();
        let mut iter = entry.attrs();
        while let Some(attr) = iter.next()? {
            decoded.push((attr.name(), attr.value()));
        }

        Ok(self.attrs.get_or_init(|| decoded))
    }

    /// Raw attribute value, or [`None`] if the DIE doesn't carry it.
    pub fn attr(&self, at: gimli::DwAt) -> Result<Option<&AV<R<'dwarf>>>> {
        Ok(self.attrs()?.iter().find(|(name, _)| *name == at).map(|(_, value)| value))
    }

    /// Checks whether the DIE carries the given attribute.
    pub fn has_attr(&self, at: gimli::DwAt) -> Result<bool> {
        Ok(self.attr(at)?.is_some())
    }

    /// Name of the entry; [`None`] for anonymous entries.
    pub fn name(&self) -> Result<Option<&str>> {
        if let Some(name) = self.name.get() {
            return Ok(name.as_deref());
        }

        let name = match self.attr(DW_AT_name)? {
            Some(value) => {
                let raw = self.info.dwarf.attr_string(&self.unit.gimli_unit, value.clone())?;
                Some(raw.to_string_lossy().into_owned())
            }
            None => None,
        };

        Ok(self.name.get_or_init(|| name).as_deref())
    }

    /// Like [`Self::name`], but fails if the entry is anonymous.
    pub fn required_name(&self) -> Result<&str> {
        self.name()?.ok_or(Error::MissingAttribute(DW_AT_name))
    }

    /// Value of the mandatory `DW_AT_byte_size` attribute.
    pub fn byte_size(&self) -> Result<u64> {
        match self.attr(DW_AT_byte_size)? {
            Some(value) => value
                .udata_value()
                .ok_or(Error::UnsupportedForm(DW_AT_byte_size)),
            None => Err(Error::MissingAttribute(DW_AT_byte_size)),
        }
    }

    /// Reads a small integer attribute, trying the unsigned interpretation
    /// first and falling back to the signed one.
    pub fn small_value(&self, at: gimli::DwAt) -> Result<i64> {
        self.opt_small_value(at)?.ok_or(Error::MissingAttribute(at))
    }

    /// Like [`Self::small_value`], but returns [`None`] if absent.
    pub fn opt_small_value(&self, at: gimli::DwAt) -> Result<Option<i64>> {
        let Some(value) = self.attr(at)? else {
            return Ok(None);
        };

        let decoded = match *value {
            AV::Encoding(x) => Some(i64::from(x.0)),
            AV::Sdata(x) => Some(x),
            ref value => value.udata_value().map(|x| x as i64).or_else(|| value.sdata_value()),
        };

        decoded.map(Some).ok_or(Error::UnsupportedForm(at))
    }

    /// Reads a flag attribute. Absent flags are `false`.
    pub fn flag(&self, at: gimli::DwAt) -> Result<bool> {
        match self.attr(at)? {
            None => Ok(false),
            Some(AV::Flag(x)) => Ok(*x),
            Some(_) => Err(Error::UnsupportedForm(at)),
        }
    }

    /// Reads an address attribute such as `DW_AT_low_pc`.
    pub fn address(&self, at: gimli::DwAt) -> Result<Option<u64>> {
        let Some(value) = self.attr(at)? else {
            return Ok(None);
        };

        match self.info.dwarf.attr_address(&self.unit.gimli_unit, value.clone())? {
            Some(addr) => Ok(Some(addr)),
            None => Err(Error::UnsupportedForm(at)),
        }
    }

    /// Resolves a reference attribute to the global offset of the target.
    ///
    /// Supports CU-relative references (`DW_FORM_ref{1,2,4,8,_udata}`) and
    /// global references (`DW_FORM_ref_addr`). Everything else, e.g.
    /// type-unit signatures or supplementary-file references, is rejected.
    pub fn ref_offset(&self, at: gimli::DwAt) -> Result<Option<u64>> {
        match self.attr(at)? {
            None => Ok(None),
            Some(AV::UnitRef(offs)) => Ok(Some(self.unit.start + offs.0 as u64)),
            Some(AV::DebugInfoRef(offs)) => Ok(Some(offs.0 as u64)),
            Some(_) => Err(Error::UnsupportedForm(at)),
        }
    }

    /// Follows a reference attribute to the target DIE.
    pub fn follow(&self, at: gimli::DwAt) -> Result<Option<Die<'dwarf, 'info>>> {
        match self.ref_offset(at)? {
            Some(offset) => self.info.die_at(offset).map(Some),
            None => Ok(None),
        }
    }
}

/// Iterator over the children of a [`Die`].
///
/// Created via [`Die::children`].
pub struct Children<'dwarf, 'info> {
    info: &'info DebugInfo<'dwarf>,
    unit: Rc<UnitData<'dwarf>>,
    next: Option<NodeIdx>,
}

impl<'dwarf, 'info> Iterator for Children<'dwarf, 'info> {
    type Item = Die<'dwarf, 'info>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next?;
        self.next = self.unit.tree.node(node).next_sibling;
        Some(Die::new(self.info, self.unit.clone(), node))
    }
}
