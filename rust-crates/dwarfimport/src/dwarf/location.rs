// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Location descriptions: single expressions and location lists.

use super::{Die, Error, Result, R};
use crate::VirtAddr;
use gimli::{constants::*, AttributeValue as AV};
use smallvec::SmallVec;
use std::ops::Range;

/// One operation of a location expression.
///
/// Only the operations that can be mapped onto a register, a stack slot, a
/// static address or a member offset are distinguished; all others collapse
/// into [`LocationAtom::Unsupported`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationAtom {
    /// `DW_OP_reg*`: value lives in a register.
    Reg(u16),
    /// `DW_OP_breg*`: memory at register + offset.
    #[allow(missing_docs)]
    Breg { register: u16, offset: i64 },
    /// `DW_OP_fbreg`: memory at frame base + offset.
    Fbreg(i64),
    /// `DW_OP_addr`: memory at a static address.
    Addr(u64),
    /// `DW_OP_plus_uconst`: used for member offsets.
    PlusUconst(u64),
    /// `DW_OP_call_frame_cfa`: canonical frame address as frame base.
    CallFrameCfa,
    /// Anything else.
    Unsupported,
}

/// A location description: a sequence of atoms, optionally restricted to
/// an address range when it came from a location list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationDesc {
    /// Address range for which the description is valid. [`None`] unless
    /// the description is an entry of a location list.
    pub range: Option<Range<VirtAddr>>,
    /// Operations of the expression, in order.
    pub atoms: SmallVec<[LocationAtom; 2]>,
}

impl LocationDesc {
    /// Whether this description was taken from a location list.
    pub fn from_location_list(&self) -> bool {
        self.range.is_some()
    }

    /// The only atom of the description, or [`None`] if there are zero or
    /// multiple atoms.
    pub fn single(&self) -> Option<LocationAtom> {
        match self.atoms[..] {
            [atom] => Some(atom),
            _ => None,
        }
    }
}

fn decode_expression(
    expr: gimli::Expression<R<'_>>,
    encoding: gimli::Encoding,
) -> Result<SmallVec<[LocationAtom; 2]>> {
    let mut atoms = SmallVec::new();
    let mut ops = expr.operations(encoding);

    while let Some(op) = ops.next()? {
        atoms.push(match op {
            gimli::Operation::Register { register } => LocationAtom::Reg(register.0),
            gimli::Operation::RegisterOffset {
                register, offset, ..
            } => LocationAtom::Breg {
                register: register.0,
                offset,
            },
            gimli::Operation::FrameOffset { offset } => LocationAtom::Fbreg(offset),
            gimli::Operation::Address { address } => LocationAtom::Addr(address),
            gimli::Operation::PlusConstant { value } => LocationAtom::PlusUconst(value),
            gimli::Operation::CallFrameCFA => LocationAtom::CallFrameCfa,
            _ => LocationAtom::Unsupported,
        });
    }

    Ok(atoms)
}

impl<'dwarf, 'info> Die<'dwarf, 'info> {
    /// Decodes the location description(s) held in the given attribute.
    ///
    /// Expression forms yield a single description without a range; location
    /// list forms yield one description per list entry, with the unit's base
    /// address already applied to the ranges.
    pub fn locations(&self, at: gimli::DwAt) -> Result<Option<Vec<LocationDesc>>> {
        let Some(value) = self.attr(at)? else {
            return Ok(None);
        };

        let unit = &self.unit.gimli_unit;
        let encoding = unit.encoding();

        let expr = match value {
            AV::Exprloc(expr) => Some(expr.clone()),
            AV::Block(data) => Some(gimli::Expression(*data)),
            _ => None,
        };

        if let Some(expr) = expr {
            return Ok(Some(vec![LocationDesc {
                range: None,
                atoms: decode_expression(expr, encoding)?,
            }]));
        }

        let Some(mut entries) = self.info.dwarf.attr_locations(unit, value.clone())? else {
            return Err(Error::UnsupportedForm(at));
        };

        let mut descs = Vec::new();
        while let Some(entry) = entries.next()? {
            descs.push(LocationDesc {
                range: Some(entry.range.begin..entry.range.end),
                atoms: decode_expression(entry.data, encoding)?,
            });
        }

        Ok(Some(descs))
    }

    /// Byte offset of a member within its enclosing structure.
    ///
    /// Accepts a constant (DWARF 3+) or an expression consisting of exactly
    /// one `DW_OP_plus_uconst`. Returns [`None`] if the attribute is absent.
    pub fn member_offset(&self) -> Result<Option<u64>> {
        let Some(value) = self.attr(DW_AT_data_member_location)? else {
            return Ok(None);
        };

        if let Some(offset) = value.udata_value() {
            return Ok(Some(offset));
        }

        let descs = self.locations(DW_AT_data_member_location)?.unwrap_or_default();
        match descs.as_slice() {
            [desc] if !desc.from_location_list() => match desc.single() {
                Some(LocationAtom::PlusUconst(offset)) => Ok(Some(offset)),
                _ => Err(Error::UnsupportedForm(DW_AT_data_member_location)),
            },
            _ => Err(Error::UnsupportedForm(DW_AT_data_member_location)),
        }
    }
}
