// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Structural equality between database entities and DIEs.
//!
//! Both sides are reduced to `name -> value` pairs: enumerator values for
//! enumerations, member offsets for structures. The pairs of the database
//! entity form a working set that the DIE's children then have to drain
//! exactly.

use super::{types, Result};
use crate::dwarf::Die;
use crate::host::{EnumDef, EnumId, StructDef, StructId, TypeDatabase};
use gimli::constants::*;
use std::collections::HashMap;

/// Anything that can enumerate `(name, value)` pairs.
pub(super) trait MemberSource {
    /// Calls `visit` for every pair until it returns `false`.
    fn visit_members(&self, visit: &mut dyn FnMut(&str, u64) -> bool) -> Result;
}

/// Constants of an enumeration in the database.
struct DbEnum<'a>(&'a EnumDef);

impl MemberSource for DbEnum<'_> {
    fn visit_members(&self, visit: &mut dyn FnMut(&str, u64) -> bool) -> Result {
        for (name, value) in &self.0.constants {
            if !visit(name, *value) {
                break;
            }
        }
        Ok(())
    }
}

/// Members of a structure in the database. Union offsets are all 0.
struct DbStruct<'a>(&'a StructDef);

impl MemberSource for DbStruct<'_> {
    fn visit_members(&self, visit: &mut dyn FnMut(&str, u64) -> bool) -> Result {
        for member in &self.0.members {
            let offset = if self.0.is_union { 0 } else { member.offset };
            if !visit(&member.name, offset) {
                break;
            }
        }
        Ok(())
    }
}

/// Enumerator children of an enumeration DIE.
struct DieEnumerators<'a, 'dwarf, 'info>(&'a Die<'dwarf, 'info>);

impl MemberSource for DieEnumerators<'_, '_, '_> {
    fn visit_members(&self, visit: &mut dyn FnMut(&str, u64) -> bool) -> Result {
        for child in self.0.children() {
            if child.tag() != DW_TAG_enumerator {
                continue;
            }

            let value = child.small_value(DW_AT_const_value)? as u64;
            if !visit(child.required_name()?, value) {
                break;
            }
        }
        Ok(())
    }
}

/// Member children of a structure or union DIE.
struct DieMembers<'a, 'dwarf, 'info>(&'a Die<'dwarf, 'info>);

impl MemberSource for DieMembers<'_, '_, '_> {
    fn visit_members(&self, visit: &mut dyn FnMut(&str, u64) -> bool) -> Result {
        for member in types::collect_members(self.0)? {
            if !visit(&member.name, member.offset) {
                break;
            }
        }
        Ok(())
    }
}

/// Working set of a structural comparison.
pub(super) struct Comparator {
    working: HashMap<String, u64>,
}

impl Comparator {
    /// Fills the working set from `source`.
    pub fn load(source: &dyn MemberSource) -> Result<Self> {
        let mut working = HashMap::new();
        source.visit_members(&mut |name, value| {
            working.insert(name.to_owned(), value);
            true
        })?;

        Ok(Self { working })
    }

    /// Checks whether `source` drains the working set exactly.
    pub fn drained_by(mut self, source: &dyn MemberSource) -> Result<bool> {
        let mut matched = true;
        source.visit_members(&mut |name, value| {
            matched = self.working.remove(name) == Some(value);
            matched
        })?;

        Ok(matched && self.working.is_empty())
    }
}

/// Whether the enumeration `id` has exactly the enumerators of `die`.
pub(super) fn enum_matches(db: &dyn TypeDatabase, id: EnumId, die: &Die<'_, '_>) -> Result<bool> {
    let Some(def) = db.enum_def(id) else {
        return Ok(false);
    };

    if die.tag() != DW_TAG_enumeration_type {
        return Ok(false);
    }

    Comparator::load(&DbEnum(def))?.drained_by(&DieEnumerators(die))
}

/// Whether the structure `id` has exactly the members of `die`.
///
/// Structures without members never match, and a union never matches a
/// structure.
pub(super) fn struct_matches(
    db: &dyn TypeDatabase,
    id: StructId,
    die: &Die<'_, '_>,
) -> Result<bool> {
    let Some(def) = db.struct_def(id) else {
        return Ok(false);
    };

    let is_union = match die.tag() {
        DW_TAG_structure_type => false,
        DW_TAG_union_type => true,
        _ => return Ok(false),
    };

    if def.is_union != is_union || def.members.is_empty() {
        return Ok(false);
    }

    Comparator::load(&DbStruct(def))?.drained_by(&DieMembers(die))
}

/// Whether two structure or union DIEs have the same member layout.
///
/// Same rules as [`struct_matches`], with `a` taking the place of the
/// database record.
pub(super) fn struct_dies_match(a: &Die<'_, '_>, b: &Die<'_, '_>) -> Result<bool> {
    let kinds = [a.tag(), b.tag()];
    let same_kind = kinds == [DW_TAG_structure_type; 2] || kinds == [DW_TAG_union_type; 2];
    if !same_kind || types::collect_members(a)?.is_empty() {
        return Ok(false);
    }

    Comparator::load(&DieMembers(a))?.drained_by(&DieMembers(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{IntWidth, Member, MemberType, MemoryDb, TypeRepr};
    use crate::testutil::Fixture;
    use gimli::write::AttributeValue as WAV;

    fn enumerators(fx: &mut Fixture, name: &str, pairs: &[(&str, i64)]) {
        let e = fx.add(fx.root(), DW_TAG_enumeration_type, vec![
            (DW_AT_name, WAV::String(name.into())),
            (DW_AT_byte_size, WAV::Data1(4)),
        ]);
        for &(name, value) in pairs {
            fx.add(e, DW_TAG_enumerator, vec![
                (DW_AT_name, WAV::String(name.into())),
                (DW_AT_const_value, WAV::Sdata(value)),
            ]);
        }
    }

    #[test]
    fn enums() {
        let mut db = MemoryDb::new(4);
        let id = db.add_enum(Some("color"), 4).unwrap();
        db.add_enum_constant(id, "RED", 0);
        db.add_enum_constant(id, "GREEN", 1);

        let mut fx = Fixture::new();
        enumerators(&mut fx, "same", &[("GREEN", 1), ("RED", 0)]);
        enumerators(&mut fx, "value", &[("RED", 0), ("GREEN", 2)]);
        enumerators(&mut fx, "fewer", &[("RED", 0)]);
        enumerators(&mut fx, "more", &[("RED", 0), ("GREEN", 1), ("BLUE", 2)]);

        let sections = fx.finish();
        let info = sections.debug_info().unwrap();
        let check = |name: &str| {
            let die = info.die_at(Fixture::offset_of(&info, name)).unwrap();
            enum_matches(&db, id, &die).unwrap()
        };

        assert!(check("same"));
        assert!(!check("value"));
        assert!(!check("fewer"));
        assert!(!check("more"));
    }

    #[test]
    fn structs() {
        let mut db = MemoryDb::new(4);
        let int = db
            .add_named_type("int", TypeRepr::Int {
                width: IntWidth::W32,
                signed: true,
                is_char: false,
            })
            .unwrap();
        let member = |name: &str, offset| Member {
            name: name.into(),
            offset,
            size: 4,
            ty: MemberType::Typed(int),
        };

        let s = db.add_struct(Some("point"), false).unwrap();
        db.add_struct_member(s, member("x", 0));
        db.add_struct_member(s, member("y", 4));
        let u = db.add_struct(Some("either"), true).unwrap();
        db.add_struct_member(u, member("x", 0));
        db.add_struct_member(u, member("y", 0));
        let empty = db.add_struct(Some("empty"), false).unwrap();

        let mut fx = Fixture::new();
        let int_die = fx.base_type("int", 4, DW_ATE_signed);
        for (name, tag, offsets) in [
            ("point_same", DW_TAG_structure_type, [0, 4]),
            ("point_moved", DW_TAG_structure_type, [0, 8]),
            ("union_same", DW_TAG_union_type, [0, 0]),
        ] {
            let die = fx.add(fx.root(), tag, vec![(DW_AT_name, WAV::String(name.into()))]);
            fx.member(die, "x", int_die, offsets[0]);
            fx.member(die, "y", int_die, offsets[1]);
        }
        fx.add(fx.root(), DW_TAG_structure_type, vec![
            (DW_AT_name, WAV::String(b"nothing".to_vec())),
        ]);

        let sections = fx.finish();
        let info = sections.debug_info().unwrap();
        let check = |id, name: &str| {
            let die = info.die_at(Fixture::offset_of(&info, name)).unwrap();
            struct_matches(&db, id, &die).unwrap()
        };

        assert!(check(s, "point_same"));
        assert!(!check(s, "point_moved"));
        assert!(!check(s, "union_same"));
        assert!(check(u, "union_same"));
        assert!(!check(u, "point_same"));
        assert!(!check(empty, "nothing"));
        assert!(!check(StructId(99), "point_same"));
    }
}
