// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

use super::{types, Error, Result, Session};
use crate::host::TypeRepr;
use tracing::{debug, warn};

impl<'db, 'dwarf, 'info> Session<'db, 'dwarf, 'info> {
    /// Retries member resolution for all structures that are still pending.
    ///
    /// Structures that can't be completed are logged and stay pending.
    pub fn run_second_pass(&mut self) {
        let pending: Vec<_> = self.cache.pending().collect();
        debug!("second pass over {} pending structures", pending.len());

        for offset in pending {
            match self.repair(offset) {
                Ok(true) => {
                    self.cache.clear_pending(offset);
                    self.stats.structs_repaired += 1;
                }
                Ok(false) => warn!("DIE {offset:#x}: structure still has unresolved members"),
                Err(err) => warn!("DIE {offset:#x}: failed to repair structure: {err}"),
            }
        }
    }

    /// Attaches the members that are missing from a pending structure.
    ///
    /// Returns whether all members could be attached.
    fn repair(&mut self, offset: u64) -> Result<bool> {
        let die = self.info.die_at(offset)?;
        let Some((ordinal, _)) = self.cache.get_type(offset) else {
            return Err(Error::NotAStructure(offset));
        };

        let id = match self.db.numbered_type(ordinal).map(|x| &x.repr) {
            Some(TypeRepr::Struct(id) | TypeRepr::Union(id)) => *id,
            _ => return Err(Error::NotAStructure(offset)),
        };

        let mut complete = true;
        for member in types::collect_members(&die)? {
            let present = self
                .db
                .struct_def(id)
                .is_some_and(|def| def.members.iter().any(|x| x.name == member.name));

            if !present {
                complete &= self.attach_member(offset, id, &member)?;
            }
        }

        Ok(complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{MemberType, MemoryDb, TypeDatabase};
    use crate::import::Config;
    use crate::testutil::Fixture;
    use gimli::constants::*;
    use gimli::write::{AttributeValue as WAV, UnitEntryId};

    fn named(name: &str) -> (gimli::DwAt, WAV) {
        (DW_AT_name, WAV::String(name.into()))
    }

    fn typed(ty: UnitEntryId) -> (gimli::DwAt, WAV) {
        (DW_AT_type, WAV::UnitRef(ty))
    }

    #[test]
    fn pending_structures_are_repaired() {
        let mut fx = Fixture::new();
        let int = fx.base_type("int", 4, DW_ATE_signed);

        // struct node { int value; struct node *next; };
        let node = fx.add(fx.root(), DW_TAG_structure_type, vec![named("node")]);
        let node_ptr = fx.add(fx.root(), DW_TAG_pointer_type, vec![typed(node)]);
        fx.member(node, "value", int, 0);
        fx.member(node, "next", node_ptr, 4);

        // struct a { struct b *other; }; defined before b, which points back.
        let a = fx.add(fx.root(), DW_TAG_structure_type, vec![named("a")]);
        let b = fx.add(fx.root(), DW_TAG_structure_type, vec![named("b")]);
        let a_ptr = fx.add(fx.root(), DW_TAG_pointer_type, vec![typed(a)]);
        let b_ptr = fx.add(fx.root(), DW_TAG_pointer_type, vec![typed(b)]);
        fx.member(a, "other", b_ptr, 0);
        fx.member(b, "back", a_ptr, 0);

        let sections = fx.finish();
        let info = sections.debug_info().unwrap();
        let mut db = MemoryDb::new(4);
        let mut session = Session::new(&info, &mut db, Config::default());

        session.run_types().unwrap();
        let node = Fixture::offset_of(&info, "node");
        let a = Fixture::offset_of(&info, "a");
        let b = Fixture::offset_of(&info, "b");
        assert_eq!(session.cache().get_type(node).map(|x| x.1), Some(true));

        // `b` is resolved from within `a`, so it is the one left waiting.
        assert_eq!(session.cache().get_type(a).map(|x| x.1), Some(false));
        assert_eq!(session.cache().get_type(b).map(|x| x.1), Some(true));
        let pending = session.stats().structs_pending;
        assert_eq!(pending, 2);

        session.run_second_pass();
        assert_eq!(session.cache().pending().count(), 0);
        assert_eq!(session.stats().structs_repaired, pending);
        drop(session);

        let id = db.find_struct("node").unwrap();
        let def = db.struct_def(id).unwrap();
        let members: Vec<_> = def
            .members
            .iter()
            .map(|x| (x.name.as_str(), x.offset, x.size))
            .collect();
        assert_eq!(members, [("value", 0, 4), ("next", 4, 4)]);

        let MemberType::Typed(next) = def.members[1].ty else {
            panic!("pointer attached through the wrong path");
        };
        assert_eq!(db.numbered_type(next).unwrap().name, "node *");

        let a = db.struct_def(db.find_struct("a").unwrap()).unwrap();
        assert_eq!(a.members.len(), 1);
        let b = db.struct_def(db.find_struct("b").unwrap()).unwrap();
        assert_eq!(b.members.len(), 1);
    }

    #[test]
    fn unresolvable_member_stays_pending() {
        let mut fx = Fixture::new();
        let s = fx.add(fx.root(), DW_TAG_structure_type, vec![named("s")]);
        let broken = fx.add(fx.root(), DW_TAG_base_type, vec![named("broken")]);
        fx.member(s, "x", broken, 0);

        let sections = fx.finish();
        let info = sections.debug_info().unwrap();
        let mut db = MemoryDb::new(4);
        let mut session = Session::new(&info, &mut db, Config::default());

        session.run_types().unwrap();
        session.run_second_pass();

        let s = Fixture::offset_of(&info, "s");
        assert_eq!(session.cache().get_type(s).map(|x| x.1), Some(true));
        assert_eq!(session.stats().structs_repaired, 0);
    }
}
