// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! In-memory DWARF fixtures for unit tests.

use crate::dwarf::{DebugInfo, Sections};
use fallible_iterator::FallibleIterator;
use gimli::constants::*;
use gimli::write::{
    self, Address, AttributeValue, EndianVec, Expression, LineProgram, Location, LocationList,
    LocationListId, Reference, Unit, UnitEntryId, UnitId,
};
use std::collections::HashMap;
use std::io::Write as _;

/// Builder for 32 bit DWARF 4 compilation units.
///
/// Entries are added to the most recently started unit. Every unit's base
/// address is 0, so location list ranges are absolute.
pub struct Fixture {
    dwarf: write::Dwarf,
    unit: UnitId,
}

impl Fixture {
    pub fn new() -> Self {
        let mut dwarf = write::Dwarf::new();
        let unit = Self::add_unit(&mut dwarf);
        Fixture { dwarf, unit }
    }

    fn add_unit(dwarf: &mut write::Dwarf) -> UnitId {
        let encoding = gimli::Encoding {
            format: gimli::Format::Dwarf32,
            version: 4,
            address_size: 4,
        };

        let name = format!("unit{}.c", dwarf.units.count());
        let id = dwarf.units.add(Unit::new(encoding, LineProgram::none()));
        let unit = dwarf.units.get_mut(id);
        let root = unit.root();
        let entry = unit.get_mut(root);
        entry.set(DW_AT_name, AttributeValue::String(name.into_bytes()));
        entry.set(DW_AT_low_pc, AttributeValue::Address(Address::Constant(0)));
        id
    }

    /// Starts another compilation unit and returns it.
    pub fn next_unit(&mut self) -> UnitId {
        self.unit = Self::add_unit(&mut self.dwarf);
        self.unit
    }

    /// Unit that entries are currently added to.
    pub fn unit(&self) -> UnitId {
        self.unit
    }

    /// Reference to an entry of any unit, encoded as `DW_FORM_ref_addr`.
    pub fn global_ref(unit: UnitId, entry: UnitEntryId) -> AttributeValue {
        AttributeValue::DebugInfoRef(Reference::Entry(unit, entry))
    }

    fn unit_mut(&mut self) -> &mut Unit {
        self.dwarf.units.get_mut(self.unit)
    }

    pub fn root(&self) -> UnitEntryId {
        self.dwarf.units.get(self.unit).root()
    }

    pub fn add(
        &mut self,
        parent: UnitEntryId,
        tag: gimli::DwTag,
        attrs: Vec<(gimli::DwAt, AttributeValue)>,
    ) -> UnitEntryId {
        let unit = self.unit_mut();
        let id = unit.add(parent, tag);
        let entry = unit.get_mut(id);
        for (name, value) in attrs {
            entry.set(name, value);
        }
        id
    }

    /// Adds an attribute to an existing entry.
    pub fn set(&mut self, id: UnitEntryId, name: gimli::DwAt, value: AttributeValue) {
        self.unit_mut().get_mut(id).set(name, value);
    }

    pub fn base_type(&mut self, name: &str, size: u64, encoding: gimli::DwAte) -> UnitEntryId {
        self.add(self.root(), DW_TAG_base_type, vec![
            (DW_AT_name, AttributeValue::String(name.into())),
            (DW_AT_byte_size, AttributeValue::Udata(size)),
            (DW_AT_encoding, AttributeValue::Encoding(encoding)),
        ])
    }

    /// Adds a structure member at a `DW_OP_plus_uconst` offset.
    pub fn member(
        &mut self,
        parent: UnitEntryId,
        name: &str,
        ty: UnitEntryId,
        offset: u64,
    ) -> UnitEntryId {
        let mut location = Expression::new();
        location.op_plus_uconst(offset);
        self.add(parent, DW_TAG_member, vec![
            (DW_AT_name, AttributeValue::String(name.into())),
            (DW_AT_type, AttributeValue::UnitRef(ty)),
            (DW_AT_data_member_location, AttributeValue::Exprloc(location)),
        ])
    }

    pub fn loclist(&mut self, entries: Vec<(u64, u64, Expression)>) -> LocationListId {
        let list = entries
            .into_iter()
            .map(|(begin, end, data)| Location::StartEnd {
                begin: Address::Constant(begin),
                end: Address::Constant(end),
                data,
            })
            .collect();

        self.unit_mut().locations.add(LocationList(list))
    }

    /// Encodes all units into raw section contents.
    pub fn encode(mut self) -> HashMap<gimli::SectionId, Vec<u8>> {
        let mut sections = write::Sections::new(EndianVec::new(gimli::LittleEndian));
        self.dwarf.write(&mut sections).unwrap();

        let mut data = HashMap::new();
        sections
            .for_each(|id, section| {
                if !section.slice().is_empty() {
                    data.insert(id, section.slice().to_vec());
                }
                Ok::<_, write::Error>(())
            })
            .unwrap();

        data
    }

    /// Encodes all units and hands out readable sections.
    pub fn finish(self) -> Sections<'static> {
        let mut data = self.encode();
        Sections::from_raw(|id| data.remove(&id))
    }

    /// Encodes all units into the debug sections of an ELF object.
    pub fn write_elf(self, arch: object::Architecture) -> tempfile::NamedTempFile {
        let mut obj = object::write::Object::new(
            object::BinaryFormat::Elf,
            arch,
            object::Endianness::Little,
        );
        for (id, data) in self.encode() {
            let name = id.name().as_bytes().to_vec();
            let section = obj.add_section(Vec::new(), name, object::SectionKind::Debug);
            obj.append_section_data(section, &data, 1);
        }

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&obj.write().unwrap()).unwrap();
        file.flush().unwrap();
        file
    }

    /// Offset of the first DIE carrying the given name.
    pub fn offset_of(info: &DebugInfo<'_>, name: &str) -> u64 {
        match Self::offsets_of(info, name).first() {
            Some(&offset) => offset,
            None => panic!("no DIE named `{name}`"),
        }
    }

    /// Offsets of all DIEs carrying the given name, in ascending order.
    ///
    /// Units that fail to decode are skipped.
    pub fn offsets_of(info: &DebugInfo<'_>, name: &str) -> Vec<u64> {
        let mut found = Vec::new();
        let mut units = info.units();
        loop {
            let root = match units.next() {
                Ok(Some(root)) => root,
                Ok(None) => break,
                Err(_) => continue,
            };

            let mut stack = vec![root];
            while let Some(die) = stack.pop() {
                if die.name().unwrap() == Some(name) {
                    found.push(die.offset());
                }
                stack.extend(die.next_sibling());
                stack.extend(die.first_child());
            }
        }

        found.sort_unstable();
        found
    }
}
