// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Placement of parameters, locals, labels and global variables.
//!
//! Stack variables are described relative to a frame base that may itself
//! move during the function: a location list for `DW_AT_frame_base` yields
//! one [`OffsetArea`] per address range.

use super::{Error, Result, Session};
use crate::dwarf::{Die, LocationAtom, LocationDesc};
use crate::host::{Function, MemberType, RegisterVar, StackVar};
use crate::regs::Arch;
use crate::{range_contains, VirtAddr};
use gimli::constants::*;
use std::ops::Range;
use tracing::{debug, warn};

/// Frame base offset valid within an address range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetArea {
    /// Addresses for which the offset holds.
    pub range: Range<VirtAddr>,
    /// Offset of the frame base relative to its register.
    pub offset: i64,
    /// Whether the frame base is relative to the frame pointer register.
    pub uses_frame_pointer: bool,
}

/// Frame base of a subprogram.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameBase {
    /// Known areas. Empty if the frame base couldn't be interpreted.
    pub areas: Vec<OffsetArea>,
    /// Offset of a frame base given as a single expression.
    pub base: i64,
    /// Whether the areas came from a location list.
    pub from_list: bool,
}

impl FrameBase {
    /// Interprets the decoded `DW_AT_frame_base` of a function.
    ///
    /// Descriptions that don't consist of a single register-relative atom
    /// are ignored.
    pub fn from_locations(descs: &[LocationDesc], func: Range<VirtAddr>, arch: Arch) -> Self {
        let mut frame = FrameBase::default();

        for desc in descs {
            let (offset, uses_frame_pointer) = match desc.single() {
                Some(LocationAtom::Breg { register, offset }) => {
                    (offset, register == arch.frame_pointer())
                }
                Some(LocationAtom::Reg(register)) => (0, register == arch.frame_pointer()),
                Some(LocationAtom::CallFrameCfa) => (0, false),
                other => {
                    debug!("ignoring frame base {other:?}");
                    continue;
                }
            };

            let range = match &desc.range {
                Some(range) => {
                    frame.from_list = true;
                    range.clone()
                }
                None => {
                    frame.base = offset;
                    func.clone()
                }
            };

            frame.areas.push(OffsetArea {
                range,
                offset,
                uses_frame_pointer,
            });
        }

        frame
    }

    /// Translates an `fbreg` operand into a stack offset.
    ///
    /// `location` is the address range of the variable's location, if it
    /// came from a location list. Without one, the first frame pointer area
    /// of a list frame base is used.
    pub fn stack_offset(&self, location: Option<&Range<VirtAddr>>, operand: i64) -> Option<i64> {
        if self.areas.is_empty() {
            return None;
        }

        if !self.from_list {
            return Some(self.base + operand);
        }

        let area = match location {
            Some(location) => self.areas.iter().find(|x| range_contains(&x.range, location)),
            None => self.areas.iter().find(|x| x.uses_frame_pointer),
        };

        area.map(|x| x.offset + operand)
    }
}

/// What became of a parameter or local variable.
enum Local {
    Placed,
    Skipped,
    /// Lives in static storage; handled like a global variable.
    Static,
}

impl<'db, 'dwarf, 'info> Session<'db, 'dwarf, 'info> {
    /// Frame phase handler.
    ///
    /// Returns whether the DIE's tag is handled in this phase. DIEs that
    /// aren't are classified as useless right away.
    pub(super) fn visit_frame(&mut self, die: &Die<'dwarf, 'info>) -> bool {
        let offset = die.offset();
        let result = match die.tag() {
            DW_TAG_subprogram => self.subprogram(die),
            DW_TAG_variable => self.global_variable(die),
            DW_TAG_label => self.label(die),
            _ => {
                self.cache.mark_useless(offset);
                return false;
            }
        };

        self.stats.dies_dispatched += 1;

        match result {
            Ok(true) => {
                self.cache.mark_variable(offset);
            }
            Ok(false) => self.cache.mark_useless(offset),
            Err(err) => {
                self.failed(offset, &err);
                self.cache.mark_useless(offset);
            }
        }

        true
    }

    /// Places the parameters and locals of a function.
    ///
    /// The subprogram itself never registers anything, so this always
    /// returns `false` on success.
    fn subprogram(&mut self, die: &Die<'dwarf, 'info>) -> Result<bool> {
        let Some(low_pc) = die.address(DW_AT_low_pc)? else {
            return Ok(false);
        };

        let Some(func) = self.db.function_at(low_pc) else {
            debug!("DIE {:#x}: no function at {low_pc:#x}", die.offset());
            return Ok(false);
        };

        let frame = match die.locations(DW_AT_frame_base)? {
            Some(descs) => FrameBase::from_locations(&descs, func.range(), self.config.arch),
            None => FrameBase::default(),
        };

        for child in die.children() {
            let offset = child.offset();
            let is_local = matches!(child.tag(), DW_TAG_formal_parameter | DW_TAG_variable);
            if !is_local || self.cache.has(offset) {
                continue;
            }

            match self.place_local(&func, &frame, &child) {
                Ok(Local::Placed) => {
                    self.stats.variables_placed += 1;
                    self.cache.mark_variable(offset);
                }
                Ok(Local::Skipped) => {
                    self.stats.variables_skipped += 1;
                    self.cache.mark_useless(offset);
                }
                Ok(Local::Static) => {}
                Err(err) => {
                    self.failed(offset, &err);
                    self.stats.variables_skipped += 1;
                    self.cache.mark_useless(offset);
                }
            }
        }

        Ok(false)
    }

    fn place_local(
        &mut self,
        func: &Function,
        frame: &FrameBase,
        die: &Die<'dwarf, 'info>,
    ) -> Result<Local> {
        let offset = die.offset();
        let Some(name) = die.name()? else {
            return Ok(Local::Skipped);
        };

        let Some(descs) = die.locations(DW_AT_location)? else {
            debug!("DIE {offset:#x}: `{name}` has no location");
            return Ok(Local::Skipped);
        };

        let arch = self.config.arch;
        let mut placed = false;

        for desc in &descs {
            let Some(atom) = desc.single() else {
                debug!("DIE {offset:#x}: `{name}` has {} location atoms", desc.atoms.len());
                continue;
            };

            let stack_offset = match atom {
                LocationAtom::Reg(register) => {
                    let range = desc.range.as_ref();
                    placed |= self.place_in_register(func, name, range, register, arch);
                    continue;
                }
                LocationAtom::Breg {
                    register,
                    offset: operand,
                } if register == arch.frame_pointer() => operand,
                LocationAtom::Fbreg(operand) => {
                    match frame.stack_offset(desc.range.as_ref(), operand) {
                        Some(stack_offset) => stack_offset,
                        None => {
                            debug!("DIE {offset:#x}: `{name}` isn't covered by the frame base");
                            continue;
                        }
                    }
                }
                LocationAtom::Addr(_) => return Ok(Local::Static),
                other => {
                    debug!("DIE {offset:#x}: `{name}` has unsupported location {other:?}");
                    continue;
                }
            };

            placed |= self.place_on_stack(func, die, name, stack_offset)?;
        }

        Ok(if placed { Local::Placed } else { Local::Skipped })
    }

    fn place_in_register(
        &mut self,
        func: &Function,
        name: &str,
        range: Option<&Range<VirtAddr>>,
        register: u16,
        arch: Arch,
    ) -> bool {
        // A register without a range doesn't tell where the value lives.
        let Some(range) = range else {
            debug!("`{name}` is in register {register} for an unknown range");
            return false;
        };

        let Some(reg_name) = arch.register_name(register) else {
            debug!("`{name}` is in unknown register {register}");
            return false;
        };

        self.db.add_register_variable(func.start, RegisterVar {
            range: range.clone(),
            register: reg_name.to_owned(),
            name: name.to_owned(),
        })
    }

    fn place_on_stack(
        &mut self,
        func: &Function,
        die: &Die<'dwarf, 'info>,
        name: &str,
        offset: i64,
    ) -> Result<bool> {
        if self.db.stack_variable(func.start, name).is_some() {
            return Ok(true);
        }

        let (ty, size) = match self.cached_type(die)? {
            Some((ty, size)) => (Some(ty), size),
            None => (None, 0),
        };

        Ok(self.db.add_stack_variable(func.start, StackVar {
            name: name.to_owned(),
            offset,
            size,
            ty,
        }))
    }

    /// The cached type of a variable, with its size.
    ///
    /// Types of unknown size are logged and treated as absent.
    fn cached_type(&self, die: &Die<'dwarf, 'info>) -> Result<Option<(MemberType, u64)>> {
        let Some(type_offset) = die.ref_offset(DW_AT_type)? else {
            return Ok(None);
        };

        let Some((ordinal, _)) = self.cache.get_type(type_offset) else {
            return Ok(None);
        };

        match self.sized_member_type(ordinal) {
            Ok(sized) => Ok(Some(sized)),
            Err(err @ Error::SizeUnknown(_)) => {
                warn!("DIE {:#x}: leaving untyped: {err}", die.offset());
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Names a variable in static storage and applies its type.
    fn global_variable(&mut self, die: &Die<'dwarf, 'info>) -> Result<bool> {
        if die.flag(DW_AT_declaration)? {
            return Ok(false);
        }

        let Some(descs) = die.locations(DW_AT_location)? else {
            return Ok(false);
        };

        let addr = match descs.as_slice() {
            [desc] => match desc.single() {
                Some(LocationAtom::Addr(addr)) => addr,
                _ => return Ok(false),
            },
            _ => return Ok(false),
        };

        // Definitions of members declared elsewhere carry neither name nor
        // type themselves.
        let decl = die.follow(DW_AT_specification)?;
        let source = match &decl {
            Some(decl) if !die.has_attr(DW_AT_name)? => decl,
            _ => die,
        };

        let Some(name) = source.name()? else {
            return Ok(false);
        };

        if let Some((ty, size)) = self.cached_type(source)? {
            self.db.apply_type(addr, ty, size);
        }

        if !self.db.set_name(addr, name, false) {
            debug!("DIE {:#x}: can't name {addr:#x} `{name}`", die.offset());
            return Ok(false);
        }

        self.stats.globals_placed += 1;
        Ok(true)
    }

    /// Names the address of a label.
    fn label(&mut self, die: &Die<'dwarf, 'info>) -> Result<bool> {
        let mut name = die.name()?.map(str::to_owned);
        let mut addr = die.address(DW_AT_low_pc)?;

        if name.is_none() != addr.is_none() {
            if let Some(origin) = die.follow(DW_AT_abstract_origin)? {
                if name.is_none() {
                    name = origin.name()?.map(str::to_owned);
                }
                if addr.is_none() {
                    addr = origin.address(DW_AT_low_pc)?;
                }
            }
        }

        let (Some(name), Some(addr)) = (name, addr) else {
            return Ok(false);
        };

        if !self.db.set_name(addr, &name, true) {
            debug!("DIE {:#x}: can't name {addr:#x} `{name}`", die.offset());
            return Ok(false);
        }

        self.stats.labels_named += 1;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Classification;
    use crate::host::{MemoryDb, TypeDatabase};
    use crate::import::Config;
    use crate::testutil::Fixture;
    use gimli::write::{Address, AttributeValue as WAV, Expression, UnitEntryId};
    use gimli::Register;
    use smallvec::smallvec;

    fn desc(range: Option<Range<u64>>, atom: LocationAtom) -> LocationDesc {
        LocationDesc {
            range,
            atoms: smallvec![atom],
        }
    }

    #[test]
    fn frame_base_from_list() {
        let descs = [
            desc(Some(0x10..0x20), LocationAtom::Breg {
                register: 5,
                offset: -8,
            }),
            desc(Some(0x20..0x30), LocationAtom::Breg {
                register: 4,
                offset: 16,
            }),
            desc(Some(0x30..0x40), LocationAtom::Unsupported),
        ];

        let frame = FrameBase::from_locations(&descs, 0x10..0x40, Arch::X86);
        assert!(frame.from_list);
        assert_eq!(frame.areas.len(), 2);
        assert!(frame.areas[0].uses_frame_pointer);
        assert!(!frame.areas[1].uses_frame_pointer);

        assert_eq!(frame.stack_offset(Some(&(0x10..0x18)), 4), Some(-4));
        assert_eq!(frame.stack_offset(Some(&(0x24..0x28)), 4), Some(20));
        assert_eq!(frame.stack_offset(Some(&(0x18..0x28)), 4), None);
        assert_eq!(frame.stack_offset(Some(&(0x30..0x38)), 4), None);
        assert_eq!(frame.stack_offset(None, 4), Some(-4));
    }

    #[test]
    fn frame_base_from_expression() {
        let descs = [desc(None, LocationAtom::CallFrameCfa)];
        let frame = FrameBase::from_locations(&descs, 0x10..0x40, Arch::X86);
        assert!(!frame.from_list);
        assert_eq!(frame.areas[0].range, 0x10..0x40);
        assert_eq!(frame.stack_offset(Some(&(0x100..0x200)), -12), Some(-12));

        let frame = FrameBase::from_locations(
            &[desc(None, LocationAtom::Breg {
                register: 6,
                offset: 16,
            })],
            0x10..0x40,
            Arch::X86_64,
        );
        assert!(frame.areas[0].uses_frame_pointer);
        assert_eq!(frame.stack_offset(None, -4), Some(12));

        assert_eq!(FrameBase::default().stack_offset(None, 4), None);
    }

    fn exprloc(build: impl FnOnce(&mut Expression)) -> WAV {
        let mut expr = Expression::new();
        build(&mut expr);
        WAV::Exprloc(expr)
    }

    fn local(
        fx: &mut Fixture,
        parent: UnitEntryId,
        name: &str,
        location: WAV,
        ty: Option<UnitEntryId>,
    ) {
        let mut attrs = vec![
            (DW_AT_name, WAV::String(name.into())),
            (DW_AT_location, location),
        ];
        attrs.extend(ty.map(|ty| (DW_AT_type, WAV::UnitRef(ty))));
        fx.add(parent, DW_TAG_variable, attrs);
    }

    #[test]
    fn function_variables() {
        let mut fx = Fixture::new();
        let int = fx.base_type("int", 4, DW_ATE_signed);
        let void = fx.add(fx.root(), DW_TAG_unspecified_type, vec![
            (DW_AT_name, WAV::String(b"void".to_vec())),
        ]);

        let mut frame_base = Expression::new();
        frame_base.op_breg(Register(5), -8);
        let frame_base = fx.loclist(vec![(0x10, 0x20, frame_base)]);
        let func = fx.add(fx.root(), DW_TAG_subprogram, vec![
            (DW_AT_name, WAV::String(b"main".to_vec())),
            (DW_AT_low_pc, WAV::Address(Address::Constant(0x10))),
            (DW_AT_frame_base, WAV::LocationListRef(frame_base)),
        ]);

        let mut fbreg = Expression::new();
        fbreg.op_fbreg(4);
        let x = fx.loclist(vec![(0x10, 0x18, fbreg)]);
        local(&mut fx, func, "x", WAV::LocationListRef(x), Some(int));

        fx.add(func, DW_TAG_formal_parameter, vec![
            (DW_AT_name, WAV::String(b"argc".to_vec())),
            (DW_AT_location, exprloc(|e| e.op_breg(Register(5), 8))),
            (DW_AT_type, WAV::UnitRef(int)),
        ]);

        let mut reg = Expression::new();
        reg.op_reg(Register(0));
        let r = fx.loclist(vec![(0x10, 0x14, reg)]);
        local(&mut fx, func, "r", WAV::LocationListRef(r), Some(int));

        let mut fbreg = Expression::new();
        fbreg.op_fbreg(4);
        let far = fx.loclist(vec![(0x20, 0x28, fbreg)]);
        local(&mut fx, func, "far", WAV::LocationListRef(far), Some(int));

        local(&mut fx, func, "multi", exprloc(|e| {
            e.op_breg(Register(5), 0);
            e.op_deref();
        }), None);
        local(&mut fx, func, "unsupported", exprloc(|e| e.op(DW_OP_lit0)), None);
        local(&mut fx, func, "in_reg", exprloc(|e| e.op_reg(Register(1))), None);
        local(&mut fx, func, "opaque", exprloc(|e| e.op_fbreg(-16)), Some(void));
        let counter = exprloc(|e| e.op_addr(Address::Constant(0x3000)));
        local(&mut fx, func, "counter", counter, Some(int));

        let sections = fx.finish();
        let info = sections.debug_info().unwrap();
        let mut db = MemoryDb::new(4);
        db.add_function(0x10..0x40);

        let mut session = Session::new(&info, &mut db, Config::default());
        session.run_types().unwrap();
        session.run_frames().unwrap();

        let stats = session.stats().clone();
        assert_eq!(stats.variables_placed, 4);
        assert_eq!(stats.variables_skipped, 4);
        assert_eq!(stats.globals_placed, 1);

        let x = Fixture::offset_of(&info, "x");
        let far = Fixture::offset_of(&info, "far");
        assert_eq!(session.cache().get(x), Some(Classification::Variable));
        assert_eq!(session.cache().get(far), Some(Classification::Useless));
        drop(session);

        let int = MemberType::Typed(db.named_type("int").unwrap());
        let vars: Vec<_> = db
            .stack_variables(0x10)
            .iter()
            .map(|v| (v.name.as_str(), v.offset, v.size, v.ty))
            .collect();
        assert_eq!(vars, [
            ("x", -4, 4, Some(int)),
            ("argc", 8, 4, Some(int)),
            ("opaque", -24, 0, None),
        ]);

        assert_eq!(db.register_variables(0x10), [RegisterVar {
            range: 0x10..0x14,
            register: "eax".into(),
            name: "r".into(),
        }]);

        // Static locals take the global path.
        assert_eq!(db.name_at(0x3000), Some(("counter", false)));
        assert_eq!(db.applied_type(0x3000), Some((int, 4)));
    }

    #[test]
    fn function_without_record() {
        let mut fx = Fixture::new();
        let func = fx.add(fx.root(), DW_TAG_subprogram, vec![
            (DW_AT_name, WAV::String(b"orphan".to_vec())),
            (DW_AT_low_pc, WAV::Address(Address::Constant(0x100))),
        ]);
        local(&mut fx, func, "x", exprloc(|e| e.op_fbreg(4)), None);

        let sections = fx.finish();
        let info = sections.debug_info().unwrap();
        let mut db = MemoryDb::new(4);
        let mut session = Session::new(&info, &mut db, Config::default());
        session.run_frames().unwrap();

        let orphan = Fixture::offset_of(&info, "orphan");
        let x = Fixture::offset_of(&info, "x");
        assert_eq!(session.cache().get(orphan), Some(Classification::Useless));
        assert_eq!(session.cache().get(x), Some(Classification::Useless));
        assert_eq!(session.stats().variables_placed, 0);
    }

    #[test]
    fn labels() {
        let mut fx = Fixture::new();
        fx.add(fx.root(), DW_TAG_label, vec![
            (DW_AT_name, WAV::String(b"done".to_vec())),
            (DW_AT_low_pc, WAV::Address(Address::Constant(0x18))),
        ]);

        let origin = fx.add(fx.root(), DW_TAG_label, vec![
            (DW_AT_name, WAV::String(b"retry".to_vec())),
        ]);
        fx.add(fx.root(), DW_TAG_label, vec![
            (DW_AT_abstract_origin, WAV::UnitRef(origin)),
            (DW_AT_low_pc, WAV::Address(Address::Constant(0x1c))),
        ]);

        let sections = fx.finish();
        let info = sections.debug_info().unwrap();
        let mut db = MemoryDb::new(4);
        let mut session = Session::new(&info, &mut db, Config::default());
        session.run_frames().unwrap();

        assert_eq!(session.stats().labels_named, 2);
        let retry = Fixture::offset_of(&info, "retry");
        assert_eq!(session.cache().get(retry), Some(Classification::Useless));
        drop(session);

        assert_eq!(db.name_at(0x18), Some(("done", true)));
        assert_eq!(db.name_at(0x1c), Some(("retry", true)));
    }

    #[test]
    fn globals() {
        let mut fx = Fixture::new();
        let int = fx.base_type("int", 4, DW_ATE_signed);
        let addr = |addr| exprloc(|e| e.op_addr(Address::Constant(addr)));

        let root = fx.root();
        local(&mut fx, root, "total", addr(0x1000), Some(int));
        fx.add(fx.root(), DW_TAG_variable, vec![
            (DW_AT_name, WAV::String(b"external".to_vec())),
            (DW_AT_declaration, WAV::Flag(true)),
        ]);

        // `int config::limit = 4;` declared in the class, defined outside.
        let decl = fx.add(fx.root(), DW_TAG_variable, vec![
            (DW_AT_name, WAV::String(b"limit".to_vec())),
            (DW_AT_type, WAV::UnitRef(int)),
            (DW_AT_declaration, WAV::Flag(true)),
        ]);
        fx.add(fx.root(), DW_TAG_variable, vec![
            (DW_AT_specification, WAV::UnitRef(decl)),
            (DW_AT_location, addr(0x2000)),
        ]);

        local(&mut fx, root, "on_stack", exprloc(|e| e.op_fbreg(8)), Some(int));

        let sections = fx.finish();
        let info = sections.debug_info().unwrap();
        let mut db = MemoryDb::new(4);
        let mut session = Session::new(&info, &mut db, Config::default());
        session.run_types().unwrap();
        session.run_frames().unwrap();

        assert_eq!(session.stats().globals_placed, 2);
        let external = Fixture::offset_of(&info, "external");
        assert_eq!(session.cache().get(external), Some(Classification::Useless));
        drop(session);

        let int = MemberType::Typed(db.named_type("int").unwrap());
        assert_eq!(db.name_at(0x1000), Some(("total", false)));
        assert_eq!(db.applied_type(0x1000), Some((int, 4)));
        assert_eq!(db.name_at(0x2000), Some(("limit", false)));
        assert_eq!(db.applied_type(0x2000), Some((int, 4)));
    }
}
