// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Handlers for type DIEs.
//!
//! Every handler returns an [`Outcome`]; [`Session::visit_type`] is the only
//! place that turns it into a cache classification. Types referenced by a
//! DIE are resolved out of band through [`Session::resolve_type_at`], which
//! recurses into [`Session::visit_type`] for DIEs that weren't seen yet.

use super::{compare, Error, Result, Session};
use crate::cache::Classification;
use crate::dwarf::{self, Die};
use crate::host::{
    BoolWidth, EnumId, FloatWidth, IntWidth, Member, Ordinal, StructId, TypeDatabase, TypeRepr,
};
use gimli::constants::*;
use tracing::{debug, warn};

/// Result of a type handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Outcome {
    /// The DIE produced a type.
    Type { ordinal: Ordinal, pending: bool },

    /// The DIE doesn't produce a type.
    Useless,

    /// The DIE depends on a type whose resolution is still on the stack.
    /// Nothing is cached, so the DIE is looked at again later.
    Deferred,
}

/// Result of resolving a type reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum TypeRef {
    Resolved(Ordinal),
    InProgress,
    Missing,
}

impl TypeRef {
    /// The ordinal, or the outcome of a handler that can't do without it.
    fn required(self) -> Result<Ordinal, Outcome> {
        match self {
            TypeRef::Resolved(ordinal) => Ok(ordinal),
            TypeRef::InProgress => Err(Outcome::Deferred),
            TypeRef::Missing => Err(Outcome::Useless),
        }
    }
}

/// Member of a structure as described by the DIE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct MemberLayout {
    pub name: String,
    pub offset: u64,
    pub type_offset: Option<u64>,
}

/// Checks whether DIEs with the given tag are handled during the type pass.
pub(super) fn is_type_tag(tag: gimli::DwTag) -> bool {
    matches!(
        tag,
        DW_TAG_base_type
            | DW_TAG_unspecified_type
            | DW_TAG_enumeration_type
            | DW_TAG_const_type
            | DW_TAG_volatile_type
            | DW_TAG_pointer_type
            | DW_TAG_typedef
            | DW_TAG_array_type
            | DW_TAG_structure_type
            | DW_TAG_union_type
            | DW_TAG_subroutine_type
    )
}

/// Reads the member layout of a structure or union DIE.
///
/// Anonymous members are named after their offset. Members of unions are
/// all placed at offset 0.
pub(super) fn collect_members(die: &Die<'_, '_>) -> Result<Vec<MemberLayout>> {
    let is_union = die.tag() == DW_TAG_union_type;
    let mut members = Vec::new();

    for child in die.children() {
        if child.tag() != DW_TAG_member {
            continue;
        }

        // DWARF permits omitting the location for members at offset 0.
        let offset = match child.member_offset()? {
            Some(offset) if !is_union => offset,
            _ => 0,
        };

        let name = match child.name()? {
            Some(name) => name.to_owned(),
            None => format!("field_{offset:X}"),
        };

        members.push(MemberLayout {
            name,
            offset,
            type_offset: child.ref_offset(DW_AT_type)?,
        });
    }

    Ok(members)
}

/// Number of elements recorded by a subrange DIE; 0 if unknown.
fn upper_bound(subrange: &Die<'_, '_>) -> u64 {
    match subrange.opt_small_value(DW_AT_upper_bound) {
        Ok(Some(bound)) if bound >= 0 => bound as u64,
        Ok(_) => 0,
        Err(err) => {
            debug!("DIE {:#x}: ignoring upper bound: {err}", subrange.offset());
            0
        }
    }
}

impl<'db, 'dwarf, 'info> Session<'db, 'dwarf, 'info> {
    /// Resolves a type DIE, consulting and updating the offset cache.
    pub(super) fn visit_type(&mut self, die: &Die<'dwarf, 'info>) -> Outcome {
        let offset = die.offset();

        match self.cache.get(offset) {
            Some(Classification::Type { ordinal, pending }) => {
                return Outcome::Type { ordinal, pending };
            }
            Some(_) => return Outcome::Useless,
            None => {}
        }

        if !self.in_progress.insert(offset) {
            return Outcome::Deferred;
        }

        self.stats.dies_dispatched += 1;
        self.depth += 1;

        let result = if self.depth > self.config.max_resolve_depth {
            Err(Error::ResolveDepthExceeded(self.config.max_resolve_depth))
        } else {
            self.type_handler(die)
        };

        self.depth -= 1;
        self.in_progress.remove(&offset);

        let outcome = result.unwrap_or_else(|err| {
            self.failed(offset, &err);
            Outcome::Useless
        });

        match outcome {
            Outcome::Type { ordinal, pending } => {
                if self.cache.mark_type(offset, ordinal, pending) {
                    self.stats.types_registered += 1;
                    self.stats.structs_pending += u64::from(pending);
                }
            }
            Outcome::Useless => self.cache.mark_useless(offset),
            Outcome::Deferred => debug!("DIE {offset:#x}: deferred"),
        }

        outcome
    }

    /// Resolves the type DIE at `offset`.
    pub(super) fn resolve_type_at(&mut self, offset: u64) -> TypeRef {
        match self.cache.get(offset) {
            Some(Classification::Type { ordinal, .. }) => return TypeRef::Resolved(ordinal),
            Some(_) => return TypeRef::Missing,
            None => {}
        }

        if self.in_progress.contains(&offset) {
            return TypeRef::InProgress;
        }

        let die = match self.info.die_at(offset) {
            Ok(die) => die,
            Err(err) => {
                self.failed(offset, &err.into());
                self.cache.mark_useless(offset);
                return TypeRef::Missing;
            }
        };

        match self.visit_type(&die) {
            Outcome::Type { ordinal, .. } => TypeRef::Resolved(ordinal),
            Outcome::Useless => TypeRef::Missing,
            Outcome::Deferred => TypeRef::InProgress,
        }
    }

    /// Resolves the type referenced by `DW_AT_type`. No reference means
    /// `void`.
    fn target_type(&mut self, die: &Die<'dwarf, 'info>) -> Result<TypeRef> {
        match die.ref_offset(DW_AT_type)? {
            Some(offset) => Ok(self.resolve_type_at(offset)),
            None => Ok(TypeRef::Resolved(self.void()?)),
        }
    }

    fn void(&mut self) -> Result<Ordinal> {
        self.register("void", TypeRepr::Void)
    }

    fn type_handler(&mut self, die: &Die<'dwarf, 'info>) -> Result<Outcome> {
        match die.tag() {
            DW_TAG_base_type => self.base_type(die),
            DW_TAG_unspecified_type => self.unspecified_type(die),
            DW_TAG_enumeration_type => self.enumeration(die),
            DW_TAG_const_type | DW_TAG_volatile_type | DW_TAG_pointer_type => self.modifier(die),
            DW_TAG_typedef => self.typedef(die),
            DW_TAG_array_type => self.array(die),
            DW_TAG_structure_type | DW_TAG_union_type => self.structure(die),
            DW_TAG_subroutine_type => self.subroutine(die),
            tag => {
                debug!("DIE {:#x}: {tag} doesn't describe a type", die.offset());
                Ok(Outcome::Useless)
            }
        }
    }

    /// Registers a named type, reusing an identical one if present.
    ///
    /// If the name is taken by a different type, `_` is appended and the
    /// lookup repeated.
    fn register(&mut self, name: &str, repr: TypeRepr) -> Result<Ordinal> {
        let mut candidate = name.to_owned();

        for _ in 0..=self.config.max_name_suffixes {
            match self.db.named_type(&candidate) {
                Some(ordinal) => {
                    if self.db.numbered_type(ordinal).is_some_and(|ty| ty.repr == repr) {
                        return Ok(ordinal);
                    }
                }
                None => {
                    if let Some(ordinal) = self.db.add_named_type(&candidate, repr.clone()) {
                        return Ok(ordinal);
                    }
                }
            }

            candidate.push('_');
        }

        Err(Error::NameExhausted(name.to_owned()))
    }

    /// Duplicate-insert loop for enumerations and structures.
    ///
    /// Tries `name`, `name_`, `name__`, ... until either an existing entity
    /// of that name is structurally equal or a new one can be created.
    /// Returns the entity and whether it existed before.
    fn insert_dup<Id: Copy>(
        &mut self,
        name: &str,
        find: impl Fn(&dyn TypeDatabase, &str) -> Option<Id>,
        matches: impl Fn(&Self, Id) -> Result<bool>,
        add: impl Fn(&mut dyn TypeDatabase, &str) -> Option<Id>,
    ) -> Result<(Id, bool)> {
        let mut candidate = name.to_owned();

        for _ in 0..=self.config.max_name_suffixes {
            if let Some(id) = find(&*self.db, &candidate) {
                if matches(&*self, id)? {
                    return Ok((id, true));
                }
            } else if let Some(id) = add(&mut *self.db, &candidate) {
                return Ok((id, false));
            }

            candidate.push('_');
        }

        Err(Error::NameExhausted(name.to_owned()))
    }

    fn base_type(&mut self, die: &Die<'dwarf, 'info>) -> Result<Outcome> {
        let offset = die.offset();
        let name = die.required_name()?.to_owned();
        let size = die.byte_size()?;
        let raw_encoding = die.small_value(DW_AT_encoding)?;

        let unexpected_size =
            || warn!("DIE {offset:#x}: base type `{name}` has unexpected size {size}");

        let Ok(encoding) = u8::try_from(raw_encoding).map(gimli::DwAte) else {
            debug!("DIE {offset:#x}: base type `{name}` has invalid encoding {raw_encoding}");
            return Ok(Outcome::Useless);
        };

        let repr = match encoding {
            DW_ATE_boolean => TypeRepr::Bool(BoolWidth::from_size(size).unwrap_or_else(|| {
                unexpected_size();
                BoolWidth::Default
            })),
            DW_ATE_float => TypeRepr::Float(FloatWidth::from_size(size).unwrap_or_else(|| {
                unexpected_size();
                FloatWidth::Default
            })),
            DW_ATE_signed | DW_ATE_unsigned => TypeRepr::Int {
                width: IntWidth::from_size(size).unwrap_or_else(|| {
                    unexpected_size();
                    IntWidth::Natural
                }),
                signed: encoding == DW_ATE_signed,
                is_char: false,
            },
            DW_ATE_signed_char | DW_ATE_unsigned_char => {
                if size != 1 {
                    unexpected_size();
                }

                TypeRepr::Int {
                    width: IntWidth::W8,
                    signed: encoding == DW_ATE_signed_char,
                    is_char: true,
                }
            }
            DW_ATE_UTF => TypeRepr::Int {
                width: IntWidth::from_size(size).unwrap_or_else(|| {
                    unexpected_size();
                    IntWidth::W8
                }),
                signed: false,
                is_char: true,
            },
            _ => {
                debug!("DIE {offset:#x}: base type `{name}` has unsupported encoding {encoding}");
                return Ok(Outcome::Useless);
            }
        };

        let ordinal = self.register(&name, repr)?;
        Ok(Outcome::Type {
            ordinal,
            pending: false,
        })
    }

    fn unspecified_type(&mut self, die: &Die<'dwarf, 'info>) -> Result<Outcome> {
        let name = die.name()?.unwrap_or("void");
        let ordinal = self.register(name, TypeRepr::Void)?;
        Ok(Outcome::Type {
            ordinal,
            pending: false,
        })
    }

    /// Registers an opaque placeholder for a declaration without definition.
    ///
    /// An already complete record of the same name is used as is.
    fn forward_declaration(&mut self, die: &Die<'dwarf, 'info>) -> Result<Outcome> {
        let name = die.required_name()?;

        if let Some(ordinal) = self.db.named_type(name) {
            let complete = self.db.numbered_type(ordinal).is_some_and(|ty| {
                matches!(
                    ty.repr,
                    TypeRepr::Struct(_) | TypeRepr::Union(_) | TypeRepr::Enum(_)
                )
            });

            if complete {
                return Ok(Outcome::Type {
                    ordinal,
                    pending: false,
                });
            }
        }

        let ordinal = self.register(name, TypeRepr::Opaque)?;
        Ok(Outcome::Type {
            ordinal,
            pending: false,
        })
    }

    fn enumeration(&mut self, die: &Die<'dwarf, 'info>) -> Result<Outcome> {
        // Enumerators carry no type of their own.
        for child in die.children() {
            if child.tag() == DW_TAG_enumerator {
                self.cache.mark_useless(child.offset());
            }
        }

        if die.flag(DW_AT_declaration)? {
            return self.forward_declaration(die);
        }

        let size = die.byte_size()?;
        let width = match size {
            1 | 2 | 4 | 8 | 16 => size as u8,
            _ => {
                warn!("DIE {:#x}: enumeration has unexpected size {size}", die.offset());
                4
            }
        };

        // Read all enumerators up front so that a malformed one can't leave
        // a half-built enumeration behind.
        let mut constants = Vec::new();
        for child in die.children() {
            if child.tag() == DW_TAG_enumerator {
                let value = child.small_value(DW_AT_const_value)? as u64;
                constants.push((child.required_name()?.to_owned(), value));
            }
        }

        let (id, existed) = match die.name()? {
            Some(name) => self.insert_dup(
                name,
                |db, name| db.find_enum(name),
                |session, id| compare::enum_matches(&*session.db, id, die),
                |db, name| db.add_enum(Some(name), width),
            )?,
            None => self.add_anonymous_enum(die, width)?,
        };

        if !existed {
            for (constant, value) in &constants {
                if !self.db.add_enum_constant(id, constant, *value) {
                    debug!("DIE {:#x}: duplicate enumerator `{constant}`", die.offset());
                }
            }
        }

        let Some(def) = self.db.enum_def(id) else {
            return Err(Error::UnknownEnum(id));
        };

        Ok(Outcome::Type {
            ordinal: def.ordinal,
            pending: false,
        })
    }

    /// Anonymous enumerations are looked up by their first enumerator.
    fn add_anonymous_enum(
        &mut self,
        die: &Die<'dwarf, 'info>,
        width: u8,
    ) -> Result<(EnumId, bool)> {
        if let Some(first) = die.children().find(|x| x.tag() == DW_TAG_enumerator) {
            if let Some(id) = self.db.enum_with_constant(first.required_name()?) {
                if compare::enum_matches(&*self.db, id, die)? {
                    return Ok((id, true));
                }
            }
        }

        match self.db.add_enum(None, width) {
            Some(id) => Ok((id, false)),
            None => Err(Error::NameExhausted("<anonymous enum>".into())),
        }
    }

    fn modifier(&mut self, die: &Die<'dwarf, 'info>) -> Result<Outcome> {
        let target = match self.target_type(die)?.required() {
            Ok(target) => target,
            Err(outcome) => return Ok(outcome),
        };

        let target_name = self.type_name(target)?;
        let (name, repr) = match die.tag() {
            DW_TAG_const_type => (format!("{target_name} const"), TypeRepr::Const(target)),
            DW_TAG_volatile_type => (format!("{target_name} volatile"), TypeRepr::Volatile(target)),
            _ => (format!("{target_name} *"), TypeRepr::Pointer(target)),
        };

        let ordinal = self.register(&name, repr)?;
        Ok(Outcome::Type {
            ordinal,
            pending: false,
        })
    }

    fn typedef(&mut self, die: &Die<'dwarf, 'info>) -> Result<Outcome> {
        let name = die.required_name()?;
        let target = match self.target_type(die)?.required() {
            Ok(target) => target,
            Err(outcome) => return Ok(outcome),
        };

        let ordinal = match self.equivalent_typedef(name, target)? {
            Some(existing) => existing,
            None => {
                let target_name = self.type_name(target)?;
                self.register(name, TypeRepr::Typedef(target_name))?
            }
        };

        Ok(Outcome::Type {
            ordinal,
            pending: false,
        })
    }

    /// Finds a typedef `name` whose target is structurally equal to the
    /// record that `target` was created from.
    fn equivalent_typedef(&self, name: &str, target: Ordinal) -> Result<Option<Ordinal>> {
        let Some(existing) = self.db.named_type(name) else {
            return Ok(None);
        };

        let aliased = match self.db.numbered_type(existing) {
            Some(ty) => match &ty.repr {
                TypeRepr::Typedef(aliased) => aliased,
                _ => return Ok(None),
            },
            None => return Ok(None),
        };

        let aliased = self
            .db
            .named_type(aliased)
            .and_then(|x| self.db.numbered_type(x));
        let Some(aliased) = aliased else {
            return Ok(None);
        };

        let Some(offset) = self.cache.type_offset(target) else {
            return Ok(None);
        };

        let die = self.info.die_at(offset)?;
        let equal = match aliased.repr {
            TypeRepr::Struct(id) | TypeRepr::Union(id) => self.equivalent_struct(id, &die)?,
            TypeRepr::Enum(id) => compare::enum_matches(&*self.db, id, &die)?,
            _ => false,
        };

        Ok(equal.then_some(existing))
    }

    fn array(&mut self, die: &Die<'dwarf, 'info>) -> Result<Outcome> {
        if !die.has_attr(DW_AT_type)? {
            return Err(dwarf::Error::MissingAttribute(DW_AT_type).into());
        }

        let element = match self.target_type(die)?.required() {
            Ok(element) => element,
            Err(outcome) => return Ok(outcome),
        };

        // Only the first dimension is looked at.
        let count = die
            .children()
            .find(|x| x.tag() == DW_TAG_subrange_type)
            .map_or(0, |x| upper_bound(&x));

        let element_name = self.type_name(element)?;
        let name = match count {
            0 => format!("{element_name}[]"),
            n => format!("{element_name}[{n}]"),
        };

        let ordinal = self.register(&name, TypeRepr::Array { element, count })?;
        Ok(Outcome::Type {
            ordinal,
            pending: false,
        })
    }

    fn subroutine(&mut self, die: &Die<'dwarf, 'info>) -> Result<Outcome> {
        let ret = match self.target_type(die)?.required() {
            Ok(ret) => ret,
            Err(outcome) => return Ok(outcome),
        };

        let name = format!("{} ()", self.type_name(ret)?);
        let ordinal = self.register(&name, TypeRepr::Function { ret })?;
        Ok(Outcome::Type {
            ordinal,
            pending: false,
        })
    }

    fn structure(&mut self, die: &Die<'dwarf, 'info>) -> Result<Outcome> {
        if die.flag(DW_AT_declaration)? {
            return self.forward_declaration(die);
        }

        let is_union = die.tag() == DW_TAG_union_type;
        let layout = collect_members(die)?;

        let (id, existed) = match die.name()? {
            Some(name) => self.insert_dup(
                name,
                |db, name| db.find_struct(name),
                |session, id| session.equivalent_struct(id, die),
                |db, name| db.add_struct(Some(name), is_union),
            )?,
            None => match self.db.add_struct(None, is_union) {
                Some(id) => (id, false),
                None => return Err(Error::NameExhausted("<anonymous struct>".into())),
            },
        };

        let ordinal = self.struct_ordinal(id)?;
        if existed {
            return Ok(Outcome::Type {
                ordinal,
                pending: false,
            });
        }

        let mut pending = false;
        for member in &layout {
            pending |= !self.attach_member(die.offset(), id, member)?;
        }

        Ok(Outcome::Type { ordinal, pending })
    }

    /// Whether the structure `id` is structurally equal to `die`.
    ///
    /// The record of a pending structure lacks its unresolved members, so
    /// it is compared through the DIE it was created from instead.
    fn equivalent_struct(&self, id: StructId, die: &Die<'dwarf, 'info>) -> Result<bool> {
        let origin = self
            .struct_ordinal(id)
            .ok()
            .and_then(|ordinal| self.cache.type_offset(ordinal))
            .filter(|&offset| self.cache.get_type(offset).is_some_and(|(_, pending)| pending));

        match origin {
            Some(offset) => compare::struct_dies_match(&self.info.die_at(offset)?, die),
            None => compare::struct_matches(&*self.db, id, die),
        }
    }

    pub(super) fn struct_ordinal(&self, id: StructId) -> Result<Ordinal> {
        match self.db.struct_def(id) {
            Some(def) => Ok(def.ordinal),
            None => Err(Error::UnknownStruct(id)),
        }
    }

    /// Resolves a member's type and adds the member to the structure.
    ///
    /// Returns `false` if the type couldn't be resolved (yet). Members whose
    /// size can't be determined are logged and skipped.
    pub(super) fn attach_member(
        &mut self,
        owner: u64,
        id: StructId,
        member: &MemberLayout,
    ) -> Result<bool> {
        let Some(type_offset) = member.type_offset else {
            debug!("DIE {owner:#x}: member `{}` has no type", member.name);
            return Ok(true);
        };

        let ordinal = match self.resolve_type_at(type_offset) {
            TypeRef::Resolved(ordinal) => ordinal,
            TypeRef::InProgress | TypeRef::Missing => return Ok(false),
        };

        let (ty, size) = match self.sized_member_type(ordinal) {
            Ok(sized) => sized,
            Err(err @ Error::SizeUnknown(_)) => {
                warn!("DIE {owner:#x}: skipping member `{}`: {err}", member.name);
                return Ok(true);
            }
            Err(err) => return Err(err),
        };

        let added = self.db.add_struct_member(id, Member {
            name: member.name.clone(),
            offset: member.offset,
            size,
            ty,
        });

        if !added {
            debug!("DIE {owner:#x}: member `{}` already present", member.name);
        }

        Ok(true)
    }
}
