// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

use super::*;
use std::collections::{BTreeMap, HashMap};

/// Maximum number of indirections followed when computing a type's size.
const MAX_SIZE_DEPTH: usize = 32;

/// [`TypeDatabase`] that keeps everything in memory.
///
/// Besides serving as the database in tests, this is useful for tools that
/// want to inspect the imported information without a real host.
#[derive(Debug, Default)]
pub struct MemoryDb {
    pointer_size: u64,

    /// Named types; ordinal `n` lives at index `n - 1`.
    types: Vec<NamedType>,
    by_name: HashMap<String, Ordinal>,

    enums: Vec<EnumDef>,
    structs: Vec<StructDef>,

    /// Functions keyed by start address.
    functions: BTreeMap<VirtAddr, Function>,

    applied: BTreeMap<VirtAddr, (MemberType, u64)>,
    names: BTreeMap<VirtAddr, (String, bool)>,
    stack_vars: HashMap<VirtAddr, Vec<StackVar>>,
    register_vars: HashMap<VirtAddr, Vec<RegisterVar>>,

    blobs: HashMap<String, Vec<u8>>,

    anon_count: u32,
}

impl MemoryDb {
    /// Creates an empty database for a target with the given pointer size.
    pub fn new(pointer_size: u64) -> Self {
        Self {
            pointer_size,
            ..Self::default()
        }
    }

    /// Registers a function covering the given address range.
    pub fn add_function(&mut self, range: Range<VirtAddr>) {
        self.functions.insert(range.start, Function {
            start: range.start,
            end: range.end,
        });
    }

    /// Number of named types.
    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    /// Iterate over all named types in allocation order.
    pub fn types(&self) -> impl Iterator<Item = (Ordinal, &NamedType)> {
        self.types
            .iter()
            .enumerate()
            .map(|(idx, ty)| (Ordinal(idx as u32 + 1), ty))
    }

    /// Type applied to the given address, with its size.
    pub fn applied_type(&self, addr: VirtAddr) -> Option<(MemberType, u64)> {
        self.applied.get(&addr).copied()
    }

    /// Name of the given address and whether it is local.
    pub fn name_at(&self, addr: VirtAddr) -> Option<(&str, bool)> {
        self.names
            .get(&addr)
            .map(|(name, local)| (name.as_str(), *local))
    }

    /// Stack variables of the function starting at `func`.
    pub fn stack_variables(&self, func: VirtAddr) -> &[StackVar] {
        self.stack_vars.get(&func).map(Vec::as_slice).unwrap_or_default()
    }

    /// Register variables of the function starting at `func`.
    pub fn register_variables(&self, func: VirtAddr) -> &[RegisterVar] {
        self.register_vars.get(&func).map(Vec::as_slice).unwrap_or_default()
    }

    fn type_index(ordinal: Ordinal) -> Option<usize> {
        (ordinal.0 as usize).checked_sub(1)
    }

    fn anon_name(&mut self, kind: &str) -> String {
        loop {
            self.anon_count += 1;
            let name = format!("__anon_{kind}_{}", self.anon_count);
            if !self.by_name.contains_key(&name) {
                return name;
            }
        }
    }

    /// Reserves the named type for a new enumeration or structure.
    fn claim(
        &mut self,
        name: Option<&str>,
        kind: &str,
        repr: TypeRepr,
    ) -> Option<(String, Ordinal)> {
        let name = match name {
            Some(name) => name.to_owned(),
            None => self.anon_name(kind),
        };

        let Some(&ordinal) = self.by_name.get(&name) else {
            let ordinal = self.add_named_type(&name, repr)?;
            return Some((name, ordinal));
        };

        // Complete a forward declaration.
        let ty = &mut self.types[Self::type_index(ordinal)?];
        if ty.repr != TypeRepr::Opaque {
            return None;
        }

        ty.repr = repr;
        Some((name, ordinal))
    }

    fn size_of(&self, ordinal: Ordinal, depth: usize) -> Option<u64> {
        if depth > MAX_SIZE_DEPTH {
            return None;
        }

        let ty = self.types.get(Self::type_index(ordinal)?)?;
        match ty.repr {
            TypeRepr::Void | TypeRepr::Opaque | TypeRepr::Function { .. } => None,
            TypeRepr::Bool(width) => Some(width.size()),
            TypeRepr::Int { width, .. } => Some(width.size()),
            TypeRepr::Float(width) => Some(width.size()),
            TypeRepr::Const(inner) | TypeRepr::Volatile(inner) => self.size_of(inner, depth + 1),
            TypeRepr::Pointer(_) => Some(self.pointer_size),
            TypeRepr::Array { element, count } => match count {
                0 => None,
                n => self.size_of(element, depth + 1)?.checked_mul(n),
            },
            TypeRepr::Typedef(ref target) => self.size_of(*self.by_name.get(target)?, depth + 1),
            TypeRepr::Struct(id) | TypeRepr::Union(id) => {
                let def = self.structs.get(id.0 as usize)?;
                let ends = def.members.iter().map(|member| match def.is_union {
                    true => member.size,
                    false => member.offset + member.size,
                });
                Some(ends.max().unwrap_or(0))
            }
            TypeRepr::Enum(id) => Some(u64::from(self.enums.get(id.0 as usize)?.width)),
        }
    }
}

impl TypeDatabase for MemoryDb {
    fn named_type(&self, name: &str) -> Option<Ordinal> {
        self.by_name.get(name).copied()
    }

    fn numbered_type(&self, ordinal: Ordinal) -> Option<&NamedType> {
        self.types.get(Self::type_index(ordinal)?)
    }

    fn add_named_type(&mut self, name: &str, repr: TypeRepr) -> Option<Ordinal> {
        if self.by_name.contains_key(name) {
            return None;
        }

        self.types.push(NamedType {
            name: name.to_owned(),
            repr,
        });

        let ordinal = Ordinal(self.types.len() as u32);
        self.by_name.insert(name.to_owned(), ordinal);
        Some(ordinal)
    }

    fn type_size(&self, ordinal: Ordinal) -> Option<u64> {
        self.size_of(ordinal, 0)
    }

    fn find_enum(&self, name: &str) -> Option<EnumId> {
        match self.numbered_type(self.named_type(name)?)?.repr {
            TypeRepr::Enum(id) => Some(id),
            _ => None,
        }
    }

    fn enum_with_constant(&self, constant: &str) -> Option<EnumId> {
        self.enums
            .iter()
            .position(|def| def.constants.iter().any(|(name, _)| name == constant))
            .map(|idx| EnumId(idx as u32))
    }

    fn add_enum(&mut self, name: Option<&str>, width: u8) -> Option<EnumId> {
        let id = EnumId(self.enums.len() as u32);
        let (name, ordinal) = self.claim(name, "enum", TypeRepr::Enum(id))?;

        self.enums.push(EnumDef {
            name,
            width,
            ordinal,
            constants: Vec::new(),
        });

        Some(id)
    }

    fn add_enum_constant(&mut self, id: EnumId, name: &str, value: u64) -> bool {
        let Some(def) = self.enums.get_mut(id.0 as usize) else {
            return false;
        };

        if def.constants.iter().any(|(existing, _)| existing == name) {
            return false;
        }

        def.constants.push((name.to_owned(), value));
        true
    }

    fn enum_def(&self, id: EnumId) -> Option<&EnumDef> {
        self.enums.get(id.0 as usize)
    }

    fn find_struct(&self, name: &str) -> Option<StructId> {
        match self.numbered_type(self.named_type(name)?)?.repr {
            TypeRepr::Struct(id) | TypeRepr::Union(id) => Some(id),
            _ => None,
        }
    }

    fn add_struct(&mut self, name: Option<&str>, is_union: bool) -> Option<StructId> {
        let id = StructId(self.structs.len() as u32);
        let (kind, repr) = match is_union {
            true => ("union", TypeRepr::Union(id)),
            false => ("struct", TypeRepr::Struct(id)),
        };

        let (name, ordinal) = self.claim(name, kind, repr)?;

        self.structs.push(StructDef {
            name,
            is_union,
            ordinal,
            members: Vec::new(),
        });

        Some(id)
    }

    fn struct_def(&self, id: StructId) -> Option<&StructDef> {
        self.structs.get(id.0 as usize)
    }

    fn add_struct_member(&mut self, id: StructId, member: Member) -> bool {
        let Some(def) = self.structs.get_mut(id.0 as usize) else {
            return false;
        };

        if def.members.iter().any(|existing| existing.name == member.name) {
            return false;
        }

        let pos = def.members.partition_point(|x| x.offset <= member.offset);
        def.members.insert(pos, member);
        true
    }

    fn function_at(&self, addr: VirtAddr) -> Option<Function> {
        let (_, func) = self.functions.range(..=addr).next_back()?;
        func.range().contains(&addr).then_some(*func)
    }

    fn apply_type(&mut self, addr: VirtAddr, ty: MemberType, size: u64) -> bool {
        self.applied.insert(addr, (ty, size));
        true
    }

    fn set_name(&mut self, addr: VirtAddr, name: &str, local: bool) -> bool {
        self.names.insert(addr, (name.to_owned(), local));
        true
    }

    fn stack_variable(&self, func: VirtAddr, name: &str) -> Option<&StackVar> {
        self.stack_variables(func).iter().find(|var| var.name == name)
    }

    fn add_stack_variable(&mut self, func: VirtAddr, var: StackVar) -> bool {
        if self.stack_variable(func, &var.name).is_some() {
            return false;
        }

        self.stack_vars.entry(func).or_default().push(var);
        true
    }

    fn add_register_variable(&mut self, func: VirtAddr, var: RegisterVar) -> bool {
        self.register_vars.entry(func).or_default().push(var);
        true
    }

    fn load_blob(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs.get(key).cloned()
    }

    fn store_blob(&mut self, key: &str, data: Vec<u8>) {
        self.blobs.insert(key.to_owned(), data);
    }
}
