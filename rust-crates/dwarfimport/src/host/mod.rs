// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Interface to the symbol database that receives the imported types.
//!
//! The database owns a single namespace of named types, each identified by
//! an [`Ordinal`]. Enumerations and structures are additionally kept as
//! dedicated entities ([`EnumDef`], [`StructDef`]) that always come with a
//! named type of their own.

mod memory;

pub use memory::*;

use crate::VirtAddr;
use std::ops::Range;

/// Handle of a named type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ordinal(pub u32);

/// Handle of an enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnumId(pub u32);

/// Handle of a structure or union.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StructId(pub u32);

/// Storage width of an integer type.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntWidth {
    /// The natural `int` of the target.
    Natural,
    W8,
    W16,
    W32,
    W64,
    W128,
}

impl IntWidth {
    /// Maps a byte size onto a width, if there's an exact match.
    pub fn from_size(size: u64) -> Option<Self> {
        Some(match size {
            1 => Self::W8,
            2 => Self::W16,
            4 => Self::W32,
            8 => Self::W64,
            16 => Self::W128,
            _ => return None,
        })
    }

    /// Size in bytes.
    pub fn size(self) -> u64 {
        match self {
            Self::W8 => 1,
            Self::W16 => 2,
            Self::Natural | Self::W32 => 4,
            Self::W64 => 8,
            Self::W128 => 16,
        }
    }
}

/// Storage width of a floating point type.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatWidth {
    /// Unknown size: the target's `float`.
    Default,
    Half,
    Single,
    Double,
    /// Extended precision, with its storage size in bytes (10, 12 or 16).
    LongDouble(u8),
}

impl FloatWidth {
    /// Maps a byte size onto a width, if there's an exact match.
    pub fn from_size(size: u64) -> Option<Self> {
        Some(match size {
            2 => Self::Half,
            4 => Self::Single,
            8 => Self::Double,
            10 | 12 | 16 => Self::LongDouble(size as u8),
            _ => return None,
        })
    }

    /// Size in bytes.
    pub fn size(self) -> u64 {
        match self {
            Self::Half => 2,
            Self::Default | Self::Single => 4,
            Self::Double => 8,
            Self::LongDouble(size) => u64::from(size),
        }
    }
}

/// Storage width of a boolean type.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoolWidth {
    /// Unknown size: whatever the target model uses.
    Default,
    W1,
    W2,
    W4,
}

impl BoolWidth {
    /// Maps a byte size onto a width, if there's an exact match.
    pub fn from_size(size: u64) -> Option<Self> {
        Some(match size {
            1 => Self::W1,
            2 => Self::W2,
            4 => Self::W4,
            _ => return None,
        })
    }

    /// Size in bytes.
    pub fn size(self) -> u64 {
        match self {
            Self::Default | Self::W1 => 1,
            Self::W2 => 2,
            Self::W4 => 4,
        }
    }
}

/// Structural description of a named type.
///
/// Two named types are considered identical iff name and representation
/// compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeRepr {
    /// `void`, also used for unspecified types.
    Void,
    /// A forward declaration that may later be completed.
    Opaque,
    /// A boolean.
    Bool(BoolWidth),
    /// An integer or character type.
    Int {
        /// Storage width.
        width: IntWidth,
        /// Signedness.
        signed: bool,
        /// Whether the type is a character type.
        is_char: bool,
    },
    /// A floating point type.
    Float(FloatWidth),
    /// `const`-qualified type.
    Const(Ordinal),
    /// `volatile`-qualified type.
    Volatile(Ordinal),
    /// Pointer to a type.
    Pointer(Ordinal),
    /// One-dimensional array.
    Array {
        /// Element type.
        element: Ordinal,
        /// Upper bound as recorded in the debug info; zero when unknown.
        count: u64,
    },
    /// Alias of the type with the given name.
    Typedef(String),
    /// Structure, see [`StructDef`].
    Struct(StructId),
    /// Union, see [`StructDef`].
    Union(StructId),
    /// Enumeration, see [`EnumDef`].
    Enum(EnumId),
    /// Function returning the given type.
    Function {
        /// Return type.
        ret: Ordinal,
    },
}

/// Entry of the named type table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedType {
    /// Unique name.
    pub name: String,
    /// Representation.
    pub repr: TypeRepr,
}

/// An enumeration and its constants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumDef {
    /// Unique name. Generated for anonymous enumerations.
    pub name: String,
    /// Storage width in bytes.
    pub width: u8,
    /// Named type representing the enumeration.
    pub ordinal: Ordinal,
    /// Constants, in insertion order.
    pub constants: Vec<(String, u64)>,
}

/// A structure or union and its members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructDef {
    /// Unique name. Generated for anonymous structures.
    pub name: String,
    /// Whether all members share offset 0.
    pub is_union: bool,
    /// Named type representing the structure.
    pub ordinal: Ordinal,
    /// Members, ordered by offset.
    pub members: Vec<Member>,
}

/// Field of a [`StructDef`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Name, unique within the structure.
    pub name: String,
    /// Byte offset within the structure.
    pub offset: u64,
    /// Size in bytes.
    pub size: u64,
    /// Type of the member.
    pub ty: MemberType,
}

/// Type attached to a member, a variable or an address.
///
/// Enumerations and structures are attached through their dedicated handles,
/// everything else through the named type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberType {
    /// An enumeration.
    Enum(EnumId),
    /// A structure or union.
    Struct(StructId),
    /// Any other named type.
    Typed(Ordinal),
}

/// A function known to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Function {
    /// Address of the first instruction.
    pub start: VirtAddr,
    /// End address, exclusive.
    pub end: VirtAddr,
}

impl Function {
    /// Address range covered by the function.
    pub fn range(&self) -> Range<VirtAddr> {
        self.start..self.end
    }
}

/// Variable living in a function's stack frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackVar {
    /// Variable name.
    pub name: String,
    /// Byte offset relative to the frame.
    pub offset: i64,
    /// Size in bytes. Zero for untyped variables.
    pub size: u64,
    /// Type, if known.
    pub ty: Option<MemberType>,
}

/// Variable bound to a register over an address range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterVar {
    /// Range in which the variable lives in the register.
    pub range: Range<VirtAddr>,
    /// Canonical register name.
    pub register: String,
    /// Variable name.
    pub name: String,
}

/// Symbol database receiving the imported information.
///
/// Mutating operations report failure with `false` / [`None`] instead of an
/// error: the importer treats them as conflicts that it can work around
/// (e.g. by picking another name) rather than hard failures.
pub trait TypeDatabase {
    /// Looks up a named type by its name.
    fn named_type(&self, name: &str) -> Option<Ordinal>;

    /// Looks up a named type by its ordinal.
    fn numbered_type(&self, ordinal: Ordinal) -> Option<&NamedType>;

    /// Allocates a new named type. Fails if the name is taken.
    fn add_named_type(&mut self, name: &str, repr: TypeRepr) -> Option<Ordinal>;

    /// Size of the type in bytes, if it can be determined.
    fn type_size(&self, ordinal: Ordinal) -> Option<u64>;

    /// Looks up an enumeration by name.
    fn find_enum(&self, name: &str) -> Option<EnumId>;

    /// Finds an enumeration that defines a constant with the given name.
    fn enum_with_constant(&self, constant: &str) -> Option<EnumId>;

    /// Creates an enumeration of the given width along with its named type.
    ///
    /// Anonymous enumerations receive a generated name. An opaque named type
    /// of the same name is taken over, keeping its ordinal. Fails if the
    /// name is taken otherwise.
    fn add_enum(&mut self, name: Option<&str>, width: u8) -> Option<EnumId>;

    /// Adds a constant. Fails if the enumeration already defines the name.
    fn add_enum_constant(&mut self, id: EnumId, name: &str, value: u64) -> bool;

    /// Looks up an enumeration by its handle.
    fn enum_def(&self, id: EnumId) -> Option<&EnumDef>;

    /// Looks up a structure or union by name.
    fn find_struct(&self, name: &str) -> Option<StructId>;

    /// Creates a structure or union along with its named type.
    ///
    /// Same naming rules as [`Self::add_enum`].
    fn add_struct(&mut self, name: Option<&str>, is_union: bool) -> Option<StructId>;

    /// Looks up a structure or union by its handle.
    fn struct_def(&self, id: StructId) -> Option<&StructDef>;

    /// Adds a member. Fails if the structure already has a member of that
    /// name.
    fn add_struct_member(&mut self, id: StructId, member: Member) -> bool;

    /// Function containing the given address.
    fn function_at(&self, addr: VirtAddr) -> Option<Function>;

    /// Declares that `size` bytes at `addr` hold a value of the given type.
    fn apply_type(&mut self, addr: VirtAddr, ty: MemberType, size: u64) -> bool;

    /// Names an address. Local names are only visible within their function.
    fn set_name(&mut self, addr: VirtAddr, name: &str, local: bool) -> bool;

    /// Looks up a stack variable of the function starting at `func`.
    fn stack_variable(&self, func: VirtAddr, name: &str) -> Option<&StackVar>;

    /// Adds a stack variable to the function starting at `func`.
    fn add_stack_variable(&mut self, func: VirtAddr, var: StackVar) -> bool;

    /// Adds a register variable to the function starting at `func`.
    fn add_register_variable(&mut self, func: VirtAddr, var: RegisterVar) -> bool;

    /// Reads a blob from the persistent store.
    fn load_blob(&self, key: &str) -> Option<Vec<u8>>;

    /// Writes a blob to the persistent store, replacing previous contents.
    fn store_blob(&mut self, key: &str, data: Vec<u8>);
}
