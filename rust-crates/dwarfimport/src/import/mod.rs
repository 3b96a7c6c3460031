// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Translation of DWARF DIEs into host types and variables.
//!
//! An import is driven by a [`Session`] and runs in three steps:
//!
//! 1. [`Session::run_types`] walks all units and registers every type DIE.
//! 2. [`Session::run_second_pass`] repairs structures that had members with
//!    unresolved types.
//! 3. [`Session::run_frames`] walks all units again and places parameters,
//!    locals, labels and global variables.
//!
//! Failures are scoped to the DIE that caused them: they are logged and the
//! DIE is classified as useless, so it isn't retried.

// Compiler complains about using the gimli constants in match patterns.
#![allow(non_upper_case_globals)]

mod compare;
pub mod frame;
mod second_pass;
mod traversal;
mod types;

use crate::cache::{self, OffsetCache};
use crate::dwarf::{self, DebugInfo, Sections};
use crate::host::{EnumId, MemberType, Ordinal, StructId, TypeDatabase, TypeRepr};
use crate::regs::Arch;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Result type shorthand.
pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Errors that can occur during an import.
#[non_exhaustive]
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("DWARF: {0}")]
    Dwarf(#[from] dwarf::Error),

    #[error("offset cache: {0}")]
    Cache(#[from] cache::Error),

    #[error("Size of type {0:?} is unknown")]
    SizeUnknown(Ordinal),

    #[error("Type resolution nested deeper than {0} levels")]
    ResolveDepthExceeded(usize),

    #[error("No free name left for `{0}`")]
    NameExhausted(String),

    #[error("The input doesn't contain any debug information")]
    NoDebugInfo,

    #[error("Type {0:?} is unknown to the database")]
    UnknownOrdinal(Ordinal),

    #[error("DIE {0:#x} didn't produce a structure")]
    NotAStructure(u64),

    #[error("Enumeration {0:?} is unknown to the database")]
    UnknownEnum(EnumId),

    #[error("Structure {0:?} is unknown to the database")]
    UnknownStruct(StructId),
}

/// Which handlers the traversal dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Type DIEs.
    Types,
    /// Subprograms, labels and global variables.
    Frames,
}

/// Import settings.
#[derive(Debug, Clone)]
pub struct Config {
    /// Architecture that register numbers refer to.
    pub arch: Arch,

    /// Maximum nesting of out-of-band type resolution.
    pub max_resolve_depth: usize,

    /// Maximum number of `_` suffixes tried when a name is taken.
    pub max_name_suffixes: usize,

    /// Whether [`Session::finish`] writes the offset cache to the database.
    pub persist_cache: bool,

    /// Blob store key of the persisted offset cache.
    pub cache_key: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            arch: Arch::default(),
            max_resolve_depth: 512,
            max_name_suffixes: 256,
            persist_cache: true,
            cache_key: "dwarfimport.offset_cache".into(),
        }
    }
}

/// Statistics collected during an import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    /// Number of units walked.
    pub units_ok: u64,
    /// Number of units that failed to decode.
    pub units_broken: u64,
    /// Number of DIEs passed to a handler.
    pub dies_dispatched: u64,
    /// Number of DIEs whose handler failed.
    pub dies_failed: u64,
    /// Number of DIEs classified as types.
    pub types_registered: u64,
    /// Number of structures left with unresolved members after first visit.
    pub structs_pending: u64,
    /// Number of pending structures completed by the second pass.
    pub structs_repaired: u64,
    /// Number of parameters and locals placed on the stack or in registers.
    pub variables_placed: u64,
    /// Number of parameters and locals that couldn't be placed.
    pub variables_skipped: u64,
    /// Number of labels named.
    pub labels_named: u64,
    /// Number of global variables named.
    pub globals_placed: u64,
}

/// State of one import run.
///
/// All nested resolution happens through `&mut self`: resolving a DIE may
/// resolve the DIEs it references, which may in turn query and populate the
/// same offset cache.
pub struct Session<'db, 'dwarf, 'info> {
    info: &'info DebugInfo<'dwarf>,
    db: &'db mut dyn TypeDatabase,
    cache: OffsetCache,
    config: Config,
    stats: Stats,

    /// Type DIEs whose resolution is currently on the stack.
    in_progress: HashSet<u64>,

    /// Current nesting depth of type resolution.
    depth: usize,
}

impl<'db, 'dwarf, 'info> Session<'db, 'dwarf, 'info> {
    /// Creates a session with an empty offset cache.
    pub fn new(
        info: &'info DebugInfo<'dwarf>,
        db: &'db mut dyn TypeDatabase,
        config: Config,
    ) -> Self {
        Self::with_cache(info, db, config, OffsetCache::new())
    }

    /// Creates a session that continues with the offset cache persisted by
    /// a previous session, if any.
    pub fn resume(
        info: &'info DebugInfo<'dwarf>,
        db: &'db mut dyn TypeDatabase,
        config: Config,
    ) -> Result<Self> {
        let cache = match db.load_blob(&config.cache_key) {
            Some(blob) => OffsetCache::from_bytes(&blob)?,
            None => OffsetCache::new(),
        };

        debug!("resuming with {} cached DIEs", cache.len());
        Ok(Self::with_cache(info, db, config, cache))
    }

    fn with_cache(
        info: &'info DebugInfo<'dwarf>,
        db: &'db mut dyn TypeDatabase,
        config: Config,
        cache: OffsetCache,
    ) -> Self {
        Self {
            info,
            db,
            cache,
            config,
            stats: Stats::default(),
            in_progress: HashSet::new(),
            depth: 0,
        }
    }

    /// The offset cache built so far.
    pub fn cache(&self) -> &OffsetCache {
        &self.cache
    }

    /// Statistics collected so far.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Ends the session, persisting the offset cache if configured.
    pub fn finish(self) -> (OffsetCache, Stats) {
        if self.config.persist_cache {
            self.db.store_blob(&self.config.cache_key, self.cache.to_bytes());
        }

        (self.cache, self.stats)
    }

    /// Registers the types of all units.
    pub fn run_types(&mut self) -> Result {
        self.walk(Phase::Types)
    }

    /// Places variables and labels of all units.
    pub fn run_frames(&mut self) -> Result {
        self.walk(Phase::Frames)
    }

    /// Runs all passes.
    pub fn run(&mut self) -> Result {
        if self.info.unit_count() == 0 {
            return Err(Error::NoDebugInfo);
        }

        self.run_types()?;
        self.run_second_pass();
        self.run_frames()?;

        let stats = &self.stats;
        info!(
            "imported {} types from {} units ({} broken), {} variables, {} globals, {} labels",
            stats.types_registered,
            stats.units_ok,
            stats.units_broken,
            stats.variables_placed,
            stats.globals_placed,
            stats.labels_named,
        );

        Ok(())
    }

    /// Processes the DIE at `offset` for the given phase.
    ///
    /// Returns whether a handler was invoked. DIEs that are already cached
    /// are left untouched. Handler failures are logged and the DIE is
    /// classified as useless.
    pub fn process(&mut self, offset: u64, phase: Phase) -> Result<bool> {
        if self.cache.has(offset) {
            return Ok(false);
        }

        let die = self.info.die_at(offset)?;
        Ok(self.dispatch(&die, phase))
    }

    /// Logs a DIE-scoped failure.
    fn failed(&mut self, offset: u64, err: &Error) {
        warn!("DIE {offset:#x}: {err}");
        self.stats.dies_failed += 1;
    }

    /// Name of a registered type.
    fn type_name(&self, ordinal: Ordinal) -> Result<String> {
        match self.db.numbered_type(ordinal) {
            Some(ty) => Ok(ty.name.clone()),
            None => Err(Error::UnknownOrdinal(ordinal)),
        }
    }

    /// Picks the path through which a type is attached to members and
    /// variables.
    fn member_type(&self, ordinal: Ordinal) -> Result<MemberType> {
        let Some(ty) = self.db.numbered_type(ordinal) else {
            return Err(Error::UnknownOrdinal(ordinal));
        };

        Ok(match ty.repr {
            TypeRepr::Enum(id) => MemberType::Enum(id),
            TypeRepr::Struct(id) | TypeRepr::Union(id) => MemberType::Struct(id),
            _ => MemberType::Typed(ordinal),
        })
    }

    /// Attachment path and size of a registered type.
    fn sized_member_type(&self, ordinal: Ordinal) -> Result<(MemberType, u64)> {
        let ty = self.member_type(ordinal)?;
        match self.db.type_size(ordinal) {
            Some(size) => Ok((ty, size)),
            None => Err(Error::SizeUnknown(ordinal)),
        }
    }
}

/// Runs a complete import of the given sections into `db`.
pub fn run(sections: &Sections<'_>, db: &mut dyn TypeDatabase, config: Config) -> Result<Stats> {
    let info = sections.debug_info()?;
    let mut session = Session::resume(&info, db, config)?;
    session.run()?;
    Ok(session.finish().1)
}
