// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Per-session record of every DIE that was looked at.
//!
//! The cache is keyed by the global `.debug_info` offset of a DIE. An entry
//! exists iff the DIE was visited, which is what makes the import idempotent:
//! the traversal never dispatches a DIE that already has an entry.

use crate::host::Ordinal;
use std::collections::{BTreeMap, HashMap};

use prost::Message as _;

/// Version stored in every serialized cache.
const BLOB_VERSION: u32 = 1;

/// Result type shorthand.
pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Errors that can occur while restoring a persisted cache.
#[non_exhaustive]
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Offset cache blob is malformed: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Offset cache blob has unsupported version {0}")]
    BadVersion(u32),

    #[error("Offset cache record for DIE {offset:#x} has unknown kind {kind}")]
    BadKind { offset: u64, kind: i32 },

    #[error("Offset cache names DIE {offset:#x} as the origin of {ordinal:?}, but it isn't")]
    BadOrigin { ordinal: Ordinal, offset: u64 },
}

/// Wire format of a persisted cache.
mod wire {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Blob {
        #[prost(uint32, tag = "1")]
        pub version: u32,
        #[prost(message, repeated, tag = "2")]
        pub entries: Vec<Entry>,
        #[prost(message, repeated, tag = "3")]
        pub origins: Vec<Origin>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Entry {
        #[prost(uint64, tag = "1")]
        pub offset: u64,
        #[prost(enumeration = "Kind", tag = "2")]
        pub kind: i32,
        #[prost(uint32, tag = "3")]
        pub ordinal: u32,
        #[prost(bool, tag = "4")]
        pub pending: bool,
    }

    /// First DIE that produced an ordinal.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Origin {
        #[prost(uint32, tag = "1")]
        pub ordinal: u32,
        #[prost(uint64, tag = "2")]
        pub offset: u64,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum Kind {
        Useless = 0,
        Type = 1,
        Variable = 2,
    }
}

/// What a visited DIE turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Nothing was registered for the DIE.
    Useless,

    /// The DIE produced a type in the host database.
    Type {
        /// Host handle of the type.
        ordinal: Ordinal,
        /// Structure with members that still need to be resolved.
        pending: bool,
    },

    /// The DIE was placed as a variable, parameter or label.
    Variable,
}

impl Classification {
    fn is_useless(&self) -> bool {
        matches!(self, Classification::Useless)
    }
}

/// Mapping from DIE offset to its [`Classification`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetCache {
    entries: BTreeMap<u64, Classification>,

    /// First DIE that produced each ordinal.
    by_ordinal: HashMap<Ordinal, u64>,
}

impl OffsetCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of visited DIEs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no DIE was visited yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Checks whether the DIE at `offset` was visited.
    pub fn has(&self, offset: u64) -> bool {
        self.entries.contains_key(&offset)
    }

    /// Classification of the DIE at `offset`, if visited.
    pub fn get(&self, offset: u64) -> Option<Classification> {
        self.entries.get(&offset).copied()
    }

    /// Ordinal and pending flag, or [`None`] unless the DIE produced a type.
    pub fn get_type(&self, offset: u64) -> Option<(Ordinal, bool)> {
        match self.get(offset)? {
            Classification::Type { ordinal, pending } => Some((ordinal, pending)),
            _ => None,
        }
    }

    /// Records that the DIE produced nothing. No-op if an entry exists.
    pub fn mark_useless(&mut self, offset: u64) {
        self.entries.entry(offset).or_insert(Classification::Useless);
    }

    /// Records a type for the DIE.
    ///
    /// Only missing and [`Classification::Useless`] entries are replaced.
    /// Returns whether the entry was written.
    pub fn mark_type(&mut self, offset: u64, ordinal: Ordinal, pending: bool) -> bool {
        if !self.upgrade(offset, Classification::Type { ordinal, pending }) {
            return false;
        }

        self.by_ordinal.entry(ordinal).or_insert(offset);
        true
    }

    /// Records that the DIE was placed as a variable.
    ///
    /// Same replacement rules as [`Self::mark_type`].
    pub fn mark_variable(&mut self, offset: u64) -> bool {
        self.upgrade(offset, Classification::Variable)
    }

    fn upgrade(&mut self, offset: u64, value: Classification) -> bool {
        let slot = self.entries.entry(offset).or_insert(Classification::Useless);
        if !slot.is_useless() {
            return false;
        }

        *slot = value;
        true
    }

    /// Drops the pending flag of a type entry. Returns whether it was set.
    pub fn clear_pending(&mut self, offset: u64) -> bool {
        match self.entries.get_mut(&offset) {
            Some(Classification::Type { pending, .. }) if *pending => {
                *pending = false;
                true
            }
            _ => false,
        }
    }

    /// Iterate over all entries in offset order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, Classification)> + '_ {
        self.entries.iter().map(|(&offset, &class)| (offset, class))
    }

    /// Offsets of all pending type entries, in offset order.
    pub fn pending(&self) -> impl Iterator<Item = u64> + '_ {
        self.iter().filter_map(|(offset, class)| match class {
            Classification::Type { pending: true, .. } => Some(offset),
            _ => None,
        })
    }

    /// Offset of the first DIE that was classified as the given type.
    pub fn type_offset(&self, ordinal: Ordinal) -> Option<u64> {
        self.by_ordinal.get(&ordinal).copied()
    }

    /// Serializes the cache for the host blob store.
    pub fn to_bytes(&self) -> Vec<u8> {
        let entries = self
            .iter()
            .map(|(offset, class)| {
                let (kind, ordinal, pending) = match class {
                    Classification::Useless => (wire::Kind::Useless, 0, false),
                    Classification::Type { ordinal, pending } => {
                        (wire::Kind::Type, ordinal.0, pending)
                    }
                    Classification::Variable => (wire::Kind::Variable, 0, false),
                };

                wire::Entry {
                    offset,
                    kind: kind as i32,
                    ordinal,
                    pending,
                }
            })
            .collect();

        let mut origins: Vec<_> = self
            .by_ordinal
            .iter()
            .map(|(ordinal, &offset)| wire::Origin {
                ordinal: ordinal.0,
                offset,
            })
            .collect();
        origins.sort_unstable_by_key(|x| x.ordinal);

        wire::Blob {
            version: BLOB_VERSION,
            entries,
            origins,
        }
        .encode_to_vec()
    }

    /// Restores a cache written by [`Self::to_bytes`].
    ///
    /// The ordinal index is restored as persisted, so [`Self::type_offset`]
    /// answers the same as in the session that wrote the blob.
    pub fn from_bytes(blob: &[u8]) -> Result<Self> {
        let blob = wire::Blob::decode(blob)?;
        if blob.version != BLOB_VERSION {
            return Err(Error::BadVersion(blob.version));
        }

        let mut cache = Self::new();
        for entry in blob.entries {
            let offset = entry.offset;
            match wire::Kind::try_from(entry.kind) {
                Ok(wire::Kind::Useless) => cache.mark_useless(offset),
                Ok(wire::Kind::Type) => {
                    cache.mark_type(offset, Ordinal(entry.ordinal), entry.pending);
                }
                Ok(wire::Kind::Variable) => {
                    cache.mark_variable(offset);
                }
                Err(_) => {
                    return Err(Error::BadKind {
                        offset,
                        kind: entry.kind,
                    })
                }
            }
        }

        for origin in blob.origins {
            let ordinal = Ordinal(origin.ordinal);
            if cache.get_type(origin.offset).map(|x| x.0) != Some(ordinal) {
                return Err(Error::BadOrigin {
                    ordinal,
                    offset: origin.offset,
                });
            }

            cache.by_ordinal.insert(ordinal, origin.offset);
        }

        Ok(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn overwrite_rules() {
        let mut cache = OffsetCache::new();
        assert!(!cache.has(0x10));

        cache.mark_useless(0x10);
        assert_eq!(cache.get(0x10), Some(Classification::Useless));
        assert_eq!(cache.get_type(0x10), None);

        // Useless upgrades to a type, but a type is never replaced.
        assert!(cache.mark_type(0x10, Ordinal(3), false));
        assert!(!cache.mark_type(0x10, Ordinal(4), false));
        assert!(!cache.mark_variable(0x10));
        cache.mark_useless(0x10);
        assert_eq!(cache.get_type(0x10), Some((Ordinal(3), false)));

        assert!(cache.mark_variable(0x20));
        assert!(!cache.mark_type(0x20, Ordinal(5), false));
        assert_eq!(cache.get(0x20), Some(Classification::Variable));
        assert_eq!(cache.get_type(0x20), None);

        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn pending_entries() {
        let mut cache = OffsetCache::new();
        cache.mark_type(0x30, Ordinal(1), true);
        cache.mark_type(0x10, Ordinal(2), true);
        cache.mark_type(0x20, Ordinal(3), false);
        cache.mark_useless(0x05);

        assert_eq!(cache.pending().collect::<Vec<_>>(), [0x10, 0x30]);

        assert!(cache.clear_pending(0x10));
        assert!(!cache.clear_pending(0x10));
        assert!(!cache.clear_pending(0x20));
        assert!(!cache.clear_pending(0x05));
        assert_eq!(cache.pending().collect::<Vec<_>>(), [0x30]);
        assert_eq!(cache.get_type(0x10), Some((Ordinal(2), false)));

        let offsets: Vec<_> = cache.iter().map(|(offset, _)| offset).collect();
        assert_eq!(offsets, [0x05, 0x10, 0x20, 0x30]);
    }

    #[test]
    fn reverse_lookup() {
        let mut cache = OffsetCache::new();
        cache.mark_type(0x40, Ordinal(7), false);
        cache.mark_type(0x80, Ordinal(7), false);
        assert_eq!(cache.type_offset(Ordinal(7)), Some(0x40));
        assert_eq!(cache.type_offset(Ordinal(8)), None);
    }

    #[test]
    fn persistence() {
        let mut cache = OffsetCache::new();
        cache.mark_useless(0x0b);
        cache.mark_type(0x1000_0000_0001, Ordinal(u32::MAX), true);
        cache.mark_type(0x2d, Ordinal(12), false);
        cache.mark_variable(0x4e);

        let blob = cache.to_bytes();
        assert_eq!(OffsetCache::from_bytes(&blob).unwrap(), cache);
        assert!(OffsetCache::from_bytes(&OffsetCache::new().to_bytes())
            .unwrap()
            .is_empty());

        // An empty blob decodes to version 0.
        assert!(matches!(OffsetCache::from_bytes(&[]), Err(Error::BadVersion(0))));

        assert!(matches!(
            OffsetCache::from_bytes(&blob[..blob.len() - 1]),
            Err(Error::Decode(_))
        ));

        let mut raw = wire::Blob::decode(&blob[..]).unwrap();
        raw.version = 9;
        assert!(matches!(
            OffsetCache::from_bytes(&raw.encode_to_vec()),
            Err(Error::BadVersion(9))
        ));

        raw.version = BLOB_VERSION;
        raw.entries[0].kind = 0xff;
        assert!(matches!(
            OffsetCache::from_bytes(&raw.encode_to_vec()),
            Err(Error::BadKind { offset: 0x0b, kind: 0xff })
        ));
    }

    #[test]
    fn persisted_origins() {
        // The later DIE is registered first, so offset order disagrees
        // with the order in which the ordinal was produced.
        let mut cache = OffsetCache::new();
        cache.mark_type(0x80, Ordinal(7), false);
        cache.mark_type(0x40, Ordinal(7), false);
        assert_eq!(cache.type_offset(Ordinal(7)), Some(0x80));

        let restored = OffsetCache::from_bytes(&cache.to_bytes()).unwrap();
        assert_eq!(restored.type_offset(Ordinal(7)), Some(0x80));
        assert_eq!(restored, cache);

        let mut raw = wire::Blob::decode(&cache.to_bytes()[..]).unwrap();
        raw.origins[0].offset = 0x99;
        assert!(matches!(
            OffsetCache::from_bytes(&raw.encode_to_vec()),
            Err(Error::BadOrigin { offset: 0x99, .. })
        ));
    }
}
