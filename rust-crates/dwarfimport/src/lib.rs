// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

pub mod cache;
pub mod dwarf;
pub mod host;
pub mod import;
pub mod objfile;
pub mod regs;

#[cfg(test)]
mod testutil;

/// Type-erased error type.
///
/// We primarily use this to hand out errors from third-party libraries where
/// lifting them into distinct error variants didn't make sense because no
/// consumer cares about differentiating between different error variants.
pub type AnyError = Box<dyn std::error::Error + Send + Sync>;

/// Virtual address in the ELF / mach-O address space.
pub type VirtAddr = u64;

/// Checks whether range `inner` lies completely within range `outer`.
///
/// # Examples
///
/// ```
/// # use dwarfimport::range_contains;
/// assert!(range_contains(&(0x10..0x20), &(0x10..0x18)));
/// assert!(range_contains(&(0x10..0x20), &(0x10..0x20)));
/// assert!(!range_contains(&(0x10..0x20), &(0x18..0x28)));
/// assert!(!range_contains(&(0x10..0x20), &(0..0x10))); // adjacent isn't inside
/// assert!(!range_contains(&(0..0), &(0..0))); // nothing is inside an empty range
/// ```
pub fn range_contains<T: Ord + Copy>(
    outer: &std::ops::Range<T>,
    inner: &std::ops::Range<T>,
) -> bool {
    !outer.is_empty() && outer.start <= inner.start && inner.end <= outer.end
}
