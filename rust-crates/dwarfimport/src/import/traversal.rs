// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

use super::{types, Phase, Result, Session};
use crate::dwarf::Die;
use fallible_iterator::FallibleIterator;
use tracing::{debug, warn};

impl<'db, 'dwarf, 'info> Session<'db, 'dwarf, 'info> {
    /// Walks all units, dispatching every DIE that isn't cached yet.
    ///
    /// Units that fail to decode are logged and skipped.
    pub(super) fn walk(&mut self, phase: Phase) -> Result {
        let info = self.info;
        let mut units = info.units();

        loop {
            let root = match units.next() {
                Ok(Some(root)) => root,
                Ok(None) => break,
                Err(err) => {
                    warn!("skipping broken unit: {err}");
                    if phase == Phase::Types {
                        self.stats.units_broken += 1;
                    }
                    continue;
                }
            };

            if phase == Phase::Types {
                self.stats.units_ok += 1;
            }

            debug!(
                "{phase:?}: walking unit at {:#x} ({} bytes)",
                root.unit_offset(),
                root.unit_length()
            );

            self.walk_unit(root, phase);
        }

        Ok(())
    }

    /// Visits the DIEs of one unit in pre-order.
    ///
    /// The worklist is explicit so that deeply nested units can't exhaust
    /// the stack; only out-of-band type resolution recurses.
    fn walk_unit(&mut self, root: Die<'dwarf, 'info>, phase: Phase) {
        let mut worklist = vec![root];

        while let Some(die) = worklist.pop() {
            if !self.cache.has(die.offset()) {
                self.dispatch(&die, phase);
            }

            worklist.extend(die.next_sibling());
            worklist.extend(die.first_child());
        }
    }

    /// Hands a DIE to the handler of the given phase.
    ///
    /// Returns whether a handler was invoked.
    pub(super) fn dispatch(&mut self, die: &Die<'dwarf, 'info>, phase: Phase) -> bool {
        match phase {
            Phase::Types => {
                if !types::is_type_tag(die.tag()) {
                    return false;
                }

                self.visit_type(die);
                true
            }
            Phase::Frames => self.visit_frame(die),
        }
    }
}
