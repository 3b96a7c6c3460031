// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Offset-indexed arena of the DIEs in one unit.

use super::{Error, Result, R};
use smallvec::SmallVec;

/// Maximum nesting depth of DIEs within a unit.
const MAX_TREE_DEPTH: usize = 64 * 1024;

/// Index of a node within a [`DieTree`].
pub(super) type NodeIdx = u32;

/// Structural information about a single DIE.
///
/// Attributes are not stored here: they are decoded on demand by the
/// [`super::Die`] accessor.
#[derive(Debug, Clone)]
pub(super) struct Node {
    /// Offset relative to the start of the unit header.
    pub offset: u64,
    pub tag: gimli::DwTag,
    pub parent: Option<NodeIdx>,
    pub first_child: Option<NodeIdx>,
    pub next_sibling: Option<NodeIdx>,
}

/// All DIEs of a unit, in DFS (and thus offset) order.
#[derive(Debug, Default)]
pub(super) struct DieTree {
    nodes: Vec<Node>,
}

impl DieTree {
    /// Walks the unit once and records the tree shape.
    pub fn build(unit: &gimli::Unit<R<'_>>) -> Result<Self> {
        let mut nodes: Vec<Node> = Vec::new();
        let mut last_child: Vec<Option<NodeIdx>> = Vec::new();
        let mut path: SmallVec<[NodeIdx; 64]> = SmallVec::new();

        let mut cursor = unit.entries();
        while let Some((depth_delta, die)) = cursor.next_dfs()? {
            // Remove as many levels as we have left behind, plus one since we
            // always push the current element even if it doesn't have children.
            for _ in 0..1 - depth_delta {
                path.pop();
            }

            if path.len() + 1 > MAX_TREE_DEPTH {
                return Err(Error::TreeTooDeep);
            }

            let idx = nodes.len() as NodeIdx;
            let parent = path.last().copied();

            nodes.push(Node {
                offset: die.offset().0 as u64,
                tag: die.tag(),
                parent,
                first_child: None,
                next_sibling: None,
            });
            last_child.push(None);

            if let Some(parent) = parent {
                match last_child[parent as usize] {
                    Some(prev) => nodes[prev as usize].next_sibling = Some(idx),
                    None => nodes[parent as usize].first_child = Some(idx),
                }
                last_child[parent as usize] = Some(idx);
            }

            path.push(idx);
        }

        Ok(Self { nodes })
    }

    /// Index of the unit's root DIE.
    pub fn root(&self) -> Option<NodeIdx> {
        if self.nodes.is_empty() {
            None
        } else {
            Some(0)
        }
    }

    /// Finds the node starting exactly at the given unit-relative offset.
    pub fn find(&self, offset: u64) -> Option<NodeIdx> {
        self.nodes
            .binary_search_by_key(&offset, |x| x.offset)
            .ok()
            .map(|x| x as NodeIdx)
    }

    pub fn node(&self, idx: NodeIdx) -> &Node {
        &self.nodes[idx as usize]
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::Fixture;
    use fallible_iterator::FallibleIterator;
    use gimli::constants::*;
    use gimli::write::AttributeValue;

    #[test]
    fn shape() {
        // root
        // ├── struct s
        // │   ├── member a
        // │   └── member b
        // └── base_type int
        let mut fx = Fixture::new();
        let s = fx.add(fx.root(), DW_TAG_structure_type, vec![named("s")]);
        fx.add(s, DW_TAG_member, vec![named("a")]);
        fx.add(s, DW_TAG_member, vec![named("b")]);
        fx.base_type("int", 4, DW_ATE_signed);

        let sections = fx.finish();
        let info = sections.debug_info().unwrap();
        let root_die = info.units().next().unwrap().unwrap();
        let unit = &root_die.unit;
        let node_of = |name: &str| info.die_at(Fixture::offset_of(&info, name)).unwrap().node;

        let root = unit.tree.root().unwrap();
        let (s, a, b, int) = (node_of("s"), node_of("a"), node_of("b"), node_of("int"));
        assert_eq!(unit.tree.node(s).tag, DW_TAG_structure_type);
        assert_eq!(unit.tree.node(s).parent, Some(root));

        assert_eq!(unit.tree.node(s).first_child, Some(a));
        assert_eq!(unit.tree.node(a).next_sibling, Some(b));
        assert_eq!(unit.tree.node(b).tag, DW_TAG_member);
        assert_eq!(unit.tree.node(b).next_sibling, None);
        assert_eq!(unit.tree.node(b).parent, Some(s));

        // The writer may emit base types first; only membership is fixed.
        let mut children = Vec::new();
        let mut next = unit.tree.node(root).first_child;
        while let Some(idx) = next {
            children.push(idx);
            next = unit.tree.node(idx).next_sibling;
        }
        children.sort_unstable();
        let mut expected = vec![s, int];
        expected.sort_unstable();
        assert_eq!(children, expected);

        assert_eq!(unit.tree.node(int).tag, DW_TAG_base_type);
        assert_eq!(unit.tree.node(int).parent, Some(root));
        assert_eq!(unit.tree.node(int).first_child, None);

        for idx in [root, s, a, b, int] {
            assert_eq!(unit.tree.find(unit.tree.node(idx).offset), Some(idx));
        }
    }

    fn named(name: &str) -> (gimli::DwAt, AttributeValue) {
        (DW_AT_name, AttributeValue::String(name.into()))
    }
}
