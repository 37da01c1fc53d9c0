//! Generic logical-addressed B-tree reader.
//!
//! Nodes are addressed by logical byte address, translated through the
//! chunk table to a physical offset on the (single) device, read into a
//! scratch buffer of `nodesize` bytes, and validated: checksum over
//! `[0x20, nodesize)`, then `bytenr`, `level`, `generation`, and `owner`
//! against what the parent said they should be. Two operations are
//! exposed: full traversal with an early-exit visitor, and ordered
//! descent to a single key.

use crate::chunk::ChunkTable;
use qba_error::{AuditError, Result};
use qba_image::VirtualRead;
use qba_ondisk::{
    Key, NodeHeader, Superblock, csum, leaf_payload, parse_internal_items, parse_leaf_items,
};
use tracing::trace;

/// What a node must look like before its contents are trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeExpectation {
    pub level: u8,
    pub generation: u64,
    pub owner: u64,
}

impl NodeExpectation {
    fn child(&self, generation: u64) -> Self {
        Self {
            level: self.level - 1,
            generation,
            owner: self.owner,
        }
    }
}

/// Visitor for `walk`: receives each leaf item's key and payload in key
/// order. Returning `Ok(false)` stops the whole traversal.
pub type LeafVisitor<'v> = dyn FnMut(&Key, &[u8]) -> Result<bool> + 'v;

/// Callback for `find_item`: receives the payload of the exactly-matching
/// leaf item.
pub type ItemAccept<'v> = dyn FnMut(&[u8]) -> Result<()> + 'v;

/// Read-only B-tree engine over one device and one chunk table.
pub struct TreeReader<'a> {
    dev: &'a dyn VirtualRead,
    chunks: &'a ChunkTable,
    nodesize: u32,
    csum_type: u16,
}

impl<'a> TreeReader<'a> {
    #[must_use]
    pub fn new(dev: &'a dyn VirtualRead, chunks: &'a ChunkTable, sb: &Superblock) -> Self {
        Self {
            dev,
            chunks,
            nodesize: sb.nodesize,
            csum_type: sb.csum_type,
        }
    }

    /// Fetch and validate one tree node.
    fn read_node(&self, logical: u64, exp: &NodeExpectation) -> Result<Vec<u8>> {
        let chunk = self.chunks.find(logical)?;
        let nodesize = u64::from(self.nodesize);
        if logical
            .checked_add(nodesize)
            .is_none_or(|end| end > chunk.end())
        {
            return Err(AuditError::Integrity(format!(
                "tree node at {logical:x} crosses the end of its chunk at {:x}",
                chunk.end()
            )));
        }

        let physical = chunk.logical_to_physical(logical);
        let mut block = vec![0_u8; self.nodesize as usize];
        self.dev.read_at(physical, &mut block)?;

        csum::verify_tree_block(&block, self.csum_type).map_err(|err| {
            AuditError::Integrity(format!("tree node at {logical:x}: {err}"))
        })?;

        let header = NodeHeader::parse(&block)?;
        header.validate(block.len())?;
        if header.bytenr != logical {
            return Err(AuditError::Integrity(format!(
                "tree node at {logical:x} claims bytenr {:x}",
                header.bytenr
            )));
        }
        if header.level != exp.level {
            return Err(AuditError::Integrity(format!(
                "tree node at {logical:x} has level {}, expected {}",
                header.level, exp.level
            )));
        }
        if header.generation != exp.generation {
            return Err(AuditError::Integrity(format!(
                "tree node at {logical:x} has generation {}, expected {}",
                header.generation, exp.generation
            )));
        }
        if header.owner != exp.owner {
            return Err(AuditError::Integrity(format!(
                "tree node at {logical:x} belongs to tree {}, expected {}",
                header.owner, exp.owner
            )));
        }

        trace!(
            logical = format_args!("{logical:x}"),
            physical = format_args!("{physical:x}"),
            level = header.level,
            nritems = header.nritems,
            "read tree node"
        );
        Ok(block)
    }

    /// Depth-first traversal in key order. `visit` is called for every
    /// leaf item; returning `Ok(false)` terminates the whole walk early.
    /// The result is `Ok(false)` iff the visitor stopped the walk.
    pub fn walk(
        &self,
        logical: u64,
        exp: &NodeExpectation,
        visit: &mut LeafVisitor<'_>,
    ) -> Result<bool> {
        let block = self.read_node(logical, exp)?;

        if exp.level == 0 {
            let (_, items) = parse_leaf_items(&block)?;
            for item in &items {
                let payload = leaf_payload(&block, item)?;
                if !visit(&item.key, payload)? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }

        let (_, ptrs) = parse_internal_items(&block)?;
        for ptr in &ptrs {
            if !self.walk(ptr.blockptr, &exp.child(ptr.generation), visit)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Ordered descent to an exact key.
    ///
    /// At an internal node the child chosen is the rightmost one whose
    /// first key does not exceed `target`; if `target` precedes every
    /// key the item cannot exist. At a leaf, `accept` runs on an exact
    /// match. Returns whether the key was found.
    pub fn find_item(
        &self,
        logical: u64,
        exp: &NodeExpectation,
        target: Key,
        accept: &mut ItemAccept<'_>,
    ) -> Result<bool> {
        let block = self.read_node(logical, exp)?;

        if exp.level == 0 {
            let (_, items) = parse_leaf_items(&block)?;
            for item in &items {
                if item.key == target {
                    accept(leaf_payload(&block, item)?)?;
                    return Ok(true);
                }
                if item.key > target {
                    break;
                }
            }
            return Ok(false);
        }

        let (_, ptrs) = parse_internal_items(&block)?;
        let mut chosen = None;
        for ptr in &ptrs {
            if ptr.key == target {
                chosen = Some(ptr);
                break;
            }
            if ptr.key > target {
                break;
            }
            chosen = Some(ptr);
        }
        let Some(ptr) = chosen else {
            // Target sorts before the first key of the subtree.
            return Ok(false);
        };

        self.find_item(ptr.blockptr, &exp.child(ptr.generation), target, accept)
    }
}
