//! Block versions and branch targets.
//!
//! Every block gets exactly one [`BlockVersion`], created as an empty
//! placeholder the first time anything refers to it and filled in when the
//! block is compiled. Branch instructions in the code heap never hold code
//! addresses directly: they hold a [`BranchSlot`] into the [`BranchTable`],
//! which starts out naming the target version and is resolved to the
//! version's start address the first time the branch is taken.

use std::collections::HashMap;

use super::codeheap::CodeAddr;
use super::heap::GcRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VersionId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BranchSlot(pub u32);

/// Compiled instantiation of a block.
#[derive(Debug, Clone)]
pub struct BlockVersion {
    /// Block this version was compiled from.
    pub block: GcRef,
    range: Option<(CodeAddr, CodeAddr)>,
}

impl BlockVersion {
    fn new(block: GcRef) -> Self {
        Self { block, range: None }
    }

    pub fn is_compiled(&self) -> bool {
        self.range.is_some()
    }

    pub fn start(&self) -> Option<CodeAddr> {
        self.range.map(|(start, _)| start)
    }

    /// Byte range `[start, end)` of the compiled body.
    pub fn range(&self) -> Option<(CodeAddr, CodeAddr)> {
        self.range
    }
}

/// Map from block identity to its versions.
#[derive(Debug, Default)]
pub struct VersionTable {
    versions: Vec<BlockVersion>,
    by_block: HashMap<GcRef, Vec<VersionId>>,
}

impl VersionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the version of a block, creating an uncompiled placeholder on
    /// first request.
    pub fn get_block_version(&mut self, block: GcRef) -> VersionId {
        if let Some(list) = self.by_block.get(&block) {
            assert_eq!(list.len(), 1, "block {:?} has {} versions", block, list.len());
            return list[0];
        }
        let id = VersionId(self.versions.len() as u32);
        self.versions.push(BlockVersion::new(block));
        self.by_block.insert(block, vec![id]);
        id
    }

    /// Version of a block, if one was ever requested.
    pub fn lookup(&self, block: GcRef) -> Option<VersionId> {
        self.by_block.get(&block).and_then(|list| list.first().copied())
    }

    pub fn versions_of(&self, block: GcRef) -> &[VersionId] {
        self.by_block
            .get(&block)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn get(&self, id: VersionId) -> &BlockVersion {
        &self.versions[id.0 as usize]
    }

    /// Record the compiled range of a version. A version is compiled once.
    pub fn set_compiled(&mut self, id: VersionId, start: CodeAddr, end: CodeAddr) {
        let version = &mut self.versions[id.0 as usize];
        assert!(
            version.range.is_none(),
            "block version {} compiled twice",
            id.0
        );
        assert!(start <= end, "inverted code range {}..{}", start, end);
        version.range = Some((start, end));
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn compiled_count(&self) -> usize {
        self.versions.iter().filter(|v| v.is_compiled()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (VersionId, &BlockVersion)> {
        self.versions
            .iter()
            .enumerate()
            .map(|(i, v)| (VersionId(i as u32), v))
    }
}

/// State of one branch operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchTarget {
    /// Not taken yet; names the version to compile and jump to.
    Unresolved(VersionId),
    /// Start address of the target version's code.
    Resolved(CodeAddr),
}

/// Indirection table for branch operands.
#[derive(Debug, Default)]
pub struct BranchTable {
    slots: Vec<(VersionId, BranchTarget)>,
}

impl BranchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, target: VersionId) -> BranchSlot {
        let slot = BranchSlot(self.slots.len() as u32);
        self.slots.push((target, BranchTarget::Unresolved(target)));
        slot
    }

    pub fn get(&self, slot: BranchSlot) -> BranchTarget {
        self.slots[slot.0 as usize].1
    }

    /// Version a slot points at, resolved or not.
    pub fn target_version(&self, slot: BranchSlot) -> VersionId {
        self.slots[slot.0 as usize].0
    }

    /// Resolve a slot. Slots are written once.
    pub fn resolve(&mut self, slot: BranchSlot, addr: CodeAddr) {
        let entry = &mut self.slots[slot.0 as usize].1;
        assert!(
            matches!(entry, BranchTarget::Unresolved(_)),
            "branch slot {} resolved twice",
            slot.0
        );
        *entry = BranchTarget::Resolved(addr);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn resolved_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|(_, t)| matches!(t, BranchTarget::Resolved(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_version_per_block() {
        let mut table = VersionTable::new();
        let a = GcRef::from_index(1);
        let b = GcRef::from_index(2);

        let va = table.get_block_version(a);
        let vb = table.get_block_version(b);
        assert_ne!(va, vb);
        assert_eq!(table.get_block_version(a), va);
        assert_eq!(table.versions_of(a), &[va]);
        assert_eq!(table.len(), 2);
        assert!(!table.get(va).is_compiled());
        assert_eq!(table.get(va).start(), None);
    }

    #[test]
    fn test_set_compiled_sets_both_ends() {
        let mut table = VersionTable::new();
        let v = table.get_block_version(GcRef::from_index(0));
        table.set_compiled(v, 16, 40);
        assert_eq!(table.get(v).range(), Some((16, 40)));
        assert_eq!(table.compiled_count(), 1);
    }

    #[test]
    #[should_panic(expected = "compiled twice")]
    fn test_double_compile_is_fatal() {
        let mut table = VersionTable::new();
        let v = table.get_block_version(GcRef::from_index(0));
        table.set_compiled(v, 0, 4);
        table.set_compiled(v, 4, 8);
    }

    #[test]
    fn test_branch_slots_resolve_independently() {
        let mut table = VersionTable::new();
        let v = table.get_block_version(GcRef::from_index(0));
        let mut branches = BranchTable::new();
        let then_slot = branches.add(v);
        let else_slot = branches.add(v);

        branches.resolve(then_slot, 12);
        assert_eq!(branches.get(then_slot), BranchTarget::Resolved(12));
        assert_eq!(branches.get(else_slot), BranchTarget::Unresolved(v));
        assert_eq!(branches.target_version(then_slot), v);
        assert_eq!(branches.resolved_count(), 1);
    }
}
