//! Packs and the pack set.
//!
//! A [`Pack`] is an ordered group of isomorphic, independent scalar nodes
//! that will become one vector node; lane `i` of the vector is `lanes[i]`.
//! During discovery the set holds pairs that may chain (`(a, b)`, `(b, c)`);
//! after combination every node belongs to at most one pack.

use crate::ir::arena::Id;
use crate::ir::node::NodeId;
use crate::ir::operators::CmpOp;
use smallvec::SmallVec;
use std::fmt;

/// Index of a pack inside its [`PackSet`].
pub type PackId = Id<Pack>;

/// Lane storage; eight lanes cover every register width without spilling
/// for 32-bit and wider elements.
pub type Lanes = SmallVec<[NodeId; 8]>;

// =============================================================================
// Pack
// =============================================================================

/// Compare and bool lanes folded into a conditional-move pack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FusedCompare {
    pub cmps: Lanes,
    pub bools: Lanes,
    pub cond: CmpOp,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Pack {
    lanes: Lanes,
    fused: Option<FusedCompare>,
}

impl Pack {
    pub fn pair(a: NodeId, b: NodeId) -> Self {
        let mut lanes = Lanes::new();
        lanes.push(a);
        lanes.push(b);
        Pack { lanes, fused: None }
    }

    pub fn from_lanes(lanes: &[NodeId]) -> Self {
        Pack {
            lanes: Lanes::from_slice(lanes),
            fused: None,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    #[inline]
    pub fn lanes(&self) -> &[NodeId] {
        &self.lanes
    }

    #[inline]
    pub fn at(&self, lane: usize) -> NodeId {
        self.lanes[lane]
    }

    #[inline]
    pub fn first(&self) -> NodeId {
        self.lanes[0]
    }

    #[inline]
    pub fn last(&self) -> NodeId {
        self.lanes[self.lanes.len() - 1]
    }

    pub fn contains(&self, n: NodeId) -> bool {
        self.lanes.contains(&n)
    }

    /// Append `other` minus its first lane, which must equal our last.
    pub fn chain(&mut self, other: &Pack) {
        debug_assert_eq!(self.last(), other.first());
        self.lanes.extend_from_slice(&other.lanes[1..]);
    }

    /// Cut into consecutive packs of `max` lanes; a short tail is dropped.
    pub fn split(&self, max: usize) -> Vec<Pack> {
        if max < 2 {
            return Vec::new();
        }
        self.lanes
            .chunks_exact(max)
            .map(Pack::from_lanes)
            .collect()
    }

    #[inline]
    pub fn fused(&self) -> Option<&FusedCompare> {
        self.fused.as_ref()
    }

    pub fn set_fused(&mut self, fused: FusedCompare) {
        debug_assert_eq!(fused.cmps.len(), self.len());
        debug_assert_eq!(fused.bools.len(), self.len());
        self.fused = Some(fused);
    }

    /// Every scalar the pack replaces: its lanes plus any fused compares.
    pub fn members(&self) -> impl Iterator<Item = NodeId> + '_ {
        let fused = self
            .fused
            .iter()
            .flat_map(|f| f.cmps.iter().chain(f.bools.iter()).copied());
        self.lanes.iter().copied().chain(fused)
    }
}

impl fmt::Debug for Pack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, n) in self.lanes.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?}", n)?;
        }
        write!(f, "]")?;
        if let Some(fused) = &self.fused {
            write!(f, " cmov({})", fused.cond.name())?;
        }
        Ok(())
    }
}

// =============================================================================
// Pack Set
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct PackSet {
    packs: Vec<Pack>,
}

impl PackSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.packs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.packs.is_empty()
    }

    pub fn push(&mut self, pack: Pack) -> PackId {
        self.packs.push(pack);
        PackId::new(self.packs.len() as u32 - 1)
    }

    #[inline]
    pub fn get(&self, id: PackId) -> &Pack {
        &self.packs[id.as_usize()]
    }

    #[inline]
    pub fn get_mut(&mut self, id: PackId) -> &mut Pack {
        &mut self.packs[id.as_usize()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (PackId, &Pack)> {
        self.packs
            .iter()
            .enumerate()
            .map(|(i, p)| (PackId::new(i as u32), p))
    }

    pub fn packs(&self) -> &[Pack] {
        &self.packs
    }

    pub fn retain(&mut self, f: impl FnMut(&Pack) -> bool) {
        self.packs.retain(f);
    }

    pub fn replace_all(&mut self, packs: Vec<Pack>) {
        self.packs = packs;
    }

    pub fn take_all(&mut self) -> Vec<Pack> {
        std::mem::take(&mut self.packs)
    }

    /// `n` occupies lane `pos` of some pack.
    pub fn exists_at(&self, n: NodeId, pos: usize) -> bool {
        self.packs
            .iter()
            .any(|p| p.len() > pos && p.at(pos) == n)
    }

    /// Some pack starts with `first` and ends with `last`.
    pub fn contains_span(&self, first: NodeId, last: NodeId) -> bool {
        self.packs
            .iter()
            .any(|p| p.first() == first && p.last() == last)
    }

    /// Merge packs whose last lane starts another pack, until no two chain.
    ///
    /// Runs to a fixpoint; combining an already combined set is a no-op.
    pub fn combine(&mut self) {
        let mut slots: Vec<Option<Pack>> = self.take_all().into_iter().map(Some).collect();
        let mut changed = true;
        while changed {
            changed = false;
            for i in 0..slots.len() {
                let Some(mut p1) = slots[i].take() else {
                    continue;
                };
                for j in 0..slots.len() {
                    if i == j {
                        continue;
                    }
                    let chains = matches!(&slots[j], Some(p2) if p1.last() == p2.first());
                    if chains {
                        if let Some(p2) = slots[j].take() {
                            p1.chain(&p2);
                            changed = true;
                        }
                    }
                }
                slots[i] = Some(p1);
            }
        }
        self.packs = slots.into_iter().flatten().collect();
    }

    /// Check that no node is a member of two packs.
    pub fn verify_injective(&self) -> Result<(), NodeId> {
        let mut seen = rustc_hash::FxHashSet::default();
        for pack in &self.packs {
            for n in pack.members() {
                if !seen.insert(n) {
                    return Err(n);
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Ordered Pair
// =============================================================================

/// Two node ids in ascending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OrderedPair {
    pub lo: NodeId,
    pub hi: NodeId,
}

impl OrderedPair {
    pub fn new(a: NodeId, b: NodeId) -> Self {
        if a <= b {
            OrderedPair { lo: a, hi: b }
        } else {
            OrderedPair { lo: b, hi: a }
        }
    }
}

// =============================================================================
// Element Size Statistics
// =============================================================================

/// Histogram of lane sizes (1, 2, 4, 8 bytes) across the surviving packs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VectorElementSizeStats {
    counts: [u32; 4],
}

impl VectorElementSizeStats {
    /// No pack was recorded.
    pub const NO_SIZE: i32 = -1;
    /// Packs disagree on lane size.
    pub const MIXED_SIZE: i32 = -2;

    fn slot(size: i32) -> Option<usize> {
        match size {
            1 => Some(0),
            2 => Some(1),
            4 => Some(2),
            8 => Some(3),
            _ => None,
        }
    }

    pub fn record(&mut self, size: i32) {
        if let Some(slot) = Self::slot(size) {
            self.counts[slot] += 1;
        }
    }

    pub fn count(&self, size: i32) -> u32 {
        Self::slot(size).map_or(0, |s| self.counts[s])
    }

    fn sizes(&self) -> impl Iterator<Item = i32> + '_ {
        self.counts
            .iter()
            .enumerate()
            .filter(|&(_, &c)| c > 0)
            .map(|(i, _)| 1 << i)
    }

    pub fn smallest(&self) -> i32 {
        self.sizes().next().unwrap_or(Self::NO_SIZE)
    }

    pub fn largest(&self) -> i32 {
        self.sizes().last().unwrap_or(Self::NO_SIZE)
    }

    /// The one size every pack uses, `NO_SIZE` or `MIXED_SIZE`.
    pub fn unique_size(&self) -> i32 {
        let mut sizes = self.sizes();
        match (sizes.next(), sizes.next()) {
            (None, _) => Self::NO_SIZE,
            (Some(size), None) => size,
            (Some(_), Some(_)) => Self::MIXED_SIZE,
        }
    }

    pub fn is_mixed(&self) -> bool {
        self.unique_size() == Self::MIXED_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(i: u32) -> NodeId {
        NodeId::new(i)
    }

    #[test]
    fn test_pack_chain_and_split() {
        let mut p = Pack::pair(n(1), n(2));
        p.chain(&Pack::pair(n(2), n(3)));
        p.chain(&Pack::from_lanes(&[n(3), n(4), n(5)]));
        assert_eq!(p.lanes(), &[n(1), n(2), n(3), n(4), n(5)]);
        let parts = p.split(2);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].lanes(), &[n(3), n(4)]);
        assert!(p.split(1).is_empty());
    }

    #[test]
    fn test_pack_members_include_fused() {
        let mut p = Pack::pair(n(10), n(11));
        p.set_fused(FusedCompare {
            cmps: Lanes::from_slice(&[n(1), n(2)]),
            bools: Lanes::from_slice(&[n(3), n(4)]),
            cond: CmpOp::Gt,
        });
        let members: Vec<_> = p.members().collect();
        assert_eq!(members, vec![n(10), n(11), n(1), n(2), n(3), n(4)]);
        assert_eq!(format!("{:?}", p), "[#10, #11] cmov(gt)");
    }

    #[test]
    fn test_packset_positions() {
        let mut set = PackSet::new();
        set.push(Pack::pair(n(1), n(2)));
        set.push(Pack::pair(n(2), n(3)));
        assert!(set.exists_at(n(2), 0));
        assert!(set.exists_at(n(2), 1));
        assert!(!set.exists_at(n(3), 0));
        assert!(set.contains_span(n(1), n(2)));
        assert_eq!(set.verify_injective(), Err(n(2)));
        set.retain(|p| p.first() != n(2));
        assert_eq!(set.len(), 1);
        assert_eq!(set.verify_injective(), Ok(()));
    }

    #[test]
    fn test_combine_chains_pairs() {
        let mut set = PackSet::new();
        set.push(Pack::pair(n(3), n(4)));
        set.push(Pack::pair(n(1), n(2)));
        set.push(Pack::pair(n(2), n(3)));
        set.push(Pack::pair(n(7), n(8)));
        set.combine();
        assert_eq!(set.len(), 2);
        assert_eq!(set.packs()[0].lanes(), &[n(1), n(2), n(3), n(4)]);
        assert_eq!(set.packs()[1].lanes(), &[n(7), n(8)]);
        let once = set.clone();
        set.combine();
        assert_eq!(set.packs(), once.packs());
    }

    #[test]
    fn test_ordered_pair_canonical() {
        assert_eq!(OrderedPair::new(n(9), n(3)), OrderedPair::new(n(3), n(9)));
        assert_eq!(OrderedPair::new(n(9), n(3)).lo, n(3));
    }

    #[test]
    fn test_element_size_stats() {
        let mut stats = VectorElementSizeStats::default();
        assert_eq!(stats.unique_size(), VectorElementSizeStats::NO_SIZE);
        stats.record(4);
        stats.record(4);
        assert_eq!(stats.unique_size(), 4);
        stats.record(8);
        assert!(stats.is_mixed());
        assert_eq!(stats.smallest(), 4);
        assert_eq!(stats.largest(), 8);
        assert_eq!(stats.count(4), 2);
        stats.record(3);
        assert_eq!(stats.count(3), 0);
    }
}
