//! Conditional-move fusion.
//!
//! After packing, `c ? x : y` per lane appears as three packs:
//!
//! ```text
//! [Cmp(a0, b0), Cmp(a1, b1), ..]
//! [Bool(gt, cmp0), Bool(gt, cmp1), ..]
//! [CMove(bool0, y0, x0), CMove(bool1, y1, x1), ..]
//! ```
//!
//! [`CMoveKit`] folds the compare and bool packs into the select pack, which
//! then emits one vector select instead of a materialized boolean vector.
//! The compare operands must be the select operands themselves (the
//! `max`/`min` idiom).

use super::pack::{FusedCompare, Lanes, Pack, PackId, PackSet};
use crate::ir::graph::Graph;
use crate::ir::node::NodeId;
use crate::ir::operators::{CmpOp, Operator};
use log::trace;
use rustc_hash::FxHashMap;

/// Select fusion over a pack set. Holds no state of its own: pack ids
/// shift whenever packs are dropped, so ownership is always read from the
/// caller's node-to-pack map.
#[derive(Debug, Clone, Copy, Default)]
pub struct CMoveKit;

/// Packs that fuse into one select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CMoveMerge {
    pub cmove: PackId,
    pub bools: PackId,
    pub cmps: PackId,
    pub cond: CmpOp,
}

impl CMoveKit {
    /// Every lane is a `Bool` of one condition read only by a select.
    pub fn is_bool_candidate(graph: &Graph, pack: &Pack) -> Option<CmpOp> {
        let Operator::Bool(cond) = graph.op(pack.first()) else {
            return None;
        };
        for &b in pack.lanes() {
            if graph.op(b) != Operator::Bool(cond) || graph.use_count(b) != 1 {
                return None;
            }
            let user = graph.uses(b)[0];
            if !matches!(graph.op(user), Operator::CMove(_)) || graph.input(user, 0) != Some(b) {
                return None;
            }
        }
        Some(cond)
    }

    /// Every lane is a `Cmp` read only by a `Bool`.
    pub fn is_cmp_candidate(graph: &Graph, pack: &Pack) -> bool {
        pack.lanes().iter().all(|&c| {
            matches!(graph.op(c), Operator::Cmp(_))
                && graph.use_count(c) == 1
                && matches!(graph.op(graph.uses(c)[0]), Operator::Bool(_))
        })
    }

    /// Compare operands are the select operands, in one orientation for
    /// every lane.
    pub fn test_cmp_pack(graph: &Graph, cmps: &Pack, cmoves: &Pack) -> bool {
        if cmps.len() != cmoves.len() {
            return false;
        }
        let operands = |n: NodeId, i: usize, j: usize| (graph.input(n, i), graph.input(n, j));
        let straight = cmps
            .lanes()
            .iter()
            .zip(cmoves.lanes())
            .all(|(&c, &m)| operands(c, 0, 1) == operands(m, 1, 2));
        let crossed = cmps
            .lanes()
            .iter()
            .zip(cmoves.lanes())
            .all(|(&c, &m)| operands(c, 0, 1) == operands(m, 2, 1));
        straight || crossed
    }

    /// Find the bool and compare packs feeding `cmove`.
    pub fn can_merge_cmove_pack(
        graph: &Graph,
        packs: &PackSet,
        my_pack: impl Fn(NodeId) -> Option<PackId>,
        cmove: PackId,
    ) -> Option<CMoveMerge> {
        let cm_pack = packs.get(cmove);
        if cm_pack.fused().is_some() || !matches!(graph.op(cm_pack.first()), Operator::CMove(_)) {
            return None;
        }
        let bool_lanes: Option<Lanes> = cm_pack.lanes().iter().map(|&m| graph.input(m, 0)).collect();
        let bool_lanes = bool_lanes?;
        let bools = my_pack(bool_lanes[0])?;
        if packs.get(bools).lanes() != bool_lanes.as_slice() {
            return None;
        }
        let cond = Self::is_bool_candidate(graph, packs.get(bools))?;

        let cmp_lanes: Option<Lanes> = bool_lanes.iter().map(|&b| graph.input(b, 0)).collect();
        let cmp_lanes = cmp_lanes?;
        let cmps = my_pack(cmp_lanes[0])?;
        if packs.get(cmps).lanes() != cmp_lanes.as_slice()
            || !Self::is_cmp_candidate(graph, packs.get(cmps))
            || !Self::test_cmp_pack(graph, packs.get(cmps), cm_pack)
        {
            return None;
        }
        Some(CMoveMerge {
            cmove,
            bools,
            cmps,
            cond,
        })
    }

    /// The select pack carrying its compare and bool lanes.
    pub fn make_cmove_pack(cmove: &Pack, bools: &Pack, cmps: &Pack, cond: CmpOp) -> Pack {
        let mut fused = cmove.clone();
        fused.set_fused(FusedCompare {
            cmps: Lanes::from_slice(cmps.lanes()),
            bools: Lanes::from_slice(bools.lanes()),
            cond,
        });
        fused
    }

    /// Fuse every eligible select pack; returns how many were fused.
    ///
    /// Pack ids change; the caller rebuilds its node-to-pack map.
    pub fn merge_packs(
        graph: &Graph,
        packs: &mut PackSet,
        my_pack: impl Fn(NodeId) -> Option<PackId>,
    ) -> usize {
        let merges: Vec<CMoveMerge> = packs
            .iter()
            .filter_map(|(id, _)| Self::can_merge_cmove_pack(graph, packs, &my_pack, id))
            .collect();
        if merges.is_empty() {
            return 0;
        }

        let old = packs.take_all();
        let mut fused_at: FxHashMap<usize, Pack> = FxHashMap::default();
        let mut absorbed = Vec::new();
        for m in &merges {
            let pack = Self::make_cmove_pack(
                &old[m.cmove.as_usize()],
                &old[m.bools.as_usize()],
                &old[m.cmps.as_usize()],
                m.cond,
            );
            trace!("cmove fused: {:?}", pack);
            fused_at.insert(m.cmove.as_usize(), pack);
            absorbed.push(m.bools.as_usize());
            absorbed.push(m.cmps.as_usize());
        }
        for (i, pack) in old.into_iter().enumerate() {
            if absorbed.contains(&i) {
                continue;
            }
            packs.push(fused_at.remove(&i).unwrap_or(pack));
        }
        merges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::LoopBuilder;
    use crate::ir::loops::CountedLoop;
    use crate::ir::types::BasicType;

    struct MaxLoop {
        graph: Graph,
        _lp: CountedLoop,
        cmps: Vec<NodeId>,
        bools: Vec<NodeId>,
        cmoves: Vec<NodeId>,
    }

    fn max_loop(crossed: bool) -> MaxLoop {
        let mut b = LoopBuilder::new(2);
        let out = b.distinct_array(BasicType::Int);
        let xs = b.distinct_array(BasicType::Int);
        let ys = b.distinct_array(BasicType::Int);
        let (mut cmps, mut bools, mut cmoves) = (Vec::new(), Vec::new(), Vec::new());
        for k in 0..2 {
            let x = b.load(xs, k);
            let y = b.load(ys, k);
            let c = b.cmp(x, y);
            let t = b.test(CmpOp::Gt, c);
            let m = if crossed { b.cmove(t, x, y) } else { b.cmove(t, y, x) };
            b.store(out, k, m);
            cmps.push(c);
            bools.push(t);
            cmoves.push(m);
        }
        let (graph, lp) = b.finish();
        MaxLoop {
            graph,
            _lp: lp,
            cmps,
            bools,
            cmoves,
        }
    }

    fn pack_lookup(packs: &PackSet) -> impl Fn(NodeId) -> Option<PackId> + '_ {
        move |n| packs.iter().find(|(_, p)| p.contains(n)).map(|(id, _)| id)
    }

    #[test]
    fn test_candidates() {
        let l = max_loop(false);
        let bools = Pack::from_lanes(&l.bools);
        let cmps = Pack::from_lanes(&l.cmps);
        let cmoves = Pack::from_lanes(&l.cmoves);
        assert_eq!(CMoveKit::is_bool_candidate(&l.graph, &bools), Some(CmpOp::Gt));
        assert!(CMoveKit::is_cmp_candidate(&l.graph, &cmps));
        assert!(!CMoveKit::is_cmp_candidate(&l.graph, &bools));
        assert!(CMoveKit::test_cmp_pack(&l.graph, &cmps, &cmoves));
        let crossed = max_loop(true);
        assert!(CMoveKit::test_cmp_pack(
            &crossed.graph,
            &Pack::from_lanes(&crossed.cmps),
            &Pack::from_lanes(&crossed.cmoves)
        ));
    }

    #[test]
    fn test_merge_fuses_three_packs() {
        let l = max_loop(false);
        let mut packs = PackSet::new();
        packs.push(Pack::from_lanes(&l.cmps));
        packs.push(Pack::from_lanes(&l.bools));
        let cm = packs.push(Pack::from_lanes(&l.cmoves));
        let snapshot = packs.clone();
        let merge = CMoveKit::can_merge_cmove_pack(&l.graph, &snapshot, pack_lookup(&snapshot), cm)
            .expect("mergeable");
        assert_eq!(merge.cond, CmpOp::Gt);

        let fused = CMoveKit::merge_packs(&l.graph, &mut packs, pack_lookup(&snapshot));
        assert_eq!(fused, 1);
        assert_eq!(packs.len(), 1);
        let pack = packs.get(PackId::new(0));
        assert_eq!(pack.lanes(), l.cmoves.as_slice());
        assert_eq!(pack.members().count(), 6);
        assert!(pack.members().any(|m| m == l.cmps[1]));
    }

    #[test]
    fn test_mismatched_lanes_not_merged() {
        let l = max_loop(false);
        let mut packs = PackSet::new();
        packs.push(Pack::from_lanes(&[l.cmps[1], l.cmps[0]]));
        packs.push(Pack::from_lanes(&l.bools));
        let cm = packs.push(Pack::from_lanes(&l.cmoves));
        assert!(CMoveKit::can_merge_cmove_pack(&l.graph, &packs, pack_lookup(&packs), cm).is_none());
    }
}
