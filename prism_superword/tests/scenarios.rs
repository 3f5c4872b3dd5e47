//! End-to-end SuperWord runs over small unrolled loops.

use prism_superword::ir::{
    BasicType, BinaryOp, CmpOp, ControlOp, CountedLoop, Graph, LoopBuilder, LoopFlags, MemoryOp,
    NodeFlags, NodeId, Operator, VectorKind,
};
use prism_superword::opt::superword::{
    CostModel, Pack, PackSet, SimdLevel, SimdTarget, SlpError, SlpOutcome, SuperWord,
    SuperWordConfig, TraceFlags,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn run(level: SimdLevel, g: &mut Graph, lp: &mut CountedLoop) -> Result<SlpOutcome, SlpError> {
    let target = SimdTarget::new(level);
    let config = SuperWordConfig {
        simd_level: level,
        ..SuperWordConfig::default()
    };
    let mut sw = SuperWord::new(config, &target, CostModel::new(level));
    sw.transform_loop(g, lp)
}

fn vector_nodes(g: &Graph, kind: impl Fn(VectorKind) -> bool) -> Vec<NodeId> {
    g.live_nodes()
        .filter(|&n| matches!(g.op(n), Operator::Vector(v) if kind(v.kind)))
        .collect()
}

/// `a[i + k] = a[i + k] + a[i + k]`, unrolled four times.
fn in_place_add() -> (Graph, CountedLoop, Vec<NodeId>) {
    let mut b = LoopBuilder::new(4);
    let a = b.array(BasicType::Int);
    let mut scalars = Vec::new();
    for k in 0..4 {
        let x = b.load(a, k);
        let y = b.binary(BinaryOp::Add, x, x);
        let s = b.store(a, k, y);
        scalars.extend([x, y, s]);
    }
    let (g, lp) = b.finish();
    (g, lp, scalars)
}

#[test]
fn test_in_place_add_vectorizes() {
    init_logging();
    let (mut g, mut lp, scalars) = in_place_add();
    let outcome = run(SimdLevel::Avx2, &mut g, &mut lp).expect("vectorized");

    assert_eq!(outcome.packs.len(), 3);
    assert_eq!(outcome.vector_nodes, 3);
    assert_eq!(outcome.scalars_removed, 12);
    assert!(scalars.iter().all(|&n| g.node(n).is_dead()));
    assert_eq!(vector_nodes(&g, |k| k == VectorKind::Load).len(), 1);
    assert_eq!(vector_nodes(&g, |k| k == VectorKind::Binary(BinaryOp::Add)).len(), 1);

    let stores = vector_nodes(&g, |k| k == VectorKind::Store);
    assert_eq!(stores.len(), 1);
    let phi = lp.memory_phis(&g)[0];
    assert_eq!(g.input(phi, 2), Some(stores[0]));
    assert!(lp.flags.contains(LoopFlags::VECTORIZED));
    let adj = lp.pre_loop_adjustment.expect("alignment anchor");
    assert_eq!(adj.vector_width, 16);
    assert!(g.verify().is_ok());
}

#[test]
fn test_invariant_operand_replicated_outside_loop() {
    init_logging();
    let mut b = LoopBuilder::new(4);
    let a = b.array(BasicType::Int);
    let c = b.invariant(BasicType::Int);
    for k in 0..4 {
        let x = b.load(a, k);
        let y = b.binary(BinaryOp::Add, x, c);
        b.store(a, k, y);
    }
    let (mut g, mut lp) = b.finish();
    let outcome = run(SimdLevel::Avx2, &mut g, &mut lp).expect("vectorized");

    assert_eq!(outcome.vector_nodes, 4);
    let replicates = vector_nodes(&g, |k| k == VectorKind::Replicate);
    assert_eq!(replicates.len(), 1);
    let r = replicates[0];
    assert_eq!(g.input(r, 0), Some(c));
    assert!(!lp.contains(r));
    assert!(g.node(r).flags.contains(NodeFlags::LOOP_INVARIANT));
    assert!(g.verify().is_ok());
}

#[test]
fn test_indexed_load_left_scalar() {
    init_logging();
    // out[i + k] = data[idx[i + k]]
    let mut b = LoopBuilder::new(4);
    let idx = b.distinct_array(BasicType::Int);
    let data = b.distinct_array(BasicType::Int);
    let out = b.distinct_array(BasicType::Int);
    for k in 0..4 {
        let j = b.load(idx, k);
        let v = b.load_at(data, j);
        b.store(out, k, v);
    }
    let (mut g, mut lp) = b.finish();
    let before = g.clone();

    let result = run(SimdLevel::Avx2, &mut g, &mut lp);
    assert_eq!(result.unwrap_err(), SlpError::NoProfitablePacks);
    assert!(g.structurally_equal(&before));
    assert!(!lp.flags.contains(LoopFlags::VECTORIZED));
    assert!(lp.pre_loop_adjustment.is_none());
}

#[test]
fn test_indexed_store_left_scalar() {
    init_logging();
    // out[idx[i + k]] = src[i + k]
    let mut b = LoopBuilder::new(4);
    let idx = b.distinct_array(BasicType::Int);
    let src = b.distinct_array(BasicType::Int);
    let out = b.distinct_array(BasicType::Int);
    let mut stores = Vec::new();
    for k in 0..4 {
        let j = b.load(idx, k);
        let v = b.load(src, k);
        stores.push(b.store_at(out, j, v));
    }
    let (mut g, mut lp) = b.finish();
    let before = g.clone();

    assert!(run(SimdLevel::Avx2, &mut g, &mut lp).is_err());
    assert!(g.structurally_equal(&before));
    assert!(stores.iter().all(|&s| !g.node(s).is_dead()));
    assert!(!lp.flags.contains(LoopFlags::VECTORIZED));
    assert!(lp.pre_loop_adjustment.is_none());
}

#[test]
fn test_load_of_old_state_stays_before_store() {
    init_logging();
    let mut b = LoopBuilder::new(4);
    let a = b.array(BasicType::Int);
    let c = b.invariant(BasicType::Int);
    let first = b.store(a, 0, c);
    for k in 1..4 {
        b.store(a, k, c);
    }
    let (mut g, mut lp) = b.finish();

    // A load of a[i] made after the stores but reading the state they replace.
    let phi = lp.memory_phis(&g)[0];
    let adr = g.node(first).address_input().expect("address");
    let old = g.add_node(Operator::Memory(MemoryOp::Load(BasicType::Int)), &[phi, adr]);
    lp.add_to_body(old);
    let exit = g.add_node(Operator::Control(ControlOp::Return), &[old]);
    assert!(first < old);

    run(SimdLevel::Avx2, &mut g, &mut lp).expect("vectorized");
    let stores = vector_nodes(&g, |k| k == VectorKind::Store);
    assert_eq!(stores.len(), 1);
    assert_eq!(g.input(old, 0), Some(phi));
    assert_eq!(g.input(exit, 0), Some(old));
    assert_eq!(g.input(stores[0], 0), Some(phi));
    assert_eq!(g.input(phi, 2), Some(stores[0]));
    assert!(g.verify().is_ok());
}

#[test]
fn test_sum_reduction() {
    init_logging();
    let mut b = LoopBuilder::new(4);
    let a = b.array(BasicType::Int);
    let init = b.invariant(BasicType::Int);
    let acc = b.accumulator(init);
    let mut sum = acc;
    for k in 0..4 {
        let x = b.load(a, k);
        sum = b.binary(BinaryOp::Add, sum, x);
    }
    b.close_accumulator(acc, sum);
    let exit = b.exit_use(sum);
    let (mut g, mut lp) = b.finish();

    let outcome = run(SimdLevel::Avx2, &mut g, &mut lp).expect("vectorized");
    assert_eq!(outcome.reductions, 1);
    assert!(lp.flags.contains(LoopFlags::HAS_REDUCTIONS));

    let reduces = vector_nodes(&g, |k| k == VectorKind::Reduce(BinaryOp::Add));
    assert_eq!(reduces.len(), 1);
    let reduce = reduces[0];
    assert!(!lp.contains(reduce));
    assert_eq!(g.input(exit, 0), Some(reduce));
    assert_eq!(g.input(reduce, 0), Some(init));
    assert!(g.node(acc).is_dead());

    // The accumulator is now a vector phi closed by the vector add.
    let vop = g.input(reduce, 1).expect("vector accumulator");
    let vphi = g.input(vop, 0).expect("vector phi");
    assert!(g.node(vphi).is_phi());
    assert_eq!(g.input(vphi, 2), Some(vop));
    assert!(g.verify().is_ok());
}

#[test]
fn test_tracing_leaves_result_unchanged() {
    init_logging();
    let sum_loop = || {
        let mut b = LoopBuilder::new(4);
        let a = b.array(BasicType::Int);
        let init = b.invariant(BasicType::Int);
        let acc = b.accumulator(init);
        let mut sum = acc;
        for k in 0..4 {
            let x = b.load(a, k);
            sum = b.binary(BinaryOp::Add, sum, x);
        }
        b.close_accumulator(acc, sum);
        b.exit_use(sum);
        b.finish()
    };
    let target = SimdTarget::new(SimdLevel::Avx2);
    let quiet = SuperWordConfig::avx2();
    let loud = SuperWordConfig {
        trace: TraceFlags::all(),
        ..SuperWordConfig::avx2()
    };

    let (mut g1, mut lp1) = sum_loop();
    let (mut g2, mut lp2) = sum_loop();
    let plain = SuperWord::new(quiet, &target, CostModel::new(SimdLevel::Avx2))
        .transform_loop(&mut g1, &mut lp1)
        .expect("vectorized");
    let traced = SuperWord::new(loud, &target, CostModel::new(SimdLevel::Avx2))
        .transform_loop(&mut g2, &mut lp2)
        .expect("vectorized");
    assert_eq!(plain.packs, traced.packs);
    assert_eq!(plain.reductions, traced.reductions);
    assert!(g1.structurally_equal(&g2));
}

/// `dst[i + k] = (int) src[i + k]` over longs.
fn long_to_int() -> (Graph, CountedLoop) {
    let mut b = LoopBuilder::new(4);
    let src = b.distinct_array(BasicType::Long);
    let dst = b.distinct_array(BasicType::Int);
    for k in 0..4 {
        let x = b.load(src, k);
        let y = b.convert(x, BasicType::Int);
        b.store(dst, k, y);
    }
    b.finish()
}

#[test]
fn test_narrowing_conversion_needs_wide_registers() {
    init_logging();
    let (mut g, mut lp) = long_to_int();
    let before = g.clone();
    let target = SimdTarget::new(SimdLevel::Sse42);
    let mut sw = SuperWord::new(
        SuperWordConfig::sse42(),
        &target,
        CostModel::new(SimdLevel::Sse42),
    );
    assert_eq!(
        sw.transform_loop(&mut g, &mut lp).unwrap_err(),
        SlpError::NoProfitablePacks
    );
    assert!(sw.element_size_stats().is_mixed());
    assert!(g.structurally_equal(&before));

    let (mut g, mut lp) = long_to_int();
    let outcome = run(SimdLevel::Avx2, &mut g, &mut lp).expect("vectorized");
    assert_eq!(outcome.packs.len(), 3);
    assert!(outcome.element_sizes.is_mixed());
    let converts = vector_nodes(&g, |k| {
        k == VectorKind::Convert {
            from: BasicType::Long,
        }
    });
    assert_eq!(converts.len(), 1);
    assert!(g.verify().is_ok());
}

#[test]
fn test_second_run_finds_nothing() {
    init_logging();
    let (mut g, mut lp, _) = in_place_add();
    run(SimdLevel::Avx2, &mut g, &mut lp).expect("vectorized");
    let after = g.clone();
    assert_eq!(
        run(SimdLevel::Avx2, &mut g, &mut lp).unwrap_err(),
        SlpError::NoMemoryOps
    );
    assert!(g.structurally_equal(&after));
}

#[test]
fn test_select_fused_into_vector_cmove() {
    init_logging();
    // out[i + k] = xs[i + k] > ys[i + k] ? xs[i + k] : ys[i + k]
    let mut b = LoopBuilder::new(4);
    let out = b.distinct_array(BasicType::Int);
    let xs = b.distinct_array(BasicType::Int);
    let ys = b.distinct_array(BasicType::Int);
    for k in 0..4 {
        let x = b.load(xs, k);
        let y = b.load(ys, k);
        let c = b.cmp(x, y);
        let t = b.test(CmpOp::Gt, c);
        let m = b.cmove(t, y, x);
        b.store(out, k, m);
    }
    let (mut g, mut lp) = b.finish();

    let outcome = run(SimdLevel::Avx2, &mut g, &mut lp).expect("vectorized");
    assert_eq!(outcome.fused_cmoves, 1);
    assert_eq!(vector_nodes(&g, |k| k == VectorKind::CMove(CmpOp::Gt)).len(), 1);
    assert!(vector_nodes(&g, |k| matches!(k, VectorKind::Cmp(_))).is_empty());
    assert!(g.verify().is_ok());
}

#[test]
fn test_emitted_packs_are_isomorphic() {
    let mut b = LoopBuilder::new(8);
    let src = b.distinct_array(BasicType::Float);
    let dst = b.distinct_array(BasicType::Float);
    let scale = b.invariant(BasicType::Float);
    let mut ops: Vec<(NodeId, Operator)> = Vec::new();
    for k in 0..8 {
        let x = b.load(src, k);
        let y = b.binary(BinaryOp::Mul, x, scale);
        let s = b.store(dst, k, y);
        for n in [x, y, s] {
            ops.push((n, b.graph().op(n)));
        }
    }
    let (mut g, mut lp) = b.finish();
    let outcome = run(SimdLevel::Avx2, &mut g, &mut lp).expect("vectorized");

    assert_eq!(outcome.packs.len(), 3);
    for lanes in &outcome.packs {
        assert_eq!(lanes.len(), 8);
        assert!(lanes.len().is_power_of_two());
        let op_of = |n: NodeId| ops.iter().find(|(m, _)| *m == n).map(|(_, op)| *op);
        let first = op_of(lanes[0]).expect("scalar");
        assert!(lanes.iter().all(|&n| op_of(n) == Some(first)));
        for (i, a) in lanes.iter().enumerate() {
            assert!(lanes[i + 1..].iter().all(|b| b != a));
        }
    }
}

#[test]
fn test_combine_independent_of_pair_order() {
    let n = |i: u32| NodeId::new(i);
    let pairs = [(1, 2), (2, 3), (3, 4), (10, 11), (11, 12), (20, 21)];

    let combined = |order: &[usize]| {
        let mut set = PackSet::new();
        for &i in order {
            let (a, b) = pairs[i];
            set.push(Pack::pair(n(a), n(b)));
        }
        set.combine();
        let mut lanes: Vec<Vec<NodeId>> = set.packs().iter().map(|p| p.lanes().to_vec()).collect();
        lanes.sort();
        lanes
    };

    let forward = combined(&[0, 1, 2, 3, 4, 5]);
    assert_eq!(forward.len(), 3);
    assert_eq!(forward[0], vec![n(1), n(2), n(3), n(4)]);
    assert_eq!(combined(&[5, 4, 3, 2, 1, 0]), forward);
    assert_eq!(combined(&[2, 4, 0, 5, 1, 3]), forward);
}
