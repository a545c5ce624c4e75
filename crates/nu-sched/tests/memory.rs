//! Memory ordering edges, with and without an alias oracle

use nu_sched::mir::{MachineFunction, MachineInstr, MemOperand, Reg};
use nu_sched::{
    AliasOracle, AliasResult, DagBuilder, DepKind, NodeId, OffsetAliasOracle, RegisterFile,
    SchedOptions, SchedRegion, ScheduleDag, UnitTiming,
};

fn block_of(instrs: Vec<MachineInstr>) -> MachineFunction {
    let mut func = MachineFunction::new();
    let bb = func.alloc_block();
    for mi in instrs {
        func.block_mut(bb).push(mi);
    }
    func
}

fn build_opts(
    func: &MachineFunction,
    aa: Option<&dyn AliasOracle>,
    options: SchedOptions,
) -> ScheduleDag {
    let regs = RegisterFile::new(16);
    let mut builder = DagBuilder::new(func, &regs, &UnitTiming, options);
    let dag = builder.build_region(SchedRegion::whole(&func.blocks[0]), aa);
    dag.verify().unwrap();
    dag
}

fn build(func: &MachineFunction, aa: Option<&dyn AliasOracle>) -> ScheduleDag {
    build_opts(func, aa, SchedOptions::default())
}

fn n(i: u32) -> NodeId {
    NodeId(i)
}

fn store(mem: MemOperand) -> MachineInstr {
    MachineInstr::new("st").with_use(Reg(1)).store(mem)
}

fn load(dst: u32, mem: MemOperand) -> MachineInstr {
    MachineInstr::new("ld").with_def(Reg(dst)).load(mem)
}

#[test]
fn store_then_load_is_ordered() {
    let func = block_of(vec![store(MemOperand::unknown(4)), load(2, MemOperand::unknown(4))]);
    let dag = build(&func, None);

    let edge = dag.edge(n(0), n(1), DepKind::Order).unwrap();
    assert_eq!(edge.latency, nu_sched::STORE_LOAD_LATENCY);
}

#[test]
fn load_then_store_is_ordered() {
    let func = block_of(vec![load(2, MemOperand::unknown(4)), store(MemOperand::unknown(4))]);
    let dag = build(&func, None);
    assert_eq!(dag.edge(n(0), n(1), DepKind::Order).unwrap().latency, 0);
}

#[test]
fn loads_are_not_ordered() {
    let func = block_of(vec![
        load(2, MemOperand::unknown(4)),
        load(3, MemOperand::object(1, 0, 4)),
        load(4, MemOperand::unknown(4)),
    ]);
    let dag = build(&func, None);
    assert_eq!(dag.num_edges(), 0);
}

#[test]
fn store_to_unknown_object_starts_alias_chain() {
    let func = block_of(vec![
        store(MemOperand::unknown(4)),
        store(MemOperand::unknown(4)),
        store(MemOperand::unknown(4)),
    ]);
    let dag = build(&func, None);

    assert!(dag.edge(n(0), n(1), DepKind::Order).is_some());
    assert!(dag.edge(n(1), n(2), DepKind::Order).is_some());
    // Reached through the chain, not directly
    assert!(dag.edge(n(0), n(2), DepKind::Order).is_none());
    assert!(dag.reaches(n(0), n(2)));
}

#[test]
fn distinct_objects_are_independent() {
    let func = block_of(vec![
        store(MemOperand::object(1, 0, 4)),
        store(MemOperand::object(2, 0, 4)),
        load(2, MemOperand::object(2, 0, 4)),
        load(3, MemOperand::object(1, 0, 4)),
    ]);
    let dag = build(&func, None);

    assert!(!dag.is_pred(n(0), n(1)));
    assert!(dag.edge(n(1), n(2), DepKind::Order).is_some());
    assert!(dag.edge(n(0), n(3), DepKind::Order).is_some());
    assert!(!dag.is_pred(n(0), n(2)));
    assert!(!dag.is_pred(n(1), n(3)));
}

#[test]
fn unknown_access_orders_against_identified_object() {
    let func = block_of(vec![
        store(MemOperand::object(1, 0, 4)),
        load(2, MemOperand::unknown(4)),
        store(MemOperand::unknown(4)),
        load(3, MemOperand::object(1, 0, 4)),
    ]);
    let dag = build(&func, None);

    assert!(dag.is_pred(n(0), n(1)));
    assert!(dag.is_pred(n(1), n(2)));
    assert!(dag.reaches(n(0), n(2)));
    assert!(dag.is_pred(n(2), n(3)));
}

#[test]
fn private_objects_are_invisible_to_unknown_accesses() {
    let func = block_of(vec![
        store(MemOperand::private(7, 0, 8)),
        load(2, MemOperand::unknown(4)),
        store(MemOperand::unknown(4)),
        load(3, MemOperand::private(7, 0, 8)),
    ]);
    let dag = build(&func, None);

    assert!(!dag.is_pred(n(0), n(1)));
    assert!(!dag.is_pred(n(0), n(2)));
    assert!(!dag.is_pred(n(2), n(3)));
    assert!(dag.edge(n(0), n(3), DepKind::Order).is_some());
}

#[test]
fn invariant_loads_have_no_memory_edges() {
    let func = block_of(vec![
        store(MemOperand::unknown(4)),
        load(2, MemOperand::unknown(4).invariant()),
        store(MemOperand::unknown(4)),
    ]);
    let dag = build(&func, None);

    assert!(dag.node(n(1)).preds.is_empty());
    assert!(dag.node(n(1)).succs.is_empty());
}

#[test]
fn volatile_access_orders_everything() {
    let func = block_of(vec![
        load(2, MemOperand::private(1, 0, 4)),
        load(3, MemOperand::unknown(4).volatile()),
        load(4, MemOperand::private(2, 0, 4)),
    ]);
    let dag = build(&func, None);

    assert!(dag.edge(n(0), n(1), DepKind::Order).is_some());
    assert!(dag.edge(n(1), n(2), DepKind::Order).is_some());
}

#[test]
fn memory_op_without_description_is_ordered() {
    let mut opaque = MachineInstr::new("ld").with_def(Reg(2));
    opaque.flags.may_load = true;
    let func = block_of(vec![load(3, MemOperand::object(1, 0, 4)), opaque]);
    assert!(func.blocks[0].instrs[1].has_ordered_memory_ref());

    let dag = build(&func, None);
    assert!(dag.is_pred(n(0), n(1)));
}

#[test]
fn paired_spill_store_follows_load_of_its_slot() {
    let pair = MachineInstr::new("stp")
        .with_use(Reg(1))
        .with_use(Reg(2))
        .store(MemOperand::private(7, 0, 4))
        .store(MemOperand::private(7, 4, 4));
    let func = block_of(vec![load(3, MemOperand::private(7, 0, 4)), pair]);
    let dag = build(&func, None);

    assert!(dag.is_pred(n(0), n(1)));
}

#[test]
fn paired_load_follows_store_to_its_slot() {
    let pair = MachineInstr::new("ldp")
        .with_def(Reg(2))
        .with_def(Reg(3))
        .load(MemOperand::private(7, 0, 4))
        .load(MemOperand::unknown(4));
    let func = block_of(vec![store(MemOperand::private(7, 0, 4)), pair]);
    let dag = build(&func, None);

    assert!(dag.is_pred(n(0), n(1)));
}

#[test]
fn copy_between_aliasing_objects_leaves_private_slots_alone() {
    let copy = MachineInstr::new("memcpy")
        .load(MemOperand::object(1, 0, 8))
        .store(MemOperand::object(2, 0, 8));
    let func = block_of(vec![
        store(MemOperand::private(7, 0, 4)),
        copy,
        load(2, MemOperand::private(7, 0, 4)),
    ]);
    let dag = build(&func, None);

    assert!(!dag.is_pred(n(0), n(1)));
    assert!(!dag.is_pred(n(1), n(2)));
    assert!(dag.edge(n(0), n(2), DepKind::Order).is_some());
}

#[test]
fn call_orders_memory_on_both_sides() {
    let func = block_of(vec![
        load(2, MemOperand::object(1, 0, 4)),
        MachineInstr::new("call").call(),
        store(MemOperand::object(3, 0, 4)),
    ]);
    let dag = build(&func, None);

    assert!(dag.edge(n(0), n(1), DepKind::Order).is_some());
    assert!(dag.edge(n(1), n(2), DepKind::Order).is_some());
}

#[test]
fn stores_stay_ahead_of_exit() {
    let func = block_of(vec![
        store(MemOperand::object(1, 0, 4)),
        load(2, MemOperand::unknown(4)),
    ]);
    let dag = build(&func, None);

    let edge = dag.edge(n(0), NodeId::EXIT, DepKind::Artificial).unwrap();
    assert!(edge.is_artificial());
    assert!(!dag.is_pred(n(1), NodeId::EXIT));
}

#[test]
fn oracle_removes_edges_between_disjoint_accesses() {
    let func = block_of(vec![
        store(MemOperand::object(1, 0, 4)),
        store(MemOperand::object(1, 4, 4)),
        load(2, MemOperand::object(1, 0, 4)),
    ]);

    let conservative = build(&func, None);
    assert!(conservative.is_pred(n(0), n(1)));
    assert!(conservative.is_pred(n(1), n(2)));

    let precise = build(&func, Some(&OffsetAliasOracle));
    assert!(!precise.is_pred(n(0), n(1)));
    assert!(!precise.is_pred(n(1), n(2)));
    // The overlapping pair still needs its edge
    let edge = precise.edge(n(0), n(2), DepKind::Order).unwrap();
    assert_eq!(edge.latency, nu_sched::STORE_LOAD_LATENCY);
}

#[test]
fn oracle_answering_no_alias_removes_all_memory_edges() {
    let never = |_: &MachineInstr, _: &MachineInstr| AliasResult::NoAlias;
    let func = block_of(vec![
        store(MemOperand::unknown(4)),
        load(2, MemOperand::unknown(4)),
        store(MemOperand::unknown(4)),
    ]);
    let dag = build(&func, Some(&never));

    assert!(!dag.is_pred(n(0), n(1)));
    assert!(!dag.is_pred(n(1), n(2)));
    assert!(!dag.is_pred(n(0), n(2)));
}

#[test]
fn oracle_is_not_asked_about_barriers() {
    let never = |_: &MachineInstr, _: &MachineInstr| AliasResult::NoAlias;
    let func = block_of(vec![
        store(MemOperand::unknown(4)),
        load(2, MemOperand::unknown(4).volatile()),
    ]);
    let dag = build(&func, Some(&never));
    assert!(dag.is_pred(n(0), n(1)));
}

#[test]
fn ruled_out_store_still_orders_what_it_covered() {
    // The second store was ordered before the unknown load; the first store
    // must reach the load even though it is separated from the second store
    let func = block_of(vec![
        store(MemOperand::object(1, 0, 4)),
        store(MemOperand::object(1, 4, 4)),
        load(2, MemOperand::unknown(4)),
    ]);
    let dag = build(&func, Some(&OffsetAliasOracle));

    assert!(!dag.is_pred(n(0), n(1)));
    assert!(dag.is_pred(n(1), n(2)));
    assert!(dag.is_pred(n(0), n(2)));
}

#[test]
fn store_to_other_object_does_not_cover_separated_store() {
    // The oracle separates the last two stores and the load from the first
    // unknown store. The store to object 2 is ordered before the last store
    // but the load never passes through it.
    let oracle = |a: &MachineInstr, b: &MachineInstr| {
        let mut pair = [a.opcode.as_str(), b.opcode.as_str()];
        pair.sort_unstable();
        match pair {
            ["ld.a", "st.d"] | ["st.c", "st.d"] => AliasResult::NoAlias,
            _ => AliasResult::MayAlias,
        }
    };
    let func = block_of(vec![
        MachineInstr::new("ld.a").with_def(Reg(2)).load(MemOperand::object(1, 0, 4)),
        MachineInstr::new("st.b").with_use(Reg(1)).store(MemOperand::object(2, 0, 4)),
        MachineInstr::new("st.d").with_use(Reg(1)).store(MemOperand::unknown(4)),
        MachineInstr::new("st.c").with_use(Reg(1)).store(MemOperand::unknown(4)),
    ]);
    let dag = build(&func, Some(&oracle));

    assert!(!dag.is_pred(n(2), n(3)));
    assert!(!dag.is_pred(n(0), n(2)));
    assert!(dag.is_pred(n(1), n(3)));
    assert!(dag.reaches(n(0), n(3)));
}

#[test]
fn chain_depth_zero_falls_back_to_conservative_edges() {
    let func = block_of(vec![
        store(MemOperand::object(1, 0, 4)),
        store(MemOperand::object(1, 4, 4)),
    ]);
    let opts = SchedOptions::new().with_max_chain_depth(0);
    let dag = build_opts(&func, Some(&OffsetAliasOracle), opts);
    assert!(dag.is_pred(n(0), n(1)));
}

#[test]
fn rejected_overflow_falls_back_to_conservative_edges() {
    let func = block_of(vec![
        store(MemOperand::object(1, 0, 4)),
        store(MemOperand::object(1, 4, 4)),
        store(MemOperand::object(1, 8, 4)),
    ]);

    let precise = build(&func, Some(&OffsetAliasOracle));
    assert_eq!(precise.edge_counts().get(&DepKind::Order), None);

    let opts = SchedOptions::new().with_max_rejected(0);
    let bounded = build_opts(&func, Some(&OffsetAliasOracle), opts);
    assert!(bounded.is_pred(n(0), n(2)));
}

#[test]
fn oracle_statistics_are_counted() {
    let func = block_of(vec![
        store(MemOperand::object(1, 0, 4)),
        store(MemOperand::object(1, 4, 4)),
    ]);
    let regs = RegisterFile::new(16);
    let mut builder = DagBuilder::new(&func, &regs, &UnitTiming, SchedOptions::default());
    builder.build_region(SchedRegion::whole(&func.blocks[0]), Some(&OffsetAliasOracle));

    assert_eq!(builder.stats().alias_queries, 1);
    assert_eq!(builder.stats().alias_edges_omitted, 1);
    assert_eq!(builder.stats().order_edges, 0);
    assert_eq!(builder.stats().artificial_edges, 2);
}
