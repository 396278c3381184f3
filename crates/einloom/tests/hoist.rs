use einloom::mapping::{Mapping, PartOp, Rank};
use einloom::{
    Equation, FlowGraph, FlowNode, Program, ScheduleOptions, SwizzleReason, TensorUse,
};

fn rank(name: &str) -> Rank {
    Rank::new(name)
}

fn ranks(names: &[&str]) -> Vec<Rank> {
    names.iter().map(|name| Rank::new(*name)).collect()
}

fn lb(name: &str) -> FlowNode {
    FlowNode::LoopBegin { rank: rank(name) }
}

fn from_fiber(tensor: &str, name: &str) -> FlowNode {
    FlowNode::FromFiber {
        tensor: tensor.to_string(),
        rank: rank(name),
    }
}

fn partition(tensor: &str, key: &[&str]) -> FlowNode {
    FlowNode::Partition {
        tensor: tensor.to_string(),
        key: ranks(key),
    }
}

fn get_root(tensor: &str, order: &[&str]) -> FlowNode {
    FlowNode::GetRoot {
        tensor: tensor.to_string(),
        ranks: ranks(order),
    }
}

fn get_payload(tensor: &str, prefix: &[&str]) -> FlowNode {
    FlowNode::GetPayload {
        tensor: tensor.to_string(),
        ranks: ranks(prefix),
    }
}

fn swizzle(tensor: &str, order: &[&str], reason: SwizzleReason) -> FlowNode {
    FlowNode::Swizzle {
        tensor: tensor.to_string(),
        ranks: ranks(order),
        reason,
    }
}

fn matmul(mapping: &Mapping) -> Program {
    let equation = Equation::new(
        TensorUse::new("Z", ["M", "N"]),
        vec![vec![
            TensorUse::new("A", ["M", "K"]),
            TensorUse::new("B", ["K", "N"]),
        ]],
    )
    .expect("matmul equation");
    Program::new(equation, mapping).expect("matmul program")
}

fn dynamic_mapping() -> Mapping {
    Mapping::new()
        .with_part("N", [PartOp::uniform_shape(4)])
        .with_part(
            "K",
            [
                PartOp::uniform_occupancy("A", 6),
                PartOp::uniform_occupancy("A", 3),
            ],
        )
        .with_loop_order(["K2", "M", "N1", "K1", "N0", "K0"])
}

fn build(program: &mut Program, hoist: bool) -> FlowGraph {
    FlowGraph::build(program, None, &ScheduleOptions { hoist }).expect("flow graph")
}

fn pos(graph: &FlowGraph, node: &FlowNode) -> usize {
    graph
        .position(node)
        .unwrap_or_else(|| panic!("{node:?} missing from the schedule"))
}

fn assert_dependencies_hold(graph: &FlowGraph) {
    for (before, after) in graph.dependencies() {
        assert!(
            pos(graph, before) < pos(graph, after),
            "{before:?} must schedule before {after:?}"
        );
    }
}

#[test]
fn loop_invariant_splits_float_out_of_unrelated_loops() {
    let mut program = matmul(&dynamic_mapping());
    let graph = build(&mut program, true);
    assert_dependencies_hold(&graph);

    // A's second split only touches the fiber produced under lb(M), so
    // the whole chain climbs past lb(N1)
    let m = pos(&graph, &lb("M"));
    let n1 = pos(&graph, &lb("N1"));
    for node in [
        from_fiber("A", "K1I"),
        partition("A", &["K1I"]),
        get_root("A", &["K1", "K0"]),
    ] {
        let at = pos(&graph, &node);
        assert!(m < at && at < n1, "{node:?} belongs between M and N1");
    }

    // B's fiber appears under lb(N1), so its split stays put
    let k1 = pos(&graph, &lb("K1"));
    for node in [
        from_fiber("B", "K1I"),
        partition("B", &["K1I"]),
        swizzle("B", &["K1", "N0", "K0"], SwizzleReason::Partitioning),
        get_root("B", &["K1", "N0", "K0"]),
    ] {
        let at = pos(&graph, &node);
        assert!(n1 < at && at < k1, "{node:?} belongs between N1 and K1");
    }
    assert!(pos(&graph, &partition("A", &["K1I"])) < pos(&graph, &partition("B", &["K1I"])));
}

#[test]
fn disabling_hoist_leaves_splits_at_their_insertion_point() {
    let mut program = matmul(&dynamic_mapping());
    let graph = build(&mut program, false);
    assert_dependencies_hold(&graph);
    assert!(
        pos(&graph, &lb("N1")) < pos(&graph, &from_fiber("A", "K1I")),
        "without hoisting the split stays where the walk emitted it"
    );
}

#[test]
fn discordant_projections_rise_to_their_gate() {
    let equation = Equation::new(
        TensorUse::new("Z", ["M", "N"]),
        vec![vec![
            TensorUse::new("A", ["M", "K"]),
            TensorUse::new("B", ["K", "N"]),
        ]],
    )
    .expect("dynamic flatten equation");
    let mapping = Mapping::new()
        .with_part("K", [PartOp::uniform_occupancy("A", 4)])
        .with_flatten(["M", "K0"]);
    let mut program = Program::new(equation, &mapping).expect("dynamic flatten program");
    let graph = build(&mut program, true);
    assert_dependencies_hold(&graph);

    // both depend only on coordinates fixed at lb(MK0) and lb(N), so
    // they climb out of the K1 loop and no further
    let n = pos(&graph, &lb("N"));
    let k1 = pos(&graph, &lb("K1"));
    for node in [
        get_payload("Z", &["M"]),
        FlowNode::Interval { rank: rank("K0") },
    ] {
        let at = pos(&graph, &node);
        assert!(n < at && at < k1, "{node:?} belongs between N and K1");
    }
    let eager = FlowNode::EagerInput {
        tensor: "B".to_string(),
        ranks: ranks(&["K0"]),
    };
    assert!(k1 < pos(&graph, &eager), "the buffer itself reads B's fiber under K1");
    assert!(pos(&graph, &eager) < pos(&graph, &get_payload("B", &["K0"])));
}
