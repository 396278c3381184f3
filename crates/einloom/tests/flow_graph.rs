use einloom::error::SchedError;
use einloom::mapping::{Mapping, PartOp, Rank};
use einloom::{
    BindingTable, Equation, FlowGraph, FlowNode, Milestone, Program, ScheduleOptions,
    SwizzleReason, TensorUse,
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

fn le(name: &str) -> FlowNode {
    FlowNode::LoopEnd { rank: rank(name) }
}

fn swizzle(tensor: &str, order: &[&str], reason: SwizzleReason) -> FlowNode {
    FlowNode::Swizzle {
        tensor: tensor.to_string(),
        ranks: ranks(order),
        reason,
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

fn partition(tensor: &str, key: &[&str]) -> FlowNode {
    FlowNode::Partition {
        tensor: tensor.to_string(),
        key: ranks(key),
    }
}

fn from_fiber(tensor: &str, name: &str) -> FlowNode {
    FlowNode::FromFiber {
        tensor: tensor.to_string(),
        rank: rank(name),
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

/// Two occupancy splits of K with a shape split of N, ordered so the
/// second K level opens between the N levels.
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

/// A declares its ranks against the flatten's member order so the merge
/// needs an adjacency swizzle first.
fn flattened_matmul() -> Program {
    let equation = Equation::new(
        TensorUse::new("Z", ["M", "N"]),
        vec![vec![
            TensorUse::new("A", ["K", "M"]),
            TensorUse::new("B", ["K", "N"]),
        ]],
    )
    .expect("flattened equation");
    let mapping = Mapping::new().with_flatten(["M", "K"]);
    Program::new(equation, &mapping).expect("flattened program")
}

/// Flattening M with the bottom of a dynamic split of K.
fn dynamic_flatten() -> Program {
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
    Program::new(equation, &mapping).expect("dynamic flatten program")
}

/// Flattening M with the bottom of a two-level dynamic split of K: the
/// member only exists once the in-nest K1I split has run.
fn deep_dynamic_flatten() -> Program {
    let equation = Equation::new(
        TensorUse::new("Z", ["M", "N"]),
        vec![vec![
            TensorUse::new("A", ["M", "K"]),
            TensorUse::new("B", ["K", "N"]),
        ]],
    )
    .expect("deep flatten equation");
    let mapping = Mapping::new()
        .with_part(
            "K",
            [
                PartOp::uniform_occupancy("A", 6),
                PartOp::uniform_occupancy("A", 3),
            ],
        )
        .with_flatten(["M", "K0"]);
    Program::new(equation, &mapping).expect("deep flatten program")
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
fn unpartitioned_matmul_schedules_setup_loops_and_milestones() {
    let mut program = matmul(&Mapping::new());
    let graph = build(&mut program, true);
    assert_eq!(graph.len(), graph.schedule().len());
    assert_eq!(graph.position(&partition("A", &["M"])), None);
    assert_dependencies_hold(&graph);

    let schedule = graph.into_schedule();
    assert_eq!(
        schedule,
        vec![
            FlowNode::Milestone(Milestone::Output),
            swizzle("Z", &["M", "N"], SwizzleReason::LoopOrder),
            get_root("Z", &["M", "N"]),
            swizzle("A", &["M", "K"], SwizzleReason::LoopOrder),
            get_root("A", &["M", "K"]),
            swizzle("B", &["N", "K"], SwizzleReason::LoopOrder),
            get_root("B", &["N", "K"]),
            FlowNode::Milestone(Milestone::Graphics),
            lb("M"),
            lb("N"),
            lb("K"),
            FlowNode::Milestone(Milestone::Body),
            le("K"),
            le("N"),
            le("M"),
            FlowNode::Milestone(Milestone::Footer),
        ]
    );
}

#[test]
fn static_chains_apply_before_the_nest() {
    let mapping = Mapping::new().with_part(
        "M",
        [PartOp::uniform_shape(6), PartOp::uniform_shape(2)],
    );
    let mut program = matmul(&mapping);
    let graph = build(&mut program, true);
    assert_dependencies_hold(&graph);

    let graphics = pos(&graph, &FlowNode::Milestone(Milestone::Graphics));
    assert!(pos(&graph, &partition("Z", &["M"])) < graphics);
    assert!(pos(&graph, &partition("A", &["M"])) < graphics);
    assert_eq!(graph.position(&partition("B", &["M"])), None);

    assert!(graph.position(&get_root("A", &["M2", "M1", "M0", "K"])).is_some());
    assert!(graph.position(&get_root("B", &["N", "K"])).is_some());

    let begins = [lb("M2"), lb("M1"), lb("M0"), lb("N"), lb("K")];
    for pair in begins.windows(2) {
        assert!(pos(&graph, &pair[0]) < pos(&graph, &pair[1]));
    }
}

#[test]
fn dynamic_chains_split_just_in_time() {
    let mut program = matmul(&dynamic_mapping());
    let graph = build(&mut program, false);
    assert_dependencies_hold(&graph);

    // the fresh ranks split off before the nest, with followers behind
    // their leader
    let graphics = pos(&graph, &FlowNode::Milestone(Milestone::Graphics));
    assert!(pos(&graph, &partition("A", &["K"])) < pos(&graph, &partition("B", &["K"])));
    assert!(pos(&graph, &partition("B", &["K"])) < graphics);
    assert!(graph
        .dependencies()
        .any(|dep| dep == (&partition("A", &["K"]), &partition("B", &["K"]))));
    assert!(graph.position(&get_root("A", &["K2", "M", "K1I"])).is_some());
    assert!(graph
        .position(&get_root("B", &["K2", "N1", "K1I", "N0"]))
        .is_some());

    // the second level splits in the nest, as soon as its fiber exists
    let n1 = pos(&graph, &lb("N1"));
    let k1 = pos(&graph, &lb("K1"));
    for node in [
        from_fiber("A", "K1I"),
        partition("A", &["K1I"]),
        get_root("A", &["K1", "K0"]),
        from_fiber("B", "K1I"),
        partition("B", &["K1I"]),
        swizzle("B", &["K1", "N0", "K0"], SwizzleReason::Partitioning),
        get_root("B", &["K1", "N0", "K0"]),
    ] {
        let at = pos(&graph, &node);
        assert!(n1 < at && at < k1, "{node:?} belongs between N1 and K1");
    }
    assert!(
        pos(&graph, &partition("A", &["K1I"])) < pos(&graph, &partition("B", &["K1I"])),
        "the in-nest follower also waits for its leader"
    );
    assert!(
        !graph.schedule().any(|node| matches!(
            node,
            FlowNode::Swizzle {
                tensor,
                reason: SwizzleReason::Partitioning,
                ..
            } if tensor == "A"
        )),
        "A's remainder is already in loop order after the split"
    );
}

#[test]
fn flattening_swizzles_members_and_projects_them_discordantly() {
    let mut program = flattened_matmul();
    let graph = build(&mut program, true);
    assert_dependencies_hold(&graph);

    let schedule = graph.into_schedule();
    assert_eq!(
        schedule,
        vec![
            FlowNode::Milestone(Milestone::Output),
            swizzle("Z", &["N", "M"], SwizzleReason::LoopOrder),
            get_root("Z", &["N", "M"]),
            swizzle("A", &["M", "K"], SwizzleReason::Partitioning),
            partition("A", &["M", "K"]),
            swizzle("A", &["MK"], SwizzleReason::LoopOrder),
            get_root("A", &["MK"]),
            swizzle("B", &["N", "K"], SwizzleReason::LoopOrder),
            get_root("B", &["N", "K"]),
            FlowNode::Milestone(Milestone::Graphics),
            lb("MK"),
            lb("N"),
            get_payload("Z", &["M"]),
            get_payload("B", &["K"]),
            FlowNode::Milestone(Milestone::Body),
            le("N"),
            le("MK"),
            FlowNode::Milestone(Milestone::Footer),
        ]
    );
}

#[test]
fn dynamic_flatten_members_buffer_eagerly() {
    let mut program = dynamic_flatten();
    let graph = build(&mut program, false);
    assert_dependencies_hold(&graph);

    let begins = [lb("MK0"), lb("N"), lb("K1")];
    for pair in begins.windows(2) {
        assert!(pos(&graph, &pair[0]) < pos(&graph, &pair[1]));
    }
    assert!(graph.position(&get_root("A", &["MK0", "K1"])).is_some());
    assert!(graph
        .dependencies()
        .any(|dep| dep == (&partition("A", &["K"]), &partition("B", &["K"]))));

    // B's K0 coordinate is dynamic, so the projection needs the interval
    // and an eagerly built buffer; Z's M is statically bounded
    let eager = FlowNode::EagerInput {
        tensor: "B".to_string(),
        ranks: ranks(&["K0"]),
    };
    let interval = FlowNode::Interval { rank: rank("K0") };
    for dep in [
        (&lb("MK0"), &interval),
        (&interval, &eager),
        (&eager, &get_payload("B", &["K0"])),
        (&get_payload("B", &["K0"]), &FlowNode::Milestone(Milestone::Body)),
        (&lb("MK0"), &get_payload("Z", &["M"])),
    ] {
        assert!(
            graph.dependencies().any(|pair| pair == dep),
            "missing dependency {dep:?}"
        );
    }
    assert!(!graph
        .schedule()
        .any(|node| matches!(node, FlowNode::EagerInput { tensor, .. } if tensor == "Z")));
}

#[test]
fn in_nest_flattens_wait_for_their_member_split() {
    let mut program = deep_dynamic_flatten();
    let graph = build(&mut program, false);
    assert_dependencies_hold(&graph);

    let begins = [lb("N"), lb("K2"), lb("K1"), lb("MK0")];
    for pair in begins.windows(2) {
        assert!(pos(&graph, &pair[0]) < pos(&graph, &pair[1]));
    }

    // the second K level splits between K2 and K1, as usual
    let k2 = pos(&graph, &lb("K2"));
    let k1 = pos(&graph, &lb("K1"));
    for node in [from_fiber("A", "K1I"), partition("A", &["K1I"])] {
        let at = pos(&graph, &node);
        assert!(k2 < at && at < k1, "{node:?} belongs between K2 and K1");
    }

    // the merge runs once K0 exists: inside K1, before the merged loop
    let mk0 = pos(&graph, &lb("MK0"));
    for node in [
        swizzle("A", &["M", "K0"], SwizzleReason::Partitioning),
        partition("A", &["M", "K0"]),
        get_root("A", &["MK0"]),
    ] {
        let at = pos(&graph, &node);
        assert!(k1 < at && at < mk0, "{node:?} belongs between K1 and MK0");
    }
    assert!(graph.dependencies().any(|dep| dep
        == (
            &swizzle("A", &["M", "K0"], SwizzleReason::Partitioning),
            &partition("A", &["M", "K0"])
        )));

    // B and Z come back out of the merged loop discordantly
    let eager = FlowNode::EagerInput {
        tensor: "B".to_string(),
        ranks: ranks(&["K0"]),
    };
    let interval = FlowNode::Interval { rank: rank("K0") };
    for dep in [
        (&lb("MK0"), &interval),
        (&interval, &eager),
        (&eager, &get_payload("B", &["K0"])),
        (&lb("MK0"), &get_payload("Z", &["M"])),
    ] {
        assert!(
            graph.dependencies().any(|pair| pair == dep),
            "missing dependency {dep:?}"
        );
    }
    assert!(!graph
        .schedule()
        .any(|node| matches!(node, FlowNode::EagerInput { tensor, .. } if tensor == "A")));

    let hoisted = build(&mut program, true);
    assert_dependencies_hold(&hoisted);
}

#[test]
fn degenerate_nest_still_frames_the_body() {
    let equation = Equation::new(
        TensorUse::new("Z", Vec::<Rank>::new()),
        vec![vec![TensorUse::new("A", Vec::<Rank>::new())]],
    )
    .expect("rankless equation");
    let mut program = Program::new(equation, &Mapping::new()).expect("rankless program");
    let graph = build(&mut program, true);
    assert_dependencies_hold(&graph);

    assert_eq!(
        graph.into_schedule(),
        vec![
            FlowNode::Milestone(Milestone::Output),
            swizzle("Z", &[], SwizzleReason::LoopOrder),
            get_root("Z", &[]),
            swizzle("A", &[], SwizzleReason::LoopOrder),
            get_root("A", &[]),
            FlowNode::Milestone(Milestone::Graphics),
            FlowNode::Milestone(Milestone::Body),
            FlowNode::Milestone(Milestone::Footer),
        ]
    );
}

#[test]
fn memory_model_wraps_the_nest_in_metrics() {
    let mut program = matmul(&Mapping::new());
    let memory = BindingTable::new().resident("A").buffer("A", "K");
    let graph = FlowGraph::build(&mut program, Some(&memory), &ScheduleOptions::default())
        .expect("flow graph with metrics");
    assert_dependencies_hold(&graph);

    let collect = FlowNode::Collect {
        tensor: "A".to_string(),
        rank: rank("K"),
    };
    let graphics = pos(&graph, &FlowNode::Milestone(Milestone::Graphics));
    assert!(pos(&graph, &collect) < graphics);
    assert!(graphics < pos(&graph, &FlowNode::MetricsBegin));
    assert!(pos(&graph, &FlowNode::MetricsBegin) < pos(&graph, &lb("M")));
    let footer = pos(&graph, &FlowNode::Milestone(Milestone::Footer));
    assert!(footer < pos(&graph, &FlowNode::MetricsEnd));
    assert!(pos(&graph, &FlowNode::MetricsEnd) < pos(&graph, &FlowNode::MetricsDump));

    // a stationary tensor causes no per-iteration traffic to collect
    let stationary = BindingTable::new()
        .resident("A")
        .stationary("A")
        .buffer("A", "K");
    let graph = FlowGraph::build(&mut program, Some(&stationary), &ScheduleOptions::default())
        .expect("flow graph with stationary binding");
    assert_eq!(graph.position(&collect), None);
    assert!(graph.position(&FlowNode::MetricsBegin).is_some());
}

#[test]
fn conflicting_buffer_bindings_are_rejected() {
    let mut program = matmul(&Mapping::new());
    let memory = BindingTable::new().buffer("A", "M").buffer("A", "K");
    let err = FlowGraph::build(&mut program, Some(&memory), &ScheduleOptions::default())
        .expect_err("two buffered ranks for one tensor");
    assert!(matches!(
        err.root_cause().downcast_ref::<SchedError>(),
        Some(SchedError::ConflictingBinding { tensor, ranks })
            if tensor == "A" && ranks == "M, K"
    ));
}

#[test]
fn buffered_discordant_access_swizzles_for_metrics() {
    let mut program = flattened_matmul();
    let memory = BindingTable::new().resident("B").buffer("B", "K");
    let graph = FlowGraph::build(&mut program, Some(&memory), &ScheduleOptions::default())
        .expect("flow graph with buffered discord");
    assert_dependencies_hold(&graph);

    let collect = FlowNode::Collect {
        tensor: "B".to_string(),
        rank: rank("K"),
    };
    assert!(pos(&graph, &collect) < pos(&graph, &FlowNode::Milestone(Milestone::Graphics)));
    let layout = swizzle("B", &["K"], SwizzleReason::Metrics);
    assert!(graph
        .dependencies()
        .any(|dep| dep == (&layout, &get_payload("B", &["K"]))));
}

#[test]
fn rebuilding_the_same_program_is_stable() {
    let mut program = matmul(&dynamic_mapping());
    let first = build(&mut program, true).into_schedule();
    let second = build(&mut program, true).into_schedule();
    assert_eq!(first, second);
}
