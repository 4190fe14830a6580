use lunaris_core::cfg_ir::{identify_blocks, BlockExit, BlockSet, EdgeType};
use lunaris_core::{Instruction, Opcode};
use lunaris_tests::fixtures::{self, jmp, ret0};
use lunaris_tests::init_tracing;
use lunaris_utils::errors::CfgError;
use lunaris_utils::log::DebugLog;
use petgraph::visit::EdgeRef;

fn blocks_of(code: &[Instruction]) -> BlockSet {
    init_tracing();
    identify_blocks(code, &mut DebugLog::disabled()).unwrap()
}

fn ranges(set: &BlockSet) -> Vec<(usize, usize)> {
    set.blocks().iter().map(|b| (b.start_pc, b.end_pc)).collect()
}

#[test]
fn if_else_partition() {
    let set = blocks_of(&fixtures::if_else().code);
    assert_eq!(ranges(&set), [(0, 2), (2, 4), (4, 5), (5, 6), (6, 7)]);
    assert_eq!(set.exit(0), Some(BlockExit::TestJump { test_pc: 0 }));
    assert_eq!(set.exit(1), Some(BlockExit::Jump { jump_pc: 3 }));
    assert_eq!(set.exit(2), Some(BlockExit::FallThrough));
    assert_eq!(set.exit(3), Some(BlockExit::Return));

    let entry = &set.blocks()[0];
    assert!(entry.is_entry);
    assert_eq!(entry.cond_target, Some(1));
    assert_eq!(entry.original_target, Some(2));
    assert_eq!(set.blocks()[1].original_target, Some(3));
    assert_eq!(set.blocks()[2].fall_through, Some(3));
    assert!(set.blocks()[3].is_exit && set.blocks()[4].is_exit);
    assert!(set
        .blocks()
        .iter()
        .enumerate()
        .all(|(i, b)| b.state_id == i));
}

#[test]
fn false_skip_ends_its_block() {
    let set = blocks_of(&fixtures::lt_to_bool().code);
    assert_eq!(ranges(&set), [(0, 2), (2, 3), (3, 4), (4, 5), (5, 6)]);
    assert_eq!(set.exit(1), Some(BlockExit::SkipNext { pc: 2 }));
    // LFALSESKIP resumes two slots later, at the return
    assert_eq!(set.blocks()[1].cond_target, Some(3));
    assert_eq!(set.blocks()[1].fall_through, None);
}

#[test]
fn loop_back_edge() {
    let set = blocks_of(&fixtures::while_sum().code);
    assert_eq!(ranges(&set), [(0, 2), (2, 4), (4, 9), (9, 10), (10, 11)]);
    assert_eq!(set.blocks()[0].fall_through, Some(1));
    assert_eq!(set.exit(2), Some(BlockExit::Jump { jump_pc: 8 }));
    assert_eq!(set.blocks()[2].original_target, Some(1));
    assert_eq!(set.block_containing(6), Some(2));
    assert_eq!(set.block_starting_at(6), None);
    assert_eq!(set.block_containing(11), None);
}

#[test]
fn testset_is_a_test_jump() {
    let set = blocks_of(&fixtures::or_default().code);
    assert_eq!(ranges(&set), [(0, 2), (2, 4), (4, 5), (5, 6)]);
    assert_eq!(set.exit(0), Some(BlockExit::TestJump { test_pc: 0 }));
    assert_eq!(set.blocks()[0].original_target, Some(2));
    assert_eq!(set.blocks()[1].original_target, Some(2));
}

#[test]
fn bare_test_before_a_jump_target() {
    // pc 1 is both the test's jump and the target of pc 3
    let code = vec![
        Instruction::abc(Opcode::TEST, 0, 0, 0, false).unwrap(),
        jmp(1),
        fixtures::ret1(0),
        jmp(-3),
        ret0(),
    ];
    let set = blocks_of(&code);
    assert_eq!(set.exit(0), Some(BlockExit::Test { test_pc: 0 }));
    assert_eq!(set.blocks()[0].fall_through, Some(1));
    assert_eq!(set.blocks()[0].cond_target, set.block_starting_at(2));
}

#[test]
fn loop_opcodes_are_classified() {
    let set = blocks_of(&fixtures::for_loop().code);
    assert!((0..set.len()).any(|i| matches!(
        set.exit(i),
        Some(BlockExit::Loop {
            opcode: Opcode::FORLOOP,
            ..
        })
    )));
}

#[test]
fn malformed_code_is_rejected() {
    init_tracing();
    let mut log = DebugLog::disabled();
    assert!(matches!(identify_blocks(&[], &mut log), Err(CfgError::EmptyFunction)));
    assert!(matches!(
        identify_blocks(&[jmp(-4), ret0()], &mut log),
        Err(CfgError::InvalidJumpTarget { pc: 0, target: -3, len: 2 })
    ));
    assert!(matches!(
        identify_blocks(&[Instruction::from_raw(0x7f)], &mut log),
        Err(CfgError::Instruction { pc: 0, .. })
    ));
}

#[test]
fn graph_edges_follow_exits() {
    let set = blocks_of(&fixtures::if_else().code);
    let graph = set.to_graph();
    assert_eq!(graph.node_count(), 5);
    let mut edges: Vec<(usize, usize, EdgeType)> = graph
        .edge_references()
        .map(|e| (e.source().index(), e.target().index(), *e.weight()))
        .collect();
    edges.sort_by_key(|&(from, to, _)| (from, to));
    assert_eq!(
        edges,
        [
            (0, 1, EdgeType::BranchTrue),
            (0, 2, EdgeType::BranchFalse),
            (1, 3, EdgeType::Jump),
            (2, 3, EdgeType::Fallthrough),
        ]
    );
}
