use lunaris_core::{Opcode, Proto};
use lunaris_tests::interp::{self, Value};
use lunaris_tests::{fixtures, init_tracing};
use lunaris_transform::dispatcher::{group_starts, INNER_STATE_SALT};
use lunaris_transform::state::encode_state;
use lunaris_transform::{flatten, FlattenReport, ObfuscationFlags};
use lunaris_utils::log::DebugLog;

const NESTED: ObfuscationFlags = ObfuscationFlags::CFF.union(ObfuscationFlags::NESTED_DISPATCHER);

fn nested(proto: &mut Proto, flags: ObfuscationFlags, seed: u32) -> FlattenReport {
    init_tracing();
    flatten(proto, flags, seed, &mut DebugLog::disabled()).unwrap()
}

#[test]
fn two_level_layout() {
    let mut proto = fixtures::if_else();
    let report = nested(&mut proto, NESTED, 1);
    let layout = report.layout.unwrap();
    let code = &proto.code;

    assert_eq!(layout.group_starts, [0, 3]);
    assert_eq!(layout.dispatcher_pc, 2);
    assert_eq!(layout.inner_dispatcher_pcs, [7, 14]);
    assert_eq!(layout.block_pcs[0], 19);
    assert_eq!(proto.max_stack_size, 5);

    // initial outer and inner loads
    assert_eq!((code[0].a(), code[0].sbx()), (4, 0));
    assert_eq!((code[1].a(), code[1].sbx()), (3, 0));
    // outer ladder compares the outer register against group ids
    for group in 0..2 {
        let cmp = code[2 + 2 * group];
        assert_eq!(cmp.opcode().unwrap(), Opcode::EQI);
        assert_eq!((cmp.a(), cmp.sb()), (4, group as i64));
        let site = 3 + 2 * group;
        let inner = layout.inner_dispatcher_pcs[group] as i64;
        assert_eq!(code[site].jump_target(site).unwrap(), Some(inner));
    }
    // each inner ladder ends by returning to the outer head
    assert_eq!(code[13].jump_target(13).unwrap(), Some(2));
    assert_eq!(code[18].jump_target(18).unwrap(), Some(2));
    // two-way exits skip one two-load transition
    assert_eq!(code[19].opcode().unwrap(), Opcode::LT);
    assert_eq!(code[20].sj(), 3);
}

#[test]
fn nested_runs_like_the_original() {
    let cases = [(1, 2, 1), (2, 1, 2), (0, 0, 2)];
    for seed in [1u32, 77, 0xBEEF] {
        let mut proto = fixtures::if_else();
        nested(
            &mut proto,
            NESTED | ObfuscationFlags::STATE_ENCODE | ObfuscationFlags::BLOCK_SHUFFLE,
            seed,
        );
        for (x, y, expected) in cases {
            assert_eq!(
                interp::run(&proto, &[Value::Int(x), Value::Int(y)]),
                Ok(vec![Value::Int(expected)]),
                "seed {seed}, args ({x}, {y})"
            );
        }
    }
}

#[test]
fn inner_codes_use_their_own_key() {
    let mut proto = fixtures::switch(4);
    let report = nested(&mut proto, NESTED | ObfuscationFlags::STATE_ENCODE, 500);
    let meta = report.metadata.unwrap();
    let layout = report.layout.unwrap();
    let first_inner = layout.inner_dispatcher_pcs[0];
    let cmp = proto.code[first_inner];
    assert_eq!(cmp.sb(), encode_state(0, 500 ^ INNER_STATE_SALT));
    assert_eq!(meta.decode_state(cmp.sb(), report.applied), Some(0));
    // the outer ladder is keyed with the plain seed
    assert_eq!(proto.code[2].sb(), encode_state(0, 500));
}

#[test]
fn decoys_get_their_own_groups() {
    let mut proto = fixtures::if_else();
    let report = nested(&mut proto, NESTED | ObfuscationFlags::BOGUS_BLOCKS, 3);
    let layout = report.layout.unwrap();
    assert_eq!(report.bogus_count, 10);
    assert_eq!(layout.group_starts.len(), 2);
    assert_eq!(layout.inner_dispatcher_pcs.len(), 2 + 3);
    assert!(layout
        .inner_dispatcher_pcs
        .windows(2)
        .all(|w| w[0] < w[1]));
}

#[test]
fn groups_are_contiguous_and_bounded() {
    for n in 2..40 {
        let starts = group_starts(n);
        assert!(starts.len() >= 2, "{n} blocks");
        assert_eq!(starts[0], 0);
        assert!(starts.windows(2).all(|w| w[0] <= w[1]));
        assert!(starts.iter().all(|&s| s <= n));
    }
}
