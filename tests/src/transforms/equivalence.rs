//! Flattened functions must compute what the originals compute, under every
//! combination of flattening options.

use lunaris_tests::fixtures;
use lunaris_tests::init_tracing;
use lunaris_tests::interp::{self, Value};
use lunaris_transform::{flatten, FlattenOutcome, ObfuscationFlags};
use lunaris_utils::log::DebugLog;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const OPTIONS: [ObfuscationFlags; 6] = [
    ObfuscationFlags::BLOCK_SHUFFLE,
    ObfuscationFlags::BOGUS_BLOCKS,
    ObfuscationFlags::STATE_ENCODE,
    ObfuscationFlags::NESTED_DISPATCHER,
    ObfuscationFlags::OPAQUE_PREDICATES,
    ObfuscationFlags::FUNC_INTERLEAVE,
];

fn combinations() -> impl Iterator<Item = ObfuscationFlags> {
    (0..1u32 << OPTIONS.len()).map(|mask| {
        OPTIONS
            .iter()
            .enumerate()
            .filter(|(bit, _)| mask & (1 << bit) != 0)
            .fold(ObfuscationFlags::CFF, |acc, (_, &flag)| acc | flag)
    })
}

fn check(flags: ObfuscationFlags, seed: u32) {
    for (name, original, arg_sets) in fixtures::corpus() {
        let mut proto = original.clone();
        let report = flatten(&mut proto, flags, seed, &mut DebugLog::disabled())
            .unwrap_or_else(|e| panic!("{name} {flags:?} seed {seed:#x}: {e}"));
        assert_eq!(report.outcome, FlattenOutcome::Flattened, "{name}");
        assert!(proto.max_stack_size > original.max_stack_size, "{name}");
        for args in arg_sets {
            let expected = interp::run(&original, &args);
            assert!(expected.is_ok(), "{name} fixture fails on {args:?}");
            assert_eq!(
                interp::run(&proto, &args),
                expected,
                "{name} with {flags:?}, seed {seed:#x}, args {args:?}"
            );
        }
    }
}

#[test]
fn plain_flattening_preserves_results() {
    init_tracing();
    for seed in [0, 1, 0x5EED] {
        check(ObfuscationFlags::CFF, seed);
    }
}

#[test]
fn every_option_combination_preserves_results() {
    init_tracing();
    for flags in combinations() {
        for seed in [3, 0xDEAD_BEEF] {
            check(flags, seed);
        }
    }
}

#[test]
fn random_seeds_with_everything_enabled() {
    init_tracing();
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..25 {
        check(ObfuscationFlags::all(), rng.random());
    }
}

#[test]
fn flattening_twice_still_works() {
    init_tracing();
    let flags = ObfuscationFlags::CFF | ObfuscationFlags::STATE_ENCODE;
    let mut proto = fixtures::while_sum();
    let mut log = DebugLog::disabled();
    flatten(&mut proto, flags, 10, &mut log).unwrap();
    let second = flatten(&mut proto, flags | ObfuscationFlags::NESTED_DISPATCHER, 20, &mut log)
        .unwrap();
    assert_eq!(second.outcome, FlattenOutcome::Flattened);
    for n in [0, 3, 7] {
        let expected = (1..=n).sum::<i64>();
        assert_eq!(
            interp::run(&proto, &[Value::Int(n)]),
            Ok(vec![Value::Int(expected)])
        );
    }
}

#[test]
fn combinations_cover_every_option() {
    let all: Vec<_> = combinations().collect();
    assert_eq!(all.len(), 64);
    assert!(all.contains(&ObfuscationFlags::CFF));
    assert!(all.contains(&ObfuscationFlags::CFF_FAMILY));
}
