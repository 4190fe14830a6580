//! Hand-assembled functions covering the control-flow shapes the flattener
//! has to handle.

use lunaris_core::opcode::{tm, Opcode};
use lunaris_core::{FunctionId, Instruction, Proto};

/// `A B C k` instruction.
pub fn abc(op: Opcode, a: u32, b: u32, c: u32, k: bool) -> Instruction {
    Instruction::abc(op, a, b, c, k).unwrap()
}

/// `LOADI a value`.
pub fn loadi(a: u32, value: i64) -> Instruction {
    Instruction::asbx(Opcode::LOADI, a, value).unwrap()
}

/// `JMP sj`.
pub fn jmp(sj: i64) -> Instruction {
    Instruction::jmp(sj).unwrap()
}

/// Immediate comparison such as `EQI a imm k`.
pub fn cmpi(op: Opcode, a: u32, imm: i64, k: bool) -> Instruction {
    Instruction::a_sb_c(op, a, imm, 0, k).unwrap()
}

/// `RETURN1 a`.
pub fn ret1(a: u32) -> Instruction {
    abc(Opcode::RETURN1, a, 0, 0, false)
}

/// `RETURN0`.
pub fn ret0() -> Instruction {
    abc(Opcode::RETURN0, 0, 0, 0, false)
}

fn proto(code: Vec<Instruction>, max_stack_size: u8) -> Proto {
    Proto::new(FunctionId(1), code, max_stack_size)
}

/// Three return sequences, one block each.
pub fn three_returns() -> Proto {
    proto(
        vec![loadi(0, 1), ret1(0), loadi(0, 2), ret1(0), ret0()],
        1,
    )
}

/// `if x < y then r = 1 else r = 2 end return r`, with `x, y` in `R0, R1`.
pub fn if_else() -> Proto {
    proto(
        vec![
            abc(Opcode::LT, 0, 1, 0, false),
            jmp(2),
            loadi(2, 1),
            jmp(1),
            loadi(2, 2),
            ret1(2),
            ret0(),
        ],
        3,
    )
}

/// `local s, i = 0, 1 while i <= n do s = s + i i = i + 1 end return s`,
/// with `n` in `R0`.
pub fn while_sum() -> Proto {
    proto(
        vec![
            loadi(1, 0),
            loadi(2, 1),
            abc(Opcode::LE, 2, 0, 0, false),
            jmp(5),
            abc(Opcode::ADD, 1, 1, 2, false),
            abc(Opcode::MMBIN, 1, 2, tm::ADD.into(), false),
            Instruction::ab_sc(Opcode::ADDI, 2, 2, 1).unwrap(),
            Instruction::a_sb_c(Opcode::MMBINI, 2, 1, tm::ADD.into(), false).unwrap(),
            jmp(-7),
            ret1(1),
            ret0(),
        ],
        3,
    )
}

/// Sign of `x` in `R0`: -1, 0 or 1.
pub fn classify() -> Proto {
    proto(
        vec![
            cmpi(Opcode::LTI, 0, 0, false),
            jmp(2),
            loadi(1, -1),
            ret1(1),
            cmpi(Opcode::EQI, 0, 0, false),
            jmp(2),
            loadi(1, 0),
            ret1(1),
            loadi(1, 1),
            ret1(1),
            ret0(),
        ],
        2,
    )
}

/// 10 when `R0` is truthy, 20 otherwise.
pub fn test_truthy() -> Proto {
    proto(
        vec![
            abc(Opcode::TEST, 0, 0, 0, false),
            jmp(2),
            loadi(1, 10),
            ret1(1),
            loadi(1, 20),
            ret1(1),
            ret0(),
        ],
        2,
    )
}

/// `return x < y` materialised with `LFALSESKIP`/`LOADTRUE`.
pub fn lt_to_bool() -> Proto {
    proto(
        vec![
            abc(Opcode::LT, 0, 1, 0, true),
            jmp(1),
            abc(Opcode::LFALSESKIP, 2, 0, 0, false),
            abc(Opcode::LOADTRUE, 2, 0, 0, false),
            ret1(2),
            ret0(),
        ],
        3,
    )
}

/// `R0 or 7` via `TESTSET`.
pub fn or_default() -> Proto {
    proto(
        vec![
            abc(Opcode::TESTSET, 1, 0, 0, true),
            jmp(2),
            loadi(1, 7),
            jmp(0),
            ret1(1),
            ret0(),
        ],
        2,
    )
}

/// Vararg function starting with `VARARGPREP`: 1 when `R0 < 5`, else 2.
pub fn vararg() -> Proto {
    proto(
        vec![
            abc(Opcode::VARARGPREP, 0, 0, 0, false),
            cmpi(Opcode::LTI, 0, 5, false),
            jmp(2),
            loadi(1, 1),
            ret1(1),
            loadi(1, 2),
            ret1(1),
            ret0(),
        ],
        2,
    )
}

/// `x * 10` for `x` in `0..cases`, -1 otherwise. Has `2 * cases + 2` blocks.
pub fn switch(cases: i64) -> Proto {
    let mut code = Vec::new();
    for case in 0..cases {
        code.push(cmpi(Opcode::EQI, 0, case, false));
        code.push(jmp(2));
        code.push(loadi(1, case * 10));
        code.push(ret1(1));
    }
    code.extend([loadi(1, -1), ret1(1), ret0()]);
    proto(code, 2)
}

/// Numeric `for` loop; never flattened.
pub fn for_loop() -> Proto {
    proto(
        vec![
            loadi(1, 0),
            loadi(2, 1),
            abc(Opcode::MOVE, 3, 0, 0, false),
            loadi(4, 1),
            Instruction::abx(Opcode::FORPREP, 2, 2).unwrap(),
            abc(Opcode::ADD, 1, 1, 5, false),
            abc(Opcode::MMBIN, 1, 5, tm::ADD.into(), false),
            Instruction::abx(Opcode::FORLOOP, 2, 3).unwrap(),
            ret1(1),
            ret0(),
        ],
        6,
    )
}

/// Every flattenable fixture with the argument sets to check it on.
pub fn corpus() -> Vec<(&'static str, Proto, Vec<Vec<crate::interp::Value>>)> {
    use crate::interp::Value::{Bool, Int, Nil};
    let ints = |values: &[i64]| values.iter().map(|&v| vec![Int(v)]).collect::<Vec<_>>();
    let pairs = |values: &[(i64, i64)]| {
        values
            .iter()
            .map(|&(x, y)| vec![Int(x), Int(y)])
            .collect::<Vec<_>>()
    };
    vec![
        ("three_returns", three_returns(), vec![vec![]]),
        ("if_else", if_else(), pairs(&[(1, 2), (2, 1), (3, 3), (-5, 0)])),
        ("while_sum", while_sum(), ints(&[0, 1, 5, 10])),
        ("classify", classify(), ints(&[-3, 0, 9])),
        (
            "test_truthy",
            test_truthy(),
            vec![vec![Int(0)], vec![Bool(false)], vec![Nil], vec![Bool(true)]],
        ),
        ("lt_to_bool", lt_to_bool(), pairs(&[(1, 2), (2, 1), (4, 4)])),
        (
            "or_default",
            or_default(),
            vec![vec![Int(3)], vec![Nil], vec![Bool(false)]],
        ),
        ("vararg", vararg(), ints(&[0, 5, 9])),
        ("switch", switch(6), ints(&[0, 3, 5, 6, -1])),
    ]
}
