use lunaris_core::decoder::{MAX_SC, MIN_SC};
use lunaris_core::{Instruction, OpMode, Opcode, Operands, NUM_OPCODES};
use lunaris_tests::fixtures::{abc, cmpi, jmp, loadi};
use lunaris_utils::errors::InstructionError;

fn all_opcodes() -> Vec<Opcode> {
    (0..=u8::MAX).filter_map(Opcode::from_byte).collect()
}

#[test]
fn opcode_space_is_dense() {
    let ops = all_opcodes();
    assert_eq!(ops.len(), NUM_OPCODES);
    assert_eq!(NUM_OPCODES, 102);
    assert!(ops.iter().enumerate().all(|(i, op)| usize::from(op.to_byte()) == i));
    assert_eq!(Opcode::JMP.to_byte(), 57);
    assert_eq!(Opcode::RETURN.to_byte(), 71);
    assert_eq!(Opcode::EXTRAARG.to_byte(), 101);
    assert!(Opcode::from_byte(102).is_none());
}

#[test]
fn every_mode_decodes_back() {
    let cases = [
        (Instruction::abc(Opcode::ADD, 3, 4, 5, false).unwrap(), OpMode::Abc),
        (Instruction::abx(Opcode::LOADK, 1, 70_000).unwrap(), OpMode::ABx),
        (Instruction::asbx(Opcode::LOADI, 2, -12).unwrap(), OpMode::AsBx),
        (Instruction::ax_only(Opcode::EXTRAARG, 1 << 40).unwrap(), OpMode::Ax),
        (Instruction::jmp(-3).unwrap(), OpMode::SJ),
    ];
    for (inst, mode) in cases {
        let decoded = inst.decode().unwrap();
        assert_eq!(decoded.operands.mode(), mode, "{inst}");
        assert_eq!(Instruction::encode(decoded.opcode, decoded.operands).unwrap(), inst);
    }
    assert!(matches!(
        Instruction::asbx(Opcode::LOADI, 2, -12).unwrap().decode().unwrap().operands,
        Operands::AsBx { a: 2, sbx: -12 }
    ));
}

#[test]
fn signed_immediate_bounds() {
    assert_eq!(cmpi(Opcode::EQI, 0, MIN_SC, true).sb(), MIN_SC);
    assert_eq!(cmpi(Opcode::EQI, 0, MAX_SC, true).sb(), MAX_SC);
    assert!(matches!(
        Instruction::a_sb_c(Opcode::EQI, 0, MAX_SC + 1, 0, true),
        Err(InstructionError::OperandOutOfRange { .. })
    ));
    assert_eq!(Instruction::ab_sc(Opcode::ADDI, 1, 1, -1).unwrap().sc(), -1);
}

#[test]
fn mode_mismatch_is_rejected() {
    assert!(matches!(
        Instruction::asbx(Opcode::ADD, 0, 1),
        Err(InstructionError::ModeMismatch { .. })
    ));
    assert!(loadi(0, 1).with_sj(4).is_err());
}

#[test]
fn jump_targets() {
    assert_eq!(jmp(2).jump_target(1).unwrap(), Some(4));
    assert_eq!(jmp(-7).jump_target(8).unwrap(), Some(2));
    assert_eq!(loadi(0, 3).jump_target(0).unwrap(), None);
}

#[test]
fn text_forms() {
    let inst = abc(Opcode::LT, 0, 1, 0, true);
    let text = format!("{:#018x}", inst.raw());
    assert_eq!(text.parse::<Instruction>().unwrap(), inst);
    assert!(inst.to_string().starts_with("LT"));
    assert!(inst.to_string().ends_with(" k"));
    assert_eq!(jmp(-2).to_string().split_whitespace().last(), Some("sJ=-2"));

    let json = serde_json::to_string(&inst).unwrap();
    assert_eq!(json, format!("\"{text}\""));
    assert_eq!(serde_json::from_str::<Instruction>(&json).unwrap(), inst);
}
