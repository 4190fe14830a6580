//! Reference interpreter for the integer subset of the host instruction set.
//!
//! Follows the host's control-flow rules: arithmetic skips its metamethod
//! fallback on success, a comparison or test either skips the next
//! instruction or performs the `JMP` that follows it, and `LFALSESKIP`
//! always skips. Registers beyond `max_stack_size` are an error, so running
//! flattened code also checks the raised stack size.

use lunaris_core::{Instruction, Opcode, Proto};
use thiserror::Error;

/// Default instruction budget per call.
pub const STEP_LIMIT: usize = 100_000;

/// Runtime value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    /// `nil`
    Nil,
    /// A boolean.
    Bool(bool),
    /// An integer.
    Int(i64),
}

impl Value {
    const fn is_false(self) -> bool {
        matches!(self, Self::Nil | Self::Bool(false))
    }
}

/// Why execution stopped abnormally.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InterpError {
    /// Program counter left the code.
    #[error("pc {0} out of range")]
    PcOutOfRange(i64),
    /// Register index outside the frame.
    #[error("register {reg} outside frame of {size} at pc {pc}")]
    RegisterOutOfFrame {
        /// Register accessed.
        reg: u32,
        /// Frame size.
        size: usize,
        /// Instruction pc.
        pc: usize,
    },
    /// Operation on non-integers, or a metamethod fallback actually executed.
    #[error("type error at pc {0}")]
    TypeError(usize),
    /// A test was not followed by a jump.
    #[error("conditional at pc {0} not followed by JMP")]
    MissingJump(usize),
    /// Opcode outside the supported subset.
    #[error("unsupported opcode {opcode} at pc {pc}")]
    Unsupported {
        /// Opcode name.
        opcode: String,
        /// Instruction pc.
        pc: usize,
    },
    /// Step budget exhausted.
    #[error("step limit exceeded")]
    StepLimit,
}

struct Frame {
    regs: Vec<Value>,
}

impl Frame {
    fn get(&self, reg: u32, pc: usize) -> Result<Value, InterpError> {
        self.regs
            .get(reg as usize)
            .copied()
            .ok_or(InterpError::RegisterOutOfFrame {
                reg,
                size: self.regs.len(),
                pc,
            })
    }

    fn set(&mut self, reg: u32, value: Value, pc: usize) -> Result<(), InterpError> {
        let size = self.regs.len();
        let slot = self
            .regs
            .get_mut(reg as usize)
            .ok_or(InterpError::RegisterOutOfFrame { reg, size, pc })?;
        *slot = value;
        Ok(())
    }

    fn int(&self, reg: u32, pc: usize) -> Result<i64, InterpError> {
        match self.get(reg, pc)? {
            Value::Int(v) => Ok(v),
            _ => Err(InterpError::TypeError(pc)),
        }
    }
}

/// Runs `proto` with `args` in the first registers.
pub fn run(proto: &Proto, args: &[Value]) -> Result<Vec<Value>, InterpError> {
    run_with_limit(proto, args, STEP_LIMIT)
}

/// [`run`] with an explicit step budget.
pub fn run_with_limit(
    proto: &Proto,
    args: &[Value],
    limit: usize,
) -> Result<Vec<Value>, InterpError> {
    let code = &proto.code;
    let mut frame = Frame {
        regs: vec![Value::Nil; usize::from(proto.max_stack_size)],
    };
    for (reg, &arg) in args.iter().enumerate() {
        frame.set(reg as u32, arg, 0)?;
    }

    let fetch = |pc: i64| -> Result<Instruction, InterpError> {
        usize::try_from(pc)
            .ok()
            .and_then(|pc| code.get(pc).copied())
            .ok_or(InterpError::PcOutOfRange(pc))
    };

    let mut pc: i64 = 0;
    for _ in 0..limit {
        let inst = fetch(pc)?;
        let at = pc as usize;
        pc += 1;
        let op = inst
            .opcode()
            .map_err(|_| InterpError::Unsupported {
                opcode: format!("{:#04x}", inst.op_byte()),
                pc: at,
            })?;
        let (a, b, c, k) = (inst.a(), inst.b(), inst.c(), inst.k());

        // Some(cond) for comparisons: skip next when cond != k, else take the JMP
        let mut cond: Option<bool> = None;
        match op {
            Opcode::MOVE => frame.set(a, frame.get(b, at)?, at)?,
            Opcode::LOADI => frame.set(a, Value::Int(inst.sbx()), at)?,
            Opcode::LOADTRUE => frame.set(a, Value::Bool(true), at)?,
            Opcode::LOADFALSE => frame.set(a, Value::Bool(false), at)?,
            Opcode::LFALSESKIP => {
                frame.set(a, Value::Bool(false), at)?;
                pc += 1;
            }
            Opcode::LOADNIL => {
                for reg in a..=a + b {
                    frame.set(reg, Value::Nil, at)?;
                }
            }
            Opcode::ADD | Opcode::SUB | Opcode::MUL => {
                let (x, y) = (frame.int(b, at)?, frame.int(c, at)?);
                let v = match op {
                    Opcode::ADD => x.wrapping_add(y),
                    Opcode::SUB => x.wrapping_sub(y),
                    _ => x.wrapping_mul(y),
                };
                frame.set(a, Value::Int(v), at)?;
                pc += 1;
            }
            Opcode::ADDI => {
                let x = frame.int(b, at)?;
                frame.set(a, Value::Int(x.wrapping_add(inst.sc())), at)?;
                pc += 1;
            }
            Opcode::MMBIN | Opcode::MMBINI | Opcode::MMBINK => {
                return Err(InterpError::TypeError(at));
            }
            Opcode::NOT => frame.set(a, Value::Bool(frame.get(b, at)?.is_false()), at)?,
            Opcode::EQ => cond = Some(frame.get(a, at)? == frame.get(b, at)?),
            Opcode::LT => cond = Some(frame.int(a, at)? < frame.int(b, at)?),
            Opcode::LE => cond = Some(frame.int(a, at)? <= frame.int(b, at)?),
            Opcode::EQI => cond = Some(frame.get(a, at)? == Value::Int(inst.sb())),
            Opcode::LTI => cond = Some(frame.int(a, at)? < inst.sb()),
            Opcode::LEI => cond = Some(frame.int(a, at)? <= inst.sb()),
            Opcode::GTI => cond = Some(frame.int(a, at)? > inst.sb()),
            Opcode::GEI => cond = Some(frame.int(a, at)? >= inst.sb()),
            Opcode::TEST => cond = Some(!frame.get(a, at)?.is_false()),
            Opcode::TESTSET => {
                let value = frame.get(b, at)?;
                if value.is_false() == k {
                    pc += 1;
                } else {
                    frame.set(a, value, at)?;
                    pc = take_jump(&fetch, pc, at)?;
                }
            }
            Opcode::JMP => pc += inst.sj(),
            Opcode::RETURN0 => return Ok(Vec::new()),
            Opcode::RETURN1 => return Ok(vec![frame.get(a, at)?]),
            Opcode::RETURN => {
                if b == 0 {
                    return Err(InterpError::Unsupported {
                        opcode: "RETURN (multret)".to_string(),
                        pc: at,
                    });
                }
                return (a..a + b - 1).map(|reg| frame.get(reg, at)).collect();
            }
            Opcode::VARARGPREP | Opcode::NOP => {}
            other => {
                return Err(InterpError::Unsupported {
                    opcode: other.name().to_string(),
                    pc: at,
                })
            }
        }

        if let Some(cond) = cond {
            if cond != k {
                pc += 1;
            } else {
                pc = take_jump(&fetch, pc, at)?;
            }
        }
    }
    Err(InterpError::StepLimit)
}

fn take_jump(
    fetch: &impl Fn(i64) -> Result<Instruction, InterpError>,
    pc: i64,
    at: usize,
) -> Result<i64, InterpError> {
    let next = fetch(pc)?;
    if next.opcode().ok() != Some(Opcode::JMP) {
        return Err(InterpError::MissingJump(at));
    }
    Ok(pc + 1 + next.sj())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[test]
    fn fixtures_behave() {
        use Value::*;
        assert_eq!(run(&fixtures::if_else(), &[Int(1), Int(2)]), Ok(vec![Int(1)]));
        assert_eq!(run(&fixtures::if_else(), &[Int(2), Int(1)]), Ok(vec![Int(2)]));
        assert_eq!(run(&fixtures::while_sum(), &[Int(4)]), Ok(vec![Int(10)]));
        assert_eq!(run(&fixtures::classify(), &[Int(-2)]), Ok(vec![Int(-1)]));
        assert_eq!(run(&fixtures::test_truthy(), &[Nil]), Ok(vec![Int(20)]));
        assert_eq!(run(&fixtures::lt_to_bool(), &[Int(1), Int(2)]), Ok(vec![Bool(true)]));
        assert_eq!(run(&fixtures::lt_to_bool(), &[Int(3), Int(2)]), Ok(vec![Bool(false)]));
        assert_eq!(run(&fixtures::or_default(), &[Nil]), Ok(vec![Int(7)]));
        assert_eq!(run(&fixtures::or_default(), &[Int(3)]), Ok(vec![Int(3)]));
        assert_eq!(run(&fixtures::switch(4), &[Int(3)]), Ok(vec![Int(30)]));
        assert_eq!(run(&fixtures::switch(4), &[Int(4)]), Ok(vec![Int(-1)]));
    }

    #[test]
    fn infinite_loop_hits_limit() {
        let proto = Proto::new(
            lunaris_core::FunctionId(0),
            vec![fixtures::jmp(-1)],
            1,
        );
        assert_eq!(run_with_limit(&proto, &[], 50), Err(InterpError::StepLimit));
    }
}
