/// Arithmetic families
///
/// `int` covers add/sub/mul/div/mod for both signedness and both operand
/// sources; `float` covers the 64- and 32-bit register forms.

use super::Flow;
use crate::cpu::Core;
use crate::error::Fault;
use crate::isa::Instruction;

pub struct Add;
pub struct Sub;
pub struct Mul;
pub struct Div;
pub struct Mod;

/// Integer result plus the flags it produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntResult {
    pub value: u64,
    /// Unsigned overflow or borrow
    pub carry: bool,
    /// Signed overflow
    pub overflow: bool,
}

pub trait IntOp {
    /// `None` when the divisor is zero
    fn eval(lhs: u64, rhs: u64, signed: bool) -> Option<IntResult>;
}

/// Operations that can never fail
pub trait Wrapping {
    fn apply(lhs: u64, rhs: u64) -> IntResult;
}

impl Wrapping for Add {
    fn apply(lhs: u64, rhs: u64) -> IntResult {
        let (value, carry) = lhs.overflowing_add(rhs);
        let overflow = (lhs as i64).overflowing_add(rhs as i64).1;
        IntResult { value, carry, overflow }
    }
}

impl Wrapping for Sub {
    fn apply(lhs: u64, rhs: u64) -> IntResult {
        let (value, carry) = lhs.overflowing_sub(rhs);
        let overflow = (lhs as i64).overflowing_sub(rhs as i64).1;
        IntResult { value, carry, overflow }
    }
}

impl Wrapping for Mul {
    fn apply(lhs: u64, rhs: u64) -> IntResult {
        let (value, carry) = lhs.overflowing_mul(rhs);
        let overflow = (lhs as i64).overflowing_mul(rhs as i64).1;
        IntResult { value, carry, overflow }
    }
}

impl IntOp for Add {
    fn eval(lhs: u64, rhs: u64, _signed: bool) -> Option<IntResult> {
        Some(Self::apply(lhs, rhs))
    }
}

impl IntOp for Sub {
    fn eval(lhs: u64, rhs: u64, _signed: bool) -> Option<IntResult> {
        Some(Self::apply(lhs, rhs))
    }
}

impl IntOp for Mul {
    fn eval(lhs: u64, rhs: u64, _signed: bool) -> Option<IntResult> {
        Some(Self::apply(lhs, rhs))
    }
}

impl IntOp for Div {
    fn eval(lhs: u64, rhs: u64, signed: bool) -> Option<IntResult> {
        if rhs == 0 {
            return None;
        }
        let (value, overflow) = if signed {
            let (v, o) = (lhs as i64).overflowing_div(rhs as i64);
            (v as u64, o)
        } else {
            (lhs / rhs, false)
        };
        Some(IntResult {
            value,
            carry: false,
            overflow,
        })
    }
}

impl IntOp for Mod {
    fn eval(lhs: u64, rhs: u64, signed: bool) -> Option<IntResult> {
        if rhs == 0 {
            return None;
        }
        let (value, overflow) = if signed {
            let (v, o) = (lhs as i64).overflowing_rem(rhs as i64);
            (v as u64, o)
        } else {
            (lhs % rhs, false)
        };
        Some(IntResult {
            value,
            carry: false,
            overflow,
        })
    }
}

pub trait FloatOp {
    fn f64(lhs: f64, rhs: f64) -> f64;
    fn f32(lhs: f32, rhs: f32) -> f32;
}

macro_rules! float_op {
    ($ty:ty, $op:tt) => {
        impl FloatOp for $ty {
            fn f64(lhs: f64, rhs: f64) -> f64 {
                lhs $op rhs
            }
            fn f32(lhs: f32, rhs: f32) -> f32 {
                lhs $op rhs
            }
        }
    };
}

float_op!(Add, +);
float_op!(Sub, -);
float_op!(Mul, *);
float_op!(Div, /);

/// Where the right-hand operand comes from
pub trait Source {
    /// Destination register and right-hand value
    fn operands(core: &Core, inst: &Instruction, signed: bool) -> (usize, u64);
}

/// Register in bits 48-51, imm32 in the low bits
pub struct Imm;
/// Destination in bits 4-7, source in bits 0-3
pub struct Reg;

impl Source for Imm {
    fn operands(_core: &Core, inst: &Instruction, signed: bool) -> (usize, u64) {
        let imm = if signed { inst.simm() } else { inst.imm() };
        (inst.reg(), imm)
    }
}

impl Source for Reg {
    fn operands(core: &Core, inst: &Instruction, _signed: bool) -> (usize, u64) {
        (inst.dest(), core.regs[inst.src()])
    }
}

pub fn int<O: IntOp, S: Source, const SIGNED: bool>(
    core: &mut Core,
    inst: &Instruction,
) -> Result<Flow, Fault> {
    let (dest, rhs) = S::operands(core, inst, SIGNED);
    let result = O::eval(core.regs[dest], rhs, SIGNED)
        .ok_or(Fault::DivisionByZero { pc: inst.address })?;

    core.regs[dest] = result.value;
    core.flags.set(result.value, result.carry, result.overflow);
    Ok(Flow::Next)
}

pub fn float<O: FloatOp, const NARROW: bool>(
    core: &mut Core,
    inst: &Instruction,
) -> Result<Flow, Fault> {
    let (dest, src) = (inst.dest(), inst.src());
    let (lhs, rhs) = (core.regs[dest], core.regs[src]);

    let (bits, zero, negative, infinite) = if NARROW {
        let r = O::f32(f32::from_bits(lhs as u32), f32::from_bits(rhs as u32));
        (r.to_bits() as u64, r == 0.0, r < 0.0, r.is_infinite())
    } else {
        let r = O::f64(f64::from_bits(lhs), f64::from_bits(rhs));
        (r.to_bits(), r == 0.0, r < 0.0, r.is_infinite())
    };

    core.regs[dest] = bits;
    core.flags.zero = zero;
    core.flags.negative = negative;
    core.flags.carry = false;
    core.flags.overflow = infinite;
    Ok(Flow::Next)
}

/// Flags of `lhs - rhs`, no register written
pub fn cmp<S: Source>(core: &mut Core, inst: &Instruction) -> Result<Flow, Fault> {
    let (reg, rhs) = S::operands(core, inst, true);
    let result = Sub::apply(core.regs[reg], rhs);
    core.flags.set(result.value, result.carry, result.overflow);
    Ok(Flow::Next)
}

/// `inc` / `dec` on the register in bits 48-51
pub fn step<O: Wrapping>(core: &mut Core, inst: &Instruction) -> Result<Flow, Fault> {
    let reg = inst.reg();
    let result = O::apply(core.regs[reg], 1);
    core.regs[reg] = result.value;
    core.flags.set(result.value, result.carry, result.overflow);
    Ok(Flow::Next)
}
