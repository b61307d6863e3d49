/// Data movement, logic and data-memory access

use super::Flow;
use crate::cpu::Core;
use crate::error::Fault;
use crate::isa::Instruction;

/// Access widths in bytes
pub struct Width;

impl Width {
    pub const B: u64 = 1;
    pub const W: u64 = 2;
    pub const D: u64 = 4;
    pub const Q: u64 = 8;
}

fn mask(bytes: u64) -> u64 {
    if bytes >= 8 {
        u64::MAX
    } else {
        (1u64 << (bytes * 8)) - 1
    }
}

fn sign_extend(value: u64, bytes: u64) -> u64 {
    let shift = 64 - bytes * 8;
    (((value << shift) as i64) >> shift) as u64
}

pub fn move_imm(core: &mut Core, inst: &Instruction) -> Result<Flow, Fault> {
    core.regs[inst.reg()] = inst.imm();
    Ok(Flow::Next)
}

pub fn move_imm64(core: &mut Core, inst: &Instruction) -> Result<Flow, Fault> {
    core.regs[inst.reg()] = inst.operand;
    Ok(Flow::Next)
}

/// Copy the low `BYTES` of the source, zero-extended
pub fn move_reg<const BYTES: u64>(core: &mut Core, inst: &Instruction) -> Result<Flow, Fault> {
    core.regs[inst.dest()] = core.regs[inst.src()] & mask(BYTES);
    Ok(Flow::Next)
}

pub fn movesx_imm<const BYTES: u64>(core: &mut Core, inst: &Instruction) -> Result<Flow, Fault> {
    core.regs[inst.reg()] = sign_extend(inst.imm(), BYTES);
    Ok(Flow::Next)
}

pub fn movesx_reg<const BYTES: u64>(core: &mut Core, inst: &Instruction) -> Result<Flow, Fault> {
    core.regs[inst.dest()] = sign_extend(core.regs[inst.src()], BYTES);
    Ok(Flow::Next)
}

/// Swap the low `BYTES` of two registers
pub fn excg<const BYTES: u64>(core: &mut Core, inst: &Instruction) -> Result<Flow, Fault> {
    let (a, b) = (inst.dest(), inst.src());
    let m = mask(BYTES);
    let (va, vb) = (core.regs[a], core.regs[b]);
    core.regs[a] = (va & !m) | (vb & m);
    core.regs[b] = (vb & !m) | (va & m);
    Ok(Flow::Next)
}

pub const AND: u8 = 0;
pub const OR: u8 = 1;
pub const XOR: u8 = 2;

pub fn logic<const OP: u8>(core: &mut Core, inst: &Instruction) -> Result<Flow, Fault> {
    let (dest, src) = (inst.dest(), inst.src());
    let (lhs, rhs) = (core.regs[dest], core.regs[src]);
    let value = match OP {
        AND => lhs & rhs,
        OR => lhs | rhs,
        _ => lhs ^ rhs,
    };
    core.regs[dest] = value;
    core.flags.set(value, false, false);
    Ok(Flow::Next)
}

pub fn not(core: &mut Core, inst: &Instruction) -> Result<Flow, Fault> {
    let reg = inst.reg();
    core.regs[reg] = !core.regs[reg];
    core.flags.set(core.regs[reg], false, false);
    Ok(Flow::Next)
}

/// `lsh` / `rsh` by `imm & 63`
pub fn shift<const LEFT: bool>(core: &mut Core, inst: &Instruction) -> Result<Flow, Fault> {
    let reg = inst.reg();
    let by = (inst.imm() & 63) as u32;
    let value = if LEFT {
        core.regs[reg] << by
    } else {
        core.regs[reg] >> by
    };
    core.regs[reg] = value;
    core.flags.set(value, false, false);
    Ok(Flow::Next)
}

/// Register and data address of a load or store.
/// Absolute forms: register in bits 48-51, address in the trailing word.
/// Register forms: register in bits 4-7, address register in bits 0-3.
fn access<const BY_REG: bool>(core: &Core, inst: &Instruction) -> (usize, u64) {
    if BY_REG {
        (inst.dest(), core.regs[inst.src()])
    } else {
        (inst.reg(), inst.operand)
    }
}

pub fn load<const BYTES: u64, const SIGNED: bool, const BY_REG: bool>(
    core: &mut Core,
    inst: &Instruction,
) -> Result<Flow, Fault> {
    let (reg, address) = access::<BY_REG>(core, inst);
    let value = core.data().read(address, BYTES)?;
    core.regs[reg] = if SIGNED { sign_extend(value, BYTES) } else { value };
    Ok(Flow::Next)
}

pub fn store<const BYTES: u64, const BY_REG: bool>(
    core: &mut Core,
    inst: &Instruction,
) -> Result<Flow, Fault> {
    let (reg, address) = access::<BY_REG>(core, inst);
    core.data().write(address, core.regs[reg], BYTES)?;
    Ok(Flow::Next)
}
