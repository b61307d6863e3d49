/// Control transfer and stack handlers

use super::Flow;
use crate::cpu::Core;
use crate::error::Fault;
use crate::isa::Instruction;
use crate::types::REGISTER_COUNT;

pub const ZERO: u8 = 0;
pub const NEGATIVE: u8 = 1;
pub const CARRY: u8 = 2;
pub const OVERFLOW: u8 = 3;

pub fn nop(_core: &mut Core, _inst: &Instruction) -> Result<Flow, Fault> {
    Ok(Flow::Next)
}

pub fn jump(_core: &mut Core, inst: &Instruction) -> Result<Flow, Fault> {
    Ok(Flow::Jump(inst.operand))
}

/// Jump to the operand when flag `FLAG` equals `WHEN`
pub fn branch<const FLAG: u8, const WHEN: bool>(
    core: &mut Core,
    inst: &Instruction,
) -> Result<Flow, Fault> {
    let flag = match FLAG {
        ZERO => core.flags.zero,
        NEGATIVE => core.flags.negative,
        CARRY => core.flags.carry,
        _ => core.flags.overflow,
    };
    if flag == WHEN {
        Ok(Flow::Jump(inst.operand))
    } else {
        Ok(Flow::Next)
    }
}

/// Push the return pc and the caller's `bp`, then open a new frame
pub fn call(core: &mut Core, inst: &Instruction) -> Result<Flow, Fault> {
    core.push(inst.next)?;
    core.push(core.bp)?;
    core.bp = core.sp;
    Ok(Flow::Jump(inst.operand))
}

pub fn ret(core: &mut Core, _inst: &Instruction) -> Result<Flow, Fault> {
    core.sp = core.bp;
    core.bp = core.pop()?;
    let target = core.pop()?;
    Ok(Flow::Jump(target))
}

pub fn push_imm(core: &mut Core, inst: &Instruction) -> Result<Flow, Fault> {
    core.push(inst.imm())?;
    Ok(Flow::Next)
}

pub fn push_reg(core: &mut Core, inst: &Instruction) -> Result<Flow, Fault> {
    core.push(core.regs[inst.reg()])?;
    Ok(Flow::Next)
}

pub fn pop(core: &mut Core, inst: &Instruction) -> Result<Flow, Fault> {
    core.regs[inst.reg()] = core.pop()?;
    Ok(Flow::Next)
}

pub fn pusha(core: &mut Core, _inst: &Instruction) -> Result<Flow, Fault> {
    let needed = (REGISTER_COUNT * 8) as u64;
    if core.sp + needed > core.stack().len() as u64 {
        return Err(Fault::StackOverflow { sp: core.sp });
    }
    for i in 0..REGISTER_COUNT {
        core.push(core.regs[i])?;
    }
    Ok(Flow::Next)
}

pub fn popa(core: &mut Core, _inst: &Instruction) -> Result<Flow, Fault> {
    if core.sp < (REGISTER_COUNT * 8) as u64 {
        return Err(Fault::StackUnderflow { sp: core.sp });
    }
    for i in (0..REGISTER_COUNT).rev() {
        core.regs[i] = core.pop()?;
    }
    Ok(Flow::Next)
}

/// Read the frame slot `bp + simm32 * 8` into the register in bits 48-51
pub fn sva(core: &mut Core, inst: &Instruction) -> Result<Flow, Fault> {
    let address = core.frame_slot(inst.simm() as i64)?;
    core.regs[inst.reg()] = core.stack().read_u64(address)?;
    Ok(Flow::Next)
}

/// Write the register in bits 48-51 to the frame slot `bp + simm32 * 8`
pub fn svc(core: &mut Core, inst: &Instruction) -> Result<Flow, Fault> {
    let address = core.frame_slot(inst.simm() as i64)?;
    core.stack().write_u64(address, core.regs[inst.reg()])?;
    Ok(Flow::Next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::testing::detached;
    use crate::decoder::decode_at;
    use crate::hal::allocator::HostPageAllocator;
    use crate::isa::{encode, Opcode, ProgramBuilder};
    use crate::memory::MemoryRegion;

    fn run_at(core: &mut Core, words: &[u64], pc: u64) -> Result<Flow, Fault> {
        let mem = MemoryRegion::with_words(&HostPageAllocator::new(), words).unwrap();
        let inst = decode_at(&mem, pc).unwrap();
        (inst.handler)(core, &inst)
    }

    #[test]
    fn conditional_jumps_follow_flags() {
        let (mut core, _) = detached(64, 64);
        let jz = ProgramBuilder::new().wide(Opcode::Jz, 0, 40).build();
        let jnz = ProgramBuilder::new().wide(Opcode::Jnz, 0, 40).build();

        core.flags.zero = true;
        assert_eq!(run_at(&mut core, &jz, 0), Ok(Flow::Jump(40)));
        assert_eq!(run_at(&mut core, &jnz, 0), Ok(Flow::Next));

        core.flags.zero = false;
        core.flags.carry = true;
        assert_eq!(run_at(&mut core, &jz, 0), Ok(Flow::Next));
        let jc = ProgramBuilder::new().wide(Opcode::Jc, 0, 7).build();
        assert_eq!(run_at(&mut core, &jc, 0), Ok(Flow::Jump(7)));
    }

    #[test]
    fn call_and_ret_restore_the_frame() {
        let (mut core, _) = detached(64, 256);
        let program = ProgramBuilder::new()
            .op(Opcode::Nop) // 0
            .wide(Opcode::Call, 0, 10) // 1..2
            .build();

        core.push(99).unwrap();
        core.bp = 8;
        assert_eq!(run_at(&mut core, &program, 1), Ok(Flow::Jump(10)));
        assert_eq!(core.sp, 24);
        assert_eq!(core.bp, 24);

        // locals inside the callee
        core.push(5).unwrap();
        core.regs[0] = 77;
        run_at(&mut core, &[encode::imm(Opcode::Svc, 0, 0)], 0).unwrap();
        run_at(&mut core, &[encode::imm(Opcode::Sva, 1, 0)], 0).unwrap();
        assert_eq!(core.regs[1], 77);
        // caller's slot below the saved bp and return pc
        run_at(&mut core, &[encode::imm(Opcode::Sva, 2, (-3i32) as u32)], 0).unwrap();
        assert_eq!(core.regs[2], 99);

        assert_eq!(run_at(&mut core, &[encode::bare(Opcode::Ret)], 0), Ok(Flow::Jump(3)));
        assert_eq!((core.sp, core.bp), (8, 8));
    }

    #[test]
    fn ret_on_empty_stack_underflows() {
        let (mut core, _) = detached(64, 64);
        assert_eq!(
            run_at(&mut core, &[encode::bare(Opcode::Ret)], 0),
            Err(Fault::StackUnderflow { sp: 0 })
        );
    }

    #[test]
    fn pusha_popa_round_trip_registers() {
        let (mut core, _) = detached(64, 256);
        for (i, r) in core.regs.iter_mut().enumerate() {
            *r = i as u64 * 3;
        }
        let saved = core.regs;
        run_at(&mut core, &[encode::bare(Opcode::Pusha)], 0).unwrap();
        core.regs = [0; REGISTER_COUNT];
        run_at(&mut core, &[encode::bare(Opcode::Popa)], 0).unwrap();
        assert_eq!(core.regs, saved);
        assert_eq!(core.sp, 0);

        let (mut small, _) = detached(64, 64);
        assert!(matches!(
            run_at(&mut small, &[encode::bare(Opcode::Pusha)], 0),
            Err(Fault::StackOverflow { .. })
        ));
        assert_eq!(small.sp, 0);
    }

    #[test]
    fn push_and_pop() {
        let (mut core, _) = detached(64, 64);
        run_at(&mut core, &[encode::imm(Opcode::PushImm, 0, 12)], 0).unwrap();
        core.regs[5] = 34;
        run_at(&mut core, &[encode::imm(Opcode::PushReg, 5, 0)], 0).unwrap();
        run_at(&mut core, &[encode::imm(Opcode::Pop, 6, 0)], 0).unwrap();
        run_at(&mut core, &[encode::imm(Opcode::Pop, 7, 0)], 0).unwrap();
        assert_eq!((core.regs[6], core.regs[7]), (34, 12));
    }
}
