/// Execution Handlers
///
/// One handler per opcode, selected once at decode time by `handler_for`.
/// Families that differ only in operation, signedness or operand source
/// share a generic template and are instantiated per opcode.

pub mod arith;
pub mod control;
pub mod data;
pub mod system;

use crate::cpu::Core;
use crate::error::Fault;
use crate::isa::{Instruction, Opcode};

/// What the core does after a handler returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Continue with the instruction that follows in memory
    Next,
    /// Continue at the given word index
    Jump(u64),
    /// Leave the FDE loop
    Stop,
}

pub type Handler = fn(&mut Core, &Instruction) -> Result<Flow, Fault>;

pub fn handler_for(opcode: Opcode) -> Handler {
    use arith::{Add, Div, Imm, Mod, Mul, Reg, Sub};
    use data::Width;
    use Opcode::*;

    match opcode {
        Nop => control::nop,
        Halt => system::halt,

        AddImm => arith::int::<Add, Imm, false>,
        AddReg => arith::int::<Add, Reg, false>,
        SubImm => arith::int::<Sub, Imm, false>,
        SubReg => arith::int::<Sub, Reg, false>,
        MulImm => arith::int::<Mul, Imm, false>,
        MulReg => arith::int::<Mul, Reg, false>,
        DivImm => arith::int::<Div, Imm, false>,
        DivReg => arith::int::<Div, Reg, false>,
        ModImm => arith::int::<Mod, Imm, false>,
        ModReg => arith::int::<Mod, Reg, false>,

        IAddImm => arith::int::<Add, Imm, true>,
        IAddReg => arith::int::<Add, Reg, true>,
        ISubImm => arith::int::<Sub, Imm, true>,
        ISubReg => arith::int::<Sub, Reg, true>,
        IMulImm => arith::int::<Mul, Imm, true>,
        IMulReg => arith::int::<Mul, Reg, true>,
        IDivImm => arith::int::<Div, Imm, true>,
        IDivReg => arith::int::<Div, Reg, true>,
        IModImm => arith::int::<Mod, Imm, true>,
        IModReg => arith::int::<Mod, Reg, true>,

        FAdd => arith::float::<Add, false>,
        FSub => arith::float::<Sub, false>,
        FMul => arith::float::<Mul, false>,
        FDiv => arith::float::<Div, false>,
        FAdd32 => arith::float::<Add, true>,
        FSub32 => arith::float::<Sub, true>,
        FMul32 => arith::float::<Mul, true>,
        FDiv32 => arith::float::<Div, true>,

        MoveImm => data::move_imm,
        MoveImm64 => data::move_imm64,
        MoveReg => data::move_reg::<{ Width::Q }>,
        MoveReg8 => data::move_reg::<{ Width::B }>,
        MoveReg16 => data::move_reg::<{ Width::W }>,
        MoveReg32 => data::move_reg::<{ Width::D }>,
        MovesxImm8 => data::movesx_imm::<{ Width::B }>,
        MovesxImm16 => data::movesx_imm::<{ Width::W }>,
        MovesxImm32 => data::movesx_imm::<{ Width::D }>,
        MovesxReg8 => data::movesx_reg::<{ Width::B }>,
        MovesxReg16 => data::movesx_reg::<{ Width::W }>,
        MovesxReg32 => data::movesx_reg::<{ Width::D }>,
        Excg => data::excg::<{ Width::Q }>,
        Excg8 => data::excg::<{ Width::B }>,
        Excg16 => data::excg::<{ Width::W }>,
        Excg32 => data::excg::<{ Width::D }>,

        And => data::logic::<{ data::AND }>,
        Or => data::logic::<{ data::OR }>,
        Xor => data::logic::<{ data::XOR }>,
        Not => data::not,
        Lsh => data::shift::<true>,
        Rsh => data::shift::<false>,
        CmpImm => arith::cmp::<Imm>,
        CmpReg => arith::cmp::<Reg>,
        Inc => arith::step::<Add>,
        Dec => arith::step::<Sub>,

        Jmp => control::jump,
        Jz => control::branch::<{ control::ZERO }, true>,
        Jnz => control::branch::<{ control::ZERO }, false>,
        Jn => control::branch::<{ control::NEGATIVE }, true>,
        Jc => control::branch::<{ control::CARRY }, true>,
        Jo => control::branch::<{ control::OVERFLOW }, true>,
        Call => control::call,
        Ret => control::ret,

        PushImm => control::push_imm,
        PushReg => control::push_reg,
        Pop => control::pop,
        Pusha => control::pusha,
        Popa => control::popa,
        Sva => control::sva,
        Svc => control::svc,

        Load => data::load::<{ Width::Q }, false, false>,
        Store => data::store::<{ Width::Q }, false>,
        Loadb => data::load::<{ Width::B }, false, false>,
        Storeb => data::store::<{ Width::B }, false>,
        Loadw => data::load::<{ Width::W }, false, false>,
        Storew => data::store::<{ Width::W }, false>,
        Loadd => data::load::<{ Width::D }, false, false>,
        Stored => data::store::<{ Width::D }, false>,
        Loadsb => data::load::<{ Width::B }, true, false>,
        Loadsw => data::load::<{ Width::W }, true, false>,
        Loadsd => data::load::<{ Width::D }, true, false>,
        LoadReg => data::load::<{ Width::Q }, false, true>,
        StoreReg => data::store::<{ Width::Q }, true>,
        LoadbReg => data::load::<{ Width::B }, false, true>,
        StorebReg => data::store::<{ Width::B }, true>,
        LoadwReg => data::load::<{ Width::W }, false, true>,
        StorewReg => data::store::<{ Width::W }, true>,
        LoaddReg => data::load::<{ Width::D }, false, true>,
        StoredReg => data::store::<{ Width::D }, true>,

        NewCore => system::request::<system::NewCore>,
        Dynl => system::request::<system::DynLoad>,
        Dynul => system::request::<system::DynUnload>,
        Dyncall => system::request::<system::DynCall>,
        Fopen => system::request::<system::FileOpen>,
        Fclose => system::request::<system::FileClose>,
        Fread => system::request::<system::FileRead>,
        Fwrite => system::request::<system::FileWrite>,
        Feof => system::request::<system::FileEof>,
    }
}
