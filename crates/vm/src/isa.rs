/// Instruction Set
///
/// Every instruction is one little-endian 64-bit word:
///
/// ```text
///  63      56 55  52 51  48 47          32 31                          0
/// +----------+------+------+--------------+-----------------------------+
/// |  opcode  |  -   | reg  |    unused    |           imm32             |
/// +----------+------+------+--------------+-----------------------------+
/// ```
///
/// Register forms select their destination in bits 4-7 and source in bits
/// 0-3. Opcodes that carry a 64-bit operand (absolute addresses, jump
/// targets, wide immediates) are followed by one extra word. `pc` counts
/// words.

use crate::error::Fault;
use crate::exec::Handler;

macro_rules! opcodes {
    ($($name:ident = $mnemonic:literal),* $(,)?) => {
        /// Operation selector (bits 56-63)
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $($name),*
        }

        impl Opcode {
            /// Every opcode, indexed by its encoding
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name),*];

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$name => $mnemonic),*
                }
            }
        }
    };
}

opcodes! {
    Nop = "nop",
    Halt = "halt",

    AddImm = "add_imm",
    AddReg = "add_reg",
    SubImm = "sub_imm",
    SubReg = "sub_reg",
    MulImm = "mul_imm",
    MulReg = "mul_reg",
    DivImm = "div_imm",
    DivReg = "div_reg",
    ModImm = "mod_imm",
    ModReg = "mod_reg",

    IAddImm = "iadd_imm",
    IAddReg = "iadd_reg",
    ISubImm = "isub_imm",
    ISubReg = "isub_reg",
    IMulImm = "imul_imm",
    IMulReg = "imul_reg",
    IDivImm = "idiv_imm",
    IDivReg = "idiv_reg",
    IModImm = "imod_imm",
    IModReg = "imod_reg",

    FAdd = "fadd",
    FSub = "fsub",
    FMul = "fmul",
    FDiv = "fdiv",
    FAdd32 = "fadd32",
    FSub32 = "fsub32",
    FMul32 = "fmul32",
    FDiv32 = "fdiv32",

    MoveImm = "mov",
    MoveImm64 = "movq",
    MoveReg = "movr",
    MoveReg8 = "movr8",
    MoveReg16 = "movr16",
    MoveReg32 = "movr32",
    MovesxImm8 = "movsx_imm8",
    MovesxImm16 = "movsx_imm16",
    MovesxImm32 = "movsx_imm32",
    MovesxReg8 = "movsx_reg8",
    MovesxReg16 = "movsx_reg16",
    MovesxReg32 = "movsx_reg32",
    Excg = "excg",
    Excg8 = "excg8",
    Excg16 = "excg16",
    Excg32 = "excg32",

    And = "and",
    Or = "or",
    Xor = "xor",
    Not = "not",
    Lsh = "lsh",
    Rsh = "rsh",
    CmpImm = "cmp_imm",
    CmpReg = "cmp_reg",
    Inc = "inc",
    Dec = "dec",

    Jmp = "jmp",
    Jz = "jz",
    Jnz = "jnz",
    Jn = "jn",
    Jc = "jc",
    Jo = "jo",
    Call = "call",
    Ret = "ret",

    PushImm = "push_imm",
    PushReg = "push_reg",
    Pop = "pop",
    Pusha = "pusha",
    Popa = "popa",
    Sva = "sva",
    Svc = "svc",

    Load = "load",
    Store = "store",
    Loadb = "loadb",
    Storeb = "storeb",
    Loadw = "loadw",
    Storew = "storew",
    Loadd = "loadd",
    Stored = "stored",
    Loadsb = "loadsb",
    Loadsw = "loadsw",
    Loadsd = "loadsd",
    LoadReg = "load_reg",
    StoreReg = "store_reg",
    LoadbReg = "loadb_reg",
    StorebReg = "storeb_reg",
    LoadwReg = "loadw_reg",
    StorewReg = "storew_reg",
    LoaddReg = "loadd_reg",
    StoredReg = "stored_reg",

    NewCore = "ncore",
    Dynl = "dynl",
    Dynul = "dynul",
    Dyncall = "dyncall",
    Fopen = "fopen",
    Fclose = "fclose",
    Fread = "fread",
    Fwrite = "fwrite",
    Feof = "feof",
}

/// How an opcode moves the decoder's fetch cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    /// Falls through to the next instruction
    Straight,
    /// Target is the trailing operand, known at decode time
    Direct,
    /// Target is only known after execution; the decoder waits for it
    Resolved,
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Opcode> {
        Self::ALL.get(byte as usize).copied()
    }

    /// Whether a 64-bit operand word follows the instruction
    pub fn has_operand(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            MoveImm64
                | Jmp
                | Jz
                | Jnz
                | Jn
                | Jc
                | Jo
                | Call
                | Load
                | Store
                | Loadb
                | Storeb
                | Loadw
                | Storew
                | Loadd
                | Stored
                | Loadsb
                | Loadsw
                | Loadsd
        )
    }

    /// Encoded size in words
    pub fn width(self) -> u64 {
        if self.has_operand() {
            2
        } else {
            1
        }
    }

    pub fn control(self) -> ControlKind {
        use Opcode::*;
        match self {
            Jmp | Call => ControlKind::Direct,
            Jz | Jnz | Jn | Jc | Jo | Ret => ControlKind::Resolved,
            _ => ControlKind::Straight,
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// A decoded instruction bound to its handler. Consumed once by its core.
#[derive(Clone, Copy)]
pub struct Instruction {
    pub opcode: Opcode,
    /// Raw instruction word
    pub word: u64,
    /// Trailing operand word, 0 when the opcode has none
    pub operand: u64,
    /// Word index of this instruction
    pub address: u64,
    /// Word index of the instruction that follows it in memory
    pub next: u64,
    pub handler: Handler,
}

impl Instruction {
    /// Register select in bits 48-51
    pub fn reg(&self) -> usize {
        ((self.word >> 48) & 0xF) as usize
    }

    /// Destination of a register form (bits 4-7)
    pub fn dest(&self) -> usize {
        ((self.word >> 4) & 0xF) as usize
    }

    /// Source of a register form (bits 0-3)
    pub fn src(&self) -> usize {
        (self.word & 0xF) as usize
    }

    /// Low 32 bits, zero-extended
    pub fn imm(&self) -> u64 {
        self.word & 0xFFFF_FFFF
    }

    /// Low 32 bits, sign-extended
    pub fn simm(&self) -> u64 {
        self.word as u32 as i32 as i64 as u64
    }
}

impl std::fmt::Debug for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instruction")
            .field("opcode", &self.opcode)
            .field("word", &format_args!("0x{:016x}", self.word))
            .field("operand", &self.operand)
            .field("address", &self.address)
            .finish()
    }
}

/// Item travelling through a core's instruction queue
#[derive(Debug)]
pub enum Decoded {
    Ready(Instruction),
    /// Decode failed here. Raised only if execution reaches `pc`.
    Trap { pc: u64, fault: Fault },
}

/// Raw word encoders
pub mod encode {
    use super::Opcode;

    pub fn bare(op: Opcode) -> u64 {
        (op as u64) << 56
    }

    /// Immediate form: register in bits 48-51, imm32 in the low bits
    pub fn imm(op: Opcode, reg: usize, imm: u32) -> u64 {
        bare(op) | (((reg as u64) & 0xF) << 48) | imm as u64
    }

    /// Register form: destination in bits 4-7, source in bits 0-3
    pub fn regs(op: Opcode, dest: usize, src: usize) -> u64 {
        bare(op) | (((dest as u64) & 0xF) << 4) | ((src as u64) & 0xF)
    }
}

/// Assembles instruction words for tests and embedders
#[derive(Debug, Default, Clone)]
pub struct ProgramBuilder {
    words: Vec<u64>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Word index the next emitted instruction will occupy
    pub fn here(&self) -> u64 {
        self.words.len() as u64
    }

    pub fn op(mut self, op: Opcode) -> Self {
        self.words.push(encode::bare(op));
        self
    }

    pub fn imm(mut self, op: Opcode, reg: usize, imm: u32) -> Self {
        self.words.push(encode::imm(op, reg, imm));
        self
    }

    pub fn regs(mut self, op: Opcode, dest: usize, src: usize) -> Self {
        self.words.push(encode::regs(op, dest, src));
        self
    }

    /// Two-word form: register in bits 48-51 plus trailing operand
    pub fn wide(mut self, op: Opcode, reg: usize, operand: u64) -> Self {
        self.words.push(encode::imm(op, reg, 0));
        self.words.push(operand);
        self
    }

    /// Overwrite a previously emitted word (patching forward targets)
    pub fn patch(mut self, index: u64, word: u64) -> Self {
        if let Some(slot) = self.words.get_mut(index as usize) {
            *slot = word;
        }
        self
    }

    pub fn raw(mut self, word: u64) -> Self {
        self.words.push(word);
        self
    }

    pub fn build(self) -> Vec<u64> {
        self.words
    }
}
