/// Fault taxonomy for the VM
///
/// Component setup errors (`QueueError`, `AllocError`) go back to the caller.
/// Once cores are running, a `Fault` is escalated through the request
/// handler instead, since the faulting thread has no caller.

use crate::memory::RegionKind;
use crate::types::CoreId;

/// How far a fault reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Stops the faulting core (and its decoder) only
    CoreFatal,
    /// Stops the supervisor and every core
    VmFatal,
}

/// A fault raised while booting or executing
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Fault {
    #[error("invalid opcode 0x{opcode:02x} at pc {pc}")]
    InvalidOpcode { pc: u64, opcode: u8 },

    #[error("instruction fetch out of bounds at pc {pc}")]
    FetchOutOfBounds { pc: u64 },

    #[error("{region} access out of bounds: address 0x{address:x}, width {width}")]
    OutOfBounds {
        region: RegionKind,
        address: u64,
        width: u64,
    },

    #[error("division by zero at pc {pc}")]
    DivisionByZero { pc: u64 },

    #[error("stack overflow (sp = {sp})")]
    StackOverflow { sp: u64 },

    #[error("stack underflow (sp = {sp})")]
    StackUnderflow { sp: u64 },

    #[error("string at 0x{address:x} is not NUL-terminated inside data memory")]
    UnterminatedString { address: u64 },

    #[error("file request with a null handle")]
    NullFileHandle,

    #[error("unknown file handle {0}")]
    InvalidFileHandle(u64),

    #[error("failed to load dynamic library {0:?}")]
    DynamicLoadFailed(String),

    #[error("failed to allocate {bytes} bytes")]
    AllocationFailed { bytes: usize },

    #[error("decoder for core {0} failed to start")]
    DecoderNotStarting(CoreId),

    #[error("failed to spawn thread: {0}")]
    ThreadSpawn(String),

    #[error("supervisor is no longer servicing requests")]
    SupervisorUnavailable,
}

impl Fault {
    pub fn severity(&self) -> Severity {
        match self {
            Fault::AllocationFailed { .. }
            | Fault::DecoderNotStarting(_)
            | Fault::ThreadSpawn(_) => Severity::VmFatal,
            _ => Severity::CoreFatal,
        }
    }

    /// Numeric cause reported by the binary on exit
    pub fn code(&self) -> u32 {
        match self {
            Fault::InvalidOpcode { .. } => 1,
            Fault::FetchOutOfBounds { .. } => 2,
            Fault::OutOfBounds { .. } => 3,
            Fault::DivisionByZero { .. } => 4,
            Fault::StackOverflow { .. } => 5,
            Fault::StackUnderflow { .. } => 6,
            Fault::UnterminatedString { .. } => 7,
            Fault::NullFileHandle => 8,
            Fault::InvalidFileHandle(_) => 9,
            Fault::DynamicLoadFailed(_) => 10,
            Fault::AllocationFailed { .. } => 11,
            Fault::DecoderNotStarting(_) => 12,
            Fault::ThreadSpawn(_) => 13,
            Fault::SupervisorUnavailable => 14,
        }
    }
}

/// A fault together with the core that raised it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultRecord {
    pub core: Option<CoreId>,
    pub fault: Fault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue capacity must be non-zero")]
    ZeroCapacity,
    #[error("queue is full")]
    Full,
    #[error("queue is closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error("allocation of {requested} bytes exceeds budget ({in_use} of {limit} bytes in use)")]
    BudgetExceeded {
        requested: usize,
        in_use: usize,
        limit: usize,
    },
    #[error("host refused mapping of {requested} bytes: {reason}")]
    Host { requested: usize, reason: String },
}

impl From<AllocError> for Fault {
    fn from(err: AllocError) -> Self {
        let bytes = match err {
            AllocError::BudgetExceeded { requested, .. } => requested,
            AllocError::Host { requested, .. } => requested,
        };
        Fault::AllocationFailed { bytes }
    }
}
