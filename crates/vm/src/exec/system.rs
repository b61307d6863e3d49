/// Privileged request handlers
///
/// Each one snapshots `Ma/Mb/Mc`, hands the request to the supervisor and
/// blocks until the reply has been applied to the registers.

use super::Flow;
use crate::cpu::Core;
use crate::error::Fault;
use crate::isa::Instruction;
use crate::request::RequestKind;

/// The supervisor decides whether the whole VM stops; this core always does.
pub fn halt(core: &mut Core, _inst: &Instruction) -> Result<Flow, Fault> {
    core.request(RequestKind::Halt)?;
    Ok(Flow::Stop)
}

/// Selects the request a `request` handler submits
pub trait Service {
    const KIND: RequestKind;
}

pub struct NewCore;
pub struct DynLoad;
pub struct DynUnload;
pub struct DynCall;
pub struct FileOpen;
pub struct FileClose;
pub struct FileRead;
pub struct FileWrite;
pub struct FileEof;

impl Service for NewCore {
    const KIND: RequestKind = RequestKind::NewCore;
}

impl Service for DynLoad {
    const KIND: RequestKind = RequestKind::DynLoad;
}

impl Service for DynUnload {
    const KIND: RequestKind = RequestKind::DynUnload;
}

impl Service for DynCall {
    const KIND: RequestKind = RequestKind::DynCall;
}

impl Service for FileOpen {
    const KIND: RequestKind = RequestKind::FileOpen;
}

impl Service for FileClose {
    const KIND: RequestKind = RequestKind::FileClose;
}

impl Service for FileRead {
    const KIND: RequestKind = RequestKind::FileRead;
}

impl Service for FileWrite {
    const KIND: RequestKind = RequestKind::FileWrite;
}

impl Service for FileEof {
    const KIND: RequestKind = RequestKind::FileEof;
}

/// Every request except `halt` resumes at the next instruction
pub fn request<S: Service>(core: &mut Core, _inst: &Instruction) -> Result<Flow, Fault> {
    core.request(S::KIND)?;
    Ok(Flow::Next)
}
