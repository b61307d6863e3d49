/// Decoder - "The Fetch Stage"
///
/// Runs ahead of its core on a separate thread: fetches words from
/// instruction memory, binds handlers and fills the core's instruction
/// queue. Direct transfers are followed at decode time; for transfers that
/// depend on execution (`ret`, conditional jumps) the decoder waits until
/// the core reports where execution went.

use crate::error::Fault;
use crate::exec;
use crate::isa::{ControlKind, Decoded, Instruction, Opcode};
use crate::memory::MemoryRegion;
use crate::queue::BoundedQueue;
use crate::types::CoreId;
use crossbeam::channel::Receiver;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Decode the instruction at word index `pc`
pub fn decode_at(memory: &MemoryRegion, pc: u64) -> Result<Instruction, Fault> {
    let fetch = |index: u64| {
        index
            .checked_mul(8)
            .ok_or(Fault::FetchOutOfBounds { pc })
            .and_then(|address| memory.read_u64(address).map_err(|_| Fault::FetchOutOfBounds { pc }))
    };

    let word = fetch(pc)?;
    let byte = (word >> 56) as u8;
    let opcode = Opcode::from_u8(byte).ok_or(Fault::InvalidOpcode { pc, opcode: byte })?;
    let operand = if opcode.has_operand() { fetch(pc + 1)? } else { 0 };

    Ok(Instruction {
        opcode,
        word,
        operand,
        address: pc,
        next: pc + opcode.width(),
        handler: exec::handler_for(opcode),
    })
}

pub struct Decoder {
    core: CoreId,
    cursor: u64,
    memory: Arc<MemoryRegion>,
    queue: Arc<BoundedQueue<Decoded>>,
    should_stop: Arc<AtomicBool>,
    redirect: Receiver<u64>,
}

impl Decoder {
    pub fn new(
        core: CoreId,
        start: u64,
        memory: Arc<MemoryRegion>,
        queue: Arc<BoundedQueue<Decoded>>,
        should_stop: Arc<AtomicBool>,
        redirect: Receiver<u64>,
    ) -> Self {
        Self {
            core,
            cursor: start,
            memory,
            queue,
            should_stop,
            redirect,
        }
    }

    /// Decode loop. Returns when stopped, when the queue closes, or when the
    /// core hangs up the redirect channel.
    pub fn run(mut self) {
        log::debug!("Decoder for core {} starting at pc {}", self.core, self.cursor);

        while !self.should_stop.load(Ordering::Acquire) {
            match decode_at(&self.memory, self.cursor) {
                Ok(inst) => {
                    let control = inst.opcode.control();
                    if self.queue.push(Decoded::Ready(inst)).is_err() {
                        break;
                    }
                    self.cursor = match control {
                        ControlKind::Straight => inst.next,
                        ControlKind::Direct => inst.operand,
                        ControlKind::Resolved => match self.redirect.recv() {
                            Ok(pc) => pc,
                            Err(_) => break,
                        },
                    };
                }
                Err(fault) => {
                    let trap = Decoded::Trap {
                        pc: self.cursor,
                        fault,
                    };
                    if self.queue.push(trap).is_err() {
                        break;
                    }
                    // Nothing valid to fetch until the core says otherwise.
                    match self.redirect.recv() {
                        Ok(pc) => self.cursor = pc,
                        Err(_) => break,
                    }
                }
            }
        }

        log::debug!("Decoder for core {} exiting at pc {}", self.core, self.cursor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::allocator::HostPageAllocator;
    use crate::isa::{encode, ProgramBuilder};
    use crossbeam::channel;
    use std::thread;

    fn memory(words: &[u64]) -> Arc<MemoryRegion> {
        Arc::new(MemoryRegion::with_words(&HostPageAllocator::new(), words).unwrap())
    }

    fn opcodes(queue: &BoundedQueue<Decoded>, n: usize) -> Vec<Opcode> {
        (0..n)
            .map(|_| match queue.pop().unwrap() {
                Decoded::Ready(inst) => inst.opcode,
                Decoded::Trap { fault, .. } => panic!("unexpected trap: {fault}"),
            })
            .collect()
    }

    #[test]
    fn decode_reads_trailing_operand() {
        let mem = memory(&[encode::imm(Opcode::MoveImm64, 2, 0), 0xDEAD_BEEF]);
        let inst = decode_at(&mem, 0).unwrap();
        assert_eq!(inst.opcode, Opcode::MoveImm64);
        assert_eq!(inst.operand, 0xDEAD_BEEF);
        assert_eq!(inst.next, 2);
        assert_eq!(inst.reg(), 2);
    }

    #[test]
    fn decode_faults_are_reported() {
        let mem = memory(&[0xFF << 56, encode::imm(Opcode::Load, 0, 0)]);
        assert_eq!(decode_at(&mem, 0).unwrap_err(), Fault::InvalidOpcode { pc: 0, opcode: 0xFF });
        // operand word missing
        assert_eq!(decode_at(&mem, 1).unwrap_err(), Fault::FetchOutOfBounds { pc: 1 });
        assert_eq!(decode_at(&mem, 2).unwrap_err(), Fault::FetchOutOfBounds { pc: 2 });
    }

    #[test]
    fn straight_line_and_direct_jumps_need_no_core() {
        let words = ProgramBuilder::new()
            .imm(Opcode::MoveImm, 0, 1) // 0
            .wide(Opcode::Jmp, 0, 4) // 1..2
            .op(Opcode::Nop) // 3, skipped
            .regs(Opcode::AddReg, 0, 0) // 4
            .op(Opcode::Halt) // 5
            .build();

        let queue = Arc::new(BoundedQueue::new(2).unwrap());
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = channel::bounded(1);
        let decoder = Decoder::new(0, 0, memory(&words), Arc::clone(&queue), Arc::clone(&stop), rx);
        let handle = thread::spawn(move || decoder.run());

        assert_eq!(
            opcodes(&queue, 4),
            vec![Opcode::MoveImm, Opcode::Jmp, Opcode::AddReg, Opcode::Halt]
        );
        // runs off the end of memory next
        assert!(matches!(queue.pop(), Some(Decoded::Trap { pc: 6, .. })));

        drop(tx);
        handle.join().unwrap();
    }

    #[test]
    fn resolved_transfers_wait_for_the_core() {
        let words = ProgramBuilder::new()
            .wide(Opcode::Jz, 0, 3) // 0..1
            .op(Opcode::Nop) // 2
            .op(Opcode::Halt) // 3
            .build();

        let queue = Arc::new(BoundedQueue::new(4).unwrap());
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = channel::bounded(1);
        let decoder = Decoder::new(7, 0, memory(&words), Arc::clone(&queue), Arc::clone(&stop), rx);
        let handle = thread::spawn(move || decoder.run());

        assert_eq!(opcodes(&queue, 1), vec![Opcode::Jz]);
        // the decoder must not run ahead of the branch
        thread::sleep(std::time::Duration::from_millis(30));
        assert!(queue.is_empty());

        tx.send(3).unwrap();
        assert_eq!(opcodes(&queue, 1), vec![Opcode::Halt]);

        stop.store(true, Ordering::Release);
        queue.close();
        drop(tx);
        handle.join().unwrap();
    }
}
