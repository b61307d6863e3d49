/// CPU Core - "The Execution Context"
///
/// One core is two threads: a decoder filling the instruction queue and the
/// core thread draining it. The core thread owns the register file, flags
/// and private stack; instruction and data memory are shared with every
/// other core.

use crate::decoder::Decoder;
use crate::error::Fault;
use crate::exec::Flow;
use crate::hal::allocator::PageAllocator;
use crate::isa::{ControlKind, Decoded};
use crate::memory::{MemoryRegion, RegionKind};
use crate::queue::BoundedQueue;
use crate::request::{Reply, RequestHandler, RequestKind};
use crate::types::{CoreId, MA, MB, MC, REGISTER_COUNT};
use crossbeam::channel::{self, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Condition codes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    pub zero: bool,
    pub negative: bool,
    pub carry: bool,
    pub overflow: bool,
}

impl Flags {
    /// Zero and negative from `value`, carry and overflow as given
    pub fn set(&mut self, value: u64, carry: bool, overflow: bool) {
        self.zero = value == 0;
        self.negative = (value as i64) < 0;
        self.carry = carry;
        self.overflow = overflow;
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreStatus {
    Booting = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl CoreStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CoreStatus::Booting,
            1 => CoreStatus::Running,
            2 => CoreStatus::Stopping,
            _ => CoreStatus::Stopped,
        }
    }
}

/// State of a core visible to the supervisor
pub struct CoreShared {
    pub id: CoreId,
    is_private: bool,
    stop: AtomicBool,
    status: AtomicU8,
    retired: AtomicU64,
    queue: Arc<BoundedQueue<Decoded>>,
    #[cfg(test)]
    executed: parking_lot::Mutex<Vec<crate::isa::Opcode>>,
}

impl CoreShared {
    fn new(id: CoreId, is_private: bool, queue: Arc<BoundedQueue<Decoded>>) -> Self {
        Self {
            id,
            is_private,
            stop: AtomicBool::new(false),
            status: AtomicU8::new(CoreStatus::Booting as u8),
            retired: AtomicU64::new(0),
            queue,
            #[cfg(test)]
            executed: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Ask the core to stop. Wakes it if it is waiting for an instruction.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.queue.close();
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn is_private(&self) -> bool {
        self.is_private
    }

    pub fn status(&self) -> CoreStatus {
        CoreStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: CoreStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Instructions executed so far
    pub fn retired(&self) -> u64 {
        self.retired.load(Ordering::Relaxed)
    }
}

/// Supervisor-side handle to a core thread
pub struct CoreHandle {
    pub shared: Arc<CoreShared>,
    thread: Option<JoinHandle<()>>,
}

impl CoreHandle {
    pub fn id(&self) -> CoreId {
        self.shared.id
    }

    /// Whether the core still counts as running
    pub fn is_live(&self) -> bool {
        !self.shared.should_stop()
    }

    /// Wait for the core thread to exit. Only safe once the core has
    /// stopped or been asked to; a running core may never return.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Core {} thread panicked", self.shared.id);
            }
        }
    }

    /// Stop the core and wait for its threads to exit
    pub fn stop_and_join(&mut self) {
        self.shared.request_stop();
        self.join();
    }
}

/// Everything needed to bring up a core
pub struct CoreParams {
    pub id: CoreId,
    pub start_pc: u64,
    pub is_private: bool,
    pub stack_len: usize,
    pub queue_len: usize,
    pub instructions: Arc<MemoryRegion>,
    pub data: Arc<MemoryRegion>,
    pub requests: Arc<RequestHandler>,
}

/// Allocate a core's resources and start its thread
pub fn spawn(params: CoreParams, allocator: &dyn PageAllocator) -> Result<CoreHandle, Fault> {
    let id = params.id;
    let stack = MemoryRegion::new(allocator, params.stack_len, RegionKind::Stack)?;
    let queue = Arc::new(
        BoundedQueue::new(params.queue_len)
            .map_err(|e| Fault::ThreadSpawn(format!("instruction queue for core {id}: {e}")))?,
    );
    let shared = Arc::new(CoreShared::new(id, params.is_private, Arc::clone(&queue)));

    let (redirect_tx, redirect_rx) = channel::bounded(1);
    let decoder_stop = Arc::new(AtomicBool::new(false));
    let decoder = Decoder::new(
        id,
        params.start_pc,
        Arc::clone(&params.instructions),
        Arc::clone(&queue),
        Arc::clone(&decoder_stop),
        redirect_rx,
    );

    let core = Core {
        id,
        regs: [0; REGISTER_COUNT],
        flags: Flags::default(),
        pc: params.start_pc,
        sp: 0,
        bp: 0,
        stack,
        data: params.data,
        requests: params.requests,
        shared: Arc::clone(&shared),
        queue,
        redirect: Some(redirect_tx),
        decoder_stop,
    };

    let thread = thread::Builder::new()
        .name(format!("rvm-core-{id}"))
        .spawn(move || core.run(decoder))
        .map_err(|e| Fault::ThreadSpawn(e.to_string()))?;

    log::debug!("Core {} spawned at pc {}", id, params.start_pc);
    Ok(CoreHandle {
        shared,
        thread: Some(thread),
    })
}

pub struct Core {
    pub id: CoreId,
    pub regs: [u64; REGISTER_COUNT],
    pub flags: Flags,
    /// Word index of the instruction being executed
    pub pc: u64,
    /// Byte offset of the next free stack slot
    pub sp: u64,
    pub bp: u64,
    stack: MemoryRegion,
    data: Arc<MemoryRegion>,
    requests: Arc<RequestHandler>,
    shared: Arc<CoreShared>,
    queue: Arc<BoundedQueue<Decoded>>,
    redirect: Option<Sender<u64>>,
    decoder_stop: Arc<AtomicBool>,
}

impl Core {
    /// Shared data memory
    pub fn data(&self) -> &MemoryRegion {
        &self.data
    }

    pub fn stack(&self) -> &MemoryRegion {
        &self.stack
    }

    pub fn push(&mut self, value: u64) -> Result<(), Fault> {
        if self.sp + 8 > self.stack.len() as u64 {
            return Err(Fault::StackOverflow { sp: self.sp });
        }
        self.stack.write_u64(self.sp, value)?;
        self.sp += 8;
        Ok(())
    }

    pub fn pop(&mut self) -> Result<u64, Fault> {
        if self.sp < 8 {
            return Err(Fault::StackUnderflow { sp: self.sp });
        }
        self.sp -= 8;
        self.stack.read_u64(self.sp)
    }

    /// Byte offset of the live stack slot `slot` slots away from `bp`
    pub fn frame_slot(&self, slot: i64) -> Result<u64, Fault> {
        let address = (self.bp as i64).checked_add(slot.saturating_mul(8));
        match address {
            Some(a) if a >= 0 && (a as u64) + 8 <= self.sp => Ok(a as u64),
            _ => Err(Fault::OutOfBounds {
                region: RegionKind::Stack,
                address: address.unwrap_or(i64::MAX) as u64,
                width: 8,
            }),
        }
    }

    /// Submit a privileged request and apply the reply's register writes
    pub fn request(&mut self, kind: RequestKind) -> Result<Reply, Fault> {
        let args = [self.regs[MA], self.regs[MB], self.regs[MC]];
        let reply = self.requests.submit(kind, self.id, args)?;
        if let Some(v) = reply.ma {
            self.regs[MA] = v;
        }
        if let Some(v) = reply.mb {
            self.regs[MB] = v;
        }
        if let Some(v) = reply.mc {
            self.regs[MC] = v;
        }
        Ok(reply)
    }

    fn run(mut self, decoder: Decoder) {
        let id = self.id;
        let decoder_thread = match thread::Builder::new()
            .name(format!("rvm-decoder-{id}"))
            .spawn(move || decoder.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("Decoder thread for core {} failed: {}", id, e);
                self.requests.raise(Fault::DecoderNotStarting(id), Some(id));
                self.shared.stop.store(true, Ordering::Release);
                self.shared.set_status(CoreStatus::Stopped);
                return;
            }
        };

        self.shared.set_status(CoreStatus::Running);
        log::debug!("Core {} entering FDE loop at pc {}", id, self.pc);
        self.execute();

        log::debug!("Core {} stopping", id);
        self.shared.set_status(CoreStatus::Stopping);
        self.shared.stop.store(true, Ordering::Release);
        self.decoder_stop.store(true, Ordering::Release);
        self.queue.close();
        self.redirect = None;
        if decoder_thread.join().is_err() {
            log::error!("Decoder of core {} panicked", id);
        }
        self.shared.set_status(CoreStatus::Stopped);
        log::debug!("Core {} stopped after {} instructions", id, self.shared.retired());
    }

    fn execute(&mut self) {
        while !self.shared.should_stop() {
            let inst = match self.queue.pop() {
                Some(Decoded::Ready(inst)) => inst,
                Some(Decoded::Trap { pc, fault }) => {
                    self.pc = pc;
                    self.requests.raise(fault, Some(self.id));
                    return;
                }
                None => return,
            };

            self.pc = inst.address;
            log::trace!("Core {} pc {}: {}", self.id, inst.address, inst.opcode);
            let flow = (inst.handler)(self, &inst);
            self.shared.retired.fetch_add(1, Ordering::Relaxed);
            #[cfg(test)]
            self.shared.executed.lock().push(inst.opcode);

            let next = match flow {
                Ok(Flow::Next) => inst.next,
                Ok(Flow::Jump(target)) => target,
                Ok(Flow::Stop) => return,
                Err(fault) => {
                    let torn_down = self.shared.should_stop()
                        || (fault == Fault::SupervisorUnavailable && self.requests.is_shut_down());
                    if torn_down {
                        // Supervisor went away while this core waited on it.
                        log::debug!("Core {} interrupted: {}", self.id, fault);
                    } else {
                        self.requests.raise(fault, Some(self.id));
                    }
                    return;
                }
            };

            self.pc = next;
            if inst.opcode.control() == ControlKind::Resolved {
                let sent = self.redirect.as_ref().map(|tx| tx.send(next).is_ok());
                if sent != Some(true) {
                    log::debug!("Core {} lost its decoder", self.id);
                    return;
                }
            }
        }
    }
}
