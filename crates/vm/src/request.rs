/// Request Handler - "The Bus"
///
/// Multi-producer / single-consumer channel between cores and the
/// supervisor. A core submits a request carrying a snapshot of its
/// `Ma/Mb/Mc` registers plus a one-shot ticket, then blocks on the ticket.
/// The supervisor completes every ticket exactly once. Faults raised by
/// running threads travel over the same queue.

use crate::error::{Fault, FaultRecord, Severity};
use crate::queue::BoundedQueue;
use crate::types::CoreId;
use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;

/// Privileged operation requested by a core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Halt,
    NewCore,
    DynLoad,
    DynUnload,
    DynCall,
    FileOpen,
    FileClose,
    FileRead,
    FileWrite,
    FileEof,
    /// Internal: the core stopped on a core-fatal fault
    CoreFault(Fault),
}

/// Register writes the requester applies before resuming
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reply {
    pub ma: Option<u64>,
    pub mb: Option<u64>,
    pub mc: Option<u64>,
}

impl Reply {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn ma(mut self, value: u64) -> Self {
        self.ma = Some(value);
        self
    }

    pub fn mb(mut self, value: u64) -> Self {
        self.mb = Some(value);
        self
    }

    pub fn mc(mut self, value: u64) -> Self {
        self.mc = Some(value);
        self
    }
}

/// One-shot completion handle. Dropping it unanswered wakes the requester
/// with `SupervisorUnavailable`.
#[derive(Debug)]
pub struct Ticket(Sender<Result<Reply, Fault>>);

impl Ticket {
    pub fn complete(self, result: Result<Reply, Fault>) {
        // The requester may already be gone (teardown); nothing to wake then.
        let _ = self.0.send(result);
    }
}

#[derive(Debug)]
pub struct OsRequest {
    pub kind: RequestKind,
    pub core: CoreId,
    /// `Ma`, `Mb`, `Mc` as seen by the requester at submission
    pub args: [u64; 3],
    pub ticket: Option<Ticket>,
}

impl OsRequest {
    pub fn ma(&self) -> u64 {
        self.args[0]
    }

    pub fn mb(&self) -> u64 {
        self.args[1]
    }

    pub fn mc(&self) -> u64 {
        self.args[2]
    }
}

pub struct RequestHandler {
    queue: BoundedQueue<OsRequest>,
    faults: Mutex<Vec<FaultRecord>>,
    fatal: Mutex<Option<FaultRecord>>,
}

impl RequestHandler {
    pub fn new(capacity: usize) -> Result<Self, crate::error::QueueError> {
        Ok(Self {
            queue: BoundedQueue::new(capacity)?,
            faults: Mutex::new(Vec::new()),
            fatal: Mutex::new(None),
        })
    }

    /// Enqueue a request and block until the supervisor replies
    pub fn submit(
        &self,
        kind: RequestKind,
        core: CoreId,
        args: [u64; 3],
    ) -> Result<Reply, Fault> {
        let (tx, rx) = channel::bounded(1);
        log::debug!("Core {} submitting {:?}", core, kind);

        self.queue
            .push(OsRequest {
                kind,
                core,
                args,
                ticket: Some(Ticket(tx)),
            })
            .map_err(|_| Fault::SupervisorUnavailable)?;

        rx.recv().map_err(|_| Fault::SupervisorUnavailable)?
    }

    /// Next request in FIFO order. `None` after shutdown.
    pub fn take_next(&self) -> Option<OsRequest> {
        self.queue.pop()
    }

    /// Record and escalate a fault raised by a running thread
    pub fn raise(&self, fault: Fault, origin: Option<CoreId>) {
        match origin {
            Some(core) => log::error!("Core {} fault: {}", core, fault),
            None => log::error!("VM fault: {}", fault),
        }

        let record = FaultRecord {
            core: origin,
            fault: fault.clone(),
        };
        self.faults.lock().push(record.clone());

        match (fault.severity(), origin) {
            (Severity::CoreFatal, Some(core)) => {
                let notice = OsRequest {
                    kind: RequestKind::CoreFault(fault),
                    core,
                    args: [0; 3],
                    ticket: None,
                };
                if self.queue.push(notice).is_err() {
                    log::debug!("Request queue closed; fault of core {} not forwarded", core);
                }
            }
            _ => self.escalate(record),
        }
    }

    /// Make `record` the VM's fatal cause and stop servicing requests
    pub fn escalate(&self, record: FaultRecord) {
        {
            let mut fatal = self.fatal.lock();
            if fatal.is_none() {
                *fatal = Some(record);
            }
        }
        self.queue.close();
    }

    pub fn shutdown(&self) {
        self.queue.close();
    }

    pub fn is_shut_down(&self) -> bool {
        self.queue.is_closed()
    }

    pub fn faults(&self) -> Vec<FaultRecord> {
        self.faults.lock().clone()
    }

    pub fn fatal(&self) -> Option<FaultRecord> {
        self.fatal.lock().clone()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}
