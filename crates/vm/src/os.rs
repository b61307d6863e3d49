/// Supervisor - "The OS Layer"
///
/// Owns the cores, shared memory, the request bus and every host resource
/// guest programs can reach. Runs on the thread that calls `run` and
/// services one request at a time.

use crate::cpu::{self, CoreHandle, CoreParams};
use crate::error::{Fault, FaultRecord};
use crate::hal::files::{FileMode, FileTable};
use crate::hal::loader::ParamBlock;
use crate::hal::HostServices;
use crate::image::ProgramImage;
use crate::memory::{MemoryRegion, RegionKind};
use crate::request::{OsRequest, Reply, RequestHandler, RequestKind};
use crate::types::{CoreId, VmConfig, VmMetrics, DYNCALL_FAILED, NEW_CORE_FAILED};
use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;

/// How the VM ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmExit {
    /// `Ma` of the core whose halt stopped the VM
    pub return_value: u64,
    /// Cause of a VM-fatal stop
    pub fatal: Option<FaultRecord>,
}

impl VmExit {
    pub fn is_clean(&self) -> bool {
        self.fatal.is_none()
    }
}

pub struct Supervisor {
    config: VmConfig,
    host: HostServices,
    instructions: Arc<MemoryRegion>,
    data: Arc<MemoryRegion>,
    requests: Arc<RequestHandler>,
    cores: Mutex<Vec<CoreHandle>>,
    next_id: CoreId,
    /// Instructions retired by cores already reclaimed
    reaped_retired: u64,
    stop: bool,
    return_value: u64,
    files: FileTable,
    serviced: u64,
}

impl Supervisor {
    /// Map the image into fresh instruction and data memory
    pub fn new(config: VmConfig, host: HostServices, image: &ProgramImage) -> Result<Self> {
        log::info!(
            "Loading image: {} instruction words, {} data bytes",
            image.instructions.len(),
            image.data.len()
        );

        let instructions = MemoryRegion::with_words(host.allocator.as_ref(), &image.instructions)?;
        let data_len = image.data.len().max(config.min_data_len);
        let data = MemoryRegion::new(host.allocator.as_ref(), data_len, RegionKind::Data)?;
        data.write_bytes(0, &image.data)?;

        let requests = RequestHandler::new(config.request_queue_len)?;

        Ok(Self {
            config,
            host,
            instructions: Arc::new(instructions),
            data: Arc::new(data),
            requests: Arc::new(requests),
            cores: Mutex::new(Vec::new()),
            next_id: 0,
            reaped_retired: 0,
            stop: false,
            return_value: 0,
            files: FileTable::new(),
            serviced: 0,
        })
    }

    pub fn requests(&self) -> &Arc<RequestHandler> {
        &self.requests
    }

    pub fn data(&self) -> &Arc<MemoryRegion> {
        &self.data
    }

    fn spawn_core(&mut self, start_pc: u64, is_private: bool) -> Result<CoreId, Fault> {
        let id = self.next_id;
        let params = CoreParams {
            id,
            start_pc,
            is_private,
            stack_len: self.config.stack_len,
            queue_len: self.config.inst_queue_len,
            instructions: Arc::clone(&self.instructions),
            data: Arc::clone(&self.data),
            requests: Arc::clone(&self.requests),
        };

        let handle = cpu::spawn(params, self.host.allocator.as_ref())?;
        self.next_id += 1;
        self.cores.lock().push(handle);
        Ok(id)
    }

    /// Start core 0 at `entry`. Any failure here is VM-fatal.
    pub fn boot(&mut self, entry: u64) -> Result<CoreId, Fault> {
        log::info!("Booting core 0 at pc {}", entry);
        match self.spawn_core(entry, self.config.private_boot_core) {
            Ok(id) => Ok(id),
            Err(fault) => {
                log::error!("Boot failed: {}", fault);
                self.requests.escalate(FaultRecord {
                    core: None,
                    fault: fault.clone(),
                });
                Err(fault)
            }
        }
    }

    /// Service requests until the VM halts or a fault stops it, then tear
    /// everything down
    pub fn run(&mut self) -> VmExit {
        log::info!("Supervisor entering dispatch loop");
        while !self.stop {
            match self.requests.take_next() {
                Some(request) => self.service(request),
                None => break,
            }
        }

        self.teardown();
        let exit = VmExit {
            return_value: self.return_value,
            fatal: self.requests.fatal(),
        };
        match &exit.fatal {
            Some(record) => log::error!("VM stopped by fault: {}", record.fault),
            None => log::info!("VM halted with return value {}", exit.return_value),
        }
        exit
    }

    fn service(&mut self, request: OsRequest) {
        let OsRequest {
            kind,
            core,
            args,
            ticket,
        } = request;
        log::debug!("Servicing {:?} for core {} (args {:?})", kind, core, args);
        self.reap();

        let result = match kind {
            RequestKind::Halt => Ok(self.halt(core, args[0])),
            RequestKind::NewCore => Ok(self.new_core(core, args[0])),
            RequestKind::DynLoad => self.dyn_load(args),
            RequestKind::DynUnload => Ok(self.dyn_unload(args)),
            RequestKind::DynCall => self.dyn_call(args),
            RequestKind::FileOpen => self.file_open(args),
            RequestKind::FileClose => self.files.close(args[1]).map(|_| Reply::none()),
            RequestKind::FileRead => self.file_read(args),
            RequestKind::FileWrite => self.file_write(args),
            RequestKind::FileEof => self
                .files
                .eof(args[1])
                .map(|eof| Reply::none().ma(eof as u64)),
            RequestKind::CoreFault(fault) => {
                self.retire(core, fault);
                return;
            }
        };
        self.serviced += 1;

        if let Err(fault) = &result {
            log::debug!("Request from core {} refused: {}", core, fault);
        }
        if let Some(ticket) = ticket {
            ticket.complete(result);
        }
    }

    /// Join and drop every core that has stopped, releasing its stack.
    /// A stopped core never waits on the supervisor, so the join returns.
    fn reap(&mut self) {
        let mut cores = self.cores.lock();
        let before = cores.len();
        let mut retired = 0;
        cores.retain_mut(|core| {
            if core.is_live() {
                return true;
            }
            core.join();
            retired += core.shared.retired();
            false
        });
        self.reaped_retired += retired;
        if cores.len() < before {
            log::debug!("Reclaimed {} stopped core(s)", before - cores.len());
        }
    }

    fn live_cores(cores: &[CoreHandle]) -> usize {
        cores.iter().filter(|c| c.is_live()).count()
    }

    fn halt(&mut self, core: CoreId, ma: u64) -> Reply {
        let cores = self.cores.lock();
        if Self::live_cores(&cores) <= 1 {
            log::info!("Core {} halted the VM", core);
            self.stop = true;
            self.return_value = ma;
        } else {
            log::debug!("Core {} halted", core);
        }
        if let Some(handle) = cores.iter().find(|c| c.id() == core) {
            handle.shared.request_stop();
        }
        Reply::none()
    }

    fn new_core(&mut self, requester: CoreId, start_pc: u64) -> Reply {
        let deny = |reason: &str| {
            log::warn!("New core for core {} denied: {}", requester, reason);
            Reply::none().ma(NEW_CORE_FAILED)
        };

        let (private, live) = {
            let cores = self.cores.lock();
            let private = cores
                .iter()
                .find(|c| c.id() == requester)
                .map_or(false, |c| c.shared.is_private());
            (private, Self::live_cores(&cores))
        };
        if private {
            return deny("requester is private");
        }
        if live >= self.config.max_cores {
            return deny("core limit reached");
        }

        match self.spawn_core(start_pc, false) {
            Ok(id) => {
                log::debug!("Core {} started core {} at pc {}", requester, id, start_pc);
                Reply::none().ma(id)
            }
            Err(fault) => deny(&fault.to_string()),
        }
    }

    fn retire(&mut self, core: CoreId, fault: Fault) {
        let cores = self.cores.lock();
        if let Some(handle) = cores.iter().find(|c| c.id() == core) {
            handle.shared.request_stop();
        }
        log::warn!("Core {} retired after fault: {}", core, fault);

        if Self::live_cores(&cores) == 0 {
            // Nobody left to halt the VM.
            self.requests.escalate(FaultRecord {
                core: Some(core),
                fault,
            });
        }
    }

    fn dyn_load(&mut self, args: [u64; 3]) -> Result<Reply, Fault> {
        let name = self.data.read_cstr(args[0])?;
        let handle = self
            .host
            .loader
            .load(&name)
            .ok_or(Fault::DynamicLoadFailed(name))?;
        Ok(Reply::none().mb(handle))
    }

    fn dyn_unload(&mut self, args: [u64; 3]) -> Reply {
        if !self.host.loader.unload(args[1]) {
            log::debug!("dynul of unknown handle {}", args[1]);
        }
        Reply::none()
    }

    fn dyn_call(&mut self, args: [u64; 3]) -> Result<Reply, Fault> {
        let [ma, mb, mc] = args;
        let symbol = self.data.read_cstr(ma)?;
        self.data.check(mc, 8)?;

        match self.host.loader.resolve(mb, &symbol) {
            Some(function) => {
                let value = function(&ParamBlock::new(&self.data, mc))?;
                Ok(Reply::none().ma(value).mc(0))
            }
            None => {
                log::warn!("dyncall: {:?} not found in handle {}", symbol, mb);
                Ok(Reply::none().ma(DYNCALL_FAILED).mc(1))
            }
        }
    }

    fn file_open(&mut self, args: [u64; 3]) -> Result<Reply, Fault> {
        let path = self.data.read_cstr(args[0])?;
        let reply = match self.files.open(&path, FileMode::from_bits(args[1])) {
            Some(handle) => Reply::none().ma(0).mb(handle),
            None => Reply::none().ma(1).mb(0),
        };
        Ok(reply)
    }

    fn file_read(&mut self, args: [u64; 3]) -> Result<Reply, Fault> {
        let [address, handle, count] = args;
        self.files.validate(handle)?;
        self.data.check(address, count)?;

        let mut buf = vec![0u8; count as usize];
        let n = self.files.read(handle, &mut buf)?;
        self.data.write_bytes(address, &buf[..n])?;
        Ok(Reply::none().ma(n as u64))
    }

    fn file_write(&mut self, args: [u64; 3]) -> Result<Reply, Fault> {
        let [address, handle, count] = args;
        self.files.validate(handle)?;
        self.data.check(address, count)?;
        let bytes = self.data.read_bytes(address, count as usize)?;
        let n = self.files.write(handle, &bytes)?;
        Ok(Reply::none().ma(n as u64))
    }

    fn teardown(&mut self) {
        let mut cores = self.cores.lock();
        log::info!("Stopping {} core(s)", cores.len());
        for core in cores.iter() {
            core.shared.request_stop();
        }
        // Wakes cores blocked on a request.
        self.requests.shutdown();
        for core in cores.iter_mut() {
            core.stop_and_join();
            self.reaped_retired += core.shared.retired();
        }
        cores.clear();
        drop(cores);
        self.files.close_all();
    }

    pub fn metrics(&self) -> VmMetrics {
        let cores = self.cores.lock();
        VmMetrics {
            cores_running: Self::live_cores(&cores),
            cores_resident: cores.len(),
            cores_total: self.next_id as usize,
            instructions_retired: self.reaped_retired
                + cores.iter().map(|c| c.shared.retired()).sum::<u64>(),
            requests_serviced: self.serviced,
            bounds_violations: self.data.violations(),
            memory_in_use: self.host.allocator.in_use(),
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // No-op after `run`; joins threads if `run` was never called.
        if self.cores.lock().iter().any(|c| c.is_live()) {
            self.teardown();
        }
    }
}
