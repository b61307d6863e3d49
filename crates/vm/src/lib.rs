/// RayOS VM Library
///
/// A multi-core register VM: every core runs a decoder thread and an
/// execution thread over shared instruction and data memory, and reaches a
/// single supervisor for privileged work (halt, new cores, dynamic
/// libraries, files).

pub mod cpu;
pub mod decoder;
pub mod error;
pub mod exec;
pub mod hal;
pub mod image;
pub mod isa;
pub mod memory;
pub mod os;
pub mod queue;
pub mod request;
pub mod types;

pub use error::{Fault, FaultRecord, Severity};
pub use image::ProgramImage;
pub use isa::{Opcode, ProgramBuilder};
pub use os::VmExit;
pub use types::{VmConfig, VmMetrics};

use anyhow::Result;
use hal::allocator::PageAllocator;
use hal::loader::LibraryLoader;
use hal::HostServices;
use os::Supervisor;
use std::sync::Arc;

/// The RayOS VM - "The Machine"
pub struct RayVm {
    supervisor: Supervisor,
    entry: u64,
    config: VmConfig,
}

impl RayVm {
    /// Map `image` and prepare the supervisor. Cores start in `run`.
    pub fn initialize(config: VmConfig, host: HostServices, image: &ProgramImage) -> Result<Self> {
        log::info!("=== Initializing RayOS VM ===");
        config.validate()?;

        let supervisor = Supervisor::new(config.clone(), host, image)?;
        log::info!("✓ Memory mapped ({} bytes in use)", supervisor.metrics().memory_in_use);

        log::info!("=== RayOS VM Ready ===");
        Ok(Self {
            supervisor,
            entry: image.entry,
            config,
        })
    }

    /// Boot core 0 and service requests on the calling thread until the
    /// VM halts or faults
    pub fn run(&mut self) -> VmExit {
        log::info!("Starting RayOS VM at pc {}", self.entry);
        // A failed boot is recorded as the fatal cause and reported by `run`.
        let _ = self.supervisor.boot(self.entry);
        self.supervisor.run()
    }

    pub fn metrics(&self) -> VmMetrics {
        self.supervisor.metrics()
    }

    /// Every fault raised so far, fatal or not
    pub fn faults(&self) -> Vec<FaultRecord> {
        self.supervisor.requests().faults()
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Shared data memory, for inspecting results after `run`
    pub fn data(&self) -> &memory::MemoryRegion {
        self.supervisor.data()
    }
}

/// Builder for RayVm with custom configuration
pub struct RayVmBuilder {
    config: VmConfig,
    image: ProgramImage,
    allocator: Option<Arc<dyn PageAllocator>>,
    loader: Option<Arc<dyn LibraryLoader>>,
}

impl RayVmBuilder {
    pub fn new() -> Self {
        Self {
            config: VmConfig::default(),
            image: ProgramImage::default(),
            allocator: None,
            loader: None,
        }
    }

    pub fn with_config(mut self, config: VmConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_image(mut self, image: ProgramImage) -> Self {
        self.image = image;
        self
    }

    /// Instructions only, entry at word 0
    pub fn with_program(mut self, words: Vec<u64>) -> Self {
        self.image = ProgramImage::new(words, self.image.data);
        self
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.image.data = data;
        self
    }

    pub fn with_max_cores(mut self, cores: usize) -> Self {
        self.config.max_cores = cores;
        self
    }

    pub fn with_stack_len(mut self, bytes: usize) -> Self {
        self.config.stack_len = bytes;
        self
    }

    pub fn with_memory_budget(mut self, bytes: usize) -> Self {
        self.config.memory_budget = Some(bytes);
        self
    }

    pub fn with_private_boot_core(mut self, private: bool) -> Self {
        self.config.private_boot_core = private;
        self
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn PageAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn LibraryLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn build(self) -> Result<RayVm> {
        let defaults = HostServices::host(self.config.memory_budget);
        let host = HostServices::new(
            self.allocator.unwrap_or(defaults.allocator),
            self.loader.unwrap_or(defaults.loader),
        );
        RayVm::initialize(self.config, host, &self.image)
    }
}

impl Default for RayVmBuilder {
    fn default() -> Self {
        Self::new()
    }
}
