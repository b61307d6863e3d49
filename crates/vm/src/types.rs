/// Core types for the RayOS VM
///
/// Register numbering, sentinel values written back by denied requests,
/// the runtime configuration and the metrics snapshot.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Unique core identifier. Strictly increasing, never reused.
pub type CoreId = u64;

/// Number of 64-bit registers per core
pub const REGISTER_COUNT: usize = 16;

/// First request register (argument / result slot)
pub const MA: usize = 13;
pub const MB: usize = 14;
pub const MC: usize = 15;

/// Written to `Ma` when a new-core request is denied
pub const NEW_CORE_FAILED: u64 = u64::MAX;

/// Written to `Ma` when a dynamic call cannot resolve its symbol
pub const DYNCALL_FAILED: u64 = u64::MAX;

/// Host page size used to round every region
pub const PAGE_SIZE: usize = 4096;

/// Configuration for the VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Decoded instructions buffered between a decoder and its core
    pub inst_queue_len: usize,
    /// Pending privileged requests before submitters block
    pub request_queue_len: usize,
    /// Per-core stack size in bytes
    pub stack_len: usize,
    /// Data memory is at least this large even for small images
    pub min_data_len: usize,
    /// Upper bound on simultaneously running cores (including core 0)
    pub max_cores: usize,
    /// Total bytes the page allocator may hand out. `None` = unlimited
    pub memory_budget: Option<usize>,
    /// Boot core 0 as private (it may not request new cores)
    pub private_boot_core: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            inst_queue_len: 64,
            request_queue_len: 128,
            stack_len: 1024 * 1024, // 1 MiB
            min_data_len: PAGE_SIZE,
            max_cores: 64,
            memory_budget: None,
            private_boot_core: false,
        }
    }
}

impl VmConfig {
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let config: VmConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML config file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", path.display()))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.inst_queue_len == 0 {
            anyhow::bail!("inst_queue_len must be non-zero");
        }
        if self.request_queue_len == 0 {
            anyhow::bail!("request_queue_len must be non-zero");
        }
        if self.stack_len < 8 {
            anyhow::bail!("stack_len must hold at least one slot");
        }
        if self.max_cores == 0 {
            anyhow::bail!("max_cores must allow the boot core");
        }
        Ok(())
    }
}

/// Snapshot of runtime counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmMetrics {
    /// Cores currently executing
    pub cores_running: usize,
    /// Core threads the supervisor still holds, running or not yet reclaimed
    pub cores_resident: usize,
    /// Cores ever created
    pub cores_total: usize,
    /// Instructions retired across all cores
    pub instructions_retired: u64,
    /// Requests the supervisor completed
    pub requests_serviced: u64,
    /// Rejected data-memory accesses
    pub bounds_violations: u64,
    /// Bytes currently mapped by the page allocator
    pub memory_in_use: usize,
}
