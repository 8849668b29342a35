/// Construction-time configuration for the graphics device and its subsystems

// ===== DEBUG / VALIDATION =====

/// Which validation messages are reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebugSeverity {
    ErrorsOnly,
    #[default]
    ErrorsAndWarnings,
    All,
}

/// Where validation messages are written
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DebugOutput {
    #[default]
    Console,
    /// Append to the file at this path
    File(String),
    /// Console and file
    Both(String),
}

/// Validation message categories to report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugMessageFilter {
    pub show_validation: bool,
    pub show_performance: bool,
    pub show_general: bool,
}

impl Default for DebugMessageFilter {
    fn default() -> Self {
        Self { show_validation: true, show_performance: true, show_general: false }
    }
}

/// Validation message counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValidationStats {
    pub errors: u32,
    pub warnings: u32,
    pub info: u32,
    pub verbose: u32,
}

impl ValidationStats {
    pub fn total(&self) -> u32 {
        self.errors + self.warnings + self.info + self.verbose
    }

    pub fn has_errors(&self) -> bool {
        self.errors > 0
    }
}

// ===== MEMORY MANAGER =====

/// Free-block selection policy of the memory manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationStrategy {
    /// First block (by offset) that fits
    Linear,
    /// Smallest block that fits, lowest offset on ties
    #[default]
    FreeList,
    /// Power-of-two blocks split by halving
    Buddy,
    /// Best fit among blocks at most twice the request, else Linear
    Hybrid,
}

/// Memory manager configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryManagerConfig {
    /// Size of each pool created on demand
    pub default_pool_size: u64,
    /// No single pool may exceed this size
    pub max_pool_size: u64,
    pub strategy: AllocationStrategy,
    /// Smaller requests are rounded up to this
    pub min_allocation_size: u64,
    /// Power of two; every allocation size and offset is a multiple of it
    pub alignment: u64,
    /// Warn about live allocations at shutdown
    pub enable_leak_detection: bool,
    /// Keep per-allocation debug names and peak usage
    pub enable_memory_tracking: bool,
}

impl Default for MemoryManagerConfig {
    fn default() -> Self {
        Self {
            default_pool_size: 64 * 1024 * 1024,
            max_pool_size: 512 * 1024 * 1024,
            strategy: AllocationStrategy::FreeList,
            min_allocation_size: 256,
            alignment: 256,
            enable_leak_detection: cfg!(debug_assertions),
            enable_memory_tracking: true,
        }
    }
}

// ===== SYNC =====

/// Synchronization layer configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub enable_timeline_semaphores: bool,
    /// Cap on live semaphores
    pub max_semaphores: u32,
    /// Cap on live fences
    pub max_fences: u32,
    /// Timeout used by waits that take none, in nanoseconds
    pub default_timeout_ns: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enable_timeline_semaphores: true,
            max_semaphores: 1024,
            max_fences: 256,
            default_timeout_ns: u64::MAX,
        }
    }
}

// ===== DEVICE =====

/// Graphics device configuration
#[derive(Debug, Clone, PartialEq)]
pub struct GraphicsDeviceConfig {
    /// Number of frames the CPU may record ahead of the GPU
    pub max_frames_in_flight: usize,
    pub enable_validation_layers: bool,
    /// (major, minor) of the requested API version
    pub api_version: (u32, u32),
    pub app_name: String,
    pub debug_severity: DebugSeverity,
    pub debug_output: DebugOutput,
    pub debug_message_filter: DebugMessageFilter,
    /// Abort the process on the first validation error
    pub break_on_error: bool,
    /// Panic on the first validation error
    pub panic_on_error: bool,
    pub enable_validation_stats: bool,
    pub memory: MemoryManagerConfig,
    pub sync: SyncConfig,
}

impl Default for GraphicsDeviceConfig {
    fn default() -> Self {
        Self {
            max_frames_in_flight: 2,
            enable_validation_layers: cfg!(debug_assertions),
            api_version: (1, 3),
            app_name: "Ember Application".to_string(),
            debug_severity: DebugSeverity::default(),
            debug_output: DebugOutput::default(),
            debug_message_filter: DebugMessageFilter::default(),
            break_on_error: false,
            panic_on_error: false,
            enable_validation_stats: cfg!(debug_assertions),
            memory: MemoryManagerConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
