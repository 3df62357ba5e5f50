//! Driver configuration

use bitflags::bitflags;

/// Environment variable holding comma-separated debug flag names
pub const DEBUG_ENV: &str = "AMDGPU_QUEUE_DEBUG";

/// Default kernel limit on indirect buffers per submission
pub const DEFAULT_MAX_IBS_PER_SUBMIT: usize = 192;

bitflags! {
    /// Debug behaviour switches
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DebugFlags: u32 {
        /// Submit one command buffer at a time and poll for faults after each
        const HANG = 1 << 0;
        /// Never chain command streams
        const NO_CHAINING = 1 << 1;
        /// Shadow graphics registers on GFX11+
        const SHADOW_REGS = 1 << 2;
        /// Emit the graphics init state inline in every preamble
        const NO_INIT_STATE_CACHE = 1 << 3;
    }
}

impl DebugFlags {
    /// Parse a comma-separated list such as `"hang,nochain"`
    pub fn parse(s: &str) -> Self {
        let mut flags = DebugFlags::empty();
        for name in s.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            match name.to_ascii_lowercase().as_str() {
                "hang" => flags |= DebugFlags::HANG,
                "nochain" | "no_chaining" => flags |= DebugFlags::NO_CHAINING,
                "shadowregs" | "shadow_regs" => flags |= DebugFlags::SHADOW_REGS,
                "noinitcache" | "no_init_state_cache" => flags |= DebugFlags::NO_INIT_STATE_CACHE,
                other => log::warn!("Ignoring unknown debug flag '{}'", other),
            }
        }
        flags
    }
}

/// Device configuration
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub debug: DebugFlags,
    /// Maximum indirect buffers the kernel accepts in one submission
    pub max_ibs_per_submit: usize,
    /// Build the graphics init state once and call it from preambles
    pub cache_init_state: bool,
    /// Shadow graphics registers in memory (GFX11+ graphics queues)
    pub shadow_regs: bool,
    /// Shaders are uploaded asynchronously and signal a timeline
    pub async_shader_upload: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            debug: DebugFlags::empty(),
            max_ibs_per_submit: DEFAULT_MAX_IBS_PER_SUBMIT,
            cache_init_state: true,
            shadow_regs: false,
            async_shader_upload: false,
        }
    }
}

impl DeviceConfig {
    /// Default configuration adjusted by `AMDGPU_QUEUE_DEBUG`
    pub fn from_env() -> Self {
        let debug = std::env::var(DEBUG_ENV)
            .map(|s| DebugFlags::parse(&s))
            .unwrap_or_default();
        Self::default().with_debug(debug)
    }

    /// Apply debug flags, folding the ones that imply other settings
    pub fn with_debug(mut self, debug: DebugFlags) -> Self {
        self.debug |= debug;
        if debug.contains(DebugFlags::SHADOW_REGS) {
            self.shadow_regs = true;
        }
        if debug.contains(DebugFlags::NO_INIT_STATE_CACHE) {
            self.cache_init_state = false;
        }
        self
    }

    pub fn fault_detection(&self) -> bool {
        self.debug.contains(DebugFlags::HANG)
    }

    pub fn chaining(&self) -> bool {
        !self.debug.contains(DebugFlags::NO_CHAINING)
    }
}
