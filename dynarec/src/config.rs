//! Configuring and building a [Jit].

use crate::{
    compile::ops::OpsBackend,
    dispatch::Core,
    guest::Guest,
    Jit, JitError,
};
use std::env;
use strum::{Display, EnumString};

/// The default maximum number of guest instructions in one block.
pub const DEFAULT_MAX_BLOCK_INSTS: usize = 64;
/// The default number of block slots.
pub const DEFAULT_MAX_BLOCKS: usize = 16384;
/// The default size, in bytes, of the region holding translated blocks.
pub const DEFAULT_CODE_SIZE: usize = 32 * 1024 * 1024;
/// The default size, in bytes, of the region holding shared routines and backpatch trampolines.
pub const DEFAULT_FAR_CODE_SIZE: usize = 8 * 1024 * 1024;
/// The default number of guest cycles in a timeslice.
pub const DEFAULT_TIMESLICE: i32 = 20_000;
/// If invalidating a range would evict more than this many blocks, flush the whole cache instead.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 512;

/// Which code generator a [Jit] uses.
#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq)]
pub enum BackendKind {
    /// A portable backend which translates blocks into a stream of pre-decoded operations.
    #[strum(serialize = "ops")]
    Ops,
    /// Native x86-64 code with fault-based fast memory accesses.
    #[strum(serialize = "x64")]
    X64,
}

impl BackendKind {
    /// The best backend for this platform.
    pub fn native() -> Self {
        if cfg!(all(target_arch = "x86_64", target_os = "linux")) {
            BackendKind::X64
        } else {
            BackendKind::Ops
        }
    }
}

/// Resolved configuration shared by the components of one [Jit].
#[derive(Clone, Debug)]
pub(crate) struct Config {
    pub(crate) backend: BackendKind,
    pub(crate) max_block_insts: usize,
    pub(crate) max_blocks: usize,
    pub(crate) code_size: usize,
    pub(crate) far_code_size: usize,
    pub(crate) timeslice: i32,
    pub(crate) block_linking: bool,
    pub(crate) profiling: bool,
    pub(crate) flush_threshold: usize,
    pub(crate) fast_map_bits: u32,
    pub(crate) max_skip_insts: usize,
}

/// Configure a [Jit]. Every parameter has a default, so `JitBuilder::new().build(guest)` is a
/// reasonable way to get started.
///
/// The backend can be overridden at run-time with the `DYNAREC_BACKEND` environment variable,
/// which takes the values `ops` or `x64`.
pub struct JitBuilder {
    cfg: Config,
}

impl JitBuilder {
    /// Create a builder with default parameters.
    pub fn new() -> Self {
        Self {
            cfg: Config {
                backend: BackendKind::native(),
                max_block_insts: DEFAULT_MAX_BLOCK_INSTS,
                max_blocks: DEFAULT_MAX_BLOCKS,
                code_size: DEFAULT_CODE_SIZE,
                far_code_size: DEFAULT_FAR_CODE_SIZE,
                timeslice: DEFAULT_TIMESLICE,
                block_linking: true,
                profiling: false,
                flush_threshold: DEFAULT_FLUSH_THRESHOLD,
                fast_map_bits: 16,
                max_skip_insts: 4,
            },
        }
    }

    /// Select the code generator.
    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.cfg.backend = backend;
        self
    }

    /// The maximum number of guest instructions translated into one block.
    pub fn max_block_insts(mut self, n: usize) -> Self {
        self.cfg.max_block_insts = n;
        self
    }

    /// The number of blocks the cache can hold before it must be flushed.
    pub fn max_blocks(mut self, n: usize) -> Self {
        self.cfg.max_blocks = n;
        self
    }

    /// The size of the code buffer. For the x64 backend this is in bytes; for the ops backend it
    /// is a number of operations.
    pub fn code_size(mut self, n: usize) -> Self {
        self.cfg.code_size = n;
        self
    }

    /// The size, in bytes, of the region holding shared routines and backpatch trampolines.
    pub fn far_code_size(mut self, n: usize) -> Self {
        self.cfg.far_code_size = n;
        self
    }

    /// The number of guest cycles between calls to [Guest::advance_time].
    pub fn timeslice(mut self, cycles: i32) -> Self {
        self.cfg.timeslice = cycles;
        self
    }

    /// Should blocks be chained directly to one another?
    pub fn block_linking(mut self, yes: bool) -> Self {
        self.cfg.block_linking = yes;
        self
    }

    /// Should blocks count how many times they are entered?
    pub fn profiling(mut self, yes: bool) -> Self {
        self.cfg.profiling = yes;
        self
    }

    /// If invalidating a range would evict more than `n` blocks, flush the whole cache instead.
    pub fn flush_threshold(mut self, n: usize) -> Self {
        self.cfg.flush_threshold = n;
        self
    }

    /// The direct-mapped lookup table has `1 << bits` entries.
    pub fn fast_map_bits(mut self, bits: u32) -> Self {
        self.cfg.fast_map_bits = bits;
        self
    }

    /// A conditional branch skipping forward over at most `n` straight-line instructions is
    /// translated inline rather than ending the block. 0 disables this.
    pub fn max_skip_insts(mut self, n: usize) -> Self {
        self.cfg.max_skip_insts = n;
        self
    }

    /// The configuration this builder would produce, ignoring the environment.
    #[cfg(test)]
    pub(crate) fn config(self) -> Config {
        self.cfg
    }

    fn validate(mut self) -> Result<Config, JitError> {
        if let Ok(x) = env::var("DYNAREC_BACKEND") {
            self.cfg.backend = x
                .parse()
                .map_err(|_| JitError::Config(format!("Invalid DYNAREC_BACKEND value: {x}")))?;
        }
        let cfg = self.cfg;
        if cfg.max_block_insts == 0 {
            return Err(JitError::Config("max_block_insts must be non-zero".into()));
        }
        if cfg.max_blocks == 0 || cfg.max_blocks > u32::MAX as usize {
            return Err(JitError::Config(format!(
                "max_blocks must be in 1..={}",
                u32::MAX
            )));
        }
        if cfg.timeslice <= 0 {
            return Err(JitError::Config("timeslice must be positive".into()));
        }
        if !(1..=24).contains(&cfg.fast_map_bits) {
            return Err(JitError::Config("fast_map_bits must be in 1..=24".into()));
        }
        Ok(cfg)
    }

    /// Consume the builder and create a [Jit] driving `guest`.
    pub fn build<G: Guest + 'static>(self, guest: G) -> Result<Box<dyn Jit<G>>, JitError> {
        let cfg = self.validate()?;
        match cfg.backend {
            BackendKind::Ops => {
                let be = OpsBackend::new(cfg.code_size);
                Ok(Box::new(Core::new(cfg, be, guest)?))
            }
            #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
            BackendKind::X64 => {
                let be = crate::compile::x64::X64Backend::<G>::new(&cfg, guest.fastmem_base().is_some())?;
                Ok(Box::new(Core::new(cfg, be, guest)?))
            }
            #[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
            BackendKind::X64 => Err(JitError::Config(
                "the x64 backend is not supported on this platform".into(),
            )),
        }
    }
}

impl Default for JitBuilder {
    fn default() -> Self {
        Self::new()
    }
}
