//! Arena configuration.

use crate::allocators::os;
use crate::allocators::region::MAX_REGIONS;
use crate::allocators::tlsf::BLOCK_SIZE_MAX;
use crate::api::error::ArenaError;
use crate::util::size::{mb, parse_bytes};

/// Environment variable overriding [`ArenaConfig::region_size`].
pub const ENV_REGION_SIZE: &str = "TLSFALLOC_REGION_SIZE";

/// Environment variable overriding [`ArenaConfig::initial_capacity`].
pub const ENV_INITIAL_CAPACITY: &str = "TLSFALLOC_INITIAL_CAPACITY";

/// Configuration for one arena instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Bytes mapped per region, rounded up to whole pages (default: 16 MB).
    ///
    /// This is also the growth increment and bounds the largest single
    /// allocation the arena can serve.
    pub region_size: usize,

    /// Bytes mapped when the arena is created, rounded up to whole regions.
    /// At least one region is always mapped (default: 0).
    pub initial_capacity: usize,

    /// Most regions the arena may hold at once (default and maximum: 256).
    pub max_regions: usize,

    /// Fill released blocks with a poison pattern (default: on with the
    /// `debug` feature).
    pub poison_on_release: bool,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ArenaConfig {
    /// The default configuration, usable in `const` and `static` items.
    pub const fn new() -> Self {
        Self {
            region_size: mb(16),
            initial_capacity: 0,
            max_regions: MAX_REGIONS,
            poison_on_release: cfg!(feature = "debug"),
        }
    }

    /// Small regions for tests or constrained environments.
    pub const fn minimal() -> Self {
        Self {
            region_size: mb(1),
            initial_capacity: 0,
            max_regions: MAX_REGIONS,
            poison_on_release: false,
        }
    }

    /// Large regions for allocation-heavy hosts.
    pub const fn high_capacity() -> Self {
        Self {
            region_size: mb(64),
            initial_capacity: 0,
            max_regions: MAX_REGIONS,
            poison_on_release: false,
        }
    }

    /// Builder pattern: set region size.
    pub fn with_region_size(mut self, size: usize) -> Self {
        self.region_size = size;
        self
    }

    /// Builder pattern: set initial capacity.
    pub fn with_initial_capacity(mut self, bytes: usize) -> Self {
        self.initial_capacity = bytes;
        self
    }

    /// Builder pattern: set the region limit.
    pub fn with_max_regions(mut self, count: usize) -> Self {
        self.max_regions = count;
        self
    }

    /// Builder pattern: enable poisoning of released blocks.
    pub fn with_poison(mut self, enable: bool) -> Self {
        self.poison_on_release = enable;
        self
    }

    /// Overlay `TLSFALLOC_REGION_SIZE` / `TLSFALLOC_INITIAL_CAPACITY`.
    ///
    /// Values accept `k`, `m` and `g` suffixes. Unparseable values are
    /// ignored. This reads the environment, which allocates, so do not call
    /// it from inside an allocation hook.
    pub fn from_env(mut self) -> Self {
        if let Some(size) = read_env_bytes(ENV_REGION_SIZE) {
            self.region_size = size;
        }
        if let Some(bytes) = read_env_bytes(ENV_INITIAL_CAPACITY) {
            self.initial_capacity = bytes;
        }
        self
    }

    /// Check the configuration can produce a working arena.
    pub fn validate(&self) -> Result<(), ArenaError> {
        if self.region_size < os::page_size() {
            return Err(ArenaError::InvalidConfig("region_size is smaller than one page"));
        }
        match os::page_align(self.region_size) {
            Some(bytes) if bytes < BLOCK_SIZE_MAX => {}
            _ => return Err(ArenaError::InvalidConfig("region_size exceeds the largest block")),
        }
        if self.max_regions == 0 || self.max_regions > MAX_REGIONS {
            return Err(ArenaError::InvalidConfig("max_regions must be between 1 and 256"));
        }
        if self.initial_regions() > self.max_regions {
            return Err(ArenaError::InvalidConfig("initial_capacity needs more than max_regions"));
        }
        Ok(())
    }

    /// Regions to map at creation.
    pub(crate) fn initial_regions(&self) -> usize {
        if self.region_size == 0 {
            return 1;
        }
        let whole = self.initial_capacity / self.region_size;
        let partial = usize::from(self.initial_capacity % self.region_size != 0);
        (whole + partial).max(1)
    }
}

fn read_env_bytes(name: &str) -> Option<usize> {
    std::env::var(name).ok().as_deref().and_then(parse_bytes)
}
