//! Build context shared by every hook function.

use std::path::PathBuf;

use crate::error::Result;
use crate::host::Host;
use crate::store::ConfigStore;

/// Configuration plus the host it is validated against.
pub struct BuildContext {
    /// Accumulated configuration. The only shared mutable state.
    pub config: ConfigStore,
    /// Source of host facts.
    pub host: Box<dyn Host>,
}

impl BuildContext {
    pub fn new(config: ConfigStore, host: Box<dyn Host>) -> Self {
        Self { config, host }
    }

    /// Root of the build tree.
    pub fn build_dir(&self) -> PathBuf {
        PathBuf::from(self.config.get_str("build_dir").unwrap_or("/tmp/initramfs"))
    }

    /// Whether a module has been loaded.
    pub fn has_module(&self, name: &str) -> bool {
        self.config.list_contains("modules", name)
    }

    /// Build context with core schema and the given host.
    #[doc(hidden)]
    pub fn for_testing(host: impl Host + 'static) -> Result<Self> {
        Ok(Self::new(ConfigStore::with_core_schema()?, Box::new(host)))
    }
}
