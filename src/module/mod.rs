//! Static module definitions.
//!
//! A module is data: which parameters it declares, which binaries it needs,
//! which functions it binds to which hooks and which functions it masks.
//! Loading a module merges that data into the [`ConfigStore`]; nothing is
//! executed until the pipeline runs.
//!
//! ```text
//! CRYPTSETUP = Module {                  load_module(config, &CRYPTSETUP)
//!   binaries: ["cryptsetup", ...],   →     binaries += ...
//!   hooks: [(InitEarly, [crypt_init])],    imports.init_early += crypt_init
//!   processors: [multi("cryptsetup")],     cryptsetup.<name> -> processor
//! }
//! ```

pub mod base;
pub mod btrfs;
pub mod mounts;
pub mod plymouth;

use std::fmt;

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::crypt;
use crate::error::{Error, Result};
use crate::hook::{Func, Hook};
use crate::store::{ConfigStore, Param};

/// Something a module needs before it can work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dep {
    /// Another module, which must also be listed in `modules`.
    Module(&'static str),
    /// A binary, which must be listed in `binaries`.
    Binary(&'static str),
}

/// Handler for a configuration key that needs more than merge semantics.
#[derive(Clone, Copy)]
pub enum Processor {
    /// Called once with the whole value.
    Single(&'static str, fn(&mut ConfigStore, Value) -> Result<()>),
    /// Called once per entry of a mapping value.
    Multi(&'static str, fn(&mut ConfigStore, &str, Value) -> Result<()>),
}

impl Processor {
    pub fn key(&self) -> &'static str {
        match self {
            Processor::Single(key, _) | Processor::Multi(key, _) => key,
        }
    }

    /// Feed a configuration value through the processor.
    pub fn apply(&self, config: &mut ConfigStore, value: Value) -> Result<()> {
        match self {
            Processor::Single(_, f) => f(config, value),
            Processor::Multi(key, f) => {
                let Value::Object(entries) = value else {
                    return Err(Error::invalid_parameter(*key, "expected a mapping of named entries"));
                };
                for (name, entry) in entries {
                    f(config, &name, entry)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Processor::Single(key, _) => write!(f, "Single({})", key),
            Processor::Multi(key, _) => write!(f, "Multi({})", key),
        }
    }
}

/// A static module definition.
#[derive(Debug)]
pub struct Module {
    pub name: &'static str,
    pub depends: &'static [Dep],
    /// Binaries added to `binaries` on load.
    pub binaries: &'static [&'static str],
    pub parameters: &'static [Param],
    pub hooks: &'static [(Hook, &'static [Func])],
    pub processors: &'static [Processor],
    /// Functions this module suppresses, per hook.
    pub masks: &'static [(Hook, &'static str)],
    /// Extra configuration applied after parameters are declared.
    pub setup: Option<fn(&mut ConfigStore) -> Result<()>>,
}

impl Module {
    /// Empty definition to build others from with struct update syntax.
    pub const EMPTY: Module = Module {
        name: "",
        depends: &[],
        binaries: &[],
        parameters: &[],
        hooks: &[],
        processors: &[],
        masks: &[],
        setup: None,
    };

    pub fn functions(&self) -> impl Iterator<Item = (Hook, &Func)> {
        self.hooks
            .iter()
            .flat_map(|(hook, funcs)| funcs.iter().map(move |f| (*hook, f)))
    }
}

/// Every module the generator knows about.
#[derive(Debug, Clone)]
pub struct Registry {
    modules: Vec<&'static Module>,
}

impl Registry {
    /// Registry of the built-in modules.
    pub fn builtin() -> Self {
        Self {
            modules: vec![
                &base::BASE,
                &mounts::MOUNTS,
                &btrfs::BTRFS,
                &plymouth::PLYMOUTH,
                &crypt::CRYPTSETUP,
            ],
        }
    }

    /// Add a module definition.
    pub fn with_module(mut self, module: &'static Module) -> Self {
        self.modules.push(module);
        self
    }

    pub fn modules(&self) -> &[&'static Module] {
        &self.modules
    }

    pub fn get(&self, name: &str) -> Option<&'static Module> {
        self.modules.iter().copied().find(|m| m.name == name)
    }

    /// Find a function by name across all modules.
    pub fn function(&self, name: &str) -> Option<(&'static Module, Func)> {
        self.modules.iter().find_map(|m| {
            m.functions()
                .find(|(_, f)| f.name == name)
                .map(|(_, f)| (*m, *f))
        })
    }

    /// Processor for `key` among the loaded modules.
    pub fn processor(&self, config: &ConfigStore, key: &str) -> Option<Processor> {
        self.modules
            .iter()
            .filter(|m| config.list_contains("modules", m.name))
            .flat_map(|m| m.processors.iter())
            .find(|p| p.key() == key)
            .copied()
    }

    /// Load a module into the configuration. Loading twice is a no-op.
    pub fn load(&self, config: &mut ConfigStore, name: &str) -> Result<()> {
        if config.list_contains("modules", name) {
            debug!(module = name, "module already loaded");
            return Ok(());
        }
        let module = self
            .get(name)
            .ok_or_else(|| Error::invalid_parameter(name, "modules (unknown module)"))?;
        info!(module = name, "loading module");

        config.declare_all(module.parameters)?;
        for binary in module.binaries {
            config.append_to("binaries", json!(binary))?;
        }
        for (hook, funcs) in module.hooks {
            let names: Vec<&str> = funcs.iter().map(|f| f.name).collect();
            config.set("imports", json!({ hook.name(): names }))?;
        }
        for (hook, func) in module.masks {
            config.set("masks", json!({ hook.name(): func }))?;
        }
        config.append_to("modules", json!(name))?;
        if let Some(setup) = module.setup {
            setup(config)?;
        }
        Ok(())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_builtin_function_names_are_unique() {
        let registry = Registry::builtin();
        let mut seen = HashSet::new();
        for module in registry.modules() {
            for (_, func) in module.functions() {
                assert!(seen.insert(func.name), "Duplicate function: {}", func.name);
            }
        }
    }

    #[test]
    fn test_builtin_function_names_do_not_shadow_binaries() {
        let registry = Registry::builtin();
        let binaries: HashSet<&str> = registry
            .modules()
            .iter()
            .flat_map(|m| m.binaries.iter().copied())
            .collect();
        for module in registry.modules() {
            for (_, func) in module.functions() {
                assert!(!binaries.contains(func.name), "{} is also a binary", func.name);
            }
        }
    }

    #[test]
    fn test_load_module_imports_and_binaries() {
        let registry = Registry::builtin();
        let mut config = ConfigStore::with_core_schema().unwrap();
        registry.load(&mut config, "base").unwrap();
        registry.load(&mut config, "mounts").unwrap();
        registry.load(&mut config, "mounts").unwrap();

        assert_eq!(config.str_list("modules"), vec!["base", "mounts"]);
        assert!(config.list_contains("binaries", "switch_root"));
        let imports = config.get_entry("imports", "init_mount").unwrap();
        assert_eq!(imports, &json!(["mount_root"]));
    }

    #[test]
    fn test_load_unknown_module() {
        let registry = Registry::builtin();
        let mut config = ConfigStore::with_core_schema().unwrap();
        let err = registry.load(&mut config, "nope").unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { .. }));
    }

    #[test]
    fn test_processor_only_for_loaded_modules() {
        let registry = Registry::builtin();
        let mut config = ConfigStore::with_core_schema().unwrap();
        assert!(registry.processor(&config, "cryptsetup").is_none());
        registry.load(&mut config, "base").unwrap();
        registry.load(&mut config, "cryptsetup").unwrap();
        assert!(registry.processor(&config, "cryptsetup").is_some());
    }

    #[test]
    fn test_function_lookup() {
        let registry = Registry::builtin();
        let (module, func) = registry.function("crypt_init").unwrap();
        assert_eq!(module.name, "cryptsetup");
        assert_eq!(func.name, "crypt_init");
        assert!(registry.function("nonexistent").is_none());
    }
}
