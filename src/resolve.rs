//! Dependency and mask resolution.
//!
//! Runs once, after all configuration is loaded and before any hook. Module
//! dependencies must be satisfied by the aggregate configuration, and every
//! mask must name a real hook. Masks stay recorded in the `masks` table and
//! masked functions stay defined; the pipeline reads the table when it
//! assembles each hook.

use tracing::{debug, info, warn};

use crate::error::{DependencyKind, Error, Result};
use crate::hook::Hook;
use crate::module::{Dep, Registry};
use crate::store::ConfigStore;

/// Check module dependencies and masks.
pub fn resolve(registry: &Registry, config: &ConfigStore) -> Result<()> {
    for name in config.str_list("modules") {
        let Some(module) = registry.get(&name) else {
            return Err(Error::MissingDependency {
                kind: DependencyKind::Module,
                name,
                required_by: "modules".to_string(),
            });
        };
        for dep in module.depends {
            let (kind, key, dep_name) = match *dep {
                Dep::Module(m) => (DependencyKind::Module, "modules", m),
                Dep::Binary(b) => (DependencyKind::Binary, "binaries", b),
            };
            if !config.list_contains(key, dep_name) {
                return Err(Error::MissingDependency {
                    kind,
                    name: dep_name.to_string(),
                    required_by: format!("module '{}'", module.name),
                });
            }
            debug!(module = module.name, dependency = dep_name, "dependency satisfied");
        }
    }

    if let Some(imports) = config.get_map("imports") {
        for hook in imports.keys() {
            parse_hook(hook, "imports")?;
        }
    }

    let Some(masks) = config.get_map("masks") else {
        return Ok(());
    };
    for (hook_name, functions) in masks {
        let hook = parse_hook(hook_name, "masks")?;
        let mut seen = Vec::new();
        for function in functions.as_array().into_iter().flatten().filter_map(|f| f.as_str()) {
            if seen.contains(&function) {
                continue;
            }
            seen.push(function);
            if registry.function(function).is_none() {
                warn!(hook = hook_name.as_str(), function, "masked function is not defined by any module");
            }
            info!("[{}] Masking function: {}", hook, function);
        }
    }
    Ok(())
}

fn parse_hook(name: &str, required_by: &str) -> Result<Hook> {
    name.parse::<Hook>().map_err(|_| Error::MissingDependency {
        kind: DependencyKind::Hook,
        name: name.to_string(),
        required_by: required_by.to_string(),
    })
}
