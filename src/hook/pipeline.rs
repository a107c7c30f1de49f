//! Hook execution and function registration.
//!
//! For each hook the pipeline gathers internal functions and the functions
//! imported by loaded modules, drops the ones masked for that hook, runs the
//! rest in order and collects their output:
//!
//! - empty output is skipped,
//! - a single line is inlined at the hook site,
//! - anything longer is registered once as a shell function and the hook
//!   site gets a call to it.

use tracing::{debug, info};

use super::{func, Func, Hook, Source};
use crate::context::BuildContext;
use crate::error::{Error, Result};
use crate::module::Registry;
use crate::staging;

/// Functions the generator itself runs, before any imported ones.
const INTERNAL: &[(Hook, &[Func])] = &[(
    Hook::BuildPre,
    &[
        func("clean_build_dir", staging::clean_build_dir),
        func("generate_structure", staging::generate_structure),
    ],
)];

/// Runs hooks and accumulates the functions destined for `init_funcs.sh`.
#[derive(Debug)]
pub struct HookPipeline {
    registry: Registry,
    /// Registered functions in registration order, as rendered lines.
    included: Vec<(String, Vec<String>)>,
}

impl HookPipeline {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            included: Vec::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn included_functions(&self) -> &[(String, Vec<String>)] {
        &self.included
    }

    pub fn is_included(&self, name: &str) -> bool {
        self.included.iter().any(|(n, _)| n == name)
    }

    /// Functions bound to `hook`, masked ones removed.
    pub fn functions_for(&self, ctx: &BuildContext, hook: Hook) -> Result<Vec<(Func, Source)>> {
        let mut funcs: Vec<(Func, Source)> = INTERNAL
            .iter()
            .filter(|(h, _)| *h == hook)
            .flat_map(|(_, fs)| fs.iter().map(|f| (*f, Source::Internal)))
            .collect();

        if let Some(imports) = ctx.config.get_entry("imports", hook.name()) {
            for name in imports.as_array().into_iter().flatten() {
                let Some(name) = name.as_str() else {
                    return Err(Error::invalid_parameter(
                        name.to_string(),
                        format!("imports.{}", hook),
                    ));
                };
                let (module, f) = self.registry.function(name).ok_or_else(|| {
                    Error::invalid_parameter(name, format!("imports.{} (unknown function)", hook))
                })?;
                funcs.push((f, Source::Module(module.name)));
            }
        }

        let masked = ctx
            .config
            .get_entry("masks", hook.name())
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        funcs.retain(|(f, source)| {
            let is_masked = masked.iter().any(|m| m.as_str() == Some(f.name));
            if is_masked {
                info!(hook = %hook, function = f.name, %source, "function masked");
            }
            !is_masked
        });
        Ok(funcs)
    }

    /// Run one function and decide what ends up at the hook site.
    fn run_func(
        &mut self,
        ctx: &mut BuildContext,
        f: Func,
        source: Source,
        force_include: bool,
    ) -> Result<Option<String>> {
        debug!(function = f.name, %source, "running function");
        let script = (f.run)(ctx)?;
        let lines = script.lines();
        if lines.is_empty() {
            debug!(function = f.name, "function returned no output");
            return Ok(None);
        }

        if self.is_included(f.name) {
            return Err(Error::DuplicateFunction(f.name.to_string()));
        }
        if ctx.config.list_contains("binaries", f.name) {
            return Err(Error::NameCollision(f.name.to_string()));
        }

        if lines.len() == 1 && !force_include {
            debug!(function = f.name, line = %lines[0], "inlining single line");
            return Ok(lines.into_iter().next());
        }

        self.register(f.name, lines)?;
        info!("Created function alias: {}", f.name);
        Ok(Some(f.name.to_string()))
    }

    /// Register a named shell function.
    pub fn register(&mut self, name: &str, lines: Vec<String>) -> Result<()> {
        if self.is_included(name) {
            return Err(Error::DuplicateFunction(name.to_string()));
        }
        self.included.push((name.to_string(), lines));
        Ok(())
    }

    /// Run every function bound to `hook`, returning the hook-site lines.
    pub fn run_hook(&mut self, ctx: &mut BuildContext, hook: Hook, force_include: bool) -> Result<Vec<String>> {
        info!("Running hook: {}", hook);
        let mut out = Vec::new();
        for (f, source) in self.functions_for(ctx, hook)? {
            if let Some(line) = self.run_func(ctx, f, source, force_include)? {
                out.push(line);
            }
        }
        if !out.is_empty() {
            debug!(hook = %hook, ?out, "hook output");
        }
        Ok(out)
    }

    /// Run a boot-phase hook, prefixing non-empty output with a marker.
    pub fn run_init_hook(&mut self, ctx: &mut BuildContext, hook: Hook) -> Result<Vec<String>> {
        let body = self.run_hook(ctx, hook, false)?;
        if body.is_empty() {
            debug!("No output for init level: {}", hook);
            return Ok(body);
        }
        let mut out = vec![String::new(), format!("# Begin {}", hook)];
        out.extend(body);
        Ok(out)
    }

    /// Render registered functions as shell function definitions.
    pub fn render_functions(&self, banner: &str) -> Vec<String> {
        let mut out = vec![banner.to_string()];
        for (name, lines) in &self.included {
            out.push(String::new());
            out.push(format!("{}() {{", name));
            for line in lines {
                if line.is_empty() {
                    out.push(String::new());
                } else {
                    out.push(format!("    {}", line));
                }
            }
            out.push("}".to_string());
        }
        out
    }
}
