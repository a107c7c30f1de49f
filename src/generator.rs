//! Build orchestration.
//!
//! ```text
//! load(config.json) → resolve → build_pre → build_tasks → init → pack
//! ```
//!
//! `modules` is loaded before any other key so that module parameters and
//! processors exist when their keys are read.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::assemble::{self, InitArtifacts};
use crate::context::BuildContext;
use crate::error::{Error, Result};
use crate::hook::{Hook, HookPipeline};
use crate::host::Host;
use crate::module::{base, Registry};
use crate::resolve;
use crate::staging;
use crate::store::ConfigStore;
use crate::timing::{PhaseTime, Timer};

/// What a finished build left behind.
#[derive(Debug, Clone)]
pub struct BuildSummary {
    pub build_dir: PathBuf,
    pub written: Vec<PathBuf>,
    /// Boot-time files that are neither embedded nor on a mounted filesystem.
    pub unavailable: Vec<String>,
    pub phases: Vec<PhaseTime>,
    pub file_count: usize,
    pub total_size: u64,
}

impl BuildSummary {
    pub fn print(&self) {
        println!("Build directory: {}", self.build_dir.display());
        for path in &self.written {
            println!("  {}", path.display());
        }
        println!(
            "  {} files, {:.1} KiB total",
            self.file_count,
            self.total_size as f64 / 1024.0
        );
        for path in &self.unavailable {
            println!("  WARNING: not available at boot: {}", path);
        }
        println!("\nTimings:");
        for phase in &self.phases {
            println!("  {}", phase);
        }
    }
}

/// Loads configuration and drives the hook pipeline.
pub struct Generator {
    pipeline: HookPipeline,
    ctx: BuildContext,
}

impl Generator {
    pub fn new(registry: Registry, host: Box<dyn Host>) -> Result<Self> {
        Ok(Self {
            pipeline: HookPipeline::new(registry),
            ctx: BuildContext::new(ConfigStore::with_core_schema()?, host),
        })
    }

    pub fn config(&self) -> &ConfigStore {
        &self.ctx.config
    }

    /// Mutable access for command line overrides.
    pub fn config_mut(&mut self) -> &mut ConfigStore {
        &mut self.ctx.config
    }

    pub fn pipeline(&self) -> &HookPipeline {
        &self.pipeline
    }

    /// Read a JSON configuration file and load it.
    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        info!("Loading config file: {}", path.display());
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let value: Value = serde_json::from_reader(BufReader::new(file))?;
        self.load(value)
    }

    /// Load an already parsed configuration mapping.
    pub fn load(&mut self, value: Value) -> Result<()> {
        let Value::Object(entries) = value else {
            return Err(Error::invalid_parameter("config", "top level (expected a mapping)"));
        };

        match entries.get("modules") {
            Some(Value::Array(modules)) => {
                for module in modules {
                    let Some(name) = module.as_str() else {
                        return Err(Error::invalid_parameter(module.to_string(), "modules"));
                    };
                    self.pipeline.registry().load(&mut self.ctx.config, name)?;
                }
            }
            Some(_) => return Err(Error::invalid_parameter("modules", "config (expected a list)")),
            None => {}
        }

        // Declaration order matters: a volume reads cryptsetup_retries when
        // it is processed.
        for (key, value) in entries {
            if key != "modules" {
                self.load_key(&key, value)?;
            }
        }
        Ok(())
    }

    fn load_key(&mut self, key: &str, value: Value) -> Result<()> {
        if let Some(processor) = self.pipeline.registry().processor(&self.ctx.config, key) {
            debug!(key, ?processor, "processing config key");
            return processor.apply(&mut self.ctx.config, value);
        }
        if !self.ctx.config.is_declared(key) {
            return Err(Error::invalid_parameter(
                key,
                "config (not declared by any loaded module)",
            ));
        }
        self.ctx.config.set(key, value)
    }

    /// Check module dependencies and masks.
    pub fn resolve(&self) -> Result<()> {
        resolve::resolve(self.pipeline.registry(), &self.ctx.config)
    }

    /// Run the whole build. On failure the accumulated configuration is
    /// logged before the error is returned.
    pub fn build(&mut self) -> Result<BuildSummary> {
        let result = self.run_build();
        if let Err(e) = &result {
            error!("Build failed: {}", e);
            error!("Configuration at failure:\n{}", self.ctx.config.dump());
        }
        result
    }

    fn run_build(&mut self) -> Result<BuildSummary> {
        let mut phases = Vec::new();

        let timer = Timer::start("Resolve");
        self.resolve()?;
        phases.push(timer.finish());

        let timer = Timer::start("Build pre");
        self.pipeline.run_hook(&mut self.ctx, Hook::BuildPre, false)?;
        phases.push(timer.finish());

        let timer = Timer::start("Build tasks");
        self.pipeline.run_hook(&mut self.ctx, Hook::BuildTasks, false)?;
        let unavailable = base::check_included_or_mounted(&self.ctx.config);
        phases.push(timer.finish());

        let timer = Timer::start("Init");
        let artifacts = self.generate_init()?;
        let written = assemble::write_init(&self.ctx, &artifacts)?;
        phases.push(timer.finish());

        phases.extend(self.pack()?);

        let build_dir = self.ctx.build_dir();
        let (file_count, total_size) = staging::summarize(&build_dir);
        Ok(BuildSummary {
            build_dir,
            written,
            unavailable,
            phases,
            file_count,
            total_size,
        })
    }

    /// Assemble the init script without writing it.
    pub fn generate_init(&mut self) -> Result<InitArtifacts> {
        assemble::generate_init(&mut self.pipeline, &mut self.ctx)
    }

    fn pack(&mut self) -> Result<Option<PhaseTime>> {
        if self.ctx.config.get_entry("imports", Hook::Pack.name()).is_none() {
            warn!(
                "No pack function imported, the build is left in: {}",
                self.ctx.build_dir().display()
            );
            return Ok(None);
        }
        let timer = Timer::start("Pack");
        self.pipeline.run_hook(&mut self.ctx, Hook::Pack, false)?;
        Ok(Some(timer.finish()))
    }
}
