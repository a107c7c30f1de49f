//! Init script assembly.
//!
//! ```text
//! #!/bin/sh                      shebang
//! # Generated by rdgen v...      banner
//! . /init_funcs.sh               only if functions were registered
//! init_pre
//! init_debug .. init_cleanup     or the custom_init invocation
//! init_final
//! # END INIT
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::context::BuildContext;
use crate::error::{Error, Result};
use crate::hook::{Hook, HookPipeline};
use crate::process::Cmd;
use crate::shell::Line;
use crate::staging;

pub const FUNCS_FILE: &str = "init_funcs.sh";
const SOURCE_FUNCS: &str = ". /init_funcs.sh";

/// Everything the assembler produces, before it is written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitArtifacts {
    pub init: Vec<String>,
    /// Contents of `init_funcs.sh`, when any function was registered.
    pub funcs: Option<Vec<String>>,
    /// File name and contents of the custom main script.
    pub custom: Option<(String, Vec<String>)>,
}

pub fn banner() -> String {
    format!("# Generated by rdgen v{}", crate::VERSION)
}

/// Run the boot hooks and assemble the init script.
pub fn generate_init(pipeline: &mut HookPipeline, ctx: &mut BuildContext) -> Result<InitArtifacts> {
    info!("Running init generator functions");
    let shebang = ctx
        .config
        .get_str("shebang")
        .ok_or_else(|| Error::validation("shebang is not set"))?
        .to_string();
    let mut init = vec![shebang.clone(), banner()];

    // Registered for init_funcs.sh; nothing goes to the hook site.
    pipeline.run_hook(ctx, Hook::Functions, true)?;

    init.extend(pipeline.run_init_hook(ctx, Hook::InitPre)?);

    let mut custom = None;
    let custom_funcs = pipeline.functions_for(ctx, Hook::CustomInit)?;
    match custom_funcs.as_slice() {
        [] => {
            for hook in Hook::INIT_MAIN {
                init.extend(pipeline.run_init_hook(ctx, hook)?);
            }
        }
        [(f, source)] => {
            info!("Using custom init from {}: {}", source, f.name);
            let file = ctx
                .config
                .get_str("custom_init_file")
                .unwrap_or("init_main.sh")
                .to_string();
            let mut lines = vec![shebang, banner()];
            lines.extend((f.run)(ctx)?.lines());
            init.extend([String::new(), "# !!custom_init".to_string()]);
            init.push(Line::cmd(format!("/{}", file)).render());
            custom = Some((file, lines));
        }
        many => {
            let names: Vec<&str> = many.iter().map(|(f, _)| f.name).collect();
            return Err(Error::validation(format!(
                "Only one custom_init function may be imported, found: {}",
                names.join(", ")
            )));
        }
    }

    init.extend(pipeline.run_init_hook(ctx, Hook::InitFinal)?);
    init.extend([String::new(), "# END INIT".to_string()]);

    let mut funcs = None;
    if !pipeline.included_functions().is_empty() {
        funcs = Some(pipeline.render_functions(&banner()));
        init.insert(2, SOURCE_FUNCS.to_string());
        if let Some((_, lines)) = custom.as_mut() {
            lines.insert(2, SOURCE_FUNCS.to_string());
        }
    }

    Ok(InitArtifacts { init, funcs, custom })
}

/// Write the assembled files into the build tree.
pub fn write_init(ctx: &BuildContext, artifacts: &InitArtifacts) -> Result<Vec<PathBuf>> {
    let build_dir = ctx.build_dir();
    let mut files: Vec<(PathBuf, &[String])> = Vec::new();
    if let Some(funcs) = &artifacts.funcs {
        files.push((build_dir.join(FUNCS_FILE), funcs));
    }
    if let Some((name, lines)) = &artifacts.custom {
        files.push((build_dir.join(name), lines));
    }
    files.push((build_dir.join("init"), &artifacts.init));

    let shebang = ctx.config.get_str("shebang").unwrap_or("#!/bin/sh");
    let timeout = Duration::from_secs(ctx.config.get_u64("timeout").unwrap_or(15));
    let mut written = Vec::new();
    for (path, lines) in files {
        staging::write_file(&path, lines, 0o755)?;
        if ctx.config.get_bool("check_shell_syntax") {
            check_syntax(&path, lines, shebang, timeout)?;
        }
        written.push(path);
    }
    Ok(written)
}

/// `sh -n` on files that start with the configured shebang.
fn check_syntax(path: &Path, lines: &[String], shebang: &str, timeout: Duration) -> Result<()> {
    let first = lines.first().map(String::as_str).unwrap_or("");
    let interpreter = shebang.split(' ').next().unwrap_or(shebang);
    if first.starts_with(interpreter) {
        debug!("Running sh -n on file: {}", path.display());
        let result = Cmd::new("sh")
            .arg("-n")
            .arg_path(path)
            .timeout(timeout)
            .allow_fail()
            .run()?;
        if !result.success() {
            return Err(Error::validation(format!(
                "Failed to validate shell script {} (exit {}): {}",
                path.display(),
                result.code(),
                result.stderr_trimmed()
            )));
        }
    } else if first.starts_with("#!") {
        warn!("[{}] Skipping sh -n on file with unrecognized shebang: {}", path.display(), first);
    }
    Ok(())
}
