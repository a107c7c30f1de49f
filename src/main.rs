//! rdgen - modular initramfs generator.
//!
//! Loads a JSON module configuration, validates it against the host and
//! writes the build tree with its generated `init`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use rdgen::config::Settings;
use rdgen::hook::Hook;
use rdgen::host::SystemHost;
use rdgen::module::Registry;
use rdgen::Generator;

#[derive(Parser)]
#[command(name = "rdgen")]
#[command(about = "Modular initramfs generator")]
#[command(
    after_help = "QUICK START:\n  rdgen build config.json        Build the initramfs tree\n  rdgen show-config config.json  Print the processed configuration\n  rdgen hooks                    List hooks in execution order"
)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the initramfs tree and init script
    Build {
        /// Module configuration (default: RDGEN_CONFIG or /etc/rdgen/config.json)
        config: Option<PathBuf>,

        /// Build directory (overrides the configuration)
        #[arg(long)]
        build_dir: Option<PathBuf>,

        /// Skip validation of volumes and keys against the host
        #[arg(long)]
        no_validate: bool,

        /// Do not inspect host devices
        #[arg(long)]
        no_hostonly: bool,
    },

    /// Load and resolve the configuration, then print it
    ShowConfig {
        config: Option<PathBuf>,
    },

    /// List hooks in execution order
    Hooks,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn load_generator(settings: &Settings, explicit: Option<&Path>) -> Result<Generator> {
    let path = settings
        .find_config(explicit)
        .context("No configuration file given and none found in the default locations")?;
    let host = SystemHost::new(settings.timeout);
    let mut generator = Generator::new(Registry::builtin(), Box::new(host))?;
    generator
        .load_file(&path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    Ok(generator)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load .env if present
    dotenvy::dotenv().ok();
    init_logging(cli.verbose);
    let settings = Settings::load();

    match cli.command {
        Commands::Build {
            config,
            build_dir,
            no_validate,
            no_hostonly,
        } => {
            println!("=== Building initramfs ===\n");
            let mut generator = load_generator(&settings, config.as_deref())?;

            let config = generator.config_mut();
            if let Some(dir) = build_dir.or_else(|| settings.build_dir.clone()) {
                config.overwrite("build_dir", json!(dir.to_string_lossy()))?;
            }
            if no_validate {
                config.overwrite("validate", json!(false))?;
            }
            if no_hostonly {
                config.overwrite("hostonly", json!(false))?;
            }

            let summary = generator.build().context("Build failed")?;
            println!("\n=== Build complete ===\n");
            summary.print();
        }

        Commands::ShowConfig { config } => {
            let generator = load_generator(&settings, config.as_deref())?;
            generator.resolve().context("Dependency resolution failed")?;
            settings.print();
            println!();
            println!("{}", generator.config().dump());
        }

        Commands::Hooks => {
            for hook in Hook::ALL {
                let phase = if hook.is_boot_phase() { "boot" } else { "build" };
                println!("  {:<14} {}", hook.name(), phase);
            }
        }
    }

    Ok(())
}
