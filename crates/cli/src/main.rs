//! `heat-sim` command-line front end
//!
//! ```text
//! heat-sim generate --width 256 --height 256 > world.json
//! heat-sim step --dt 0.1 -n 1000 < world.json > stepped.json
//! heat-sim step --backend cpu --strategy read-back --variant naive -i world.json
//! ```
//!
//! Logs go to stderr so stdout carries only world data.

use clap::{Parser, Subcommand};
use heat_sim_core::{
    generate_world, load_world, read_world, save_world, step_world_with, write_world,
    BackendPreference, DispatchStrategy, GeneratorConfig, HeatError, HeatWorld, RunConfig,
    StencilVariant, WorldFormat,
};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Heat diffusion stepper with GPU and CPU backends
#[derive(Parser, Debug)]
#[command(name = "heat-sim")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log errors only
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Advance a world by n steps
    Step {
        /// Timestep
        #[arg(long, default_value_t = 0.1)]
        dt: f32,

        /// Number of steps
        #[arg(short, default_value_t = 1)]
        n: u32,

        /// Write the result in the binary world format
        #[arg(short, long)]
        binary: bool,

        /// Input world (default: stdin)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Output world (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Compute backend (auto, cpu, gpu)
        #[arg(long)]
        backend: Option<BackendPreference>,

        /// Dispatch strategy (resident, read-back)
        #[arg(long)]
        strategy: Option<DispatchStrategy>,

        /// Stencil variant (packed, naive)
        #[arg(long)]
        variant: Option<StencilVariant>,

        /// GPU adapter index
        #[arg(long)]
        adapter: Option<usize>,

        /// Directory holding `heat_step.wgsl`
        #[arg(long)]
        kernel_dir: Option<PathBuf>,
    },

    /// Generate a demo world with a hot source, a cold sink and walls
    Generate {
        /// Grid width in cells
        #[arg(long, default_value_t = 64)]
        width: u32,

        /// Grid height in cells
        #[arg(long, default_value_t = 64)]
        height: u32,

        /// Diffusion coefficient
        #[arg(long, default_value_t = 0.1)]
        alpha: f32,

        /// Number of random insulating walls
        #[arg(long, default_value_t = 4)]
        walls: u32,

        /// Random seed
        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Write the binary world format
        #[arg(short, long)]
        binary: bool,

        /// Output world (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn setup_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn format_for(binary: bool) -> WorldFormat {
    if binary {
        WorldFormat::Binary
    } else {
        WorldFormat::Json
    }
}

fn load(input: Option<&Path>) -> Result<HeatWorld, HeatError> {
    match input {
        Some(path) => load_world(path),
        None => read_world(io::stdin().lock()),
    }
}

fn store(output: Option<&Path>, world: &HeatWorld, format: WorldFormat) -> Result<(), HeatError> {
    match output {
        Some(path) => save_world(path, world, format),
        None => write_world(BufWriter::new(io::stdout().lock()), world, format),
    }
}

fn run(command: Commands) -> Result<(), HeatError> {
    match command {
        Commands::Step {
            dt,
            n,
            binary,
            input,
            output,
            backend,
            strategy,
            variant,
            adapter,
            kernel_dir,
        } => {
            // Flags override the environment
            let mut config = RunConfig::from_env()?;
            if let Some(backend) = backend {
                config.backend = backend;
            }
            if let Some(strategy) = strategy {
                config.strategy = strategy;
            }
            if let Some(variant) = variant {
                config.variant = variant;
            }
            if adapter.is_some() {
                config.adapter_index = adapter;
            }
            if kernel_dir.is_some() {
                config.kernel_dir = kernel_dir;
            }

            let mut world = load(input.as_deref())?;
            info!(
                "Loaded {}x{} world, stepping dt={} n={}",
                world.width, world.height, dt, n
            );

            let report = step_world_with(&config, &mut world, dt, n)?;
            info!(
                "Finished {} step(s) on {} ({} / {}), t={}",
                report.steps, report.backend, report.strategy, report.variant, world.t
            );

            store(output.as_deref(), &world, format_for(binary))
        }
        Commands::Generate {
            width,
            height,
            alpha,
            walls,
            seed,
            binary,
            output,
        } => {
            let world = generate_world(&GeneratorConfig {
                width,
                height,
                alpha,
                walls,
                seed,
            })?;
            info!("Generated {}x{} world (seed {})", width, height, seed);
            store(output.as_deref(), &world, format_for(binary))
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.quiet);

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
