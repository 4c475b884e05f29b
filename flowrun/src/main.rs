//! `flowrun`: run flows, builds and scenario sweeps in isolated instances.
//!
//! Reads `flowrun.toml` (or `flowrun.json`) from the project root and keeps
//! every run under the configured run root (`runs/` by default).

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use flowrun::cli::{self, FlowArgs};
use flowrun::logging;

#[derive(Parser)]
#[command(
    name = "flowrun",
    version,
    about = "Isolated, cached execution of parameterized flows and builds"
)]
struct Cli {
    /// Project root holding the manifest.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one flow instance.
    Flow {
        name: String,
        /// Instance name; one directory per name under the run root.
        #[arg(short, long, default_value = "default")]
        instance: String,
        /// JSON or TOML document overlaid on the flow's configuration.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Run root to use instead of the manifest's.
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
        /// Prepare the instance directory, configuration and bindings only.
        #[arg(long)]
        no_execute: bool,
        /// Ask before each step after the first.
        #[arg(long)]
        interactive: bool,
    },
    /// Run one build instance.
    Build {
        name: String,
        #[arg(short, long, default_value = "default")]
        instance: String,
        /// JSON or TOML document of build parameters.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Run every conductor build for every scenario.
    Conduct,
    /// Rebuild the status tree from the run root and rewrite the report.
    Status,
    /// Re-run one step of a flow instance from its configuration snapshot.
    Step {
        flow: String,
        instance: String,
        step: String,
        /// Build the flow instance belongs to.
        #[arg(short, long)]
        build: Option<String>,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(flowrun::exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Flow {
            name,
            instance,
            config,
            output_dir,
            no_execute,
            interactive,
        } => cli::run_flow(
            &cli.root,
            &FlowArgs {
                name,
                instance,
                config,
                output_dir,
                no_execute,
                interactive,
            },
        ),
        Command::Build {
            name,
            instance,
            config,
        } => cli::run_build(&cli.root, &name, &instance, config.as_deref()),
        Command::Conduct => cli::conduct(&cli.root),
        Command::Status => cli::status(&cli.root),
        Command::Step {
            flow,
            instance,
            step,
            build,
        } => cli::replay_step(&cli.root, &flow, &instance, &step, build.as_deref()),
    }
}
