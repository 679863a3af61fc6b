//! Headless shell agent.
//!
//! `mini run` streams JSONL events on stdout while the agent works through a
//! task; diagnostics go to stderr. `mini init` scaffolds `.miniswe/`.

use std::io;
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use minicore::exit_codes;
use minicore::headless::{self, RunRequest};
use minicore::io::config::Overrides;
use minicore::io::workspace::{InitOptions, init_workspace};
use minicore::logging;

#[derive(Parser)]
#[command(name = "mini", version, about = "Headless shell agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.miniswe/` with a starter config.
    Init {
        /// Directory to initialize (default: current directory).
        #[arg(long)]
        workdir: Option<PathBuf>,
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Run the agent on a task, streaming events to stdout.
    Run {
        /// Natural-language task description.
        #[arg(short, long)]
        task: Option<String>,
        /// Directory the task runs in (default: current directory).
        #[arg(long)]
        workdir: Option<PathBuf>,
        /// Config profile name under `.miniswe/configs/` or `$MINI_CONFIG_DIR`.
        #[arg(long)]
        profile: Option<String>,
        /// Explicit config file; must exist.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override `model.model_name`.
        #[arg(short, long)]
        model: Option<String>,
        /// Override `agent.cost_limit` (0 disables).
        #[arg(long)]
        cost_limit: Option<f64>,
        /// Override `agent.step_limit` (0 disables).
        #[arg(long)]
        step_limit: Option<u32>,
        /// Trajectory file (default: `.miniswe/data/last_run.traj.json`).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Init { workdir, force } => match cmd_init(workdir, force) {
            Ok(()) => exit_codes::OK,
            Err(err) => {
                eprintln!("{err:#}");
                exit_codes::INVALID
            }
        },
        Command::Run {
            task,
            workdir,
            profile,
            config,
            model,
            cost_limit,
            step_limit,
            output,
        } => {
            let request = RunRequest {
                task,
                workdir,
                profile,
                config,
                overrides: Overrides {
                    model,
                    cost_limit,
                    step_limit,
                },
                output,
            };
            headless::run(&request, io::stdout().lock())
        }
    };
    process::exit(code);
}

fn cmd_init(workdir: Option<PathBuf>, force: bool) -> Result<()> {
    let root = match workdir {
        Some(dir) => dir,
        None => std::env::current_dir().context("read current directory")?,
    };
    let paths = init_workspace(&root, &InitOptions { force })?;
    println!("{}", paths.miniswe_dir.display());
    Ok(())
}
