//! Engine host executable.
//!
//! Windowed by default; `--headless` renders a fixed number of frames
//! into BMP files and exits. Exit code is non-zero on any fatal init or
//! frame failure.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use kiln_engine::{run_headless, run_main_loop, Engine, EngineConfig, EngineError, ModuleHost};

#[derive(Parser, Debug)]
#[command(name = "kiln", about = "Vulkan engine host driving a reloadable game module")]
struct Args {
    /// Render offscreen and write frames as BMP files instead of
    /// presenting to a window.
    #[arg(short = 'H', long)]
    headless: bool,

    /// Number of frames to capture in headless mode.
    #[arg(short = 'f', long, default_value_t = 3)]
    frames: u32,

    /// Directory for headless frame output.
    #[arg(short = 'o', long, default_value = "out")]
    output_dir: PathBuf,

    /// Explicit config file (defaults to kiln.toml if present).
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), EngineError> {
    let config = match &args.config {
        Some(path) => EngineConfig::load_from_file(path)
            .map_err(|e| EngineError::Init(e.to_string()))?,
        None => EngineConfig::load_or_default(),
    };

    let module_dir = config.module_dir();
    let module_name = config.module.name.clone();

    let mut engine = Engine::new(config, args.headless)?;
    let mut host = ModuleHost::init_game(&mut engine, &module_dir, &module_name)?;

    if args.headless {
        let result = run_headless(&mut engine, &host, args.frames, &args.output_dir);
        host.shutdown(&mut engine);
        result
    } else {
        run_main_loop(&mut engine, &mut host)
    }
}
