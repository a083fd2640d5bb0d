//! Streamsheets - headless runner for stream-processing machines

mod default_functions;
mod error;

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use streamsheets_core::storage::{render_markdown, write_markdown};
use streamsheets_core::{MachineConfig, SystemClock};
use tracing::info;
use tracing_subscriber::EnvFilter;

use error::CliError;

#[derive(Debug, PartialEq)]
struct Options {
    file: PathBuf,
    cycles: u64,
    functions_files: Vec<PathBuf>,
    output_file: Option<PathBuf>,
    log: Option<String>,
    no_default_functions: bool,
}

fn print_usage() {
    eprintln!("Usage: streamsheets [OPTIONS] FILE");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  FILE                      Machine definition (.toml)");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -n, --cycles <N>          Number of cycles to run (default: 1)");
    eprintln!("  -f, --functions <FILE>    Load custom Rhai functions (can be repeated)");
    eprintln!("  -o, --output <FILE>       Export sheets to a markdown file");
    eprintln!("  --log <LEVEL>             Log filter (overrides RUST_LOG)");
    eprintln!("  --no-default-functions    Skip default.rhai from the config dir");
    eprintln!("  -h, --help                Print help");
}

fn value_of<'a>(
    args: &mut impl Iterator<Item = &'a String>,
    flag: &'static str,
) -> Result<&'a String, CliError> {
    args.next().ok_or(CliError::MissingValue(flag))
}

/// Parse arguments (without the program name). `None` means help was requested.
fn parse_args(args: &[String]) -> Result<Option<Options>, CliError> {
    let mut file: Option<PathBuf> = None;
    let mut cycles = 1;
    let mut functions_files = Vec::new();
    let mut output_file = None;
    let mut log = None;
    let mut no_default_functions = false;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(None),
            "-n" | "--cycles" => {
                let value = value_of(&mut iter, "--cycles")?;
                cycles = value
                    .parse()
                    .map_err(|_| CliError::InvalidCycles(value.clone()))?;
            }
            "-f" | "--functions" => {
                functions_files.push(PathBuf::from(value_of(&mut iter, "--functions")?));
            }
            "-o" | "--output" => {
                output_file = Some(PathBuf::from(value_of(&mut iter, "--output")?));
            }
            "--log" => log = Some(value_of(&mut iter, "--log")?.clone()),
            "--no-default-functions" => no_default_functions = true,
            other if other.starts_with('-') => {
                return Err(CliError::UnknownOption(other.to_string()));
            }
            other => {
                if file.is_some() {
                    return Err(CliError::UnexpectedArgument(other.to_string()));
                }
                file = Some(PathBuf::from(other));
            }
        }
    }

    Ok(Some(Options {
        file: file.ok_or(CliError::MissingFile)?,
        cycles,
        functions_files,
        output_file,
        log,
        no_default_functions,
    }))
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).map_err(|_| ()),
        None => EnvFilter::try_from_default_env().map_err(|_| ()),
    }
    .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(options: Options) -> anyhow::Result<()> {
    let config = MachineConfig::load(&options.file)
        .with_context(|| format!("Failed to load {}", options.file.display()))?;
    let mut machine = config.build(Arc::new(SystemClock))?;

    let mut functions = options.functions_files;
    default_functions::prepend_default_functions_if_present(
        &mut functions,
        options.no_default_functions,
    );
    for path in &functions {
        machine
            .load_functions(path)
            .with_context(|| format!("Failed to load functions from {}", path.display()))?;
    }

    machine.start();
    let pause = Duration::from_millis(machine.cycle_time_ms());
    for n in 0..options.cycles {
        if n > 0 {
            std::thread::sleep(pause);
        }
        machine.cycle()?;
    }
    info!(machine = %machine.name(), cycles = machine.cycles(), "run finished");

    match &options.output_file {
        Some(path) => {
            write_markdown(path, &machine)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Exported to {}", path.display());
        }
        None => print!("{}", render_markdown(&machine)),
    }
    machine.stop();
    Ok(())
}

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    let options = match parse_args(&args) {
        Ok(Some(options)) => options,
        Ok(None) => {
            print_usage();
            return;
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            print_usage();
            std::process::exit(1);
        }
    };

    init_logging(options.log.as_deref());
    if let Err(e) = run(options) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
