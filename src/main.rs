/// Filament bundle runner CLI.
use std::env;
use std::path::Path;
use std::process;

use filament::loader::run_bundle;
use filament::machine::Machine;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_usage() {
    eprintln!("filament-run v{}", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    filament-run [OPTIONS] BUNDLE [ARGS...]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -h, --help                 Print this help message");
    eprintln!("    -v, --version              Print version information");
    eprintln!("    -e NAME, -e=NAME           Select the entry point to invoke");
    eprintln!("    --entry-point NAME");
    eprintln!("    --entry-point=NAME");
    eprintln!();
    eprintln!("ARGUMENTS:");
    eprintln!("    BUNDLE                     Bundle file to run");
    eprintln!("    ARGS...                    Arguments passed to the entry point");
}

struct Options {
    entry_point: Option<String>,
    bundle_file: String,
    program_args: Vec<String>,
}

fn parse_args() -> Result<Options, String> {
    let args: Vec<String> = env::args().collect();

    let mut entry_point = None;
    let mut i = 1;

    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "-h" | "--help" => {
                print_usage();
                process::exit(0);
            }
            "-v" | "--version" => {
                println!("filament-run {}", VERSION);
                process::exit(0);
            }
            "-e" | "--entry-point" => {
                i += 1;
                if i >= args.len() {
                    return Err(format!("{} requires an argument", arg));
                }
                entry_point = Some(args[i].clone());
            }
            _ if arg.starts_with("-e=") => {
                entry_point = Some(arg["-e=".len()..].to_string());
            }
            _ if arg.starts_with("--entry-point=") => {
                entry_point = Some(arg["--entry-point=".len()..].to_string());
            }
            _ if arg.starts_with('-') => {
                return Err(format!("unknown option: {}", arg));
            }
            _ => break,
        }
        i += 1;
    }

    if i >= args.len() {
        return Err("missing BUNDLE argument".to_string());
    }
    let bundle_file = args[i].clone();
    let program_args = args[i + 1..].to_vec();

    Ok(Options { entry_point, bundle_file, program_args })
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let options = match parse_args() {
        Ok(options) => options,
        Err(message) => {
            eprintln!("Error: {}", message);
            eprintln!();
            print_usage();
            process::exit(1);
        }
    };

    let mut machine = Machine::new();
    let result = run_bundle(
        &mut machine,
        Path::new(&options.bundle_file),
        options.entry_point.as_deref(),
        &options.program_args,
    );

    if let Err(err) = result {
        eprintln!("Error: {}", err);
        process::exit(1);
    }
}
