//! gitql command-line interface: a REPL or one-shot runner over the engine.

use std::process::ExitCode;
use std::sync::Arc;

use gitql::db::{Engine, EngineConfig, Repl};

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let mut config = EngineConfig::new();
    let mut execute: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-d" | "--directories" => {
                i += 1;
                if i < args.len() {
                    config.directories.push(args[i].clone());
                }
            }
            "--db" => {
                i += 1;
                if i < args.len() {
                    config.database_name = args[i].clone();
                }
            }
            "-e" | "--execute" => {
                i += 1;
                if i < args.len() {
                    execute = Some(args[i].clone());
                }
            }
            "-i" | "--index" => {
                i += 1;
                if i < args.len() {
                    config.index_dir = args[i].clone().into();
                }
            }
            "--cache" => {
                i += 1;
                if i < args.len() {
                    config.cache_size_mib = args[i].parse().unwrap_or(512);
                }
            }
            "--parallelism" => {
                i += 1;
                if i < args.len() {
                    config.parallelism = args[i].parse().unwrap_or(0);
                }
            }
            "--no-squash" => config.disable_squash = true,
            "--skip-git-errors" => config.skip_git_errors = true,
            "-r" | "--readonly" => config.read_only = true,
            "--log-level" => {
                i += 1;
                if i < args.len() {
                    config.log_level = args[i].clone();
                }
            }
            "-h" | "--help" => {
                print_help();
                return ExitCode::SUCCESS;
            }
            "--version" => {
                println!("gitql {}", env!("CARGO_PKG_VERSION"));
                return ExitCode::SUCCESS;
            }
            arg => {
                if !arg.starts_with('-') {
                    config.directories.push(arg.to_string());
                } else {
                    eprintln!("Unknown option: {}", arg);
                    return ExitCode::FAILURE;
                }
            }
        }
        i += 1;
    }

    init_logging(&config.log_level);

    if config.directories.is_empty() {
        eprintln!("No repository directories given; use -d <path>.");
        return ExitCode::FAILURE;
    }

    let engine = match Engine::new(config) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Error starting engine: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match execute {
        Some(sql) => {
            let session = Arc::new(engine.session());
            match engine.query(&session, &sql) {
                Ok(result) => {
                    if !result.columns.is_empty() {
                        println!("{}", result.columns.join("\t"));
                        for row in &result.rows {
                            let values: Vec<String> =
                                row.iter().map(|v| v.to_string()).collect();
                            println!("{}", values.join("\t"));
                        }
                    }
                    session.close();
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
        None => match Repl::new(engine).run() {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error: {}", e);
                ExitCode::FAILURE
            }
        },
    }
}

fn init_logging(level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("gitql={}", level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_help() {
    println!("gitql - SQL over git repositories");
    println!();
    println!("Usage: gitql [OPTIONS] [DIRECTORY...]");
    println!();
    println!("Options:");
    println!("  -d, --directories PATH  Directory with git repositories (repeatable)");
    println!("      --db NAME           Database name (default: gitql)");
    println!("  -e, --execute SQL       Execute SQL and exit");
    println!("  -i, --index PATH        Index storage directory");
    println!("      --cache MIB         Object cache size in MiB (default: 512)");
    println!("      --parallelism N     Partitions per scan; 0 = cores, 1 = off");
    println!("      --no-squash         Disable join squashing");
    println!("      --skip-git-errors   Skip rows from broken repositories");
    println!("  -r, --readonly          Reject index creation and deletion");
    println!("      --log-level LEVEL   error|warn|info|debug|trace (default: info)");
    println!("  -h, --help              Show this help");
    println!("      --version           Show version");
}
