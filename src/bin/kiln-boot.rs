//! The launcher: resolves the configured runtime and engine versions into
//! `project/boot/` and hands the arguments to the engine process.

use clap::Parser;
use kiln::{
    boot,
    logging::{ConsoleLogger, Log},
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kiln-boot", version, about = "Bootstraps the kiln build tool")]
struct Cli {
    /// Engine arguments; `reboot` separates load+execute cycles.
    #[arg(trailing_var_arg = true)]
    arguments: Vec<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let log = ConsoleLogger::new();

    let directory = match std::env::current_dir() {
        Ok(directory) => directory,
        Err(err) => {
            eprintln!("could not determine the working directory: {err}");
            std::process::exit(1);
        }
    };

    match boot::launch(&directory, &cli.arguments, &log) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            log.error(&err.to_string());
            std::process::exit(err.exit_code());
        }
    }
}
