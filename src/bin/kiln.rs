//! The build engine entry point: batch dispatch or the interactive shell.

use clap::Parser;
use kiln::{
    console::{self, ReplOutcome},
    logging::Log,
    ProjectLoader,
};
use std::io::IsTerminal;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kiln", version, about = "Incremental build tool for Scala projects")]
struct Cli {
    /// Actions or method invocations to run; with none, an interactive
    /// shell starts.
    #[arg(trailing_var_arg = true)]
    actions: Vec<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    std::process::exit(run(&cli.actions));
}

fn run(actions: &[String]) -> i32 {
    let directory = match std::env::current_dir() {
        Ok(directory) => directory,
        Err(err) => {
            eprintln!("could not determine the working directory: {err}");
            return 1;
        }
    };

    let interactive = actions.is_empty();
    loop {
        let loader = ProjectLoader::new();
        let project = match loader.load(&directory) {
            Ok(project) => project,
            Err(err) => {
                eprintln!("{err}");
                // a broken definition is recoverable from the shell: fix
                // the sources and retry without losing the session
                if interactive && retry_load() {
                    continue;
                }
                return err.exit_code();
            }
        };

        if interactive {
            match console::interactive(&project) {
                Ok(ReplOutcome::Exit) => return 0,
                Ok(ReplOutcome::Reload) => continue,
                Err(err) => {
                    eprintln!("{err}");
                    return err.exit_code();
                }
            }
        }

        for action in actions {
            if let Err(err) = console::dispatch(&project, action) {
                let log = project.log();
                log.error(&err.to_string());
                log.trace_err(&err);
                return err.exit_code();
            }
        }
        return 0;
    }
}

fn retry_load() -> bool {
    let stdin = std::io::stdin();
    if !stdin.is_terminal() {
        return false;
    }
    eprint!("Failed to load the project; retry? (y/N): ");
    let mut answer = String::new();
    if stdin.read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "y" | "Y" | "yes")
}
