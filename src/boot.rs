//! The bootstrap launcher.
//!
//! `kiln-boot` runs before the engine: it makes sure `build.properties`
//! exists (offering to create a new project when it does not), resolves the
//! configured Scala runtime and engine versions into `project/boot/`, and
//! then starts the engine as a separate child process whose environment
//! points at the resolved runtime. Running the engine out-of-process keeps
//! the launcher's own libraries invisible to the build. The `reboot`
//! argument splits a batch into groups; versions are re-read between
//! groups, so a build can upgrade its own runtime mid-session.

use crate::{
    error::{KilnError, Result},
    logging::Log,
    manage::{self, IvyConfiguration, Manager, ModuleId, UpdateConfiguration},
    properties::{self, PropertyStore},
};
use std::{
    io::{IsTerminal, Write},
    path::{Path, PathBuf},
    process::Command,
};

pub const SCALA_ORGANIZATION: &str = "org.scala-lang";
pub const ENGINE_ORGANIZATION: &str = "org.kiln";
pub const ENGINE_NAME: &str = "kiln";

/// The launcher-level sentinel separating batches.
pub const REBOOT: &str = "reboot";

/// Splits the argument list into contiguous groups at `reboot`; an empty
/// argument list is one (interactive) group.
pub fn argument_groups(args: &[String]) -> Vec<Vec<String>> {
    let mut groups: Vec<Vec<String>> = vec![Vec::new()];
    for arg in args {
        if arg == REBOOT {
            groups.push(Vec::new());
        } else if let Some(last) = groups.last_mut() {
            last.push(arg.clone());
        }
    }
    groups.retain(|group| !group.is_empty());
    if groups.is_empty() {
        groups.push(Vec::new());
    }
    groups
}

/// Boot cache layout: `project/boot/scala-<runtime>/{lib, kiln-<engine>}`.
pub fn boot_directories(
    project_directory: &Path,
    scala_version: &str,
    engine_version: &str,
) -> (PathBuf, PathBuf, PathBuf) {
    let scala_directory = project_directory
        .join("project")
        .join("boot")
        .join(format!("scala-{scala_version}"));
    let lib = scala_directory.join("lib");
    let engine = scala_directory.join(format!("kiln-{engine_version}"));
    (scala_directory, lib, engine)
}

/// Runs every argument group through a fresh engine launch. Stops at the
/// first nonzero exit.
pub fn launch(project_directory: &Path, args: &[String], log: &dyn Log) -> Result<i32> {
    for group in argument_groups(args) {
        let code = launch_once(project_directory, &group, log)?;
        if code != 0 {
            return Ok(code);
        }
    }
    Ok(0)
}

fn launch_once(project_directory: &Path, args: &[String], log: &dyn Log) -> Result<i32> {
    let properties_file = project_directory.join("project").join("build.properties");
    if !properties_file.exists() {
        create_project(&properties_file)?;
    }

    // versions are read fresh on every cycle so a `reboot` sees upgrades
    let mut store = PropertyStore::load(&properties_file)?;
    let scala_version = required_version(&mut store, properties::SCALA_VERSION)?;
    let engine_version = required_version(&mut store, properties::KILN_VERSION)?;
    store.save()?;

    let (scala_directory, lib, engine_directory) =
        boot_directories(project_directory, &scala_version, &engine_version);

    if !lib.is_dir() {
        log.info(&format!("Getting Scala {scala_version}..."));
        download(
            project_directory,
            &lib,
            &[
                ModuleId::new(SCALA_ORGANIZATION, "scala-library", &scala_version).intransitive(),
                ModuleId::new(SCALA_ORGANIZATION, "scala-compiler", &scala_version).intransitive(),
            ],
            log,
        )?;
    }
    if !engine_directory.is_dir() {
        log.info(&format!("Getting kiln {engine_version}..."));
        download(
            project_directory,
            &engine_directory,
            &[ModuleId::new(ENGINE_ORGANIZATION, ENGINE_NAME, &engine_version)],
            log,
        )?;
    }

    let engine = engine_binary()?;
    debug!(engine = %engine.display(), ?args, "launching engine");
    let status = Command::new(&engine)
        .args(args)
        .current_dir(project_directory)
        .env("SCALA_HOME", &scala_directory)
        .status()
        .map_err(|err| {
            KilnError::Setup(format!("could not start engine {}: {err}", engine.display()))
        })?;
    Ok(status.code().unwrap_or(1))
}

fn required_version(store: &mut PropertyStore, key: &str) -> Result<String> {
    if let Some(value) = store.get(key) {
        return Ok(value.to_string());
    }
    let value = properties::prompt(key)?;
    if value.is_empty() {
        return Err(KilnError::Setup(format!("property {key} is required")));
    }
    store.set(key, value.clone());
    Ok(value)
}

fn download(
    project_directory: &Path,
    into: &Path,
    modules: &[ModuleId],
    log: &dyn Log,
) -> Result<()> {
    let configuration = IvyConfiguration {
        project_root: project_directory.to_path_buf(),
        managed_library_directory: into.to_path_buf(),
        cache_directory: None,
        manager: Manager::Inline {
            module: ModuleId::new(ENGINE_ORGANIZATION, "boot", "0"),
            resolvers: Vec::new(),
            configurations: Vec::new(),
            default_configuration: None,
            dependencies: modules.to_vec(),
            fragment: None,
        },
        validate: false,
        error_if_missing_configurations: false,
    };
    let update = UpdateConfiguration {
        retrieve_pattern: "[artifact]-[revision].[ext]".to_string(),
        synchronize: false,
        quiet: true,
    };
    manage::update(&configuration, &update, log)
        .map_err(|err| KilnError::Setup(err.to_string()))
}

/// The engine binary shipped next to the launcher, overridable for tests
/// and development trees.
fn engine_binary() -> Result<PathBuf> {
    if let Some(overridden) = std::env::var_os("KILN_ENGINE") {
        return Ok(PathBuf::from(overridden));
    }
    let current = std::env::current_exe()
        .map_err(|err| KilnError::Setup(format!("could not locate the launcher: {err}")))?;
    let sibling = current
        .parent()
        .map(|directory| directory.join(ENGINE_NAME))
        .unwrap_or_else(|| PathBuf::from(ENGINE_NAME));
    Ok(sibling)
}

/// Interactively records a brand-new `build.properties`. Declining is exit
/// code 2 territory, a distinct error from setup failure.
fn create_project(properties_file: &Path) -> Result<()> {
    let stdin = std::io::stdin();
    if !stdin.is_terminal() {
        return Err(KilnError::Setup(format!(
            "{} does not exist and standard input is not a terminal",
            properties_file.display()
        )));
    }
    print!("Project does not exist, create new project? (y/N): ");
    std::io::stdout()
        .flush()
        .map_err(|err| KilnError::io(err, PathBuf::from("<stdout>")))?;
    let mut answer = String::new();
    stdin
        .read_line(&mut answer)
        .map_err(|err| KilnError::io(err, PathBuf::from("<stdin>")))?;
    if !matches!(answer.trim(), "y" | "Y" | "yes") {
        return Err(KilnError::SetupDeclined);
    }

    let mut store = PropertyStore::load(properties_file)?;
    store.set(properties::PROJECT_NAME, properties::prompt("Name")?);
    store.set(properties::PROJECT_ORGANIZATION, properties::prompt("Organization")?);
    store.set(properties::PROJECT_VERSION, properties::prompt("Version")?);
    store.set(properties::SCALA_VERSION, properties::prompt("Scala version")?);
    store.set(properties::KILN_VERSION, properties::prompt("kiln version")?);
    store.save()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn reboot_groups_contiguous_runs() {
        assert_eq!(
            argument_groups(&strings(&["update", "compile", "reboot", "test"])),
            vec![strings(&["update", "compile"]), strings(&["test"])]
        );
        assert_eq!(
            argument_groups(&strings(&["reboot", "compile"])),
            vec![strings(&["compile"])]
        );
        assert_eq!(argument_groups(&strings(&["compile"])), vec![strings(&["compile"])]);
    }

    #[test]
    fn empty_arguments_are_one_interactive_group() {
        assert_eq!(argument_groups(&[]), vec![Vec::<String>::new()]);
        assert_eq!(argument_groups(&strings(&["reboot"])), vec![Vec::<String>::new()]);
    }

    #[test]
    fn boot_layout() {
        let (scala, lib, engine) =
            boot_directories(Path::new("/work/demo"), "2.7.7", "0.1.0");
        assert_eq!(scala, Path::new("/work/demo/project/boot/scala-2.7.7"));
        assert_eq!(lib, Path::new("/work/demo/project/boot/scala-2.7.7/lib"));
        assert_eq!(engine, Path::new("/work/demo/project/boot/scala-2.7.7/kiln-0.1.0"));
    }
}
