//! The dependency manager.
//!
//! Projects describe what they need declaratively (a module, resolvers,
//! configurations and dependencies, or a pom/ivy file on disk); this façade
//! turns that description into resolve and retrieve operations. The
//! underlying resolution machinery keeps process-wide state (one artifact
//! cache, one HTTP session discipline), so every entry point serializes on a
//! single process-wide lock and runs with its own isolation scope.

pub mod module;
pub mod pom;
pub mod retrieve;

pub use module::{
    check_configurations, check_resolver_chain, default_configurations, Authentication,
    Configuration, ModuleId, Resolver, Transport, MAVEN_CENTRAL_NAME, MAVEN_CENTRAL_ROOT,
};
pub use retrieve::{MessageAdapter, MessageLevel, Resolution, ResolveEngine, ResolvedArtifact};

use crate::{
    error::{KilnError, Result},
    logging::Log,
    utils,
};
use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

/// All resolver-machinery entry points hold this for their whole call.
static RESOLVER_LOCK: Mutex<()> = Mutex::new(());

/// The resolver chain built for inline declarations.
pub const REDEFINED_PUBLIC: &str = "redefined-public";

/// How the module descriptor is obtained.
#[derive(Clone, Debug)]
pub enum Manager {
    /// Prefer a `pom.xml`, then an `ivy.xml`, then nothing but the module.
    AutoDetect(ModuleId),
    Maven { settings: Option<PathBuf>, pom: PathBuf },
    Ivy { settings: Option<PathBuf>, dependencies: PathBuf },
    Inline {
        module: ModuleId,
        resolvers: Vec<Resolver>,
        configurations: Vec<Configuration>,
        default_configuration: Option<String>,
        dependencies: Vec<ModuleId>,
        /// Raw ivy `<dependencies>` fragment merged into the declarations.
        fragment: Option<String>,
    },
}

#[derive(Clone, Debug)]
pub struct IvyConfiguration {
    pub project_root: PathBuf,
    pub managed_library_directory: PathBuf,
    /// Overrides the per-user artifact cache.
    pub cache_directory: Option<PathBuf>,
    pub manager: Manager,
    pub validate: bool,
    pub error_if_missing_configurations: bool,
}

#[derive(Clone, Debug)]
pub struct UpdateConfiguration {
    /// Placeholders: `[conf]`, `[artifact]`, `[revision]`, `[ext]`.
    pub retrieve_pattern: String,
    /// Delete files under the managed directory that were not retrieved.
    pub synchronize: bool,
    pub quiet: bool,
}

impl Default for UpdateConfiguration {
    fn default() -> Self {
        UpdateConfiguration {
            retrieve_pattern: "[conf]/[artifact]-[revision].[ext]".to_string(),
            synchronize: true,
            quiet: false,
        }
    }
}

pub fn default_cache_directory() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".kiln").join("cache"))
        .unwrap_or_else(|| PathBuf::from(".kiln-cache"))
}

struct Descriptor {
    module: ModuleId,
    dependencies: Vec<ModuleId>,
    resolvers: Vec<Resolver>,
    configurations: Vec<Configuration>,
}

/// Resolves and retrieves the project's managed dependencies.
pub fn update(
    configuration: &IvyConfiguration,
    update: &UpdateConfiguration,
    log: &dyn Log,
) -> Result<()> {
    let _isolation = RESOLVER_LOCK.lock().unwrap();
    let descriptor = select_descriptor(configuration, log)?;

    let configurations = check_configurations(&descriptor.configurations)?;
    if configurations.is_empty() && configuration.error_if_missing_configurations {
        return Err(KilnError::resolution(["no configurations defined".to_string()]));
    }
    check_resolver_chain(&descriptor.resolvers)?;

    let engine = ResolveEngine {
        resolvers: descriptor.resolvers,
        cache_directory: configuration
            .cache_directory
            .clone()
            .unwrap_or_else(default_cache_directory),
        validate: configuration.validate,
        log: MessageAdapter::new(log),
    };

    let resolution = engine.resolve(&descriptor.dependencies);
    if resolution.has_errors() {
        return Err(KilnError::resolution(resolution.problems.clone()));
    }
    engine.retrieve(
        &resolution,
        &configuration.managed_library_directory,
        &update.retrieve_pattern,
        update.synchronize,
        update.quiet,
    )?;
    Ok(())
}

/// Writes a `pom.xml` describing the module and its declared dependencies.
pub fn make_pom(configuration: &IvyConfiguration, output: &Path, log: &dyn Log) -> Result<()> {
    let _isolation = RESOLVER_LOCK.lock().unwrap();
    let descriptor = select_descriptor(configuration, log)?;
    utils::write_string(output, &pom::pom_xml(&descriptor.module, &descriptor.dependencies))
}

fn select_descriptor(configuration: &IvyConfiguration, log: &dyn Log) -> Result<Descriptor> {
    match &configuration.manager {
        Manager::Maven { settings, pom: pom_file } => {
            note_ignored_settings(settings, log);
            let text = utils::read_string(pom_file)?;
            let (module, dependencies) = pom::parse_pom(&text)?;
            let module = module.ok_or_else(|| {
                KilnError::resolution([format!(
                    "{} does not identify its module",
                    pom_file.display()
                )])
            })?;
            Ok(Descriptor {
                module,
                dependencies,
                resolvers: vec![Resolver::maven_central()],
                configurations: default_configurations(),
            })
        }
        Manager::Ivy { settings, dependencies } => {
            note_ignored_settings(settings, log);
            let text = utils::read_string(dependencies)?;
            let (module, declared) = pom::parse_ivy(&text)?;
            Ok(Descriptor {
                module: module.unwrap_or_else(|| ModuleId::new("default", "project", "working")),
                dependencies: declared,
                resolvers: vec![Resolver::maven_central()],
                configurations: default_configurations(),
            })
        }
        Manager::Inline {
            module,
            resolvers,
            configurations,
            default_configuration,
            dependencies,
            fragment,
        } => {
            let mut declared = dependencies.clone();
            if let Some(fragment) = fragment {
                declared.extend(pom::parse_dependency_fragment(module, fragment)?);
            }
            if let Some(default) = default_configuration {
                for dependency in &mut declared {
                    if dependency.configurations.is_none() {
                        dependency.configurations = Some(default.clone());
                    }
                }
            }
            let resolvers = if resolvers.is_empty() {
                vec![Resolver::maven_central()]
            } else {
                // declared resolvers first, the canonical release
                // repository last, as one chain
                log.debug(&format!("building resolver chain {REDEFINED_PUBLIC}"));
                let mut chain = resolvers.clone();
                if !chain.iter().any(|r| r.name() == MAVEN_CENTRAL_NAME) {
                    chain.push(Resolver::maven_central());
                }
                chain
            };
            let configurations = if configurations.is_empty() {
                default_configurations()
            } else {
                configurations.clone()
            };
            Ok(Descriptor {
                module: module.clone(),
                dependencies: declared,
                resolvers,
                configurations,
            })
        }
        Manager::AutoDetect(module) => {
            let pom_file = configuration.project_root.join("pom.xml");
            if pom_file.exists() {
                return select_descriptor(
                    &IvyConfiguration {
                        manager: Manager::Maven { settings: None, pom: pom_file },
                        ..configuration.clone()
                    },
                    log,
                );
            }
            let ivy_file = configuration.project_root.join("ivy.xml");
            if ivy_file.exists() {
                return select_descriptor(
                    &IvyConfiguration {
                        manager: Manager::Ivy { settings: None, dependencies: ivy_file },
                        ..configuration.clone()
                    },
                    log,
                );
            }
            Ok(Descriptor {
                module: module.clone(),
                dependencies: Vec::new(),
                resolvers: vec![Resolver::maven_central()],
                configurations: default_configurations(),
            })
        }
    }
}

// full ivy settings parsing is intentionally out of the façade's scope
fn note_ignored_settings(settings: &Option<PathBuf>, log: &dyn Log) {
    if let Some(settings) = settings {
        log.warn(&format!(
            "settings file {} is not interpreted; using the configured resolver chain",
            settings.display()
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::RecordedLogger;
    use std::fs;

    fn inline_manager(module: ModuleId, dependencies: Vec<ModuleId>) -> Manager {
        Manager::Inline {
            module,
            resolvers: Vec::new(),
            configurations: Vec::new(),
            default_configuration: None,
            dependencies,
            fragment: None,
        }
    }

    #[test]
    fn inline_defaults_to_the_canonical_repository() {
        let log = RecordedLogger::new();
        let configuration = IvyConfiguration {
            project_root: PathBuf::from("/tmp/project"),
            managed_library_directory: PathBuf::from("/tmp/project/lib_managed"),
            cache_directory: None,
            manager: inline_manager(ModuleId::new("org", "app", "1.0"), Vec::new()),
            validate: false,
            error_if_missing_configurations: false,
        };
        let descriptor = select_descriptor(&configuration, &log).unwrap();
        assert_eq!(descriptor.resolvers, vec![Resolver::maven_central()]);
        assert_eq!(descriptor.configurations.len(), 3);
    }

    #[test]
    fn inline_chain_appends_the_canonical_repository_last() {
        let log = RecordedLogger::new();
        let own = Resolver::MavenRepository {
            name: "corporate".to_string(),
            root: "https://repo.example/".to_string(),
        };
        let configuration = IvyConfiguration {
            project_root: PathBuf::from("/tmp/project"),
            managed_library_directory: PathBuf::from("/tmp/project/lib_managed"),
            cache_directory: None,
            manager: Manager::Inline {
                module: ModuleId::new("org", "app", "1.0"),
                resolvers: vec![own.clone()],
                configurations: Vec::new(),
                default_configuration: Some("test".to_string()),
                dependencies: vec![ModuleId::new("junit", "junit", "4.5")],
                fragment: None,
            },
            validate: false,
            error_if_missing_configurations: false,
        };
        let descriptor = select_descriptor(&configuration, &log).unwrap();
        assert_eq!(descriptor.resolvers.first(), Some(&own));
        assert_eq!(descriptor.resolvers.last(), Some(&Resolver::maven_central()));
        assert_eq!(
            descriptor.dependencies[0].configurations.as_deref(),
            Some("test"),
            "default configuration applies to unmapped dependencies"
        );
    }

    #[test]
    fn autodetect_prefers_an_on_disk_pom() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("pom.xml"),
            pom::pom_xml(&ModuleId::new("g", "a", "1"), &[ModuleId::new("x", "y", "2")]),
        )
        .unwrap();

        let log = RecordedLogger::new();
        let configuration = IvyConfiguration {
            project_root: dir.path().to_path_buf(),
            managed_library_directory: dir.path().join("lib_managed"),
            cache_directory: None,
            manager: Manager::AutoDetect(ModuleId::new("org", "app", "1.0")),
            validate: false,
            error_if_missing_configurations: false,
        };
        let descriptor = select_descriptor(&configuration, &log).unwrap();
        assert_eq!(descriptor.module, ModuleId::new("g", "a", "1"));
        assert_eq!(descriptor.dependencies, vec![ModuleId::new("x", "y", "2")]);
    }

    #[test]
    fn make_pom_writes_the_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let log = RecordedLogger::new();
        let configuration = IvyConfiguration {
            project_root: dir.path().to_path_buf(),
            managed_library_directory: dir.path().join("lib_managed"),
            cache_directory: None,
            manager: inline_manager(
                ModuleId::new("org.example", "app", "0.1"),
                vec![ModuleId::new("junit", "junit", "4.5")],
            ),
            validate: false,
            error_if_missing_configurations: false,
        };
        let output = dir.path().join("target/app.pom");
        make_pom(&configuration, &output, &log).unwrap();
        let (module, dependencies) = pom::parse_pom(&fs::read_to_string(&output).unwrap()).unwrap();
        assert_eq!(module, Some(ModuleId::new("org.example", "app", "0.1")));
        assert_eq!(dependencies.len(), 1);
    }

    #[test]
    fn update_reports_deduplicated_problems() {
        let dir = tempfile::tempdir().unwrap();
        let log = RecordedLogger::new();
        let missing = ModuleId::new("org", "missing", "1.0");
        let configuration = IvyConfiguration {
            project_root: dir.path().to_path_buf(),
            managed_library_directory: dir.path().join("lib_managed"),
            cache_directory: Some(dir.path().join("cache")),
            manager: Manager::Inline {
                module: ModuleId::new("org", "app", "1.0"),
                resolvers: vec![Resolver::PatternRepository {
                    name: "empty".to_string(),
                    ivy_patterns: vec![],
                    artifact_patterns: vec![format!(
                        "{}/[module]-[revision].[ext]",
                        dir.path().join("no-repo").display()
                    )],
                    maven_compatible: false,
                    transport: Some(Transport::Filesystem),
                }],
                configurations: Vec::new(),
                default_configuration: None,
                dependencies: vec![missing.clone(), missing],
                fragment: None,
            },
            validate: false,
            error_if_missing_configurations: false,
        };
        let err = update(&configuration, &UpdateConfiguration::default(), &log).unwrap_err();
        let rendered = err.to_string();
        assert_eq!(rendered.matches("org:missing:1.0").count(), 1);
    }
}
