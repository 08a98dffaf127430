//! Resolution and retrieval of module artifacts.
//!
//! Resolution walks the declared modules (and, for transitive modules, the
//! compile dependencies of their POMs, breadth-first with a visited set)
//! against the resolver chain, downloading jar and pom into the cache
//! layout. Retrieval copies resolved artifacts from the cache into the
//! managed-library directory according to an output pattern.

use super::{
    module::{ModuleId, Resolver, Transport},
    pom,
};
use crate::{
    error::{IoResultExt, KilnError, Result},
    logging::{Level, Log},
    utils,
};
use std::{
    collections::{BTreeSet, HashSet, VecDeque},
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use walkdir::WalkDir;

/// The resolution engine's five message severities; the console logger only
/// has four levels, so debug and verbose collapse.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageLevel {
    Debug,
    Verbose,
    Info,
    Warn,
    Error,
}

impl MessageLevel {
    pub fn to_log_level(self) -> Level {
        match self {
            MessageLevel::Debug | MessageLevel::Verbose => Level::Debug,
            MessageLevel::Info => Level::Info,
            MessageLevel::Warn => Level::Warn,
            MessageLevel::Error => Level::Error,
        }
    }
}

/// Translates engine messages onto a build logger.
pub struct MessageAdapter<'a> {
    log: &'a dyn Log,
}

impl<'a> MessageAdapter<'a> {
    pub fn new(log: &'a dyn Log) -> Self {
        MessageAdapter { log }
    }

    pub fn log(&self, level: MessageLevel, message: &str) {
        self.log.log(level.to_log_level(), message);
    }
}

#[derive(Clone, Debug)]
pub struct ResolvedArtifact {
    pub module: ModuleId,
    /// The configuration the artifact is retrieved under.
    pub configuration: String,
    pub cache_file: PathBuf,
    pub extension: String,
}

#[derive(Clone, Debug, Default)]
pub struct Resolution {
    pub artifacts: Vec<ResolvedArtifact>,
    pub problems: Vec<String>,
}

impl Resolution {
    pub fn has_errors(&self) -> bool {
        !self.problems.is_empty()
    }
}

/// Expands `[conf]`, `[artifact]`, `[revision]`, `[ext]` and `[type]`; no
/// other placeholders are recognized in output patterns.
pub fn expand_output_pattern(
    pattern: &str,
    configuration: &str,
    artifact: &str,
    revision: &str,
    extension: &str,
) -> String {
    pattern
        .replace("[conf]", configuration)
        .replace("[artifact]", artifact)
        .replace("[revision]", revision)
        .replace("[ext]", extension)
        .replace("[type]", extension)
}

fn expand_repository_pattern(pattern: &str, module: &ModuleId, extension: &str) -> String {
    pattern
        .replace("[organisation]", &module.organization)
        .replace("[organization]", &module.organization)
        .replace("[module]", &module.name)
        .replace("[artifact]", &module.name)
        .replace("[revision]", &module.revision)
        .replace("[ext]", extension)
        .replace("[type]", extension)
}

/// The configuration a dependency is retrieved under: the left side of its
/// mapping, or `compile`.
fn configuration_of(module: &ModuleId) -> String {
    match &module.configurations {
        Some(mapping) => mapping
            .split_once("->")
            .map(|(left, _)| left.trim().to_string())
            .unwrap_or_else(|| mapping.trim().to_string()),
        None => "compile".to_string(),
    }
}

pub struct ResolveEngine<'a> {
    pub resolvers: Vec<Resolver>,
    pub cache_directory: PathBuf,
    pub validate: bool,
    pub log: MessageAdapter<'a>,
}

impl ResolveEngine<'_> {
    /// Resolves all dependencies, following POM-declared compile
    /// dependencies of transitive modules. Problems accumulate rather than
    /// aborting, so one report covers everything missing.
    pub fn resolve(&self, dependencies: &[ModuleId]) -> Resolution {
        let mut resolution = Resolution::default();
        let mut visited: HashSet<(String, String, String)> = HashSet::new();
        let mut queue: VecDeque<(ModuleId, String)> = dependencies
            .iter()
            .map(|module| (module.clone(), configuration_of(module)))
            .collect();

        while let Some((module, configuration)) = queue.pop_front() {
            let key =
                (module.organization.clone(), module.name.clone(), module.revision.clone());
            if !visited.insert(key) {
                continue;
            }
            self.log.log(MessageLevel::Verbose, &format!("resolving {module}"));

            match self.fetch(&module, "jar") {
                Some(cache_file) => {
                    resolution.artifacts.push(ResolvedArtifact {
                        module: module.clone(),
                        configuration: configuration.clone(),
                        cache_file,
                        extension: "jar".to_string(),
                    });
                }
                None => {
                    resolution
                        .problems
                        .push(format!("unresolved dependency: {module}: not found"));
                    continue;
                }
            }

            if !module.is_transitive {
                continue;
            }
            if let Some(pom_file) = self.fetch(&module, "pom") {
                let parsed = utils::read_string(&pom_file).and_then(|text| {
                    pom::parse_pom(&text).or_else(|_| pom::parse_ivy(&text))
                });
                match parsed {
                    Ok((_, transitive)) => {
                        for dependency in transitive {
                            queue.push_back((dependency, configuration.clone()));
                        }
                    }
                    Err(err) if self.validate => {
                        resolution.problems.push(format!("invalid descriptor for {module}: {err}"));
                    }
                    Err(err) => {
                        self.log.log(
                            MessageLevel::Warn,
                            &format!("ignoring unreadable descriptor for {module}: {err}"),
                        );
                    }
                }
            }
        }
        resolution
    }

    fn cache_file(&self, module: &ModuleId, extension: &str) -> PathBuf {
        self.cache_directory
            .join(&module.organization)
            .join(&module.name)
            .join(&module.revision)
            .join(format!("{}-{}.{}", module.name, module.revision, extension))
    }

    /// Returns the cached file for the module artifact, downloading through
    /// the resolver chain on a miss (or always, for changing modules).
    fn fetch(&self, module: &ModuleId, extension: &str) -> Option<PathBuf> {
        let target = self.cache_file(module, extension);
        if target.exists() && !module.is_changing {
            self.log.log(MessageLevel::Debug, &format!("cache hit for {module} ({extension})"));
            return Some(target);
        }
        for resolver in &self.resolvers {
            match self.fetch_from(resolver, module, extension) {
                Ok(Some(content)) => {
                    if utils::write_bytes(&target, &content).is_ok() {
                        self.log.log(
                            MessageLevel::Info,
                            &format!("downloaded {module} ({extension}) from {}", resolver.name()),
                        );
                        return Some(target);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    self.log.log(
                        MessageLevel::Warn,
                        &format!("{}: {err}", resolver.name()),
                    );
                }
            }
        }
        if target.exists() {
            // a changing module we could not refresh still resolves
            return Some(target);
        }
        None
    }

    fn fetch_from(
        &self,
        resolver: &Resolver,
        module: &ModuleId,
        extension: &str,
    ) -> Result<Option<Vec<u8>>> {
        match resolver {
            Resolver::MavenRepository { root, .. } => {
                let mut url = root.clone();
                if !url.ends_with('/') {
                    url.push('/');
                }
                url.push_str(&format!(
                    "{}/{}/{}/{}-{}.{}",
                    module.organization.replace('.', "/"),
                    module.name,
                    module.revision,
                    module.name,
                    module.revision,
                    extension
                ));
                self.download(&url)
            }
            Resolver::PatternRepository {
                ivy_patterns,
                artifact_patterns,
                maven_compatible,
                transport,
                ..
            } => {
                // ivy-patterned repositories serve ivy descriptors where
                // maven ones serve poms
                let (patterns, extension) =
                    if extension == "pom" && !ivy_patterns.is_empty() && !maven_compatible {
                        (ivy_patterns, "xml")
                    } else {
                        (artifact_patterns, extension)
                    };
                for pattern in patterns {
                    let mut module = module.clone();
                    if *maven_compatible {
                        module.organization = module.organization.replace('.', "/");
                    }
                    let located = expand_repository_pattern(pattern, &module, extension);
                    let found = match transport {
                        None => self.download(&located)?,
                        Some(Transport::Filesystem) => {
                            let path = Path::new(&located);
                            path.exists().then(|| utils::read_bytes(path)).transpose()?
                        }
                        Some(Transport::Ssh(_)) | Some(Transport::Sftp(_)) => {
                            return Err(KilnError::msg(
                                "ssh/sftp transports require an external agent and are not \
                                 available in this resolver",
                            ));
                        }
                    };
                    if found.is_some() {
                        return Ok(found);
                    }
                }
                Ok(None)
            }
        }
    }

    fn download(&self, location: &str) -> Result<Option<Vec<u8>>> {
        if let Some(path) = location.strip_prefix("file://") {
            let path = Path::new(path);
            return path.exists().then(|| utils::read_bytes(path)).transpose();
        }
        if !location.starts_with("http://") && !location.starts_with("https://") {
            let path = Path::new(location);
            return path.exists().then(|| utils::read_bytes(path)).transpose();
        }

        let url = url::Url::parse(location)
            .map_err(|err| KilnError::msg(format!("invalid repository url {location:?}: {err}")))?;
        self.log.log(MessageLevel::Debug, &format!("trying {url}"));
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| KilnError::msg(format!("could not build http client: {err}")))?;
        let response = client
            .get(url)
            .send()
            .map_err(|err| KilnError::msg(format!("request to {location} failed: {err}")))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(KilnError::msg(format!(
                "unexpected status {} from {location}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .map_err(|err| KilnError::msg(format!("reading {location} failed: {err}")))?;
        Ok(Some(bytes.to_vec()))
    }

    /// Copies resolved artifacts into `lib_directory` per the output
    /// pattern; with `synchronize`, files not retrieved this round are
    /// deleted afterwards.
    pub fn retrieve(
        &self,
        resolution: &Resolution,
        lib_directory: &Path,
        pattern: &str,
        synchronize: bool,
        quiet: bool,
    ) -> Result<BTreeSet<PathBuf>> {
        let mut kept = BTreeSet::new();
        for artifact in &resolution.artifacts {
            let expanded = expand_output_pattern(
                pattern,
                &artifact.configuration,
                &artifact.module.name,
                &artifact.module.revision,
                &artifact.extension,
            );
            // a leading separator in the pattern would escape the lib dir
            let destination = lib_directory.join(expanded.trim_start_matches(['/', '\\']));
            utils::create_parent_dir_all(&destination)?;
            fs::copy(&artifact.cache_file, &destination).err_path(&artifact.cache_file)?;
            if !quiet {
                self.log.log(
                    MessageLevel::Info,
                    &format!("retrieved {} to {}", artifact.module, destination.display()),
                );
            }
            kept.insert(destination);
        }

        if synchronize && lib_directory.exists() {
            let stale: Vec<PathBuf> = WalkDir::new(lib_directory)
                .into_iter()
                .filter_map(std::result::Result::ok)
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.path().to_path_buf())
                .filter(|path| !kept.contains(path))
                .collect();
            for path in stale {
                if !quiet {
                    self.log.log(
                        MessageLevel::Verbose,
                        &format!("deleting unmanaged {}", path.display()),
                    );
                }
                fs::remove_file(&path).err_path(&path)?;
            }
        }
        Ok(kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::RecordedLogger;

    #[test]
    fn output_pattern_expansion() {
        assert_eq!(
            expand_output_pattern("[conf]/[artifact]-[revision].[ext]", "compile", "foo", "1.0", "jar"),
            "compile/foo-1.0.jar"
        );
        // unknown placeholders pass through untouched
        assert_eq!(
            expand_output_pattern("[unknown]/[artifact].[ext]", "c", "a", "r", "jar"),
            "[unknown]/a.jar"
        );
    }

    #[test]
    fn configuration_comes_from_the_mapping_left_side() {
        let plain = ModuleId::new("o", "n", "1");
        assert_eq!(configuration_of(&plain), "compile");
        assert_eq!(configuration_of(&plain.clone().in_configurations("test->default")), "test");
        assert_eq!(configuration_of(&plain.in_configurations("runtime")), "runtime");
    }

    fn filesystem_repository(root: &Path) -> Resolver {
        let pattern = format!(
            "{}/[organisation]/[module]/[revision]/[artifact]-[revision].[ext]",
            root.display()
        );
        Resolver::PatternRepository {
            name: "local-test".to_string(),
            ivy_patterns: vec![],
            artifact_patterns: vec![pattern],
            maven_compatible: false,
            transport: Some(Transport::Filesystem),
        }
    }

    fn publish(root: &Path, module: &ModuleId, extension: &str, content: &[u8]) {
        let file = root
            .join(&module.organization)
            .join(&module.name)
            .join(&module.revision)
            .join(format!("{}-{}.{}", module.name, module.revision, extension));
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(file, content).unwrap();
    }

    #[test]
    fn resolve_and_retrieve_from_a_filesystem_repository() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        let module = ModuleId::new("org", "foo", "1.0");
        publish(&repo, &module, "jar", b"jarbytes");
        publish(&repo, &module, "pom", pom_xml_for(&module).as_bytes());

        let log = RecordedLogger::new();
        let engine = ResolveEngine {
            resolvers: vec![filesystem_repository(&repo)],
            cache_directory: dir.path().join("cache"),
            validate: true,
            log: MessageAdapter::new(&log),
        };

        let resolution = engine.resolve(&[module.clone()]);
        assert!(!resolution.has_errors(), "{:?}", resolution.problems);
        assert_eq!(resolution.artifacts.len(), 1);
        assert!(resolution.artifacts[0].cache_file.exists());

        let lib = dir.path().join("lib_managed");
        // plant a stale file that synchronize must remove
        fs::create_dir_all(lib.join("compile")).unwrap();
        fs::write(lib.join("compile/stale-0.9.jar"), b"old").unwrap();

        let kept = engine
            .retrieve(&resolution, &lib, "[conf]/[artifact]-[revision].[ext]", true, true)
            .unwrap();
        let expected = lib.join("compile/foo-1.0.jar");
        assert!(kept.contains(&expected));
        assert!(expected.exists());
        assert!(fs::metadata(&expected).unwrap().len() > 0);
        assert!(!lib.join("compile/stale-0.9.jar").exists());
    }

    #[test]
    fn transitive_dependencies_follow_the_pom() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        let root_module = ModuleId::new("org", "root", "1.0");
        let dependency = ModuleId::new("org", "leaf", "2.0");

        publish(&repo, &root_module, "jar", b"root");
        publish(&repo, &root_module, "pom", pom::pom_xml(&root_module, &[dependency.clone()]).as_bytes());
        publish(&repo, &dependency, "jar", b"leaf");
        publish(&repo, &dependency, "pom", pom_xml_for(&dependency).as_bytes());

        let log = RecordedLogger::new();
        let engine = ResolveEngine {
            resolvers: vec![filesystem_repository(&repo)],
            cache_directory: dir.path().join("cache"),
            validate: true,
            log: MessageAdapter::new(&log),
        };

        let resolution = engine.resolve(&[root_module]);
        assert!(!resolution.has_errors(), "{:?}", resolution.problems);
        let names: Vec<&str> =
            resolution.artifacts.iter().map(|a| a.module.name.as_str()).collect();
        assert_eq!(names, vec!["root", "leaf"]);
    }

    #[test]
    fn missing_modules_accumulate_problems() {
        let dir = tempfile::tempdir().unwrap();
        let log = RecordedLogger::new();
        let engine = ResolveEngine {
            resolvers: vec![filesystem_repository(&dir.path().join("empty"))],
            cache_directory: dir.path().join("cache"),
            validate: false,
            log: MessageAdapter::new(&log),
        };

        let resolution = engine
            .resolve(&[ModuleId::new("a", "one", "1"), ModuleId::new("b", "two", "2")]);
        assert!(resolution.has_errors());
        assert_eq!(resolution.problems.len(), 2);
        assert!(resolution.problems[0].contains("a:one:1"));
    }

    fn pom_xml_for(module: &ModuleId) -> String {
        pom::pom_xml(module, &[])
    }

    #[test]
    fn severity_mapping_collapses_debug_and_verbose() {
        assert_eq!(MessageLevel::Debug.to_log_level(), Level::Debug);
        assert_eq!(MessageLevel::Verbose.to_log_level(), Level::Debug);
        assert_eq!(MessageLevel::Error.to_log_level(), Level::Error);
    }
}
