//! Typed project-relative paths and the on-disk project layout.
//!
//! A [`ProjectPath`] is either the project root, a base-directory marker
//! wrapping another path, or a `(parent, component)` pair. Components are
//! validated at construction so a path can always be rendered both as the
//! underlying OS file and as a relative path against the nearest base
//! directory (or the project root when no marker is present).

use crate::error::{KilnError, Result};
use std::{
    fmt,
    hash::{Hash, Hasher},
    path::{Path, PathBuf, MAIN_SEPARATOR},
    sync::Arc,
    time::UNIX_EPOCH,
};

/// A path within a project.
///
/// Paths have value equality by underlying file, so the same file reached
/// through different base markers compares equal.
#[derive(Clone)]
pub struct ProjectPath(Arc<Inner>);

struct Inner {
    kind: Kind,
    file: PathBuf,
}

enum Kind {
    Root,
    Base(ProjectPath),
    Child { parent: ProjectPath, component: String },
}

impl ProjectPath {
    /// The root of a project, from its (absolute) directory.
    pub fn root(directory: impl Into<PathBuf>) -> Self {
        ProjectPath(Arc::new(Inner { kind: Kind::Root, file: directory.into() }))
    }

    /// Marks this path as a base directory: relative paths of descendents are
    /// computed against it instead of the project root.
    pub fn as_base(&self) -> Self {
        ProjectPath(Arc::new(Inner {
            kind: Kind::Base(self.clone()),
            file: self.0.file.clone(),
        }))
    }

    /// Appends a single component, rejecting empty components, separators and
    /// the `.`/`..` references.
    pub fn join(&self, component: impl Into<String>) -> Result<Self> {
        let component = component.into();
        check_component(&component)?;
        let file = self.0.file.join(&component);
        Ok(ProjectPath(Arc::new(Inner {
            kind: Kind::Child { parent: self.clone(), component },
            file,
        })))
    }

    /// Appends each component of `relative` in turn.
    pub fn resolve(&self, relative: &Path) -> Result<Self> {
        let mut current = self.clone();
        for component in relative.iter() {
            let component = component
                .to_str()
                .ok_or_else(|| KilnError::msg(format!("invalid path component in {relative:?}")))?;
            current = current.join(component)?;
        }
        Ok(current)
    }

    /// The underlying OS file.
    pub fn as_file(&self) -> &Path {
        &self.0.file
    }

    /// The path relative to the nearest base-directory marker, or to the
    /// project root when the ancestry carries no marker.
    pub fn relative_path(&self) -> PathBuf {
        let mut components = Vec::new();
        collect_components(self, &mut components);
        components.iter().rev().collect()
    }

    /// Modification time in milliseconds since the epoch, `0` when the file
    /// does not exist.
    pub fn last_modified(&self) -> u64 {
        self.0
            .file
            .metadata()
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0)
    }

    pub fn exists(&self) -> bool {
        self.0.file.exists()
    }

    pub fn is_directory(&self) -> bool {
        self.0.file.is_dir()
    }

    /// The final component, or `None` for the root and bare base markers.
    pub fn name(&self) -> Option<&str> {
        match &self.0.kind {
            Kind::Child { component, .. } => Some(component),
            Kind::Base(wrapped) => wrapped.name(),
            Kind::Root => None,
        }
    }
}

fn collect_components(path: &ProjectPath, into: &mut Vec<String>) {
    if let Kind::Child { parent, component } = &path.0.kind {
        into.push(component.clone());
        collect_components(parent, into);
    }
}

fn check_component(component: &str) -> Result<()> {
    if component.is_empty() {
        return Err(KilnError::msg("path component may not be empty"));
    }
    if component == "." || component == ".." {
        return Err(KilnError::msg(format!("path component may not be \"{component}\"")));
    }
    if component.contains('/') || component.contains('\\') || component.contains(MAIN_SEPARATOR) {
        return Err(KilnError::msg(format!(
            "path component \"{component}\" may not contain a separator"
        )));
    }
    Ok(())
}

impl PartialEq for ProjectPath {
    fn eq(&self, other: &Self) -> bool {
        self.0.file == other.0.file
    }
}

impl Eq for ProjectPath {}

impl PartialOrd for ProjectPath {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProjectPath {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.file.cmp(&other.0.file)
    }
}

impl Hash for ProjectPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.file.hash(state)
    }
}

impl fmt::Display for ProjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let relative = self.relative_path();
        if relative.as_os_str().is_empty() {
            f.write_str(".")
        } else {
            write!(f, "{}", relative.display())
        }
    }
}

impl fmt::Debug for ProjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProjectPath({})", self.0.file.display())
    }
}

/// Where everything lives on disk, relative to the project root.
///
/// ```text
/// project/{build.properties, build/, boot/}
/// src/{main,test}/{scala,java,resources}/
/// lib/  lib_managed/<configuration>/
/// target/{classes, test-classes, analysis, test-analysis, doc}
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProjectLayout {
    pub root: PathBuf,
    pub project: PathBuf,
    pub properties: PathBuf,
    pub definition_sources: PathBuf,
    pub boot: PathBuf,
    pub output: PathBuf,
    pub main_classes: PathBuf,
    pub test_classes: PathBuf,
    pub main_analysis: PathBuf,
    pub test_analysis: PathBuf,
    pub doc: PathBuf,
    pub main_scala_sources: PathBuf,
    pub main_java_sources: PathBuf,
    pub main_resources: PathBuf,
    pub test_scala_sources: PathBuf,
    pub test_java_sources: PathBuf,
    pub test_resources: PathBuf,
    pub managed_dependency: PathBuf,
    pub unmanaged_dependency: PathBuf,
}

impl ProjectLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let project = root.join("project");
        let output = root.join("target");
        let src = root.join("src");
        let main = src.join("main");
        let test = src.join("test");
        ProjectLayout {
            properties: project.join("build.properties"),
            definition_sources: project.join("build"),
            boot: project.join("boot"),
            main_classes: output.join("classes"),
            test_classes: output.join("test-classes"),
            main_analysis: output.join("analysis"),
            test_analysis: output.join("test-analysis"),
            doc: output.join("doc"),
            main_scala_sources: main.join("scala"),
            main_java_sources: main.join("java"),
            main_resources: main.join("resources"),
            test_scala_sources: test.join("scala"),
            test_java_sources: test.join("java"),
            test_resources: test.join("resources"),
            managed_dependency: root.join("lib_managed"),
            unmanaged_dependency: root.join("lib"),
            project,
            output,
            root,
        }
    }

    /// The directories two projects may never share.
    pub fn output_directories(&self) -> Vec<PathBuf> {
        vec![self.output.clone(), self.managed_dependency.clone()]
    }
}
