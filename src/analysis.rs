//! The persisted compilation analysis.
//!
//! One analysis belongs to one compilation target (main or test) of one
//! project. It relates each source to its generated products, the sources
//! and external files it depends on, its content hash, and the test,
//! entry-point and project-definition classes discovered in it. The compile
//! conditional reads it to decide what is dirty and rewrites it through the
//! post-compile callback; persistence is the only cross-run sharing.
//!
//! On disk the analysis is a directory of labelled, line-oriented files, one
//! per map: a header line with a descriptive label, then one tab-separated
//! record per key with its set of values. Keys and project-internal values
//! are stored relative to the project root; external keys are canonical
//! absolute paths.

use crate::{
    error::{KilnError, Result},
    utils,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
};

pub const DEPENDENCIES_FILE: &str = "dependencies";
pub const PRODUCTS_FILE: &str = "generated_files";
pub const EXTERNAL_FILE: &str = "external";
pub const HASHES_FILE: &str = "hashes";
pub const TESTS_FILE: &str = "tests";
pub const APPLICATIONS_FILE: &str = "applications";
pub const PROJECTS_FILE: &str = "projects";

/// A concrete class whose supertype was in the requested search list.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TestDefinition {
    pub class_name: String,
    pub super_class_name: String,
    /// Whether the declaration is a module (singleton object) rather than an
    /// ordinary class.
    pub is_module: bool,
}

impl TestDefinition {
    fn render(&self) -> String {
        let kind = if self.is_module { "module" } else { "class" };
        format!("{} {} {}", self.class_name, self.super_class_name, kind)
    }

    fn parse(record: &str) -> Result<TestDefinition> {
        let mut parts = record.split(' ');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(class), Some(superclass), Some(kind), None) => Ok(TestDefinition {
                class_name: class.to_string(),
                super_class_name: superclass.to_string(),
                is_module: kind == "module",
            }),
            _ => Err(KilnError::msg(format!("malformed test definition record {record:?}"))),
        }
    }
}

/// In-memory analysis maps plus where they persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analysis {
    root: PathBuf,
    directory: PathBuf,
    source_dependencies: BTreeMap<PathBuf, BTreeSet<PathBuf>>,
    products: BTreeMap<PathBuf, BTreeSet<PathBuf>>,
    external_dependencies: BTreeMap<PathBuf, BTreeSet<PathBuf>>,
    hashes: BTreeMap<PathBuf, String>,
    tests: BTreeMap<PathBuf, BTreeSet<TestDefinition>>,
    applications: BTreeMap<PathBuf, BTreeSet<String>>,
    project_definitions: BTreeMap<PathBuf, BTreeSet<String>>,
}

impl Analysis {
    /// An empty analysis rooted at `root`, persisted under `directory`.
    pub fn new(root: impl Into<PathBuf>, directory: impl Into<PathBuf>) -> Analysis {
        Analysis {
            root: utils::canonicalized(root.into()),
            directory: directory.into(),
            source_dependencies: BTreeMap::new(),
            products: BTreeMap::new(),
            external_dependencies: BTreeMap::new(),
            hashes: BTreeMap::new(),
            tests: BTreeMap::new(),
            applications: BTreeMap::new(),
            project_definitions: BTreeMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Maps an absolute path under the project root to its stored relative
    /// form; paths outside the root are rejected.
    pub fn relativize(&self, path: &Path) -> Result<PathBuf> {
        if path.is_relative() {
            return Ok(path.to_path_buf());
        }
        utils::relativize(&self.root, path).ok_or_else(|| {
            KilnError::Compile(format!(
                "path {} is outside the project root {}",
                path.display(),
                self.root.display()
            ))
        })
    }

    fn absolute(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }

    // -- insertion ---------------------------------------------------------

    /// Records that `from` depends on `on`; self-loops are dropped.
    pub fn add_source_dependency(&mut self, on: &Path, from: &Path) -> Result<()> {
        let on = self.relativize(on)?;
        let from = self.relativize(from)?;
        if on != from {
            self.source_dependencies.entry(from).or_default().insert(on);
        }
        Ok(())
    }

    /// Records that `from` depends on the external file `on_file` (a class
    /// file or jar outside the project).
    pub fn add_external_dependency(&mut self, on_file: &Path, from: &Path) -> Result<()> {
        let from = self.relativize(from)?;
        self.external_dependencies
            .entry(utils::canonicalized(on_file))
            .or_default()
            .insert(from);
        Ok(())
    }

    pub fn add_product(&mut self, source: &Path, product: &Path) -> Result<()> {
        let source = self.relativize(source)?;
        let product = self.relativize(product)?;
        self.products.entry(source).or_default().insert(product);
        Ok(())
    }

    /// Ensures `source` is tracked even when it depends on nothing.
    pub fn add_source(&mut self, source: &Path) -> Result<()> {
        let source = self.relativize(source)?;
        self.source_dependencies.entry(source).or_default();
        Ok(())
    }

    pub fn add_test(&mut self, source: &Path, definition: TestDefinition) -> Result<()> {
        let source = self.relativize(source)?;
        self.tests.entry(source).or_default().insert(definition);
        Ok(())
    }

    pub fn add_application(&mut self, source: &Path, class_name: &str) -> Result<()> {
        let source = self.relativize(source)?;
        self.applications.entry(source).or_default().insert(class_name.to_string());
        Ok(())
    }

    pub fn add_project_definition(&mut self, source: &Path, class_name: &str) -> Result<()> {
        let source = self.relativize(source)?;
        self.project_definitions.entry(source).or_default().insert(class_name.to_string());
        Ok(())
    }

    pub fn set_hash(&mut self, source: &Path, hash: String) -> Result<()> {
        let source = self.relativize(source)?;
        self.hashes.insert(source, hash);
        Ok(())
    }

    // -- removal -----------------------------------------------------------

    /// Deletes the source's products from disk (best effort) and forgets the
    /// source in every per-source map.
    pub fn remove_source(&mut self, source: &Path) -> Result<()> {
        let source = self.relativize(source)?;
        if let Some(products) = self.products.remove(&source) {
            for product in products {
                let file = self.absolute(&product);
                let _ = fs::remove_file(&file);
            }
        }
        self.source_dependencies.remove(&source);
        self.tests.remove(&source);
        self.applications.remove(&source);
        self.project_definitions.remove(&source);
        self.hashes.remove(&source);
        Ok(())
    }

    /// Removes `source` from its own dependency set.
    pub fn remove_self_dependency(&mut self, source: &Path) -> Result<()> {
        let source = self.relativize(source)?;
        if let Some(dependencies) = self.source_dependencies.get_mut(&source) {
            dependencies.remove(&source);
        }
        Ok(())
    }

    /// Removes `source` from every value set across the per-source-set maps,
    /// both source and external.
    pub fn remove_dependent(&mut self, source: &Path) -> Result<()> {
        let source = self.relativize(source)?;
        for dependencies in self.source_dependencies.values_mut() {
            dependencies.remove(&source);
        }
        for dependents in self.external_dependencies.values_mut() {
            dependents.remove(&source);
        }
        Ok(())
    }

    pub fn remove_dependencies(&mut self, source: &Path) -> Result<()> {
        let source = self.relativize(source)?;
        self.source_dependencies.remove(&source);
        Ok(())
    }

    pub fn remove_external_dependency(&mut self, external: &Path) {
        self.external_dependencies.remove(&utils::canonicalized(external));
    }

    pub fn clear_hash(&mut self, source: &Path) -> Result<()> {
        let source = self.relativize(source)?;
        self.hashes.remove(&source);
        Ok(())
    }

    pub fn clear_hashes(&mut self) {
        self.hashes.clear();
    }

    // -- queries -----------------------------------------------------------

    /// All tracked sources, relative to the project root.
    pub fn sources(&self) -> impl Iterator<Item = &PathBuf> {
        self.source_dependencies.keys()
    }

    pub fn is_tracked(&self, source: &Path) -> bool {
        self.relativize(source)
            .map(|source| self.source_dependencies.contains_key(&source))
            .unwrap_or(false)
    }

    pub fn dependencies_of(&self, source: &Path) -> BTreeSet<PathBuf> {
        self.relativize(source)
            .ok()
            .and_then(|source| self.source_dependencies.get(&source).cloned())
            .unwrap_or_default()
    }

    pub fn products_of(&self, source: &Path) -> BTreeSet<PathBuf> {
        self.relativize(source)
            .ok()
            .and_then(|source| self.products.get(&source).cloned())
            .unwrap_or_default()
    }

    /// Absolute paths of the source's products.
    pub fn product_files(&self, source: &Path) -> Vec<PathBuf> {
        self.products_of(source).iter().map(|product| self.absolute(product)).collect()
    }

    pub fn hash(&self, source: &Path) -> Option<&str> {
        self.relativize(source)
            .ok()
            .and_then(|source| self.hashes.get(&source))
            .map(String::as_str)
    }

    /// External files and the sources depending on them.
    pub fn external_dependencies(&self) -> impl Iterator<Item = (&PathBuf, &BTreeSet<PathBuf>)> {
        self.external_dependencies.iter()
    }

    pub fn tests(&self) -> impl Iterator<Item = (&PathBuf, &BTreeSet<TestDefinition>)> {
        self.tests.iter()
    }

    pub fn all_test_definitions(&self) -> Vec<TestDefinition> {
        self.tests.values().flatten().cloned().collect()
    }

    pub fn applications(&self) -> impl Iterator<Item = (&PathBuf, &BTreeSet<String>)> {
        self.applications.iter()
    }

    pub fn application_classes(&self) -> Vec<String> {
        self.applications.values().flatten().cloned().collect()
    }

    pub fn project_definition_classes(&self) -> Vec<String> {
        self.project_definitions.values().flatten().cloned().collect()
    }

    // -- persistence -------------------------------------------------------

    /// Writes every map file in turn, each atomically.
    pub fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.directory)
            .map_err(|err| KilnError::io(err, self.directory.clone()))?;
        write_map(&self.directory.join(DEPENDENCIES_FILE), "Source dependencies", &self.source_dependencies, path_record)?;
        write_map(&self.directory.join(PRODUCTS_FILE), "Generated classes", &self.products, path_record)?;
        write_map(&self.directory.join(EXTERNAL_FILE), "External dependencies", &self.external_dependencies, path_record)?;
        write_scalar_map(&self.directory.join(HASHES_FILE), "Source hashes", &self.hashes)?;
        write_map(&self.directory.join(TESTS_FILE), "Test classes", &self.tests, TestDefinition::render)?;
        write_map(&self.directory.join(APPLICATIONS_FILE), "Application entry points", &self.applications, String::clone)?;
        write_map(&self.directory.join(PROJECTS_FILE), "Project definitions", &self.project_definitions, String::clone)?;
        Ok(())
    }

    /// Reads every map file; absent files default to empty maps, so a first
    /// run starts from nothing.
    pub fn load(&mut self) -> Result<()> {
        self.source_dependencies =
            read_map(&self.directory.join(DEPENDENCIES_FILE), parse_path_record)?;
        self.products = read_map(&self.directory.join(PRODUCTS_FILE), parse_path_record)?;
        self.external_dependencies =
            read_map(&self.directory.join(EXTERNAL_FILE), parse_path_record)?;
        self.hashes = read_scalar_map(&self.directory.join(HASHES_FILE))?;
        self.tests = read_map(&self.directory.join(TESTS_FILE), TestDefinition::parse)?;
        self.applications = read_map(&self.directory.join(APPLICATIONS_FILE), parse_string)?;
        self.project_definitions = read_map(&self.directory.join(PROJECTS_FILE), parse_string)?;
        Ok(())
    }

    /// Discards in-memory changes in favor of what is on disk.
    pub fn revert(&mut self) -> Result<()> {
        self.load()
    }
}

fn path_record(path: &PathBuf) -> String {
    path.display().to_string()
}

fn parse_path_record(record: &str) -> Result<PathBuf> {
    Ok(PathBuf::from(record))
}

fn parse_string(record: &str) -> Result<String> {
    Ok(record.to_string())
}

fn write_map<V: Ord>(
    path: &Path,
    label: &str,
    map: &BTreeMap<PathBuf, BTreeSet<V>>,
    render: impl Fn(&V) -> String,
) -> Result<()> {
    let mut content = String::new();
    content.push_str(label);
    content.push('\n');
    for (key, values) in map {
        content.push_str(&key.display().to_string());
        for value in values {
            content.push('\t');
            content.push_str(&render(value));
        }
        content.push('\n');
    }
    write_atomically(path, &content)
}

fn write_scalar_map(path: &Path, label: &str, map: &BTreeMap<PathBuf, String>) -> Result<()> {
    let mut content = String::new();
    content.push_str(label);
    content.push('\n');
    for (key, value) in map {
        content.push_str(&key.display().to_string());
        content.push('\t');
        content.push_str(value);
        content.push('\n');
    }
    write_atomically(path, &content)
}

// write to a sibling then rename, so readers never see a torn file
fn write_atomically(path: &Path, content: &str) -> Result<()> {
    let mut temporary = path.as_os_str().to_owned();
    temporary.push(".tmp");
    let temporary = PathBuf::from(temporary);
    utils::write_string(&temporary, content)?;
    fs::rename(&temporary, path).map_err(|err| KilnError::io(err, path.to_path_buf()))
}

fn read_map<V: Ord>(
    path: &Path,
    parse: impl Fn(&str) -> Result<V>,
) -> Result<BTreeMap<PathBuf, BTreeSet<V>>> {
    let mut map = BTreeMap::new();
    if !path.exists() {
        return Ok(map);
    }
    let content = utils::read_string(path)?;
    for line in content.lines().skip(1) {
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let Some(key) = fields.next() else { continue };
        let mut values = BTreeSet::new();
        for field in fields {
            values.insert(parse(field)?);
        }
        map.insert(PathBuf::from(key), values);
    }
    Ok(map)
}

fn read_scalar_map(path: &Path) -> Result<BTreeMap<PathBuf, String>> {
    let mut map = BTreeMap::new();
    if !path.exists() {
        return Ok(map);
    }
    let content = utils::read_string(path)?;
    for line in content.lines().skip(1) {
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once('\t') {
            map.insert(PathBuf::from(key), value.to_string());
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fixture() -> (tempfile::TempDir, Analysis) {
        let dir = tempfile::Builder::new().prefix("kiln_analysis").tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        let analysis = Analysis::new(dir.path(), dir.path().join("target/analysis"));
        (dir, analysis)
    }

    #[test]
    fn save_load_round_trip() {
        let (dir, mut analysis) = fixture();
        let root = analysis.root().to_path_buf();
        analysis.add_source(&root.join("src/A.scala")).unwrap();
        analysis
            .add_source_dependency(&root.join("src/A.scala"), &root.join("src/B.scala"))
            .unwrap();
        analysis
            .add_product(&root.join("src/A.scala"), &root.join("target/classes/A.class"))
            .unwrap();
        analysis
            .add_external_dependency(Path::new("/opt/scala/lib/scala-library.jar"), &root.join("src/A.scala"))
            .unwrap();
        analysis.set_hash(&root.join("src/A.scala"), "abc123".to_string()).unwrap();
        analysis
            .add_test(
                &root.join("src/B.scala"),
                TestDefinition {
                    class_name: "example.BSpec".into(),
                    super_class_name: "org.scalatest.Suite".into(),
                    is_module: false,
                },
            )
            .unwrap();
        analysis.add_application(&root.join("src/A.scala"), "example.Main").unwrap();
        analysis.add_project_definition(&root.join("src/A.scala"), "example.Build").unwrap();

        analysis.save().unwrap();

        let mut reloaded = Analysis::new(analysis.root(), analysis.directory());
        reloaded.load().unwrap();
        assert_eq!(reloaded, analysis);
        drop(dir);
    }

    #[test]
    fn self_dependencies_are_dropped() {
        let (_dir, mut analysis) = fixture();
        let root = analysis.root().to_path_buf();
        let a = root.join("src/A.scala");
        analysis.add_source_dependency(&a, &a).unwrap();
        assert!(analysis.dependencies_of(&a).is_empty());
    }

    #[test]
    fn paths_outside_the_root_are_rejected() {
        let (_dir, mut analysis) = fixture();
        let outside = Path::new("/somewhere/else/A.scala");
        assert!(analysis.add_source(outside).is_err());
        assert!(analysis
            .add_source_dependency(outside, &analysis.root().join("src/A.scala"))
            .is_err());
    }

    #[test]
    fn remove_source_deletes_products_and_records() {
        let (dir, mut analysis) = fixture();
        let root = analysis.root().to_path_buf();
        let source = root.join("src/A.scala");
        let product = root.join("target/classes/A.class");
        fs::create_dir_all(product.parent().unwrap()).unwrap();
        fs::write(&product, b"class").unwrap();

        analysis.add_source(&source).unwrap();
        analysis.add_product(&source, &product).unwrap();
        analysis.set_hash(&source, "h".into()).unwrap();
        analysis.remove_source(&source).unwrap();

        assert!(!product.exists());
        assert!(!analysis.is_tracked(&source));
        assert!(analysis.hash(&source).is_none());
        drop(dir);
    }

    #[test]
    fn remove_dependent_scrubs_value_sets() {
        let (_dir, mut analysis) = fixture();
        let root = analysis.root().to_path_buf();
        let a = root.join("src/A.scala");
        let b = root.join("src/B.scala");
        analysis.add_source_dependency(&a, &b).unwrap();
        analysis.add_external_dependency(Path::new("/opt/lib.jar"), &b).unwrap();

        analysis.remove_dependent(&b).unwrap();
        assert!(analysis.dependencies_of(&b).is_empty());
        let all_external: Vec<_> = analysis
            .external_dependencies()
            .flat_map(|(_, dependents)| dependents.iter())
            .collect();
        assert!(all_external.is_empty());
    }

    #[test]
    fn load_of_missing_files_yields_empty_analysis() {
        let (_dir, mut analysis) = fixture();
        analysis.load().unwrap();
        assert_eq!(analysis.sources().count(), 0);
        assert_eq!(analysis.external_dependencies().count(), 0);
    }

    #[test]
    fn revert_discards_in_memory_changes() {
        let (_dir, mut analysis) = fixture();
        let root = analysis.root().to_path_buf();
        let a = root.join("src/A.scala");
        analysis.add_source(&a).unwrap();
        analysis.save().unwrap();

        analysis.add_source(&root.join("src/B.scala")).unwrap();
        analysis.revert().unwrap();
        let sources: Vec<_> = analysis.sources().collect();
        assert_eq!(sources, vec![&PathBuf::from("src/A.scala")]);
    }

    #[test]
    fn test_definition_records_round_trip() {
        let definition = TestDefinition {
            class_name: "example.SuiteA".into(),
            super_class_name: "org.scalacheck.Properties".into(),
            is_module: true,
        };
        assert_eq!(TestDefinition::parse(&definition.render()).unwrap(), definition);
        assert!(TestDefinition::parse("only two").is_err());
        assert!(TestDefinition::parse("one two three four").is_err());
    }
}
