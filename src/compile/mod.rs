//! Conditional, incremental compilation.
//!
//! Deciding what to hand to the compiler runs in several steps. First the
//! previous [`Analysis`] is loaded and every configured source is checked
//! for dirtiness: a source is dirty when it is untracked, its content hash
//! changed, one of its products is gone, one of its external dependencies is
//! missing or newer than its oldest product, or, transitively, when any
//! source it depends on is dirty (a fixed point over the recorded
//! dependencies). An empty dirty set means the compiler is not invoked at
//! all. Otherwise the dirty sources are invalidated, products deleted from
//! disk, and the compiler runs with a callback that rebuilds their analysis
//! records; the analysis is persisted only when the compiler succeeds, so a
//! failed run retries the same dirty set.

mod compiler;

pub use compiler::{
    replay_report, AnalysisCallback, CompileReport, CompileRequest, Compiler, Scalac,
    SourceReport, SubclassReport,
};

use crate::{
    analysis::{Analysis, TestDefinition},
    error::Result,
    filter::PathFinder,
    logging::Log,
    utils,
};
use rayon::prelude::*;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::{Path, PathBuf},
};

/// Entry points subclass this.
pub const APPLICATION_SUPER_CLASS: &str = "scala.App";
/// Project definitions compiled from `project/build` subclass this.
pub const PROJECT_SUPER_CLASS: &str = "kiln.Project";

/// Everything a conditional compile needs to know.
#[derive(Clone, Debug)]
pub struct CompileConfiguration {
    /// Short label used in log messages, e.g. `main` or `test`.
    pub label: String,
    pub sources: PathFinder,
    pub classpath: PathFinder,
    pub output_directory: PathBuf,
    pub analysis_directory: PathBuf,
    pub root: PathBuf,
    /// Supertypes whose concrete subclasses count as tests.
    pub test_super_classes: Vec<String>,
    pub options: Vec<String>,
}

/// Drives incremental recompilation for one configuration.
pub struct CompileConditional<'a> {
    pub config: CompileConfiguration,
    pub compiler: &'a dyn Compiler,
    pub log: &'a dyn Log,
}

impl CompileConditional<'_> {
    /// Runs the decision algorithm and, when needed, the compiler. Returns
    /// the up-to-date analysis.
    pub fn run(&self) -> Result<Analysis> {
        let mut analysis =
            Analysis::new(&self.config.root, &self.config.analysis_directory);
        analysis.load()?;

        let current: BTreeSet<PathBuf> = self.config.sources.get_files();
        let (dirty, removed) = self.dirty_sources(&analysis, &current)?;
        trace!(label = %self.config.label, dirty = dirty.len(), removed = removed.len());

        for source in &removed {
            for product in analysis.product_files(source) {
                analysis.remove_external_dependency(&product);
            }
            analysis.remove_source(source)?;
            analysis.remove_dependent(source)?;
        }

        if dirty.is_empty() {
            self.log.debug(&format!("No {} sources need recompiling.", self.config.label));
            if !removed.is_empty() {
                analysis.save()?;
            }
            return Ok(analysis);
        }

        for source in &dirty {
            for product in analysis.product_files(source) {
                analysis.remove_external_dependency(&product);
            }
            analysis.remove_source(source)?;
            analysis.remove_dependent(source)?;
        }

        let sources: Vec<PathBuf> =
            dirty.iter().map(|relative| self.config.root.join(relative)).collect();
        let classpath: Vec<PathBuf> = self.config.classpath.get_files().into_iter().collect();
        let mut super_classes = self.config.test_super_classes.clone();
        super_classes.push(APPLICATION_SUPER_CLASS.to_string());
        super_classes.push(PROJECT_SUPER_CLASS.to_string());

        self.log.info(&format!(
            "Compiling {} {} source{}...",
            sources.len(),
            self.config.label,
            if sources.len() == 1 { "" } else { "s" }
        ));

        let mut callback = BuildCallback {
            analysis: &mut analysis,
            test_super_classes: &self.config.test_super_classes,
        };
        self.compiler.compile(
            CompileRequest {
                sources: &sources,
                classpath: &classpath,
                output_directory: &self.config.output_directory,
                options: &self.config.options,
                super_classes: &super_classes,
                log: self.log,
            },
            &mut callback,
        )?;

        analysis.save()?;
        Ok(analysis)
    }

    /// Returns `(dirty, removed)`, both relative to the project root. The
    /// dirty set is restricted to sources that still exist; removed sources
    /// are tracked sources no longer found by the source finder.
    fn dirty_sources(
        &self,
        analysis: &Analysis,
        current: &BTreeSet<PathBuf>,
    ) -> Result<(BTreeSet<PathBuf>, Vec<PathBuf>)> {
        let mut current_relative: BTreeMap<PathBuf, PathBuf> = BTreeMap::new();
        for absolute in current {
            current_relative.insert(analysis.relativize(absolute)?, absolute.clone());
        }

        let removed: Vec<PathBuf> = analysis
            .sources()
            .filter(|source| !current_relative.contains_key(*source))
            .cloned()
            .collect();

        let hashes: HashMap<&PathBuf, String> = current_relative
            .par_iter()
            .map(|(relative, absolute)| utils::hash_file(absolute).map(|hash| (relative, hash)))
            .collect::<Result<_>>()?;

        // external files seen per source
        let mut external: HashMap<&PathBuf, Vec<&PathBuf>> = HashMap::new();
        for (file, dependents) in analysis.external_dependencies() {
            for dependent in dependents {
                external.entry(dependent).or_default().push(file);
            }
        }

        let mut dirty: BTreeSet<PathBuf> = removed.iter().cloned().collect();
        for relative in current_relative.keys() {
            if self.is_dirty(analysis, relative, &hashes, &external) {
                dirty.insert(relative.clone());
            }
        }

        // transitive closure: anything depending on a dirty source is dirty
        loop {
            let mut changed = false;
            for relative in current_relative.keys() {
                if dirty.contains(relative) {
                    continue;
                }
                if analysis
                    .dependencies_of(relative)
                    .iter()
                    .any(|dependency| dirty.contains(dependency))
                {
                    dirty.insert(relative.clone());
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        dirty.retain(|relative| current_relative.contains_key(relative));
        Ok((dirty, removed))
    }

    fn is_dirty(
        &self,
        analysis: &Analysis,
        relative: &PathBuf,
        hashes: &HashMap<&PathBuf, String>,
        external: &HashMap<&PathBuf, Vec<&PathBuf>>,
    ) -> bool {
        if !analysis.is_tracked(relative) {
            trace!(source = %relative.display(), "untracked source");
            return true;
        }
        if analysis.hash(relative) != hashes.get(relative).map(String::as_str) {
            trace!(source = %relative.display(), "content hash changed");
            return true;
        }
        let products = analysis.product_files(relative);
        let mut oldest_product: Option<u64> = None;
        for product in &products {
            if !product.exists() {
                trace!(source = %relative.display(), product = %product.display(), "missing product");
                return true;
            }
            let modified = utils::last_modified(product);
            oldest_product =
                Some(oldest_product.map_or(modified, |current| current.min(modified)));
        }
        for file in external.get(relative).into_iter().flatten() {
            if !file.exists() {
                trace!(source = %relative.display(), external = %file.display(), "missing external dependency");
                return true;
            }
            if let Some(oldest) = oldest_product {
                if utils::last_modified(file) > oldest {
                    trace!(source = %relative.display(), external = %file.display(), "external dependency newer than products");
                    return true;
                }
            }
        }
        false
    }
}

/// Routes compiler observations into the analysis; discovered subclasses go
/// to the tests, applications or project-definitions map according to their
/// superclass.
struct BuildCallback<'a> {
    analysis: &'a mut Analysis,
    test_super_classes: &'a [String],
}

impl AnalysisCallback for BuildCallback<'_> {
    fn begin_source(&mut self, source: &Path) -> Result<()> {
        self.analysis.add_source(source)
    }

    fn source_dependency(&mut self, on: &Path, from: &Path) -> Result<()> {
        self.analysis.add_source_dependency(on, from)
    }

    fn class_dependency(&mut self, on_file: &Path, from: &Path) -> Result<()> {
        self.analysis.add_external_dependency(on_file, from)
    }

    fn jar_dependency(&mut self, on_jar: &Path, from: &Path) -> Result<()> {
        self.analysis.add_external_dependency(on_jar, from)
    }

    fn generated_class(&mut self, source: &Path, product: &Path) -> Result<()> {
        self.analysis.add_product(source, product)
    }

    fn found_subclass(
        &mut self,
        source: &Path,
        full_name: &str,
        super_name: &str,
        is_module: bool,
    ) -> Result<()> {
        if super_name == APPLICATION_SUPER_CLASS {
            if is_module {
                self.analysis.add_application(source, full_name)?;
            }
        } else if super_name == PROJECT_SUPER_CLASS {
            self.analysis.add_project_definition(source, full_name)?;
        } else if self.test_super_classes.iter().any(|candidate| candidate == super_name) {
            self.analysis.add_test(
                source,
                TestDefinition {
                    class_name: full_name.to_string(),
                    super_class_name: super_name.to_string(),
                    is_module,
                },
            )?;
        }
        Ok(())
    }

    fn end_source(&mut self, source: &Path) -> Result<()> {
        let file = if source.is_absolute() {
            source.to_path_buf()
        } else {
            self.analysis.root().join(source)
        };
        let hash = utils::hash_file(&file)?;
        self.analysis.set_hash(source, hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{filter::NameFilter, logging::RecordedLogger, paths::ProjectPath};
    use std::{
        fs,
        sync::atomic::{AtomicUsize, Ordering},
        sync::Mutex,
    };

    /// Pretends to be scalac: "compiles" `X.scala` to `X.class` and reports
    /// dependencies derived from `// depends: Y.scala` comment lines.
    struct FakeCompiler {
        invocations: AtomicUsize,
        compiled: Mutex<Vec<PathBuf>>,
    }

    impl FakeCompiler {
        fn new() -> Self {
            FakeCompiler { invocations: AtomicUsize::new(0), compiled: Mutex::new(Vec::new()) }
        }

        fn last_compiled(&self) -> Vec<String> {
            self.compiled
                .lock()
                .unwrap()
                .iter()
                .filter_map(|p| p.file_name())
                .map(|n| n.to_string_lossy().to_string())
                .collect()
        }
    }

    impl Compiler for FakeCompiler {
        fn compile(
            &self,
            request: CompileRequest<'_>,
            callback: &mut dyn AnalysisCallback,
        ) -> Result<()> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            *self.compiled.lock().unwrap() = request.sources.to_vec();
            fs::create_dir_all(request.output_directory).unwrap();
            for source in request.sources {
                let stem = source.file_stem().unwrap().to_string_lossy().to_string();
                let product = request.output_directory.join(format!("{stem}.class"));
                fs::write(&product, b"bytecode").unwrap();

                callback.begin_source(source)?;
                let text = fs::read_to_string(source).unwrap();
                for line in text.lines() {
                    if let Some(dependency) = line.trim().strip_prefix("// depends: ") {
                        let dependency = source.parent().unwrap().join(dependency);
                        callback.source_dependency(&dependency, source)?;
                    }
                }
                callback.generated_class(source, &product)?;
                callback.end_source(source)?;
            }
            Ok(())
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        root: PathBuf,
    }

    impl Fixture {
        fn new() -> Fixture {
            let dir = tempfile::Builder::new().prefix("kiln_compile").tempdir().unwrap();
            let root = utils::canonicalized(dir.path());
            fs::create_dir_all(root.join("src")).unwrap();
            Fixture { dir, root }
        }

        fn write_source(&self, name: &str, content: &str) {
            fs::write(self.root.join("src").join(name), content).unwrap();
        }

        fn configuration(&self) -> CompileConfiguration {
            let sources = PathFinder::from(ProjectPath::root(&self.root))
                .descendents(NameFilter::glob("*.scala").unwrap());
            CompileConfiguration {
                label: "main".to_string(),
                sources,
                classpath: PathFinder::empty(),
                output_directory: self.root.join("target/classes"),
                analysis_directory: self.root.join("target/analysis"),
                root: self.root.clone(),
                test_super_classes: vec!["org.scalatest.Suite".to_string()],
                options: Vec::new(),
            }
        }
    }

    fn compile(fixture: &Fixture, compiler: &FakeCompiler) -> Analysis {
        let log = RecordedLogger::new();
        CompileConditional { config: fixture.configuration(), compiler, log: &log }
            .run()
            .unwrap()
    }

    #[test]
    fn cold_compile_records_everything() {
        let fixture = Fixture::new();
        fixture.write_source("A.scala", "class A\n");
        fixture.write_source("B.scala", "// depends: A.scala\nclass B\n");

        let compiler = FakeCompiler::new();
        let analysis = compile(&fixture, &compiler);

        assert_eq!(compiler.invocations.load(Ordering::SeqCst), 1);
        assert_eq!(analysis.sources().count(), 2);
        for name in ["A", "B"] {
            let source = fixture.root.join(format!("src/{name}.scala"));
            assert!(analysis.hash(&source).is_some());
            assert_eq!(analysis.products_of(&source).len(), 1);
        }
        assert_eq!(
            analysis.dependencies_of(&fixture.root.join("src/B.scala")),
            BTreeSet::from([PathBuf::from("src/A.scala")])
        );
        assert!(fixture.root.join("target/classes/A.class").exists());
        drop(fixture.dir);
    }

    #[test]
    fn unchanged_project_skips_the_compiler() {
        let fixture = Fixture::new();
        fixture.write_source("A.scala", "class A\n");

        let compiler = FakeCompiler::new();
        let first = compile(&fixture, &compiler);
        let second = compile(&fixture, &compiler);

        assert_eq!(compiler.invocations.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
    }

    #[test]
    fn touching_a_leaf_recompiles_only_it() {
        let fixture = Fixture::new();
        fixture.write_source("A.scala", "class A\n");
        fixture.write_source("B.scala", "// depends: A.scala\nclass B\n");

        let compiler = FakeCompiler::new();
        let first = compile(&fixture, &compiler);
        let a_hash = first.hash(&fixture.root.join("src/A.scala")).unwrap().to_string();

        fixture.write_source("B.scala", "// depends: A.scala\nclass B { def go = 1 }\n");
        let second = compile(&fixture, &compiler);

        assert_eq!(compiler.invocations.load(Ordering::SeqCst), 2);
        assert_eq!(compiler.last_compiled(), vec!["B.scala"]);
        assert_eq!(second.hash(&fixture.root.join("src/A.scala")).unwrap(), a_hash);
        assert_ne!(
            second.hash(&fixture.root.join("src/B.scala")),
            first.hash(&fixture.root.join("src/B.scala"))
        );
    }

    #[test]
    fn touching_an_internal_node_recompiles_dependents() {
        let fixture = Fixture::new();
        fixture.write_source("A.scala", "class A\n");
        fixture.write_source("B.scala", "// depends: A.scala\nclass B\n");

        let compiler = FakeCompiler::new();
        compile(&fixture, &compiler);

        fixture.write_source("A.scala", "class A { def go = 2 }\n");
        compile(&fixture, &compiler);

        let mut compiled = compiler.last_compiled();
        compiled.sort();
        assert_eq!(compiled, vec!["A.scala", "B.scala"]);
    }

    #[test]
    fn deleting_a_product_recompiles_the_source_and_dependents() {
        let fixture = Fixture::new();
        fixture.write_source("A.scala", "class A\n");
        fixture.write_source("B.scala", "// depends: A.scala\nclass B\n");

        let compiler = FakeCompiler::new();
        compile(&fixture, &compiler);

        fs::remove_file(fixture.root.join("target/classes/A.class")).unwrap();
        compile(&fixture, &compiler);

        let mut compiled = compiler.last_compiled();
        compiled.sort();
        assert_eq!(compiled, vec!["A.scala", "B.scala"]);
        assert!(fixture.root.join("target/classes/A.class").exists());
    }

    #[test]
    fn removed_sources_lose_their_products() {
        let fixture = Fixture::new();
        fixture.write_source("A.scala", "class A\n");
        fixture.write_source("B.scala", "class B\n");

        let compiler = FakeCompiler::new();
        compile(&fixture, &compiler);
        assert!(fixture.root.join("target/classes/B.class").exists());

        fs::remove_file(fixture.root.join("src/B.scala")).unwrap();
        let analysis = compile(&fixture, &compiler);

        assert!(!fixture.root.join("target/classes/B.class").exists());
        assert_eq!(analysis.sources().count(), 1);
    }

    #[test]
    fn failed_compile_leaves_analysis_unsaved() {
        struct FailingCompiler;
        impl Compiler for FailingCompiler {
            fn compile(
                &self,
                _request: CompileRequest<'_>,
                _callback: &mut dyn AnalysisCallback,
            ) -> Result<()> {
                Err(crate::error::KilnError::Compile("boom".to_string()))
            }
        }

        let fixture = Fixture::new();
        fixture.write_source("A.scala", "class A\n");

        let log = RecordedLogger::new();
        let conditional = CompileConditional {
            config: fixture.configuration(),
            compiler: &FailingCompiler,
            log: &log,
        };
        assert!(conditional.run().is_err());

        // nothing persisted: the next run sees the same dirty set
        let mut analysis =
            Analysis::new(&fixture.root, fixture.root.join("target/analysis"));
        analysis.load().unwrap();
        assert_eq!(analysis.sources().count(), 0);
    }
}
