//! Project definitions.
//!
//! A definition populates a [`ProjectSetup`] with tasks, sub-projects,
//! library dependencies, resolvers and configurations; nothing is scanned
//! for reflectively, everything is registered explicitly under its
//! published name. Definitions are looked up in a [`DefinitionRegistry`]
//! by fully qualified name. When `project/build/` holds definition sources
//! they are compiled by the builder (a specialization of the compile
//! conditional) and the recorded definition class selects the entry; a
//! project without custom build logic gets [`DefaultDefinition`].

use crate::{
    analysis::Analysis,
    archive::{self, Manifest},
    compile::{CompileConditional, CompileConfiguration, Compiler, Scalac},
    error::{KilnError, Result},
    filter::{NameFilter, PathFinder},
    logging::Log,
    manage::{
        self, Configuration, IvyConfiguration, Manager, ModuleId, Resolver, UpdateConfiguration,
    },
    paths::{ProjectLayout, ProjectPath},
    properties::{self, PropertyStore},
    task::Task,
    testing::{self, ProcessRunner, TestFramework},
    utils,
};
use once_cell::sync::Lazy;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::{Arc, Mutex},
};

/// The class name the built-in default definition answers to.
pub const DEFAULT_DEFINITION_CLASS: &str = "kiln.DefaultProject";

/// Files scalac accepts as compilation units.
static SOURCE_FILTER: Lazy<NameFilter> = Lazy::new(|| {
    NameFilter::glob("*.scala").unwrap() | NameFilter::glob("*.java").unwrap()
});
/// Dot-directories (version control and editor droppings) are never walked.
static HIDDEN_FILTER: Lazy<NameFilter> = Lazy::new(|| NameFilter::glob(".*").unwrap());
static JAR_FILTER: Lazy<NameFilter> = Lazy::new(|| NameFilter::glob("*.jar").unwrap());
static SCALA_FILTER: Lazy<NameFilter> = Lazy::new(|| NameFilter::glob("*.scala").unwrap());

/// What task closures capture: the per-project facts that outlive setup.
#[derive(Clone)]
pub struct ProjectContext {
    pub name: String,
    pub organization: String,
    pub version: String,
    pub layout: ProjectLayout,
    pub log: Arc<dyn Log>,
    pub compiler: Arc<dyn Compiler + Send + Sync>,
    pub properties: Arc<Mutex<PropertyStore>>,
    /// Classes directories of the projects this project depends on.
    pub dependency_classes: Vec<PathBuf>,
}

impl ProjectContext {
    fn root_path(&self) -> ProjectPath {
        ProjectPath::root(&self.layout.root)
    }

    fn sources_under(&self, directories: &[&PathBuf]) -> PathFinder {
        let mut finder = PathFinder::empty();
        for directory in directories {
            let base = self.root_relative(directory);
            finder = finder
                + PathFinder::from(base)
                    .descendents_except(SOURCE_FILTER.clone(), HIDDEN_FILTER.clone());
        }
        finder
    }

    fn root_relative(&self, directory: &Path) -> ProjectPath {
        let relative = directory.strip_prefix(&self.layout.root).unwrap_or(directory);
        self.root_path().resolve(relative).unwrap_or_else(|_| self.root_path())
    }

    fn jar_finder(&self, directory: &Path) -> PathFinder {
        PathFinder::from(self.root_relative(directory)).descendents(JAR_FILTER.clone())
    }

    /// Compile classpath: unmanaged jars, managed jars, dependency classes.
    fn main_classpath(&self) -> PathFinder {
        let mut finder = self.jar_finder(&self.layout.unmanaged_dependency)
            + self.jar_finder(&self.layout.managed_dependency);
        for classes in &self.dependency_classes {
            finder = finder + PathFinder::from(ProjectPath::root(classes));
        }
        finder
    }

    fn test_classpath(&self) -> PathFinder {
        self.main_classpath() + PathFinder::from(ProjectPath::root(&self.layout.main_classes))
    }

    /// The full runtime classpath, test classes included.
    fn run_classpath(&self) -> Vec<PathBuf> {
        let mut classpath = vec![self.layout.main_classes.clone(), self.layout.test_classes.clone()];
        classpath.extend(self.test_classpath().get_files());
        classpath
    }

    pub fn main_compile_configuration(&self, options: Vec<String>) -> CompileConfiguration {
        CompileConfiguration {
            label: "main".to_string(),
            sources: self
                .sources_under(&[&self.layout.main_scala_sources, &self.layout.main_java_sources]),
            classpath: self.main_classpath(),
            output_directory: self.layout.main_classes.clone(),
            analysis_directory: self.layout.main_analysis.clone(),
            root: self.layout.root.clone(),
            test_super_classes: Vec::new(),
            options,
        }
    }

    pub fn test_compile_configuration(
        &self,
        options: Vec<String>,
        frameworks: &[TestFramework],
    ) -> CompileConfiguration {
        CompileConfiguration {
            label: "test".to_string(),
            sources: self
                .sources_under(&[&self.layout.test_scala_sources, &self.layout.test_java_sources]),
            classpath: self.test_classpath(),
            output_directory: self.layout.test_classes.clone(),
            analysis_directory: self.layout.test_analysis.clone(),
            root: self.layout.root.clone(),
            test_super_classes: frameworks
                .iter()
                .map(|framework| framework.super_class_name.clone())
                .collect(),
            options,
        }
    }

    fn module_id(&self) -> ModuleId {
        ModuleId::new(&self.organization, &self.name, &self.version)
    }
}

/// A sub-project declared by the definition; `dependencies` names sibling
/// sub-projects that must build first.
#[derive(Clone, Debug)]
pub struct SubProjectDeclaration {
    pub name: String,
    pub directory: PathBuf,
    pub dependencies: Vec<String>,
}

pub type MethodFn = Arc<dyn Fn(&[String]) -> Option<String> + Send + Sync>;

/// Collects everything a definition registers.
pub struct ProjectSetup {
    context: ProjectContext,
    pub tasks: BTreeMap<String, Task>,
    pub methods: BTreeMap<String, MethodFn>,
    pub sub_projects: Vec<SubProjectDeclaration>,
    pub library_dependencies: Vec<ModuleId>,
    pub resolvers: Vec<Resolver>,
    pub configurations: Vec<Configuration>,
    pub compile_options: Vec<String>,
    pub test_frameworks: Vec<TestFramework>,
    pub parallel_execution: bool,
    pub disable_output_directory_check: bool,
}

impl ProjectSetup {
    pub fn new(context: ProjectContext) -> ProjectSetup {
        ProjectSetup {
            context,
            tasks: BTreeMap::new(),
            methods: BTreeMap::new(),
            sub_projects: Vec::new(),
            library_dependencies: Vec::new(),
            resolvers: Vec::new(),
            configurations: Vec::new(),
            compile_options: Vec::new(),
            test_frameworks: testing::default_frameworks(),
            parallel_execution: false,
            disable_output_directory_check: false,
        }
    }

    pub fn context(&self) -> &ProjectContext {
        &self.context
    }

    /// Publishes a task under its action name.
    pub fn add_task(&mut self, name: impl Into<String>, task: Task) {
        let name = name.into();
        task.bind_name(&name);
        self.tasks.insert(name, task);
    }

    pub fn add_method(&mut self, name: impl Into<String>, method: MethodFn) {
        self.methods.insert(name.into(), method);
    }

    pub fn add_sub_project(&mut self, declaration: SubProjectDeclaration) {
        self.sub_projects.push(declaration);
    }

    pub fn add_dependency(&mut self, module: ModuleId) {
        self.library_dependencies.push(module);
    }

    pub fn add_resolver(&mut self, resolver: Resolver) {
        self.resolvers.push(resolver);
    }

    pub fn add_configuration(&mut self, configuration: Configuration) {
        self.configurations.push(configuration);
    }

    /// Registers the standard task set against the declarations made so far.
    /// Classes of sub-projects declared before this call join the compile
    /// classpath.
    pub fn add_standard_tasks(&mut self) {
        let mut context = self.context.clone();
        context.dependency_classes.extend(
            self.sub_projects
                .iter()
                .map(|declaration| ProjectLayout::new(&declaration.directory).main_classes),
        );
        let context = context;
        let options = self.compile_options.clone();
        let frameworks = self.test_frameworks.clone();

        let compile = {
            let context = context.clone();
            let options = options.clone();
            Task::new(move || {
                act(CompileConditional {
                    config: context.main_compile_configuration(options.clone()),
                    compiler: &*context.compiler,
                    log: &*context.log,
                }
                .run())
            })
            .described_as("Compiles main sources.")
        };

        let test_compile = {
            let context = context.clone();
            let options = options.clone();
            let frameworks = frameworks.clone();
            Task::new(move || {
                act(CompileConditional {
                    config: context.test_compile_configuration(options.clone(), &frameworks),
                    compiler: &*context.compiler,
                    log: &*context.log,
                }
                .run())
            })
            .described_as("Compiles test sources.")
        };
        let test_compile = match test_compile.depends_on(&[compile.clone()]) {
            Ok(task) => task,
            Err(_) => test_compile,
        };

        let clean = {
            let context = context.clone();
            Task::new(move || {
                act(utils::clean(
                    [context.layout.output.as_path()],
                    false,
                    &*context.log,
                ))
            })
            .described_as("Deletes all generated files.")
        };

        let clean_lib = {
            let context = context.clone();
            Task::new(move || {
                act(utils::clean(
                    [context.layout.managed_dependency.as_path()],
                    false,
                    &*context.log,
                ))
            })
            .described_as("Deletes the managed library directory.")
        };

        let update = {
            let context = context.clone();
            let dependencies = self.library_dependencies.clone();
            let resolvers = self.resolvers.clone();
            let configurations = self.configurations.clone();
            Task::new(move || {
                let ivy = IvyConfiguration {
                    project_root: context.layout.root.clone(),
                    managed_library_directory: context.layout.managed_dependency.clone(),
                    cache_directory: None,
                    manager: Manager::Inline {
                        module: context.module_id(),
                        resolvers: resolvers.clone(),
                        configurations: configurations.clone(),
                        default_configuration: None,
                        dependencies: dependencies.clone(),
                        fragment: None,
                    },
                    validate: false,
                    error_if_missing_configurations: false,
                };
                act(manage::update(&ivy, &UpdateConfiguration::default(), &*context.log))
            })
            .described_as("Resolves and retrieves managed dependencies.")
        };

        let test = {
            let context = context.clone();
            let frameworks = frameworks.clone();
            Task::new(move || {
                let mut analysis =
                    Analysis::new(&context.layout.root, &context.layout.test_analysis);
                if let Err(err) = analysis.load() {
                    return Some(err.to_string());
                }
                let classpath = context.run_classpath();
                let outcome = testing::run_tests(
                    &frameworks,
                    &analysis.all_test_definitions(),
                    |framework| {
                        Box::new(ProcessRunner::new(
                            scala_runtime(),
                            classpath.clone(),
                            framework.adapter_class.clone(),
                        ))
                    },
                    &mut [],
                    &*context.log,
                );
                act(outcome)
            })
            .described_as("Runs all discovered tests.")
        };
        let test = match test.depends_on(&[test_compile.clone()]) {
            Ok(task) => task,
            Err(_) => test,
        };

        let package = {
            let context = context.clone();
            Task::new(move || act(package_action(&context)))
                .described_as("Creates the project jar.")
        };
        let package = match package.depends_on(&[compile.clone()]) {
            Ok(task) => task,
            Err(_) => package,
        };

        let doc = {
            let context = context.clone();
            Task::new(move || {
                let sources: Vec<PathBuf> = context
                    .sources_under(&[&context.layout.main_scala_sources])
                    .get_files()
                    .into_iter()
                    .collect();
                if sources.is_empty() {
                    context.log.info("No sources to document.");
                    return None;
                }
                let classpath: Vec<PathBuf> =
                    context.main_classpath().get_files().into_iter().collect();
                act(Scalac::discover().doc(
                    &sources,
                    &classpath,
                    &context.layout.doc,
                    &*context.log,
                ))
            })
            .described_as("Generates API documentation.")
        };
        let doc = match doc.depends_on(&[compile.clone()]) {
            Ok(task) => task,
            Err(_) => doc,
        };

        let run = {
            let context = context.clone();
            Task::new(move || act(run_action(&context))).described_as("Runs the main class.")
        };
        let run = match run.depends_on(&[compile.clone()]) {
            Ok(task) => task.set_interactive(),
            Err(_) => run.set_interactive(),
        };

        let console = {
            let context = context.clone();
            Task::new(move || act(console_action(&context)))
                .described_as("Starts the interactive interpreter with the project classpath.")
        };
        let console = match console.depends_on(&[test_compile.clone()]) {
            Ok(task) => task.set_interactive(),
            Err(_) => console.set_interactive(),
        };

        self.add_task("clean", clean);
        self.add_task("clean-lib", clean_lib);
        self.add_task("update", update);
        self.add_task("compile", compile);
        self.add_task("test-compile", test_compile);
        self.add_task("test", test);
        self.add_task("package", package);
        self.add_task("doc", doc);
        self.add_task("run", run);
        self.add_task("console", console);
    }
}

fn act(result: Result<impl Sized>) -> Option<String> {
    result.err().map(|err| err.to_string())
}

/// `scala` from `SCALA_HOME` when set, else from the path.
pub fn scala_runtime() -> PathBuf {
    std::env::var_os("SCALA_HOME")
        .map(|home| Path::new(&home).join("bin").join("scala"))
        .unwrap_or_else(|| PathBuf::from("scala"))
}

fn package_action(context: &ProjectContext) -> Result<()> {
    let classes = ProjectPath::root(&context.layout.main_classes).as_base();
    let resources = ProjectPath::root(&context.layout.main_resources).as_base();
    let contents: Vec<ProjectPath> = (PathFinder::from(classes).descendents(NameFilter::All)
        + PathFinder::from(resources).descendents(NameFilter::All))
    .get()
    .into_iter()
    .collect();

    let mut manifest = Manifest::new();
    let mut analysis = Analysis::new(&context.layout.root, &context.layout.main_analysis);
    analysis.load()?;
    let applications = analysis.application_classes();
    if let [main_class] = applications.as_slice() {
        manifest.main.insert("Main-Class".to_string(), main_class.clone());
    }

    let jar = context
        .layout
        .output
        .join(format!("{}-{}.jar", context.name, context.version));
    archive::archive(&contents, &jar, Some(&manifest), false)?;
    context.log.info(&format!("Packaged {}", jar.display()));
    Ok(())
}

fn run_action(context: &ProjectContext) -> Result<()> {
    let mut analysis = Analysis::new(&context.layout.root, &context.layout.main_analysis);
    analysis.load()?;
    let applications = analysis.application_classes();
    let main_class = match applications.as_slice() {
        [] => {
            return Err(KilnError::msg("no entry point was discovered; nothing to run"));
        }
        [main_class] => main_class.clone(),
        multiple => {
            return Err(KilnError::msg(format!(
                "multiple entry points were discovered, specify one of: {}",
                multiple.join(", ")
            )));
        }
    };

    context.log.info(&format!("Running {main_class}..."));
    let status = Command::new(scala_runtime())
        .arg("-classpath")
        .arg(join_classpath(&context.run_classpath()))
        .arg(&main_class)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .map_err(|err| KilnError::msg(format!("could not start the runtime: {err}")))?;
    if status.success() {
        Ok(())
    } else {
        Err(KilnError::msg(format!("{main_class} exited with {status}")))
    }
}

fn console_action(context: &ProjectContext) -> Result<()> {
    context.log.info("Starting the interpreter; :quit to return.");
    let status = Command::new(scala_runtime())
        .arg("-classpath")
        .arg(join_classpath(&context.run_classpath()))
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .map_err(|err| KilnError::msg(format!("could not start the interpreter: {err}")))?;
    if status.success() {
        Ok(())
    } else {
        Err(KilnError::msg(format!("interpreter exited with {status}")))
    }
}

fn join_classpath(entries: &[PathBuf]) -> String {
    let rendered: Vec<String> = entries.iter().map(|entry| entry.display().to_string()).collect();
    rendered.join(if cfg!(windows) { ";" } else { ":" })
}

/// User-facing build logic, instantiated by fully qualified name.
pub trait ProjectDefinition: Send + Sync {
    fn configure(&self, setup: &mut ProjectSetup) -> Result<()>;
}

/// The standard layout with the standard task set.
pub struct DefaultDefinition;

impl ProjectDefinition for DefaultDefinition {
    fn configure(&self, setup: &mut ProjectSetup) -> Result<()> {
        setup.add_standard_tasks();
        Ok(())
    }
}

pub type DefinitionFactory = Arc<dyn Fn() -> Box<dyn ProjectDefinition> + Send + Sync>;

/// Known definitions by fully qualified name.
#[derive(Clone)]
pub struct DefinitionRegistry {
    by_name: BTreeMap<String, DefinitionFactory>,
}

impl DefinitionRegistry {
    pub fn standard() -> DefinitionRegistry {
        let mut registry = DefinitionRegistry { by_name: BTreeMap::new() };
        registry.register(
            DEFAULT_DEFINITION_CLASS,
            Arc::new(|| Box::new(DefaultDefinition) as Box<dyn ProjectDefinition>),
        );
        registry
    }

    pub fn register(&mut self, class_name: impl Into<String>, factory: DefinitionFactory) {
        self.by_name.insert(class_name.into(), factory);
    }

    pub fn create(&self, class_name: &str) -> Option<Box<dyn ProjectDefinition>> {
        self.by_name.get(class_name).map(|factory| factory())
    }
}

/// Compiles `project/build/` and reports the declared definition class.
///
/// Returns `None` when the project has no custom build logic; more than one
/// recorded definition is a load error.
pub fn builder_definition_class(
    layout: &ProjectLayout,
    compiler: &dyn Compiler,
    log: &dyn Log,
) -> Result<Option<String>> {
    let sources_root = &layout.definition_sources;
    if !sources_root.exists() {
        return Ok(None);
    }
    let base = ProjectPath::root(&layout.root)
        .resolve(sources_root.strip_prefix(&layout.root).unwrap_or(sources_root))
        .map_err(|err| KilnError::Load(err.to_string()))?;
    let sources = PathFinder::from(base).descendents(SCALA_FILTER.clone());
    if sources.get().is_empty() {
        return Ok(None);
    }

    let build_target = layout.project.join("build").join("target");
    let conditional = CompileConditional {
        config: CompileConfiguration {
            label: "project definition".to_string(),
            sources,
            classpath: PathFinder::empty(),
            output_directory: build_target.join("classes"),
            analysis_directory: build_target.join("analysis"),
            root: layout.root.clone(),
            test_super_classes: Vec::new(),
            options: Vec::new(),
        },
        compiler,
        log,
    };
    let analysis = conditional.run().map_err(|err| KilnError::Load(err.to_string()))?;

    let mut classes = analysis.project_definition_classes();
    classes.sort();
    classes.dedup();
    match classes.as_slice() {
        [] => Ok(None),
        [class_name] => Ok(Some(class_name.clone())),
        multiple => Err(KilnError::Load(format!(
            "multiple project definitions found: {}",
            multiple.join(", ")
        ))),
    }
}

/// Reads `project.initialize` and prompts for any required property that is
/// still undefined, recording the answers.
pub fn initialize_properties(store: &mut PropertyStore) -> Result<()> {
    if store.get(properties::PROJECT_NAME).is_none() {
        let name = properties::prompt("Project name")?;
        store.set(properties::PROJECT_NAME, name);
    }
    if store.get(properties::PROJECT_VERSION).is_none() {
        let version = properties::prompt("Project version")?;
        store.set(properties::PROJECT_VERSION, version);
    }
    store.remove(properties::PROJECT_INITIALIZE);
    Ok(())
}
