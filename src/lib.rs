#![doc = include_str!("../README.md")]
#![deny(unused_must_use, rust_2018_idioms)]

#[macro_use]
extern crate tracing;

pub mod error;

pub mod analysis;
pub mod archive;
pub mod boot;
pub mod compile;
pub mod console;
pub mod definition;
pub mod distributor;
pub mod filter;
pub mod graph;
pub mod logging;
pub mod manage;
pub mod paths;
pub mod properties;
pub mod scripted;
pub mod task;
pub mod testing;
pub mod utils;
pub mod watch;

pub use error::{KilnError, Result};

use crate::{
    compile::{Compiler, Scalac},
    definition::{
        builder_definition_class, DefaultDefinition, DefinitionRegistry, MethodFn,
        ProjectContext, ProjectDefinition, ProjectSetup, SubProjectDeclaration,
    },
    graph::{topological_sort_checked, Dag},
    logging::{BufferedLogger, ConsoleLogger, Level, Log},
    manage::{Configuration, ModuleId, Resolver},
    paths::ProjectLayout,
    properties::PropertyStore,
    task::Task,
};
use std::{
    collections::{BTreeMap, HashMap},
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

/// The version of the build tool itself.
pub fn engine_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// The logger the whole project tree shares.
pub type ProjectLogger = BufferedLogger<ConsoleLogger>;

/// A loaded project: tasks, sub-projects, properties and dependencies, all
/// registered by its definition. Cloning is cheap and preserves identity.
#[derive(Clone)]
pub struct Project(Arc<ProjectData>);

pub struct ProjectData {
    name: String,
    organization: String,
    version: String,
    info: ProjectInfo,
    layout: ProjectLayout,
    log: Arc<ProjectLogger>,
    tasks: BTreeMap<String, Task>,
    methods: BTreeMap<String, MethodFn>,
    sub_projects: BTreeMap<String, Project>,
    library_dependencies: Vec<ModuleId>,
    resolvers: Vec<Resolver>,
    configurations: Vec<Configuration>,
    properties: Arc<Mutex<PropertyStore>>,
    parallel_execution: bool,
    disable_output_directory_check: bool,
}

/// Construction-time facts about a project.
pub struct ProjectInfo {
    pub directory: PathBuf,
    /// The projects this one depends on, in declaration order.
    pub dependencies: Vec<Project>,
    /// Name of the enclosing project, if any.
    pub parent: Option<String>,
}

impl Dag for Project {
    fn dependencies(&self) -> Vec<Project> {
        self.0.info.dependencies.clone()
    }
}

impl PartialEq for Project {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Project {}
impl Hash for Project {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state)
    }
}

impl std::fmt::Debug for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Project")
            .field("name", &self.0.name)
            .field("directory", &self.0.info.directory)
            .finish()
    }
}

impl Project {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn version(&self) -> &str {
        &self.0.version
    }

    pub fn organization(&self) -> &str {
        &self.0.organization
    }

    pub fn directory(&self) -> &Path {
        &self.0.info.directory
    }

    pub fn layout(&self) -> &ProjectLayout {
        &self.0.layout
    }

    pub fn log(&self) -> &Arc<ProjectLogger> {
        &self.0.log
    }

    pub fn tasks(&self) -> &BTreeMap<String, Task> {
        &self.0.tasks
    }

    pub fn methods(&self) -> &BTreeMap<String, MethodFn> {
        &self.0.methods
    }

    pub fn sub_projects(&self) -> &BTreeMap<String, Project> {
        &self.0.sub_projects
    }

    pub fn properties(&self) -> &Arc<Mutex<PropertyStore>> {
        &self.0.properties
    }

    /// This project and everything it transitively depends on, dependencies
    /// first. Doubles as the cycle check.
    pub fn ordered_projects(&self) -> Result<Vec<Project>> {
        topological_sort_checked(self, |project| project.name().to_string())
            .map_err(KilnError::Load)
    }

    /// All projects of the tree by name, transitively.
    pub fn project_map(&self) -> BTreeMap<String, Project> {
        let mut map = BTreeMap::new();
        if let Ok(order) = self.ordered_projects() {
            for project in order {
                for (name, sub) in &project.0.sub_projects {
                    map.entry(name.clone()).or_insert_with(|| sub.clone());
                }
                map.insert(project.name().to_string(), project.clone());
            }
        }
        map
    }

    pub fn get_property(&self, key: &str) -> Option<String> {
        self.0.properties.lock().unwrap().get(key).map(str::to_string)
    }

    pub fn set_property(&self, key: &str, value: &str) {
        self.0.properties.lock().unwrap().set(key, value);
    }

    pub fn property_keys(&self) -> Vec<String> {
        self.0.properties.lock().unwrap().keys().map(str::to_string).collect()
    }

    fn save_properties(&self) -> Result<()> {
        self.0.properties.lock().unwrap().save()
    }

    /// Runs the named action over this project and its dependencies.
    ///
    /// Projects run in topological order; in parallel mode the task graphs
    /// of all participating projects drain through the worker pool. An
    /// interactive task's own action runs only on this project, though its
    /// dependencies run everywhere. Property changes persist on success and
    /// error alike, the run error taking precedence over a save error.
    pub fn act(&self, action: &str) -> Result<()> {
        let order = self.ordered_projects()?;
        self.check_output_directories(&order)?;

        let participating: Vec<Project> = order
            .iter()
            .filter(|project| project.0.tasks.contains_key(action))
            .cloned()
            .collect();
        if participating.is_empty() {
            return Err(KilnError::usage(format!("action \"{action}\" is not defined")));
        }

        debug!(action, projects = participating.len());
        let run_error = if self.0.parallel_execution && participating.len() > 1 {
            self.act_parallel(action, &participating)
        } else {
            self.act_sequential(action, &participating)
        };

        // the save-environment wrapper: property changes survive both paths
        let mut save_error = None;
        for project in &order {
            if let Err(err) = project.save_properties() {
                save_error.get_or_insert(err);
            }
        }

        match run_error {
            Some(message) => Err(KilnError::Message(message)),
            None => match save_error {
                Some(err) => Err(err),
                None => Ok(()),
            },
        }
    }

    fn act_sequential(&self, action: &str, participating: &[Project]) -> Option<String> {
        for project in participating {
            let Some(task) = project.0.tasks.get(action) else { continue };
            let result = if task.interactive() && project != self {
                // dependencies run on every project, the interactive action
                // only on the current one
                task.dependency_list().iter().find_map(Task::run)
            } else {
                task.run()
            };
            if result.is_some() {
                return result;
            }
        }
        None
    }

    fn act_parallel(&self, action: &str, participating: &[Project]) -> Option<String> {
        // per project: its own task, linked to the same-named tasks of the
        // projects it depends on; interactive actions are stripped off
        // everything but the current project
        let mut combined: HashMap<Project, Task> = HashMap::new();
        let mut tops: Vec<Task> = Vec::new();
        for project in participating {
            let Some(task) = project.0.tasks.get(action) else { continue };
            let local = if task.interactive() && project != self {
                match Task::empty().depends_on(task.dependency_list()) {
                    Ok(stripped) => stripped,
                    Err(message) => return Some(message.to_string()),
                }
            } else {
                task.clone()
            };
            let upstream: Vec<Task> = project
                .0
                .info
                .dependencies
                .iter()
                .filter_map(|dependency| combined.get(dependency).cloned())
                .collect();
            let linked = match local.depends_on(&upstream) {
                Ok(linked) => linked,
                Err(message) => return Some(message.to_string()),
            };
            linked.bind_name(&format!("{}/{}", project.name(), action));
            combined.insert(project.clone(), linked.clone());
            tops.push(linked);
        }

        let root = match Task::empty().depends_on(&tops) {
            Ok(root) => root,
            Err(message) => return Some(message.to_string()),
        };
        let scheduler = graph::Scheduler::new(&root, |_| 1);
        let failures =
            distributor::run(scheduler, distributor::default_workers(), |task| task.invoke());
        if failures.is_empty() {
            None
        } else {
            let messages: Vec<String> = failures
                .into_iter()
                .map(|(task, message)| match task.name() {
                    Some(name) => format!("{name}: {message}"),
                    None => message,
                })
                .collect();
            Some(messages.join("\n"))
        }
    }

    /// Two projects claiming the same output directory corrupt each other;
    /// reject the build unless a definition explicitly disabled the check.
    fn check_output_directories(&self, order: &[Project]) -> Result<()> {
        if self.0.disable_output_directory_check {
            return Ok(());
        }
        let mut claimed: HashMap<PathBuf, String> = HashMap::new();
        for project in order {
            for directory in project.0.layout.output_directories() {
                let canonical = utils::canonicalized(directory);
                if let Some(owner) = claimed.get(&canonical) {
                    if owner != project.name() {
                        return Err(KilnError::Setup(format!(
                            "projects \"{owner}\" and \"{}\" share the output directory {}",
                            project.name(),
                            canonical.display()
                        )));
                    }
                }
                claimed.insert(canonical, project.name().to_string());
            }
        }
        Ok(())
    }
}

/// Loads projects: properties, definition compilation, definition lookup,
/// sub-project recursion.
pub struct ProjectLoader {
    pub registry: DefinitionRegistry,
    pub compiler: Arc<dyn Compiler + Send + Sync>,
    pub log: Arc<ProjectLogger>,
}

impl ProjectLoader {
    pub fn new() -> ProjectLoader {
        ProjectLoader {
            registry: DefinitionRegistry::standard(),
            compiler: Arc::new(Scalac::discover()),
            log: Arc::new(BufferedLogger::new(ConsoleLogger::new())),
        }
    }

    pub fn with_compiler(mut self, compiler: Arc<dyn Compiler + Send + Sync>) -> ProjectLoader {
        self.compiler = compiler;
        self
    }

    /// Loads the project in `directory` as the current (root) project.
    pub fn load(&self, directory: &Path) -> Result<Project> {
        self.load_project(directory, None, Vec::new(), None)
    }

    fn load_project(
        &self,
        directory: &Path,
        declared_name: Option<&str>,
        dependency_projects: Vec<Project>,
        parent: Option<(&str, &str, &str)>,
    ) -> Result<Project> {
        let directory = utils::canonicalize(directory)
            .map_err(|err| KilnError::Setup(format!("invalid project directory: {err}")))?;
        if !directory.is_dir() {
            return Err(KilnError::Setup(format!(
                "project directory {} does not exist",
                directory.display()
            )));
        }
        let layout = ProjectLayout::new(&directory);
        let mut store = PropertyStore::load(&layout.properties)?;
        if store.get(properties::PROJECT_INITIALIZE).is_some() {
            definition::initialize_properties(&mut store)?;
        }

        let name = match (store.get(properties::PROJECT_NAME), declared_name) {
            (Some(name), _) => name.to_string(),
            (None, Some(declared)) => {
                store.set(properties::PROJECT_NAME, declared);
                declared.to_string()
            }
            (None, None) => {
                let answer = properties::prompt("Project name")?;
                store.set(properties::PROJECT_NAME, answer.clone());
                answer
            }
        };
        let version = match (store.get(properties::PROJECT_VERSION), parent) {
            (Some(version), _) => version.to_string(),
            (None, Some((_, _, inherited))) => inherited.to_string(),
            (None, None) => {
                let answer = properties::prompt("Project version")?;
                store.set(properties::PROJECT_VERSION, answer.clone());
                answer
            }
        };
        let organization = store
            .get(properties::PROJECT_ORGANIZATION)
            .map(str::to_string)
            .or_else(|| parent.map(|(_, organization, _)| organization.to_string()))
            .unwrap_or_else(|| name.clone());

        let definition = self.select_definition(&layout)?;

        let properties = Arc::new(Mutex::new(store));
        let context = ProjectContext {
            name: name.clone(),
            organization: organization.clone(),
            version: version.clone(),
            layout: layout.clone(),
            log: self.log.clone() as Arc<dyn Log>,
            compiler: self.compiler.clone(),
            properties: properties.clone(),
            dependency_classes: dependency_projects
                .iter()
                .map(|project| project.layout().main_classes.clone())
                .collect(),
        };

        let mut setup = ProjectSetup::new(context);
        definition
            .configure(&mut setup)
            .map_err(|err| KilnError::Load(err.to_string()))?;

        let children = self.load_sub_projects(&setup.sub_projects, &name, &organization, &version)?;
        let mut dependencies = dependency_projects;
        dependencies.extend(children.values().cloned());

        let data = ProjectData {
            name,
            organization,
            version,
            info: ProjectInfo {
                directory,
                dependencies,
                parent: parent.map(|(parent_name, _, _)| parent_name.to_string()),
            },
            layout,
            log: self.log.clone(),
            tasks: setup.tasks,
            methods: setup.methods,
            sub_projects: children,
            library_dependencies: setup.library_dependencies,
            resolvers: setup.resolvers,
            configurations: setup.configurations,
            properties,
            parallel_execution: setup.parallel_execution,
            disable_output_directory_check: setup.disable_output_directory_check,
        };
        Ok(Project(Arc::new(data)))
    }

    fn select_definition(&self, layout: &ProjectLayout) -> Result<Box<dyn ProjectDefinition>> {
        match builder_definition_class(layout, &*self.compiler, &*self.log)? {
            None => Ok(Box::new(DefaultDefinition)),
            Some(class_name) => self.registry.create(&class_name).ok_or_else(|| {
                KilnError::Load(format!(
                    "project definition {class_name} is not registered with this build"
                ))
            }),
        }
    }

    fn load_sub_projects(
        &self,
        declarations: &[SubProjectDeclaration],
        parent_name: &str,
        organization: &str,
        version: &str,
    ) -> Result<BTreeMap<String, Project>> {
        let mut remaining: Vec<&SubProjectDeclaration> = declarations.iter().collect();
        let mut loaded: BTreeMap<String, Project> = BTreeMap::new();
        while !remaining.is_empty() {
            let ready_index = remaining.iter().position(|declaration| {
                declaration.dependencies.iter().all(|name| loaded.contains_key(name))
            });
            let Some(index) = ready_index else {
                let names: Vec<&str> =
                    remaining.iter().map(|declaration| declaration.name.as_str()).collect();
                return Err(KilnError::Load(format!(
                    "sub-project dependency cycle or unknown reference among: {}",
                    names.join(", ")
                )));
            };
            let declaration = remaining.remove(index);
            let dependencies: Vec<Project> = declaration
                .dependencies
                .iter()
                .filter_map(|name| loaded.get(name).cloned())
                .collect();
            let child = self.load_project(
                &declaration.directory,
                Some(&declaration.name),
                dependencies,
                Some((parent_name, organization, version)),
            )?;
            loaded.insert(declaration.name.clone(), child);
        }
        Ok(loaded)
    }
}

impl Default for ProjectLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl Project {
    pub fn library_dependencies(&self) -> &[ModuleId] {
        &self.0.library_dependencies
    }

    pub fn resolvers(&self) -> &[Resolver] {
        &self.0.resolvers
    }

    pub fn configurations(&self) -> &[Configuration] {
        &self.0.configurations
    }

    pub fn parent_name(&self) -> Option<&str> {
        self.0.info.parent.as_deref()
    }

    /// Sets the log level for the whole tree (one shared logger).
    pub fn set_level(&self, level: Level) {
        self.0.log.set_level(level);
    }

    pub fn enable_trace(&self, flag: bool) {
        self.0.log.enable_trace(flag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::{AnalysisCallback, CompileRequest};
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A compiler that records invocations and products nothing.
    struct CountingCompiler(AtomicUsize);

    impl Compiler for CountingCompiler {
        fn compile(
            &self,
            request: CompileRequest<'_>,
            callback: &mut dyn AnalysisCallback,
        ) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            fs::create_dir_all(request.output_directory).unwrap();
            for source in request.sources {
                callback.begin_source(source)?;
                callback.end_source(source)?;
            }
            Ok(())
        }
    }

    fn seeded_project(dir: &Path, name: &str) {
        fs::create_dir_all(dir.join("project")).unwrap();
        fs::write(
            dir.join("project/build.properties"),
            format!("project.name={name}\nproject.version=0.1.0\nscala.version=2.7.7\n"),
        )
        .unwrap();
    }

    fn loader() -> ProjectLoader {
        ProjectLoader::new().with_compiler(Arc::new(CountingCompiler(AtomicUsize::new(0))))
    }

    #[test]
    fn loads_a_default_project_with_standard_tasks() {
        let dir = tempfile::tempdir().unwrap();
        seeded_project(dir.path(), "demo");

        let project = loader().load(dir.path()).unwrap();
        assert_eq!(project.name(), "demo");
        assert_eq!(project.version(), "0.1.0");
        assert!(project.tasks().contains_key("compile"));
        assert!(project.tasks().contains_key("test"));
        assert_eq!(project.ordered_projects().unwrap().len(), 1);
    }

    #[test]
    fn missing_directory_is_a_setup_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        match loader().load(&missing) {
            Err(KilnError::Setup(_)) => {}
            other => panic!("expected setup error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_action_is_a_usage_error() {
        let dir = tempfile::tempdir().unwrap();
        seeded_project(dir.path(), "demo");
        let project = loader().load(dir.path()).unwrap();
        match project.act("does-not-exist") {
            Err(KilnError::Usage(_)) => {}
            other => panic!("expected usage error, got {other:?}"),
        }
    }

    #[test]
    fn clean_runs_and_persists_properties() {
        let dir = tempfile::tempdir().unwrap();
        seeded_project(dir.path(), "demo");
        fs::create_dir_all(dir.path().join("target/classes")).unwrap();

        let project = loader().load(dir.path()).unwrap();
        project.set_property("custom.key", "value");
        project.act("clean").unwrap();

        assert!(!dir.path().join("target").exists());
        let content = fs::read_to_string(dir.path().join("project/build.properties")).unwrap();
        assert!(content.contains("custom.key=value"));
    }

    struct SubProjectsDefinition;
    impl ProjectDefinition for SubProjectsDefinition {
        fn configure(&self, setup: &mut ProjectSetup) -> Result<()> {
            let root = setup.context().layout.root.clone();
            for name in ["p1", "p2", "p3"] {
                setup.add_sub_project(SubProjectDeclaration {
                    name: name.to_string(),
                    directory: root.join(name),
                    dependencies: Vec::new(),
                });
            }
            setup.parallel_execution = true;
            setup.add_standard_tasks();
            Ok(())
        }
    }

    fn seeded_multi_project(dir: &Path) {
        seeded_project(dir, "root");
        for name in ["p1", "p2", "p3"] {
            let sub = dir.join(name);
            fs::create_dir_all(&sub).unwrap();
            seeded_project(&sub, name);
        }
    }

    fn multi_loader() -> ProjectLoader {
        let mut loader = loader();
        // a custom definition standing in for compiled build logic
        loader.registry.register(
            "example.RootBuild",
            Arc::new(|| Box::new(SubProjectsDefinition) as Box<dyn ProjectDefinition>),
        );
        loader
    }

    fn load_multi(dir: &Path) -> Project {
        let loader = multi_loader();
        // bypass the builder compile by constructing through the registry
        let definition = loader.registry.create("example.RootBuild").unwrap();
        let layout = ProjectLayout::new(dir);
        let store = PropertyStore::load(&layout.properties).unwrap();
        let properties = Arc::new(Mutex::new(store));
        let context = ProjectContext {
            name: "root".into(),
            organization: "org".into(),
            version: "0.1.0".into(),
            layout: layout.clone(),
            log: loader.log.clone() as Arc<dyn Log>,
            compiler: loader.compiler.clone(),
            properties: properties.clone(),
            dependency_classes: Vec::new(),
        };
        let mut setup = ProjectSetup::new(context);
        definition.configure(&mut setup).unwrap();
        let children = loader
            .load_sub_projects(&setup.sub_projects, "root", "org", "0.1.0")
            .unwrap();
        let dependencies: Vec<Project> = children.values().cloned().collect();
        Project(Arc::new(ProjectData {
            name: "root".into(),
            organization: "org".into(),
            version: "0.1.0".into(),
            info: ProjectInfo {
                directory: utils::canonicalized(dir),
                dependencies,
                parent: None,
            },
            layout,
            log: loader.log.clone(),
            tasks: setup.tasks,
            methods: setup.methods,
            sub_projects: children,
            library_dependencies: setup.library_dependencies,
            resolvers: setup.resolvers,
            configurations: setup.configurations,
            properties,
            parallel_execution: setup.parallel_execution,
            disable_output_directory_check: setup.disable_output_directory_check,
        }))
    }

    #[test]
    fn multi_project_order_has_dependencies_first() {
        let dir = tempfile::tempdir().unwrap();
        seeded_multi_project(dir.path());
        let project = load_multi(dir.path());

        let order = project.ordered_projects().unwrap();
        assert_eq!(order.len(), 4);
        assert_eq!(order.last().unwrap().name(), "root");
        assert_eq!(project.project_map().len(), 4);
    }

    #[test]
    fn parallel_clean_runs_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        seeded_multi_project(dir.path());
        for name in ["p1", "p2", "p3"] {
            fs::create_dir_all(dir.path().join(name).join("target")).unwrap();
        }
        fs::create_dir_all(dir.path().join("target")).unwrap();

        let project = load_multi(dir.path());
        project.act("clean").unwrap();

        for name in ["p1", "p2", "p3"] {
            assert!(!dir.path().join(name).join("target").exists());
        }
        assert!(!dir.path().join("target").exists());
    }

    #[test]
    fn shared_output_directories_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        seeded_multi_project(dir.path());
        let project = load_multi(dir.path());

        // second tree claiming the same directories
        let clone = Project(Arc::new(ProjectData {
            name: "impostor".into(),
            organization: "org".into(),
            version: "0.1.0".into(),
            info: ProjectInfo {
                directory: project.directory().to_path_buf(),
                dependencies: vec![project.clone()],
                parent: None,
            },
            layout: project.layout().clone(),
            log: project.log().clone(),
            tasks: project.tasks().clone(),
            methods: BTreeMap::new(),
            sub_projects: BTreeMap::new(),
            library_dependencies: Vec::new(),
            resolvers: Vec::new(),
            configurations: Vec::new(),
            properties: project.properties().clone(),
            parallel_execution: false,
            disable_output_directory_check: false,
        }));
        match clone.act("clean") {
            Err(KilnError::Setup(message)) => {
                assert!(message.contains("share the output directory"))
            }
            other => panic!("expected setup error, got {other:?}"),
        }
    }
}
