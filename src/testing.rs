//! Running discovered tests.
//!
//! Tests are not scanned for at run time: the compile analysis already
//! recorded every concrete subclass of the registered frameworks' base
//! types. At `test` time the definitions are grouped by framework and each
//! group is handed to the framework's runner, which executes the class in a
//! child process whose classpath holds only the test classpath and the
//! framework itself, so loaded code cannot see the build tool's own
//! symbols.

use crate::{
    analysis::TestDefinition,
    error::{KilnError, Result},
    logging::Log,
};
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    path::PathBuf,
    process::{Command, Stdio},
};

/// Declares how a framework's tests are recognized and run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestFramework {
    pub name: String,
    /// Subclasses of this fully qualified type are this framework's tests.
    pub super_class_name: String,
    /// Whether test declarations must be modules (singletons) rather than
    /// ordinary classes.
    pub requires_module: bool,
    /// The adapter class executed in the child runner.
    pub adapter_class: String,
}

impl TestFramework {
    pub fn matches(&self, definition: &TestDefinition) -> bool {
        self.super_class_name == definition.super_class_name
            && self.requires_module == definition.is_module
    }
}

/// The frameworks wired in by default.
pub fn default_frameworks() -> Vec<TestFramework> {
    vec![
        TestFramework {
            name: "ScalaCheck".to_string(),
            super_class_name: "org.scalacheck.Properties".to_string(),
            requires_module: true,
            adapter_class: "kiln.adapter.ScalaCheckAdapter".to_string(),
        },
        TestFramework {
            name: "ScalaTest".to_string(),
            super_class_name: "org.scalatest.Suite".to_string(),
            requires_module: false,
            adapter_class: "kiln.adapter.ScalaTestAdapter".to_string(),
        },
        TestFramework {
            name: "specs".to_string(),
            super_class_name: "org.specs.Specification".to_string(),
            requires_module: true,
            adapter_class: "kiln.adapter.SpecsAdapter".to_string(),
        },
    ]
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TestResult {
    Passed,
    Failed,
    Error,
}

impl TestResult {
    fn worst(self, other: TestResult) -> TestResult {
        match (self, other) {
            (TestResult::Error, _) | (_, TestResult::Error) => TestResult::Error,
            (TestResult::Failed, _) | (_, TestResult::Failed) => TestResult::Failed,
            _ => TestResult::Passed,
        }
    }
}

/// Lifecycle callbacks reported in order; a listener that panics is logged
/// and the run continues.
pub trait TestListener {
    fn do_init(&mut self) {}
    fn start_group(&mut self, _framework: &str) {}
    fn test_event(&mut self, _class_name: &str, _result: TestResult) {}
    fn end_group(&mut self, _framework: &str) {}
    fn do_complete(&mut self, _overall: TestResult) {}
}

/// Executes a single test class, returning its verdict.
pub trait FrameworkRunner {
    fn run_test(&mut self, class_name: &str) -> Result<TestResult>;
}

/// Runs each test class in a child `scala` process with a constrained
/// classpath. Exit status is the protocol: 0 passed, 1 failed, anything
/// else an error.
pub struct ProcessRunner {
    runtime: PathBuf,
    classpath: Vec<PathBuf>,
    adapter_class: String,
    log_output: bool,
}

impl ProcessRunner {
    pub fn new(runtime: impl Into<PathBuf>, classpath: Vec<PathBuf>, adapter_class: String) -> Self {
        ProcessRunner { runtime: runtime.into(), classpath, adapter_class, log_output: true }
    }

    fn classpath_argument(&self) -> String {
        let rendered: Vec<String> =
            self.classpath.iter().map(|entry| entry.display().to_string()).collect();
        rendered.join(if cfg!(windows) { ";" } else { ":" })
    }
}

impl FrameworkRunner for ProcessRunner {
    fn run_test(&mut self, class_name: &str) -> Result<TestResult> {
        let mut cmd = Command::new(&self.runtime);
        cmd.arg("-classpath")
            .arg(self.classpath_argument())
            .arg(&self.adapter_class)
            .arg(class_name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let output = cmd
            .output()
            .map_err(|err| KilnError::msg(format!("could not run {class_name}: {err}")))?;
        if self.log_output {
            trace!(class = class_name, status = ?output.status);
        }
        match output.status.code() {
            Some(0) => Ok(TestResult::Passed),
            Some(1) => Ok(TestResult::Failed),
            _ => Ok(TestResult::Error),
        }
    }
}

/// Groups the definitions by framework and runs everything, reporting to
/// the listeners and aggregating the verdict: Error beats Failed beats
/// Passed. Zero tests is a success.
pub fn run_tests(
    frameworks: &[TestFramework],
    definitions: &[TestDefinition],
    mut runner_for: impl FnMut(&TestFramework) -> Box<dyn FrameworkRunner>,
    listeners: &mut [Box<dyn TestListener>],
    log: &dyn Log,
) -> Result<()> {
    if definitions.is_empty() {
        log.info("No tests to run.");
        return Ok(());
    }

    notify(listeners, log, |listener| listener.do_init());

    let mut overall = TestResult::Passed;
    for framework in frameworks {
        let group: Vec<&TestDefinition> =
            definitions.iter().filter(|definition| framework.matches(definition)).collect();
        if group.is_empty() {
            continue;
        }
        log.info(&format!("Running {} tests...", framework.name));
        notify(listeners, log, |listener| listener.start_group(&framework.name));

        let mut runner = runner_for(framework);
        for definition in group {
            let result = match runner.run_test(&definition.class_name) {
                Ok(result) => result,
                Err(err) => {
                    log.error(&err.to_string());
                    TestResult::Error
                }
            };
            match result {
                TestResult::Passed => log.info(&format!("+ {}", definition.class_name)),
                TestResult::Failed => log.error(&format!("- {} (failed)", definition.class_name)),
                TestResult::Error => log.error(&format!("x {} (error)", definition.class_name)),
            }
            overall = overall.worst(result);
            notify(listeners, log, |listener| {
                listener.test_event(&definition.class_name, result)
            });
        }
        notify(listeners, log, |listener| listener.end_group(&framework.name));
    }

    notify(listeners, log, |listener| listener.do_complete(overall));

    match overall {
        TestResult::Passed => {
            log.success("All tests PASSED.");
            Ok(())
        }
        TestResult::Failed => Err(KilnError::TestsFailed("One or more tests FAILED.".to_string())),
        TestResult::Error => {
            Err(KilnError::TestsErrored("One or more tests could not be run.".to_string()))
        }
    }
}

// listener failures must never abort the run
fn notify(
    listeners: &mut [Box<dyn TestListener>],
    log: &dyn Log,
    mut call: impl FnMut(&mut Box<dyn TestListener>),
) {
    for listener in listeners.iter_mut() {
        if catch_unwind(AssertUnwindSafe(|| call(listener))).is_err() {
            log.error("test listener failed; continuing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{LogEvent, RecordedLogger};
    use std::collections::HashMap;

    struct MapRunner {
        results: HashMap<String, TestResult>,
    }

    impl FrameworkRunner for MapRunner {
        fn run_test(&mut self, class_name: &str) -> Result<TestResult> {
            Ok(*self.results.get(class_name).unwrap_or(&TestResult::Error))
        }
    }

    fn definition(class: &str, superclass: &str, is_module: bool) -> TestDefinition {
        TestDefinition {
            class_name: class.to_string(),
            super_class_name: superclass.to_string(),
            is_module,
        }
    }

    fn run_with(
        definitions: &[TestDefinition],
        results: HashMap<String, TestResult>,
        listeners: &mut [Box<dyn TestListener>],
    ) -> (Result<()>, Vec<LogEvent>) {
        let log = RecordedLogger::new();
        let outcome = run_tests(
            &default_frameworks(),
            definitions,
            |_| Box::new(MapRunner { results: results.clone() }),
            listeners,
            &log,
        );
        (outcome, log.take())
    }

    #[test]
    fn no_tests_is_a_success() {
        let (outcome, events) = run_with(&[], HashMap::new(), &mut []);
        assert!(outcome.is_ok());
        assert!(events
            .iter()
            .any(|event| matches!(event, LogEvent::Log(_, m) if m == "No tests to run.")));
    }

    #[test]
    fn definitions_group_by_matching_framework() {
        let definitions = vec![
            definition("a.Props", "org.scalacheck.Properties", true),
            definition("b.Suite", "org.scalatest.Suite", false),
            // wrong kind: Properties as a plain class matches nothing
            definition("c.NotATest", "org.scalacheck.Properties", false),
        ];
        let results = HashMap::from([
            ("a.Props".to_string(), TestResult::Passed),
            ("b.Suite".to_string(), TestResult::Passed),
        ]);
        let (outcome, events) = run_with(&definitions, results, &mut []);
        assert!(outcome.is_ok());
        let rendered = format!("{events:?}");
        assert!(rendered.contains("Running ScalaCheck tests"));
        assert!(rendered.contains("Running ScalaTest tests"));
        assert!(!rendered.contains("NotATest"));
    }

    #[test]
    fn verdict_aggregation_prefers_error_over_failed() {
        let definitions = vec![
            definition("a.One", "org.scalatest.Suite", false),
            definition("a.Two", "org.scalatest.Suite", false),
        ];
        let failed = HashMap::from([
            ("a.One".to_string(), TestResult::Passed),
            ("a.Two".to_string(), TestResult::Failed),
        ]);
        let (outcome, _) = run_with(&definitions, failed, &mut []);
        assert!(matches!(outcome, Err(KilnError::TestsFailed(_))));

        let errored = HashMap::from([
            ("a.One".to_string(), TestResult::Failed),
            ("a.Two".to_string(), TestResult::Error),
        ]);
        let (outcome, _) = run_with(&definitions, errored, &mut []);
        assert!(matches!(outcome, Err(KilnError::TestsErrored(_))));
    }

    #[test]
    fn listeners_see_the_lifecycle_in_order() {
        use std::{cell::RefCell, rc::Rc};

        struct Recording(Rc<RefCell<Vec<String>>>);
        impl TestListener for Recording {
            fn do_init(&mut self) {
                self.0.borrow_mut().push("init".into());
            }
            fn start_group(&mut self, framework: &str) {
                self.0.borrow_mut().push(format!("start {framework}"));
            }
            fn test_event(&mut self, class_name: &str, _result: TestResult) {
                self.0.borrow_mut().push(format!("event {class_name}"));
            }
            fn end_group(&mut self, framework: &str) {
                self.0.borrow_mut().push(format!("end {framework}"));
            }
            fn do_complete(&mut self, _overall: TestResult) {
                self.0.borrow_mut().push("complete".into());
            }
        }

        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut listeners: Vec<Box<dyn TestListener>> =
            vec![Box::new(Recording(Rc::clone(&seen)))];

        let definitions = vec![definition("a.Suite", "org.scalatest.Suite", false)];
        let results = HashMap::from([("a.Suite".to_string(), TestResult::Passed)]);
        let (outcome, _) = run_with(&definitions, results, &mut listeners);
        assert!(outcome.is_ok());

        assert_eq!(
            &*seen.borrow(),
            &vec![
                "init".to_string(),
                "start ScalaTest".to_string(),
                "event a.Suite".to_string(),
                "end ScalaTest".to_string(),
                "complete".to_string(),
            ]
        );
    }

    #[test]
    fn a_panicking_listener_does_not_abort_the_run() {
        struct Panicking;
        impl TestListener for Panicking {
            fn do_init(&mut self) {
                panic!("listener bug");
            }
        }
        let mut listeners: Vec<Box<dyn TestListener>> = vec![Box::new(Panicking)];
        let definitions = vec![definition("a.Suite", "org.scalatest.Suite", false)];
        let results = HashMap::from([("a.Suite".to_string(), TestResult::Passed)]);
        let (outcome, _) = run_with(&definitions, results, &mut listeners);
        assert!(outcome.is_ok());
    }
}
