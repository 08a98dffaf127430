//! The external compiler façade.
//!
//! The engine treats the compiler as a black box: it hands over the dirty
//! sources, classpath and output directory, and receives observations back
//! through an [`AnalysisCallback`]. The production implementation spawns
//! `scalac` with an analyzer plugin that writes a machine-readable
//! dependency report; the adapter parses the report and replays it into the
//! callback. Tests drive the callback directly.

use crate::{
    error::{IoResultExt, KilnError, Result},
    logging::Log,
};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

/// How the compiler reports what it observed, source by source.
///
/// For each processed source the compiler calls `begin_source`, then any
/// number of dependency/product/subclass observations, then `end_source`.
pub trait AnalysisCallback {
    fn begin_source(&mut self, source: &Path) -> Result<()>;
    /// `from` depends on the project source `on`.
    fn source_dependency(&mut self, on: &Path, from: &Path) -> Result<()>;
    /// `from` depends on a class file outside the output directory.
    fn class_dependency(&mut self, on_file: &Path, from: &Path) -> Result<()>;
    /// `from` depends on a jar entry.
    fn jar_dependency(&mut self, on_jar: &Path, from: &Path) -> Result<()>;
    /// The compiler produced `product` from `source`.
    fn generated_class(&mut self, source: &Path, product: &Path) -> Result<()>;
    /// A concrete declaration whose supertype was in the requested list.
    fn found_subclass(
        &mut self,
        source: &Path,
        full_name: &str,
        super_name: &str,
        is_module: bool,
    ) -> Result<()>;
    fn end_source(&mut self, source: &Path) -> Result<()>;
}

/// One compiler invocation.
pub struct CompileRequest<'a> {
    pub sources: &'a [PathBuf],
    pub classpath: &'a [PathBuf],
    pub output_directory: &'a Path,
    pub options: &'a [String],
    /// Fully qualified names whose concrete subclasses the compiler reports
    /// through [`AnalysisCallback::found_subclass`].
    pub super_classes: &'a [String],
    pub log: &'a dyn Log,
}

pub trait Compiler {
    fn compile(&self, request: CompileRequest<'_>, callback: &mut dyn AnalysisCallback)
        -> Result<()>;
}

/// The dependency report the analyzer plugin writes after a compile.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CompileReport {
    pub sources: Vec<SourceReport>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SourceReport {
    pub source: PathBuf,
    #[serde(default)]
    pub source_dependencies: Vec<PathBuf>,
    #[serde(default)]
    pub class_dependencies: Vec<PathBuf>,
    #[serde(default)]
    pub jar_dependencies: Vec<PathBuf>,
    #[serde(default)]
    pub products: Vec<PathBuf>,
    #[serde(default)]
    pub subclasses: Vec<SubclassReport>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubclassReport {
    pub name: String,
    pub superclass: String,
    #[serde(default)]
    pub is_module: bool,
}

/// Replays a parsed report into the callback, preserving per-source framing.
pub fn replay_report(report: &CompileReport, callback: &mut dyn AnalysisCallback) -> Result<()> {
    for source in &report.sources {
        callback.begin_source(&source.source)?;
        for on in &source.source_dependencies {
            callback.source_dependency(on, &source.source)?;
        }
        for on in &source.class_dependencies {
            callback.class_dependency(on, &source.source)?;
        }
        for on in &source.jar_dependencies {
            callback.jar_dependency(on, &source.source)?;
        }
        for product in &source.products {
            callback.generated_class(&source.source, product)?;
        }
        for subclass in &source.subclasses {
            callback.found_subclass(
                &source.source,
                &subclass.name,
                &subclass.superclass,
                subclass.is_module,
            )?;
        }
        callback.end_source(&source.source)?;
    }
    Ok(())
}

/// Drives the external `scalac` with the analyzer plugin.
#[derive(Clone, Debug)]
pub struct Scalac {
    compiler: PathBuf,
    analyzer_plugin: Option<PathBuf>,
}

impl Scalac {
    pub fn new(compiler: impl Into<PathBuf>) -> Self {
        Scalac { compiler: compiler.into(), analyzer_plugin: None }
    }

    /// Locates `scalac` under `SCALA_HOME` when set, otherwise on the path.
    pub fn discover() -> Self {
        let compiler = std::env::var_os("SCALA_HOME")
            .map(|home| Path::new(&home).join("bin").join("scalac"))
            .unwrap_or_else(|| PathBuf::from("scalac"));
        Scalac::new(compiler)
    }

    pub fn with_analyzer_plugin(mut self, plugin: impl Into<PathBuf>) -> Self {
        self.analyzer_plugin = Some(plugin.into());
        self
    }

    fn classpath_argument(classpath: &[PathBuf]) -> String {
        let rendered: Vec<String> =
            classpath.iter().map(|entry| entry.display().to_string()).collect();
        rendered.join(if cfg!(windows) { ";" } else { ":" })
    }

    /// Generates API documentation with `scaladoc`; no analysis involved.
    pub fn doc(
        &self,
        sources: &[PathBuf],
        classpath: &[PathBuf],
        output_directory: &Path,
        log: &dyn Log,
    ) -> Result<()> {
        let scaladoc = self
            .compiler
            .parent()
            .map(|bin| bin.join("scaladoc"))
            .unwrap_or_else(|| PathBuf::from("scaladoc"));
        std::fs::create_dir_all(output_directory).err_path(output_directory)?;
        let mut cmd = Command::new(&scaladoc);
        cmd.arg("-d").arg(output_directory);
        if !classpath.is_empty() {
            cmd.arg("-classpath").arg(Self::classpath_argument(classpath));
        }
        cmd.args(sources);
        run_tool(cmd, &scaladoc, log)
    }
}

impl Compiler for Scalac {
    fn compile(
        &self,
        request: CompileRequest<'_>,
        callback: &mut dyn AnalysisCallback,
    ) -> Result<()> {
        std::fs::create_dir_all(request.output_directory).err_path(request.output_directory)?;
        let report_file = tempfile::Builder::new()
            .prefix("kiln_report")
            .suffix(".json")
            .tempfile()
            .map_err(|err| KilnError::msg(format!("could not create report file: {err}")))?;

        let mut cmd = Command::new(&self.compiler);
        cmd.arg("-d").arg(request.output_directory);
        if !request.classpath.is_empty() {
            cmd.arg("-classpath").arg(Self::classpath_argument(request.classpath));
        }
        cmd.args(request.options);
        if let Some(plugin) = &self.analyzer_plugin {
            cmd.arg(format!("-Xplugin:{}", plugin.display()));
            cmd.arg(format!("-P:analyzer:out:{}", report_file.path().display()));
            if !request.super_classes.is_empty() {
                cmd.arg(format!("-P:analyzer:supers:{}", request.super_classes.join(",")));
            }
        }
        cmd.args(request.sources);

        debug!(?cmd, "invoking compiler");
        run_tool(cmd, &self.compiler, request.log)?;

        let content = std::fs::read(report_file.path()).err_path(report_file.path())?;
        if content.is_empty() {
            // tolerated so plain scalac still works without the plugin;
            // nothing gets recorded and every source stays dirty
            request.log.warn("compiler produced no dependency report");
            return Ok(());
        }
        let report: CompileReport = serde_json::from_slice(&content)?;
        replay_report(&report, callback)
    }
}

fn run_tool(mut cmd: Command, tool: &Path, log: &dyn Log) -> Result<()> {
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    let output = cmd.output().err_path(tool)?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    for line in stdout.lines().chain(stderr.lines()) {
        if output.status.success() {
            log.info(line);
        } else {
            log.error(line);
        }
    }
    if !output.status.success() {
        return Err(KilnError::Compile(format!(
            "{} exited with {}",
            tool.display(),
            output.status
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingCallback {
        calls: Vec<String>,
    }

    impl AnalysisCallback for RecordingCallback {
        fn begin_source(&mut self, source: &Path) -> Result<()> {
            self.calls.push(format!("begin {}", source.display()));
            Ok(())
        }
        fn source_dependency(&mut self, on: &Path, from: &Path) -> Result<()> {
            self.calls.push(format!("dep {} <- {}", on.display(), from.display()));
            Ok(())
        }
        fn class_dependency(&mut self, on: &Path, _from: &Path) -> Result<()> {
            self.calls.push(format!("class {}", on.display()));
            Ok(())
        }
        fn jar_dependency(&mut self, on: &Path, _from: &Path) -> Result<()> {
            self.calls.push(format!("jar {}", on.display()));
            Ok(())
        }
        fn generated_class(&mut self, _source: &Path, product: &Path) -> Result<()> {
            self.calls.push(format!("product {}", product.display()));
            Ok(())
        }
        fn found_subclass(
            &mut self,
            _source: &Path,
            full_name: &str,
            super_name: &str,
            is_module: bool,
        ) -> Result<()> {
            self.calls.push(format!("subclass {full_name} : {super_name} ({is_module})"));
            Ok(())
        }
        fn end_source(&mut self, source: &Path) -> Result<()> {
            self.calls.push(format!("end {}", source.display()));
            Ok(())
        }
    }

    #[test]
    fn replay_preserves_per_source_framing() {
        let report = CompileReport {
            sources: vec![SourceReport {
                source: PathBuf::from("src/A.scala"),
                source_dependencies: vec![PathBuf::from("src/B.scala")],
                products: vec![PathBuf::from("target/classes/A.class")],
                subclasses: vec![SubclassReport {
                    name: "example.ASpec".into(),
                    superclass: "org.scalatest.Suite".into(),
                    is_module: false,
                }],
                ..Default::default()
            }],
        };

        let mut callback = RecordingCallback::default();
        replay_report(&report, &mut callback).unwrap();
        assert_eq!(
            callback.calls,
            vec![
                "begin src/A.scala",
                "dep src/B.scala <- src/A.scala",
                "product target/classes/A.class",
                "subclass example.ASpec : org.scalatest.Suite (false)",
                "end src/A.scala",
            ]
        );
    }

    #[test]
    fn report_json_shape() {
        let json = r#"{
            "sources": [{
                "source": "src/Main.scala",
                "products": ["target/classes/Main.class"],
                "subclasses": [{"name": "Main", "superclass": "scala.App", "is_module": true}]
            }]
        }"#;
        let report: CompileReport = serde_json::from_str(json).unwrap();
        assert_eq!(report.sources.len(), 1);
        assert!(report.sources[0].source_dependencies.is_empty());
        assert!(report.sources[0].subclasses[0].is_module);
    }
}
