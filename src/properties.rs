//! The per-project property store, persisted to `project/build.properties`.

use crate::{
    error::{KilnError, Result},
    utils,
};
use semver::Version;
use std::{
    collections::BTreeMap,
    io::{IsTerminal, Write},
    path::{Path, PathBuf},
};

pub const PROJECT_NAME: &str = "project.name";
pub const PROJECT_ORGANIZATION: &str = "project.organization";
pub const PROJECT_VERSION: &str = "project.version";
pub const SCALA_VERSION: &str = "scala.version";
pub const KILN_VERSION: &str = "kiln.version";
pub const PROJECT_INITIALIZE: &str = "project.initialize";

/// String-keyed properties with dirty tracking; written back only at task
/// end through the save-environment wrapper.
#[derive(Debug)]
pub struct PropertyStore {
    file: PathBuf,
    values: BTreeMap<String, String>,
    modified: bool,
}

impl PropertyStore {
    /// Loads the store; a missing file is an empty store.
    pub fn load(file: impl Into<PathBuf>) -> Result<PropertyStore> {
        let file = file.into();
        let mut values = BTreeMap::new();
        if file.exists() {
            let content = utils::read_string(&file)?;
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    values.insert(key.trim().to_string(), value.trim().to_string());
                }
            }
        }
        Ok(PropertyStore { file, values, modified: false })
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if self.values.get(&key).map(String::as_str) != Some(value.as_str()) {
            self.values.insert(key, value);
            self.modified = true;
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let removed = self.values.remove(key);
        if removed.is_some() {
            self.modified = true;
        }
        removed
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// A property that must parse as a version.
    pub fn get_version(&self, key: &str) -> Result<Option<Version>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => Version::parse(raw)
                .map(Some)
                .map_err(|err| KilnError::Setup(format!("property {key} is not a version: {err}"))),
        }
    }

    /// Writes the store back if anything changed since load.
    pub fn save(&mut self) -> Result<()> {
        if !self.modified {
            return Ok(());
        }
        let mut content = String::from("# project properties\n");
        for (key, value) in &self.values {
            content.push_str(key);
            content.push('=');
            content.push_str(value);
            content.push('\n');
        }
        utils::write_string(&self.file, &content)?;
        self.modified = false;
        Ok(())
    }
}

/// Prompts on the controlling terminal for a required property. Fails when
/// there is no terminal to ask on.
pub fn prompt(question: &str) -> Result<String> {
    let stdin = std::io::stdin();
    if !stdin.is_terminal() {
        return Err(KilnError::Setup(format!(
            "property required but standard input is not a terminal: {question}"
        )));
    }
    print!("{question}: ");
    std::io::stdout().flush().map_err(|err| KilnError::io(err, PathBuf::from("<stdout>")))?;
    let mut answer = String::new();
    stdin
        .read_line(&mut answer)
        .map_err(|err| KilnError::io(err, PathBuf::from("<stdin>")))?;
    Ok(answer.trim().to_string())
}
