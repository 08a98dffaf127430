//! Module identifiers, resolvers and dependency configurations.

use crate::error::{KilnError, Result};
use std::{collections::HashMap, fmt};

/// The canonical release repository appended to inline resolver chains.
pub const MAVEN_CENTRAL_NAME: &str = "Maven2 Repository";
pub const MAVEN_CENTRAL_ROOT: &str = "https://repo1.maven.org/maven2/";

/// `(organization, name, revision)` plus dependency-declaration details.
/// The revision is an opaque string; there are no revision-set semantics.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleId {
    pub organization: String,
    pub name: String,
    pub revision: String,
    /// Optional configuration mapping, e.g. `test->default`.
    pub configurations: Option<String>,
    pub is_changing: bool,
    pub is_transitive: bool,
}

impl ModuleId {
    pub fn new(
        organization: impl Into<String>,
        name: impl Into<String>,
        revision: impl Into<String>,
    ) -> ModuleId {
        ModuleId {
            organization: organization.into(),
            name: name.into(),
            revision: revision.into(),
            configurations: None,
            is_changing: false,
            is_transitive: true,
        }
    }

    /// Parses `organization:name:revision`.
    pub fn from_coordinates(coordinates: &str) -> Result<ModuleId> {
        let parts: Vec<&str> = coordinates.split(':').collect();
        match parts.as_slice() {
            [organization, name, revision]
                if !organization.is_empty() && !name.is_empty() && !revision.is_empty() =>
            {
                Ok(ModuleId::new(*organization, *name, *revision))
            }
            _ => Err(KilnError::msg(format!(
                "expected organization:name:revision, got {coordinates:?}"
            ))),
        }
    }

    pub fn in_configurations(mut self, mapping: impl Into<String>) -> ModuleId {
        self.configurations = Some(mapping.into());
        self
    }

    pub fn changing(mut self) -> ModuleId {
        self.is_changing = true;
        self
    }

    pub fn intransitive(mut self) -> ModuleId {
        self.is_transitive = false;
        self
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.organization, self.name, self.revision)
    }
}

/// Credentials for a transported repository.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Authentication {
    pub user: Option<String>,
    pub password: Option<String>,
}

/// How a pattern repository is reached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transport {
    Filesystem,
    Ssh(Authentication),
    Sftp(Authentication),
}

/// A named location artifacts are fetched from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolver {
    /// A Maven-style HTTP repository.
    MavenRepository { name: String, root: String },
    /// Ivy/artifact pattern based layout, optionally behind a transport.
    PatternRepository {
        name: String,
        ivy_patterns: Vec<String>,
        artifact_patterns: Vec<String>,
        maven_compatible: bool,
        transport: Option<Transport>,
    },
}

impl Resolver {
    pub fn maven_central() -> Resolver {
        Resolver::MavenRepository {
            name: MAVEN_CENTRAL_NAME.to_string(),
            root: MAVEN_CENTRAL_ROOT.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Resolver::MavenRepository { name, .. } => name,
            Resolver::PatternRepository { name, .. } => name,
        }
    }
}

/// Resolver names must be unique within one resolution's chain.
pub fn check_resolver_chain(resolvers: &[Resolver]) -> Result<()> {
    let mut seen = Vec::new();
    for resolver in resolvers {
        if seen.contains(&resolver.name()) {
            return Err(KilnError::msg(format!(
                "duplicate resolver name {:?} in resolver chain",
                resolver.name()
            )));
        }
        seen.push(resolver.name());
    }
    Ok(())
}

/// A named dependency scope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Configuration {
    pub name: String,
    pub description: Option<String>,
    pub public: bool,
    pub extends: Vec<String>,
    pub transitive: bool,
}

impl Configuration {
    pub fn new(name: impl Into<String>) -> Configuration {
        Configuration {
            name: name.into(),
            description: None,
            public: true,
            extends: Vec::new(),
            transitive: true,
        }
    }

    pub fn extending(mut self, parents: &[&str]) -> Configuration {
        self.extends = parents.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn private(mut self) -> Configuration {
        self.public = false;
        self
    }

    pub fn described_as(mut self, description: impl Into<String>) -> Configuration {
        self.description = Some(description.into());
        self
    }
}

/// The standard configurations most projects declare.
pub fn default_configurations() -> Vec<Configuration> {
    vec![
        Configuration::new("compile").described_as("Compile-time dependencies"),
        Configuration::new("runtime")
            .described_as("Runtime dependencies")
            .extending(&["compile"]),
        Configuration::new("test")
            .described_as("Test dependencies")
            .extending(&["runtime"])
            .private(),
    ]
}

/// Collapses duplicate names (last declaration wins) and rejects cyclic
/// extension graphs.
pub fn check_configurations(configurations: &[Configuration]) -> Result<Vec<Configuration>> {
    let mut collapsed: Vec<Configuration> = Vec::new();
    for configuration in configurations {
        collapsed.retain(|existing| existing.name != configuration.name);
        collapsed.push(configuration.clone());
    }

    let by_name: HashMap<&str, &Configuration> =
        collapsed.iter().map(|c| (c.name.as_str(), c)).collect();

    fn visit<'a>(
        name: &'a str,
        by_name: &HashMap<&'a str, &'a Configuration>,
        visiting: &mut Vec<&'a str>,
        done: &mut Vec<&'a str>,
    ) -> Result<()> {
        if done.contains(&name) {
            return Ok(());
        }
        if visiting.contains(&name) {
            return Err(KilnError::msg(format!(
                "configuration extension cycle involving {name:?}"
            )));
        }
        visiting.push(name);
        if let Some(configuration) = by_name.get(name) {
            for parent in &configuration.extends {
                visit(parent, by_name, visiting, done)?;
            }
        }
        visiting.pop();
        done.push(name);
        Ok(())
    }

    let mut done = Vec::new();
    for configuration in &collapsed {
        visit(&configuration.name, &by_name, &mut Vec::new(), &mut done)?;
    }
    Ok(collapsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinates_parse() {
        let module = ModuleId::from_coordinates("org.example:foo:1.0").unwrap();
        assert_eq!(module.organization, "org.example");
        assert_eq!(module.name, "foo");
        assert_eq!(module.revision, "1.0");
        assert!(module.is_transitive);
        assert!(ModuleId::from_coordinates("no-colons").is_err());
        assert!(ModuleId::from_coordinates("a::c").is_err());
    }

    #[test]
    fn duplicate_resolver_names_rejected() {
        let chain = vec![
            Resolver::maven_central(),
            Resolver::MavenRepository {
                name: MAVEN_CENTRAL_NAME.to_string(),
                root: "https://elsewhere.example/".to_string(),
            },
        ];
        assert!(check_resolver_chain(&chain).is_err());
    }

    #[test]
    fn duplicate_configurations_keep_the_last() {
        let collapsed = check_configurations(&[
            Configuration::new("compile").described_as("first"),
            Configuration::new("compile").described_as("second"),
        ])
        .unwrap();
        assert_eq!(collapsed.len(), 1);
        assert_eq!(collapsed[0].description.as_deref(), Some("second"));
    }

    #[test]
    fn extension_cycles_are_rejected() {
        let cyclic = [
            Configuration::new("a").extending(&["b"]),
            Configuration::new("b").extending(&["a"]),
        ];
        assert!(check_configurations(&cyclic).is_err());

        let acyclic = check_configurations(&default_configurations()).unwrap();
        assert_eq!(acyclic.len(), 3);
    }
}
