//! POM and ivy XML: generation for publishing, parsing for resolution.

use super::module::ModuleId;
use crate::error::{KilnError, Result};
use roxmltree::{Document, Node};

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Renders a minimal `pom.xml` for the module and its declared dependencies.
pub fn pom_xml(module: &ModuleId, dependencies: &[ModuleId]) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str("<project xmlns=\"http://maven.apache.org/POM/4.0.0\">\n");
    out.push_str("  <modelVersion>4.0.0</modelVersion>\n");
    out.push_str(&format!("  <groupId>{}</groupId>\n", escape(&module.organization)));
    out.push_str(&format!("  <artifactId>{}</artifactId>\n", escape(&module.name)));
    out.push_str(&format!("  <version>{}</version>\n", escape(&module.revision)));
    if !dependencies.is_empty() {
        out.push_str("  <dependencies>\n");
        for dependency in dependencies {
            out.push_str("    <dependency>\n");
            out.push_str(&format!(
                "      <groupId>{}</groupId>\n",
                escape(&dependency.organization)
            ));
            out.push_str(&format!(
                "      <artifactId>{}</artifactId>\n",
                escape(&dependency.name)
            ));
            out.push_str(&format!(
                "      <version>{}</version>\n",
                escape(&dependency.revision)
            ));
            out.push_str("    </dependency>\n");
        }
        out.push_str("  </dependencies>\n");
    }
    out.push_str("</project>\n");
    out
}

/// Wraps inline dependency declarations in the fixed `ivy-module` envelope.
pub fn ivy_module_xml(module: &ModuleId, fragment: Option<&str>) -> String {
    let mut out = String::new();
    out.push_str("<ivy-module version=\"2.0\">\n");
    out.push_str(&format!(
        "  <info organisation=\"{}\" module=\"{}\" revision=\"{}\"/>\n",
        escape(&module.organization),
        escape(&module.name),
        escape(&module.revision)
    ));
    if let Some(fragment) = fragment {
        for line in fragment.lines() {
            out.push_str("  ");
            out.push_str(line);
            out.push('\n');
        }
    }
    out.push_str("</ivy-module>\n");
    out
}

fn child_text<'a>(node: Node<'a, '_>, name: &str) -> Option<&'a str> {
    node.children()
        .find(|child| child.is_element() && child.tag_name().name() == name)
        .and_then(|child| child.text())
        .map(str::trim)
}

fn find_child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|child| child.is_element() && child.tag_name().name() == name)
}

/// Extracts the module and its compile/runtime dependencies from a POM.
///
/// Dependencies with unresolvable (interpolated) versions, non-compile
/// scopes or the optional marker are skipped.
pub fn parse_pom(text: &str) -> Result<(Option<ModuleId>, Vec<ModuleId>)> {
    let document =
        Document::parse(text).map_err(|err| KilnError::msg(format!("invalid pom: {err}")))?;
    let project = document.root_element();

    let parent = find_child(project, "parent");
    let group = child_text(project, "groupId")
        .or_else(|| parent.and_then(|p| child_text(p, "groupId")));
    let version = child_text(project, "version")
        .or_else(|| parent.and_then(|p| child_text(p, "version")));
    let artifact = child_text(project, "artifactId");

    let module = match (group, artifact, version) {
        (Some(group), Some(artifact), Some(version)) => {
            Some(ModuleId::new(group, artifact, version))
        }
        _ => None,
    };

    let mut dependencies = Vec::new();
    if let Some(list) = find_child(project, "dependencies") {
        for node in list.children().filter(|n| n.is_element() && n.tag_name().name() == "dependency")
        {
            let scope = child_text(node, "scope").unwrap_or("compile");
            if scope != "compile" && scope != "runtime" {
                continue;
            }
            if child_text(node, "optional") == Some("true") {
                continue;
            }
            let (Some(group), Some(artifact), Some(version)) = (
                child_text(node, "groupId"),
                child_text(node, "artifactId"),
                child_text(node, "version"),
            ) else {
                continue;
            };
            if version.contains("${") || group.contains("${") {
                continue;
            }
            dependencies.push(ModuleId::new(group, artifact, version));
        }
    }
    Ok((module, dependencies))
}

/// Extracts the module and declared dependencies from an `ivy.xml`.
pub fn parse_ivy(text: &str) -> Result<(Option<ModuleId>, Vec<ModuleId>)> {
    let document =
        Document::parse(text).map_err(|err| KilnError::msg(format!("invalid ivy file: {err}")))?;
    let root = document.root_element();

    let module = find_child(root, "info").and_then(|info| {
        let organisation = info.attribute("organisation")?;
        let name = info.attribute("module")?;
        let revision = info.attribute("revision").unwrap_or("working");
        Some(ModuleId::new(organisation, name, revision))
    });

    let mut dependencies = Vec::new();
    if let Some(list) = find_child(root, "dependencies") {
        for node in list.children().filter(|n| n.is_element() && n.tag_name().name() == "dependency")
        {
            let (Some(organisation), Some(name), Some(revision)) =
                (node.attribute("org"), node.attribute("name"), node.attribute("rev"))
            else {
                continue;
            };
            let mut dependency = ModuleId::new(organisation, name, revision);
            if let Some(mapping) = node.attribute("conf") {
                dependency = dependency.in_configurations(mapping);
            }
            if node.attribute("transitive") == Some("false") {
                dependency = dependency.intransitive();
            }
            if node.attribute("changing") == Some("true") {
                dependency = dependency.changing();
            }
            dependencies.push(dependency);
        }
    }
    Ok((module, dependencies))
}

/// Parses an inline ivy dependency fragment by wrapping it in the standard
/// envelope.
pub fn parse_dependency_fragment(module: &ModuleId, fragment: &str) -> Result<Vec<ModuleId>> {
    let (_, dependencies) = parse_ivy(&ivy_module_xml(module, Some(fragment)))?;
    Ok(dependencies)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_pom_parses_back() {
        let module = ModuleId::new("org.example", "app", "0.3");
        let dependencies =
            vec![ModuleId::new("junit", "junit", "4.5"), ModuleId::new("org.scala-lang", "scala-library", "2.7.7")];
        let xml = pom_xml(&module, &dependencies);
        let (parsed, parsed_dependencies) = parse_pom(&xml).unwrap();
        assert_eq!(parsed, Some(module));
        assert_eq!(parsed_dependencies, dependencies);
    }

    #[test]
    fn pom_skips_test_and_optional_dependencies() {
        let xml = r#"<project>
            <groupId>g</groupId><artifactId>a</artifactId><version>1</version>
            <dependencies>
              <dependency><groupId>x</groupId><artifactId>keep</artifactId><version>1</version></dependency>
              <dependency><groupId>x</groupId><artifactId>test-only</artifactId><version>1</version><scope>test</scope></dependency>
              <dependency><groupId>x</groupId><artifactId>opt</artifactId><version>1</version><optional>true</optional></dependency>
              <dependency><groupId>x</groupId><artifactId>prop</artifactId><version>${managed.version}</version></dependency>
            </dependencies>
          </project>"#;
        let (_, dependencies) = parse_pom(xml).unwrap();
        assert_eq!(dependencies, vec![ModuleId::new("x", "keep", "1")]);
    }

    #[test]
    fn pom_inherits_group_and_version_from_parent() {
        let xml = r#"<project>
            <parent><groupId>g</groupId><artifactId>parent</artifactId><version>2</version></parent>
            <artifactId>child</artifactId>
          </project>"#;
        let (module, _) = parse_pom(xml).unwrap();
        assert_eq!(module, Some(ModuleId::new("g", "child", "2")));
    }

    #[test]
    fn ivy_fragment_round_trip() {
        let module = ModuleId::new("org.example", "app", "0.3");
        let fragment = r#"<dependencies>
  <dependency org="org.scalacheck" name="scalacheck" rev="1.5" conf="test->default" transitive="false"/>
</dependencies>"#;
        let xml = ivy_module_xml(&module, Some(fragment));
        assert!(xml.starts_with("<ivy-module version=\"2.0\">"));

        let dependencies = parse_dependency_fragment(&module, fragment).unwrap();
        assert_eq!(dependencies.len(), 1);
        assert_eq!(dependencies[0].configurations.as_deref(), Some("test->default"));
        assert!(!dependencies[0].is_transitive);
    }
}
