//! Name filters and lazily evaluated path sets.
//!
//! A [`NameFilter`] matches final path components: exact names, globs whose
//! only wildcard is `*`, regular expressions, and boolean combinations of
//! those. A [`PathFinder`] is a set-valued expression over the filesystem;
//! evaluation with [`PathFinder::get`] walks the disk at that instant and is
//! never cached.

use crate::{
    error::{KilnError, Result},
    paths::ProjectPath,
    utils,
};
use regex::Regex;
use std::collections::BTreeSet;
use walkdir::WalkDir;

/// A predicate over file names.
#[derive(Clone, Debug)]
pub enum NameFilter {
    /// Accepts everything.
    All,
    Exact(String),
    /// Split on `*`: first part anchors the start, last part the end,
    /// interior parts must occur in order.
    Glob(Vec<String>),
    Pattern(Regex),
    And(Box<NameFilter>, Box<NameFilter>),
    Or(Box<NameFilter>, Box<NameFilter>),
    /// Accepts what the first accepts and the second rejects.
    Minus(Box<NameFilter>, Box<NameFilter>),
    Not(Box<NameFilter>),
}

impl NameFilter {
    pub fn exact(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        check_expression(&name)?;
        Ok(NameFilter::Exact(name))
    }

    /// Builds a glob filter. `*` means zero or more of any character; a
    /// pattern without `*` is an exact filter and `"*"` accepts everything.
    pub fn glob(expression: impl AsRef<str>) -> Result<Self> {
        let expression = expression.as_ref();
        check_expression(expression)?;
        if !expression.contains('*') {
            return Ok(NameFilter::Exact(expression.to_string()));
        }
        if expression == "*" {
            return Ok(NameFilter::All);
        }
        Ok(NameFilter::Glob(expression.split('*').map(str::to_string).collect()))
    }

    pub fn pattern(expression: &str) -> Result<Self> {
        check_expression(expression)?;
        let regex = Regex::new(expression)
            .map_err(|err| KilnError::msg(format!("invalid filter pattern: {err}")))?;
        Ok(NameFilter::Pattern(regex))
    }

    pub fn accepts(&self, name: &str) -> bool {
        match self {
            NameFilter::All => true,
            NameFilter::Exact(exact) => name == exact,
            NameFilter::Glob(parts) => glob_matches(parts, name),
            NameFilter::Pattern(regex) => regex.is_match(name),
            NameFilter::And(a, b) => a.accepts(name) && b.accepts(name),
            NameFilter::Or(a, b) => a.accepts(name) || b.accepts(name),
            NameFilter::Minus(a, b) => a.accepts(name) && !b.accepts(name),
            NameFilter::Not(inner) => !inner.accepts(name),
        }
    }
}

fn check_expression(expression: &str) -> Result<()> {
    if expression.chars().any(char::is_control) {
        return Err(KilnError::msg(format!(
            "filter expression {expression:?} may not contain control characters"
        )));
    }
    Ok(())
}

fn glob_matches(parts: &[String], name: &str) -> bool {
    debug_assert!(parts.len() >= 2);
    let mut remaining = match name.strip_prefix(parts[0].as_str()) {
        Some(rest) => rest,
        None => return false,
    };
    let last = &parts[parts.len() - 1];
    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match remaining.find(part.as_str()) {
            Some(index) => remaining = &remaining[index + part.len()..],
            None => return false,
        }
    }
    remaining.ends_with(last.as_str())
}

impl std::ops::BitOr for NameFilter {
    type Output = NameFilter;
    fn bitor(self, other: NameFilter) -> NameFilter {
        NameFilter::Or(Box::new(self), Box::new(other))
    }
}

impl std::ops::BitAnd for NameFilter {
    type Output = NameFilter;
    fn bitand(self, other: NameFilter) -> NameFilter {
        NameFilter::And(Box::new(self), Box::new(other))
    }
}

impl std::ops::Sub for NameFilter {
    type Output = NameFilter;
    fn sub(self, other: NameFilter) -> NameFilter {
        NameFilter::Minus(Box::new(self), Box::new(other))
    }
}

impl std::ops::Not for NameFilter {
    type Output = NameFilter;
    fn not(self) -> NameFilter {
        NameFilter::Not(Box::new(self))
    }
}

/// A lazily evaluated, set-valued filesystem expression.
#[derive(Clone, Debug)]
pub enum PathFinder {
    Empty,
    /// A literal path, included whether or not it exists yet.
    Single(ProjectPath),
    Union(Box<PathFinder>, Box<PathFinder>),
    Difference(Box<PathFinder>, Box<PathFinder>),
    /// All strict descendents whose name matches.
    Descendents(Box<PathFinder>, NameFilter),
    /// Descendents matching `include` whose ancestor chain below the base
    /// contains no directory matching `exclude`.
    DescendentsExcept(Box<PathFinder>, NameFilter, NameFilter),
    /// Immediate children whose name matches.
    Children(Box<PathFinder>, NameFilter),
    /// The named child of every path in the base set, looked up literally.
    Child(Box<PathFinder>, String),
}

impl From<ProjectPath> for PathFinder {
    fn from(path: ProjectPath) -> Self {
        PathFinder::Single(path)
    }
}

impl PathFinder {
    pub fn empty() -> Self {
        PathFinder::Empty
    }

    pub fn descendents(self, filter: NameFilter) -> Self {
        PathFinder::Descendents(Box::new(self), filter)
    }

    pub fn descendents_except(self, include: NameFilter, exclude: NameFilter) -> Self {
        PathFinder::DescendentsExcept(Box::new(self), include, exclude)
    }

    pub fn children(self, filter: NameFilter) -> Self {
        PathFinder::Children(Box::new(self), filter)
    }

    pub fn child(self, name: impl Into<String>) -> Self {
        PathFinder::Child(Box::new(self), name.into())
    }

    /// Evaluates the expression against the filesystem right now.
    pub fn get(&self) -> BTreeSet<ProjectPath> {
        let mut into = BTreeSet::new();
        self.eval(&mut into);
        into
    }

    /// The evaluated set as plain OS paths.
    pub fn get_files(&self) -> BTreeSet<std::path::PathBuf> {
        self.get().into_iter().map(|path| path.as_file().to_path_buf()).collect()
    }

    fn eval(&self, into: &mut BTreeSet<ProjectPath>) {
        match self {
            PathFinder::Empty => {}
            PathFinder::Single(path) => {
                into.insert(path.clone());
            }
            PathFinder::Union(a, b) => {
                a.eval(into);
                b.eval(into);
            }
            PathFinder::Difference(a, b) => {
                let mut left = BTreeSet::new();
                a.eval(&mut left);
                let mut right = BTreeSet::new();
                b.eval(&mut right);
                into.extend(left.difference(&right).cloned());
            }
            PathFinder::Descendents(base, filter) => {
                for base_path in base.get() {
                    walk(&base_path, filter, None, into);
                }
            }
            PathFinder::DescendentsExcept(base, include, exclude) => {
                for base_path in base.get() {
                    walk(&base_path, include, Some(exclude), into);
                }
            }
            PathFinder::Children(base, filter) => {
                for base_path in base.get() {
                    let Ok(entries) = std::fs::read_dir(base_path.as_file()) else { continue };
                    for entry in entries.filter_map(std::result::Result::ok) {
                        let name = entry.file_name();
                        let Some(name) = name.to_str() else { continue };
                        if filter.accepts(name) {
                            if let Ok(child) = base_path.join(name) {
                                into.insert(child);
                            }
                        }
                    }
                }
            }
            PathFinder::Child(base, name) => {
                for base_path in base.get() {
                    if let Ok(child) = base_path.join(name.clone()) {
                        into.insert(child);
                    }
                }
            }
        }
    }
}

fn walk(
    base: &ProjectPath,
    include: &NameFilter,
    exclude: Option<&NameFilter>,
    into: &mut BTreeSet<ProjectPath>,
) {
    let walker = WalkDir::new(base.as_file()).follow_links(true).into_iter();
    let entries = walker.filter_entry(|entry| {
        if entry.depth() == 0 || !entry.file_type().is_dir() {
            return true;
        }
        match (exclude, entry.file_name().to_str()) {
            (Some(exclude), Some(name)) => !exclude.accepts(name),
            _ => true,
        }
    });
    for entry in entries.filter_map(std::result::Result::ok) {
        if entry.depth() == 0 {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else { continue };
        if !include.accepts(name) {
            continue;
        }
        let Some(relative) = utils::relativize(base.as_file(), entry.path()) else { continue };
        if let Ok(found) = base.resolve(&relative) {
            into.insert(found);
        }
    }
}

impl std::ops::Add for PathFinder {
    type Output = PathFinder;
    fn add(self, other: PathFinder) -> PathFinder {
        PathFinder::Union(Box::new(self), Box::new(other))
    }
}

impl std::ops::Sub for PathFinder {
    type Output = PathFinder;
    fn sub(self, other: PathFinder) -> PathFinder {
        PathFinder::Difference(Box::new(self), Box::new(other))
    }
}
