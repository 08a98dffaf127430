use std::{
    io,
    path::{Path, PathBuf},
};

pub type Result<T, E = KilnError> = std::result::Result<T, E>;

/// Various errors raised while building a project.
///
/// Every variant renders to a human-readable message; the structured data is
/// only used to pick the process exit code and to keep `io::Error` causes
/// attached to the path that produced them.
#[derive(Debug, thiserror::Error)]
pub enum KilnError {
    /// Filesystem operation failed.
    #[error("\"{}\": {0}", .1.display())]
    Io(io::Error, PathBuf),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    SemVer(#[from] semver::Error),
    /// Project bootstrap failed: missing directory, invalid properties.
    #[error("{0}")]
    Setup(String),
    /// The user declined to create a new project.
    #[error("setup declined")]
    SetupDeclined,
    /// Project-definition compile or constructor failure.
    #[error("error loading project: {0}")]
    Load(String),
    /// Dependency-manager problems, already deduplicated and joined.
    #[error("{0}")]
    Resolution(String),
    /// The compiler returned nonzero or the analysis callback rejected a path.
    #[error("{0}")]
    Compile(String),
    #[error("{0}")]
    TestsFailed(String),
    #[error("{0}")]
    TestsErrored(String),
    /// Scripted-test assertion or parse failure with the script line.
    #[error("{}:{line}: {message}", .path.display())]
    Script { path: PathBuf, line: usize, message: String },
    /// Unknown action or malformed command.
    #[error("{0}")]
    Usage(String),
    #[error("{0}")]
    Message(String),
}

impl KilnError {
    pub fn io(err: io::Error, path: impl Into<PathBuf>) -> Self {
        KilnError::Io(err, path.into())
    }

    pub fn msg(msg: impl std::fmt::Display) -> Self {
        KilnError::Message(msg.to_string())
    }

    pub fn usage(msg: impl std::fmt::Display) -> Self {
        KilnError::Usage(msg.to_string())
    }

    /// Joins a deduplicated problem list into one resolution error.
    pub fn resolution(problems: impl IntoIterator<Item = String>) -> Self {
        let mut seen = Vec::new();
        for problem in problems {
            if !seen.contains(&problem) {
                seen.push(problem);
            }
        }
        KilnError::Resolution(seen.join("\n"))
    }

    /// The process exit code reported for this error.
    ///
    /// 1 setup error, 2 setup declined, 3 load error, 4 usage error,
    /// 5 everything that failed while building.
    pub fn exit_code(&self) -> i32 {
        match self {
            KilnError::Setup(_) => 1,
            KilnError::SetupDeclined => 2,
            KilnError::Load(_) => 3,
            KilnError::Usage(_) => 4,
            _ => 5,
        }
    }
}

/// Short-hand for attaching a path to `io::Error`s raised in `path`-heavy code.
pub(crate) trait IoResultExt<T> {
    fn err_path(self, path: &Path) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, io::Error> {
    fn err_path(self, path: &Path) -> Result<T> {
        self.map_err(|err| KilnError::io(err, path))
    }
}
