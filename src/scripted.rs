//! The scripted-test interpreter.
//!
//! Each scripted test is a directory with a `test` file in a small
//! statement language: `$ command args [result]` runs a filesystem
//! built-in, `> action [result]` runs a build action on the loaded
//! project, and `result` asserts `success` or `error`. The directory is
//! copied to a temporary location first so tests never mutate fixtures,
//! and the project log is buffered per statement: it is only played when a
//! statement's outcome differs from the expectation, together with the
//! script line number.

use crate::{
    error::{IoResultExt, KilnError, Result},
    logging::{BufferedLogger, Log},
    utils, Project,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};

static RESULT_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\s*(success|error)\s*\]\s*$").unwrap());

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatementKind {
    /// `$` — a filesystem/shell built-in.
    Filesystem,
    /// `>` — a build action on the test project.
    Action,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Statement {
    pub line: usize,
    pub kind: StatementKind,
    pub command: Vec<String>,
    pub expect_success: bool,
}

/// Parses a `test` script; `path` only labels errors.
pub fn parse_script(path: &Path, text: &str) -> Result<Vec<Statement>> {
    let mut statements = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let parse_error = |message: String| KilnError::Script {
            path: path.to_path_buf(),
            line,
            message,
        };

        let kind = match trimmed.chars().next() {
            Some('$') => StatementKind::Filesystem,
            Some('>') => StatementKind::Action,
            _ => {
                return Err(parse_error(format!(
                    "statement must start with '$' or '>', got {trimmed:?}"
                )))
            }
        };
        let rest = &trimmed[1..];

        let Some(result) = RESULT_SUFFIX.captures(rest) else {
            return Err(parse_error("missing expected result, e.g. [success]".to_string()));
        };
        let expect_success = &result[1] == "success";
        let command_text = &rest[..result.get(0).map(|m| m.start()).unwrap_or(rest.len())];

        let command = tokenize(command_text).map_err(parse_error)?;
        if command.is_empty() {
            return Err(KilnError::Script {
                path: path.to_path_buf(),
                line,
                message: "statement has no command".to_string(),
            });
        }
        statements.push(Statement { line, kind, command, expect_success });
    }
    Ok(statements)
}

// word = bare [^ \[\]\s'"]+ | "..." | '...'
fn tokenize(text: &str) -> std::result::Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&ch) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }
        if ch == '"' || ch == '\'' {
            chars.next();
            let mut word = String::new();
            loop {
                match chars.next() {
                    Some(c) if c == ch => break,
                    Some(c) => word.push(c),
                    None => return Err(format!("unterminated quote in {text:?}")),
                }
            }
            words.push(word);
            continue;
        }
        if ch == '[' || ch == ']' {
            return Err(format!("unexpected '{ch}' in command {text:?}"));
        }
        let mut word = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() || c == '[' || c == ']' || c == '"' || c == '\'' {
                break;
            }
            word.push(c);
            chars.next();
        }
        words.push(word);
    }
    Ok(words)
}

/// How `>` statements reach the build.
pub trait ActionRunner {
    fn run_action(&mut self, action: &str) -> Option<String>;
}

/// The production runner: dispatches to a loaded [`Project`].
pub struct ProjectActionRunner {
    pub project: Project,
}

impl ActionRunner for ProjectActionRunner {
    fn run_action(&mut self, action: &str) -> Option<String> {
        self.project.act(action).err().map(|err| err.to_string())
    }
}

/// Runs parsed statements against `workdir`. The first mismatch plays the
/// buffered log and aborts with the statement's line number.
pub fn run_script<L: Log>(
    script_path: &Path,
    statements: &[Statement],
    workdir: &Path,
    buffered: &BufferedLogger<L>,
    runner: &mut dyn ActionRunner,
) -> Result<()> {
    buffered.start_recording();
    for statement in statements {
        let observed = match statement.kind {
            StatementKind::Filesystem => {
                filesystem_command(workdir, &statement.command, buffered)
                    .err()
                    .map(|err| err.to_string())
            }
            StatementKind::Action => runner.run_action(&statement.command.join(" ")),
        };
        let succeeded = observed.is_none();
        if succeeded != statement.expect_success {
            buffered.play();
            buffered.clear_all();
            return Err(KilnError::Script {
                path: script_path.to_path_buf(),
                line: statement.line,
                message: match observed {
                    Some(err) => format!("expected success, but the command failed: {err}"),
                    None => "expected an error, but the command succeeded".to_string(),
                },
            });
        }
        buffered.clear();
    }
    buffered.clear_all();
    Ok(())
}

/// Copies the test directory to a temporary location, loads a runner on
/// the copy, and executes its `test` script.
pub fn run_scripted_test<L: Log>(
    test_directory: &Path,
    buffered: &BufferedLogger<L>,
    make_runner: impl FnOnce(&Path) -> Result<Box<dyn ActionRunner>>,
) -> Result<()> {
    let script_path = test_directory.join("test");
    let text = utils::read_string(&script_path)?;
    let statements = parse_script(&script_path, &text)?;
    utils::do_in_temporary_directory(|copy| {
        utils::sync(test_directory, copy)?;
        let mut runner = make_runner(copy)?;
        run_script(&script_path, &statements, copy, buffered, &mut *runner)
    })
}

fn filesystem_command(workdir: &Path, command: &[String], log: &dyn Log) -> Result<()> {
    let (name, args) = command
        .split_first()
        .ok_or_else(|| KilnError::msg("empty command"))?;
    let path = |arg: &String| workdir.join(arg);

    match name.as_str() {
        "touch" => {
            for arg in args {
                utils::touch(&path(arg))?;
            }
            Ok(())
        }
        "delete" => {
            let paths: Vec<PathBuf> = args.iter().map(path).collect();
            utils::clean(paths.iter().map(PathBuf::as_path), true, log)
        }
        "mkdir" => {
            for arg in args {
                std::fs::create_dir_all(path(arg)).err_path(&path(arg))?;
            }
            Ok(())
        }
        "copy-file" => match args {
            [from, to] => {
                let to = path(to);
                utils::create_parent_dir_all(&to)?;
                std::fs::copy(path(from), &to).err_path(&path(from))?;
                Ok(())
            }
            _ => Err(KilnError::msg("copy-file takes a source and a destination")),
        },
        "copy" => match args.split_last() {
            Some((into, sources)) if !sources.is_empty() => {
                for source in sources {
                    let destination = path(into).join(source);
                    utils::create_parent_dir_all(&destination)?;
                    std::fs::copy(path(source), &destination).err_path(&path(source))?;
                }
                Ok(())
            }
            _ => Err(KilnError::msg("copy takes sources and a destination directory")),
        },
        "sync" => match args {
            [from, to] => utils::sync(&path(from), &path(to)).map(|_| ()),
            _ => Err(KilnError::msg("sync takes a source and a destination directory")),
        },
        "exists" => {
            for arg in args {
                if !path(arg).exists() {
                    return Err(KilnError::msg(format!("{arg} does not exist")));
                }
            }
            Ok(())
        }
        "absent" => {
            for arg in args {
                if path(arg).exists() {
                    return Err(KilnError::msg(format!("{arg} exists")));
                }
            }
            Ok(())
        }
        "newer" => match args {
            [a, b] => {
                let first = path(a);
                if !first.exists() {
                    return Err(KilnError::msg(format!("{a} does not exist")));
                }
                if utils::last_modified(&first) > utils::last_modified(&path(b)) {
                    Ok(())
                } else {
                    Err(KilnError::msg(format!("{a} is not newer than {b}")))
                }
            }
            _ => Err(KilnError::msg("newer takes two paths")),
        },
        "sleep" => match args {
            [millis] => {
                let millis: u64 = millis
                    .parse()
                    .map_err(|_| KilnError::msg(format!("invalid sleep duration {millis:?}")))?;
                std::thread::sleep(Duration::from_millis(millis));
                Ok(())
            }
            _ => Err(KilnError::msg("sleep takes a duration in milliseconds")),
        },
        "exec" => match args.split_first() {
            Some((program, rest)) => {
                let status = Command::new(program)
                    .args(rest)
                    .current_dir(workdir)
                    .status()
                    .map_err(|err| KilnError::msg(format!("could not run {program}: {err}")))?;
                if status.success() {
                    Ok(())
                } else {
                    Err(KilnError::msg(format!("{program} exited with {status}")))
                }
            }
            None => Err(KilnError::msg("exec takes a command")),
        },
        "pause" => {
            log.info("Script paused, press enter to continue.");
            let mut line = String::new();
            std::io::stdin()
                .read_line(&mut line)
                .map_err(|err| KilnError::io(err, PathBuf::from("<stdin>")))?;
            Ok(())
        }
        other => Err(KilnError::msg(format!("unknown scripted command {other:?}"))),
    }
}
