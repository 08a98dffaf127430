//! The interactive shell.
//!
//! Prompts with line editing and tab completion over commands, actions,
//! methods, project names and property names. Build errors surface on the
//! logger and the shell continues; `reload` hands control back to the
//! outer loop so the whole project can be reconstructed.

use crate::{
    error::{KilnError, Result},
    logging::{Level, Log},
    watch, Project,
};
use rustyline::{
    completion::Completer,
    error::ReadlineError,
    highlight::Highlighter,
    hint::Hinter,
    history::DefaultHistory,
    validate::Validator,
    Context, Editor, Helper,
};

/// Why the shell returned: the process-level loop restarts on `Reload`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReplOutcome {
    Exit,
    Reload,
}

const COMMANDS: &[&str] = &[
    "actions", "cc", "current", "exit", "get", "help", "methods", "project", "projects",
    "quit", "reload", "set", "trace",
];

const HELP: &str = "\
<action>                 runs the action on the current project
<method> <arg>*          invokes a project method
project <name>           changes the current project
projects                 lists the projects of this build
actions                  lists the actions of the current project
methods                  lists the methods of the current project
current                  shows the current project, log level and trace state
set <name> <value>       sets a project property
get <name>               shows a project property or environment variable
trace                    toggles stack-trace logging
debug|info|warn|error    sets the log level for the project tree
cc <action> | ~<action>  reruns the action whenever sources change
reload                   rereads the project definition
exit | quit              ends the session";

/// Splits a command line on whitespace, honoring single and double quotes.
pub fn split_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&ch) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }
        let mut word = String::new();
        if ch == '"' || ch == '\'' {
            chars.next();
            for c in chars.by_ref() {
                if c == ch {
                    break;
                }
                word.push(c);
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                word.push(c);
                chars.next();
            }
        }
        words.push(word);
    }
    words
}

/// Executes one non-shell command: an action name, or a method invocation
/// with arguments (`set`/`get` are built in).
pub fn dispatch(current: &Project, command: &str) -> Result<()> {
    let words = split_words(command);
    let Some((name, args)) = words.split_first() else { return Ok(()) };
    let log = current.log().clone();

    match (name.as_str(), args) {
        ("set", [key, value]) => {
            current.set_property(key, value);
            log.info(&format!("Set property {key}"));
            Ok(())
        }
        ("set", _) => Err(KilnError::usage("set <name> <value>")),
        ("get", [key]) => {
            // project property first, then the process environment
            match current.get_property(key).or_else(|| std::env::var(key).ok()) {
                Some(value) => log.info(&format!("{key}={value}")),
                None => log.info(&format!("{key} is not defined")),
            }
            Ok(())
        }
        ("get", _) => Err(KilnError::usage("get <name>")),
        (_, []) => current.act(name),
        (_, _) => match current.methods().get(name.as_str()) {
            Some(method) => match method(args) {
                None => Ok(()),
                Some(message) => Err(KilnError::Message(message)),
            },
            None => Err(KilnError::usage(format!("method \"{name}\" is not defined"))),
        },
    }
}

struct ShellHelper {
    words: Vec<String>,
}

impl ShellHelper {
    fn for_project(root: &Project, current: &Project) -> ShellHelper {
        let mut words: Vec<String> = COMMANDS.iter().map(|c| c.to_string()).collect();
        words.extend(Level::ALL.iter().map(|level| level.label().to_string()));
        words.extend(current.tasks().keys().cloned());
        words.extend(current.methods().keys().cloned());
        words.extend(root.project_map().keys().cloned());
        words.extend(current.property_keys());
        words.sort();
        words.dedup();
        ShellHelper { words }
    }
}

impl Completer for ShellHelper {
    type Candidate = String;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<String>)> {
        let start = line[..pos].rfind(char::is_whitespace).map(|i| i + 1).unwrap_or(0);
        let prefix = &line[start..pos];
        let candidates = self
            .words
            .iter()
            .filter(|word| word.starts_with(prefix))
            .cloned()
            .collect();
        Ok((start, candidates))
    }
}

impl Hinter for ShellHelper {
    type Hint = String;
}
impl Highlighter for ShellHelper {}
impl Validator for ShellHelper {}
impl Helper for ShellHelper {}

/// Runs the shell until the user exits or asks for a reload.
pub fn interactive(root: &Project) -> Result<ReplOutcome> {
    let mut current = root.clone();
    let mut editor: Editor<ShellHelper, DefaultHistory> = Editor::new()
        .map_err(|err| KilnError::msg(format!("could not start the line editor: {err}")))?;
    let log = root.log().clone();

    loop {
        editor.set_helper(Some(ShellHelper::for_project(root, &current)));
        let line = match editor.readline("> ") {
            Ok(line) => line,
            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => {
                return Ok(ReplOutcome::Exit)
            }
            Err(err) => return Err(KilnError::msg(format!("line editor failed: {err}"))),
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(input);

        match input {
            "exit" | "quit" => return Ok(ReplOutcome::Exit),
            "reload" => return Ok(ReplOutcome::Reload),
            "help" => println!("{HELP}"),
            "projects" => {
                for (name, project) in root.project_map() {
                    log.info(&format!("  {name} ({})", project.directory().display()));
                }
            }
            "current" => {
                log.info(&format!(
                    "Current project is {} {} (level {}, trace {})",
                    current.name(),
                    current.version(),
                    log.get_level(),
                    if log.trace_enabled() { "on" } else { "off" }
                ));
            }
            "actions" => {
                for (name, task) in current.tasks() {
                    match task.description() {
                        Some(description) => log.info(&format!("  {name}: {description}")),
                        None => log.info(&format!("  {name}")),
                    }
                }
            }
            "methods" => {
                for name in current.methods().keys() {
                    log.info(&format!("  {name}"));
                }
            }
            "trace" => {
                let enabled = !log.trace_enabled();
                root.enable_trace(enabled);
                log.info(if enabled { "Trace logging enabled." } else { "Trace logging disabled." });
            }
            _ => {
                if let Ok(level) = input.parse::<Level>() {
                    root.set_level(level);
                    log.info(&format!("Log level set to {level}."));
                    continue;
                }
                if let Some(name) = input.strip_prefix("project ") {
                    let name = name.trim();
                    match root.project_map().get(name) {
                        Some(project) => {
                            current = project.clone();
                            log.info(&format!("Set current project to {name}."));
                        }
                        None => log.error(&format!("Project \"{name}\" does not exist.")),
                    }
                    continue;
                }
                let watched = input
                    .strip_prefix('~')
                    .map(str::trim)
                    .or_else(|| input.strip_prefix("cc ").map(str::trim));
                if let Some(action) = watched {
                    if action.is_empty() {
                        log.error("cc/~ needs an action to run.");
                    } else if let Err(err) = watch::watch_sources(&current, action) {
                        log.error(&err.to_string());
                        log.trace_err(&err);
                    }
                    continue;
                }
                if let Err(err) = dispatch(&current, input) {
                    log.error(&err.to_string());
                    log.trace_err(&err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_whitespace_with_quotes() {
        assert_eq!(split_words("compile"), vec!["compile"]);
        assert_eq!(split_words("  run  main  "), vec!["run", "main"]);
        assert_eq!(
            split_words("set name \"two words\""),
            vec!["set", "name", "two words"]
        );
        assert_eq!(split_words("exec 'a b' c"), vec!["exec", "a b", "c"]);
        assert!(split_words("").is_empty());
    }

    #[test]
    fn completion_is_prefix_based_on_the_last_word() {
        let helper = ShellHelper {
            words: vec!["compile".into(), "clean".into(), "console".into(), "test".into()],
        };
        let history = DefaultHistory::new();
        let ctx = Context::new(&history);
        let (start, candidates) = helper.complete("project co", 10, &ctx).unwrap();
        assert_eq!(start, 8);
        assert_eq!(candidates, vec!["compile".to_string(), "console".to_string()]);

        let (start, all) = helper.complete("", 0, &ctx).unwrap();
        assert_eq!(start, 0);
        assert_eq!(all.len(), 4);
    }
}
