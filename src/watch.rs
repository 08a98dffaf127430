//! Continuous building.
//!
//! `~<action>` polls the modification times of every source in the project
//! tree and reruns the action whenever they change. There is no filesystem
//! notification machinery involved; a poll every couple of seconds is
//! plenty for a human edit loop. Watching stops as soon as a byte arrives
//! on standard input.

use crate::{logging::Log, Project};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use std::{io::Read, time::Duration};

/// Seconds between modification-time sweeps.
pub const POLL_SECONDS: u64 = 2;

/// Runs `action` now and again on every source change until the user
/// presses enter. Action failures are reported and watching continues.
pub fn watch_sources(project: &Project, action: &str) -> crate::Result<()> {
    let log = project.log().clone();
    log.info(&format!(
        "Triggered execution of \"{action}\": rebuilding on source changes, press enter to stop."
    ));

    let stop = stdin_byte();
    let mut stamp = fingerprint(project);
    loop {
        if let Err(err) = project.act(action) {
            log.error(&err.to_string());
            log.trace_err(&err);
        }
        log.info("Waiting for source changes... (press enter to stop)");
        loop {
            match stop.recv_timeout(Duration::from_secs(POLL_SECONDS)) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return Ok(()),
                Err(RecvTimeoutError::Timeout) => {
                    let current = fingerprint(project);
                    if current != stamp {
                        stamp = current;
                        break;
                    }
                }
            }
        }
    }
}

// one byte of stdin ends the watch; the reader consumes exactly that byte
fn stdin_byte() -> Receiver<()> {
    let (sender, receiver) = unbounded();
    std::thread::spawn(move || {
        let mut buffer = [0u8; 1];
        let _ = std::io::stdin().read(&mut buffer);
        let _ = sender.send(());
    });
    receiver
}

/// A cheap digest of every source file's path and modification time across
/// the whole project tree.
fn fingerprint(project: &Project) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    if let Ok(order) = project.ordered_projects() {
        for member in order {
            let layout = member.layout();
            for directory in [
                &layout.main_scala_sources,
                &layout.main_java_sources,
                &layout.test_scala_sources,
                &layout.test_java_sources,
                &layout.definition_sources,
            ] {
                for entry in walkdir::WalkDir::new(directory)
                    .into_iter()
                    .filter_map(std::result::Result::ok)
                    .filter(|entry| entry.file_type().is_file())
                {
                    entry.path().hash(&mut hasher);
                    crate::utils::last_modified(entry.path()).hash(&mut hasher);
                }
            }
        }
    }
    hasher.finish()
}
