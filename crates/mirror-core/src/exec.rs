//! Subprocess execution with a hard kill-timeout.
//!
//! All external collaborators (`git`, `arc`, `mysql`) are command-line
//! tools. Operations that can hang on the network get a watchdog that
//! SIGKILLs the child after a deadline, so a wedged remote degrades to an
//! error for the current unit of work instead of stalling the whole loop.

use std::io::Write;
use std::process::{Command, Output, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Timeout for network-bound and RPC subprocess calls.
pub const REMOTE_TIMEOUT: Duration = Duration::from_secs(60);

/// Run a command to completion, optionally writing `stdin` first and
/// optionally killing it after `timeout`.
///
/// Returns the raw output; callers decide whether a non-zero exit is fatal.
pub fn run(
    mut command: Command,
    stdin: Option<&[u8]>,
    timeout: Option<Duration>,
) -> Result<Output> {
    let program = command.get_program().to_string_lossy().into_owned();

    command.stdout(Stdio::piped()).stderr(Stdio::piped());
    if stdin.is_some() {
        command.stdin(Stdio::piped());
    } else {
        command.stdin(Stdio::null());
    }

    let mut child = command.spawn().with_context(|| {
        if let Err(err) = which::which(&program) {
            format!("{program} command not found. Please install it: {err}")
        } else {
            format!("Failed to execute {program}")
        }
    })?;

    // Stdin is written from its own thread so a child that never drains
    // the pipe cannot block this call; the watchdog below then bounds the
    // whole child lifetime, stdin delivery included.
    let writer = match stdin {
        Some(input) => {
            let mut pipe = child
                .stdin
                .take()
                .context("Child process has no stdin pipe")?;
            let input = input.to_vec();
            // Write errors are expected when the child exits or is killed
            // before reading everything; the exit status tells the story.
            Some(thread::spawn(move || {
                let _ = pipe.write_all(&input);
            }))
        }
        None => None,
    };

    let watchdog = timeout.map(|deadline| {
        let pid = Pid::from_raw(child.id() as i32);
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            if cancel_rx.recv_timeout(deadline).is_err() {
                // Deadline elapsed without the child finishing.
                let _ = kill(pid, Signal::SIGKILL);
            }
        });
        (cancel_tx, handle)
    });

    let output = child
        .wait_with_output()
        .with_context(|| format!("Failed to wait for {program}"));

    if let Some((cancel_tx, handle)) = watchdog {
        let _ = cancel_tx.send(());
        let _ = handle.join();
    }
    if let Some(handle) = writer {
        let _ = handle.join();
    }

    output
}

/// Run a command and return its stdout, failing on non-zero exit.
pub fn run_checked(
    command: Command,
    stdin: Option<&[u8]>,
    timeout: Option<Duration>,
) -> Result<String> {
    let description = format!(
        "{} {}",
        command.get_program().to_string_lossy(),
        command
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    );

    let output = run(command, stdin, timeout)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "Command failed with status {}: {description}: {}",
            output.status,
            stderr.trim()
        );
    }
    String::from_utf8(output.stdout).with_context(|| format!("{description}: output was not UTF-8"))
}
