//! Best-effort adapter reset used to clear a stuck LE scan.

use crate::scanner::BoxFuture;
use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// An action that tries to bring the adapter back to a state where scanning
/// can start. Outcomes are not reported.
pub trait AdapterReset: Send {
    fn reset(&self) -> BoxFuture<'_, ()>;
}

/// One external command with its time limit.
#[derive(Debug, Clone, PartialEq)]
struct Step {
    program: &'static str,
    args: Vec<String>,
    timeout: Duration,
}

impl Step {
    fn new(program: &'static str, args: &[&str], timeout: Duration) -> Self {
        Step {
            program,
            args: args.iter().map(|arg| arg.to_string()).collect(),
            timeout,
        }
    }
}

/// Reset through `btmgmt`, or `bluetoothctl` when `btmgmt` is not installed.
#[derive(Debug, Clone)]
pub struct CommandReset {
    adapter: String,
}

impl CommandReset {
    pub fn new(adapter: impl Into<String>) -> Self {
        CommandReset {
            adapter: adapter.into(),
        }
    }

    fn btmgmt_steps(&self) -> Vec<Step> {
        let adapter = self.adapter.as_str();
        vec![
            Step::new(
                "sudo",
                &["btmgmt", "-i", adapter, "find", "stop"],
                Duration::from_secs(2),
            ),
            Step::new(
                "sudo",
                &["btmgmt", "-i", adapter, "power", "off"],
                Duration::from_secs(3),
            ),
            Step::new(
                "sudo",
                &["btmgmt", "-i", adapter, "power", "on"],
                Duration::from_secs(3),
            ),
        ]
    }

    fn bluetoothctl_steps() -> Vec<Step> {
        vec![
            Step::new("bluetoothctl", &["scan", "off"], Duration::from_secs(2)),
            Step::new("bluetoothctl", &["power", "off"], Duration::from_secs(3)),
            Step::new("bluetoothctl", &["power", "on"], Duration::from_secs(3)),
        ]
    }
}

/// Run a step to completion or until its timeout. A non-zero exit is not an error.
async fn run_step(step: &Step) -> io::Result<()> {
    let mut child = Command::new(step.program)
        .args(&step.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    match tokio::time::timeout(step.timeout, child.wait()).await {
        Ok(status) => {
            let status = status?;
            debug!(program = step.program, args = ?step.args, %status, "reset step finished");
            Ok(())
        }
        Err(_) => {
            debug!(program = step.program, args = ?step.args, "reset step timed out");
            Err(io::Error::from(io::ErrorKind::TimedOut))
        }
    }
}

/// Run `steps` in order, ignoring failures. Returns an error only when the
/// first command could not be found at all.
async fn run_sequence(steps: &[Step]) -> io::Result<()> {
    for (index, step) in steps.iter().enumerate() {
        match run_step(step).await {
            Ok(()) => {}
            Err(err) if index == 0 && err.kind() == io::ErrorKind::NotFound => return Err(err),
            Err(err) => debug!(program = step.program, %err, "reset step failed"),
        }
    }
    Ok(())
}

/// Whether `program` resolves to an executable in the `paths` search list.
fn installed_in(program: &str, paths: Option<impl AsRef<OsStr>>) -> bool {
    which::which_in(program, paths, Path::new(".")).is_ok()
}

/// Whether `program` resolves to an executable on `PATH`.
fn on_path(program: &str) -> bool {
    installed_in(program, std::env::var_os("PATH"))
}

impl AdapterReset for CommandReset {
    fn reset(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            debug!(adapter = %self.adapter, "resetting adapter");

            if on_path("btmgmt") {
                match run_sequence(&self.btmgmt_steps()).await {
                    Ok(()) => return,
                    Err(err) => debug!(%err, "btmgmt reset unavailable"),
                }
            }

            if let Err(err) = run_sequence(&Self::bluetoothctl_steps()).await {
                debug!(%err, "bluetoothctl reset unavailable");
            }
        })
    }
}
