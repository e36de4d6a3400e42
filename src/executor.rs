//! Runs a materialized script under the configured interpreter with a
//! wall-clock deadline.

use std::{
    path::Path,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use anyhow::{Context, Result};
use nix::{
    errno::Errno,
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use tokio::{process::Command, time::timeout};
use tracing::{debug, warn};

use crate::env::ScriptEnvironment;

/// How the interpreter process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The process exited (or was signalled) before the deadline.
    Exited(ExitStatus),
    /// The deadline passed; the process group was killed and the interpreter reaped.
    TimedOut,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(status) if status.success())
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited(status) => status.code(),
            Self::TimedOut => None,
        }
    }
}

/// The script's process group. Everything left in it is killed when the
/// guard drops while still armed, so a cancelled attempt takes its
/// background jobs with it.
struct ProcessGroup {
    pgid: Option<Pid>,
}

impl ProcessGroup {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.and_then(|p| i32::try_from(p).ok()).map(Pid::from_raw),
        }
    }

    fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) => debug!(pgid = pgid.as_raw(), "killed script process group"),
            // Nothing left in the group
            Err(Errno::ESRCH) => {}
            Err(e) => warn!(pgid = pgid.as_raw(), error = %e, "could not kill script process group"),
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Spawn `interpreter <script>` with the inherited environment overlaid by
/// `env`, and wait at most `limit` for it to finish.
///
/// The interpreter leads its own process group. On timeout or a non-zero
/// exit the whole group is killed, so no background job of a failed attempt
/// can write the output file during a later one. A successful script keeps
/// whatever it started.
///
/// The child's stdout and stderr are inherited so script output lands in the
/// supervisor's log stream.
pub async fn execute(
    interpreter: &Path,
    script: &Path,
    env: &ScriptEnvironment,
    limit: Duration,
) -> Result<ExitOutcome> {
    let mut cmd = Command::new(interpreter);
    cmd.arg(script)
        .envs(env.iter())
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .process_group(0)
        .kill_on_drop(true);

    let mut child = cmd.spawn().with_context(|| {
        format!(
            "failed to spawn interpreter {} for {}",
            interpreter.display(),
            script.display()
        )
    })?;
    let mut group = ProcessGroup::new(child.id());
    debug!(pid = ?child.id(), interpreter = %interpreter.display(), "script started");

    match timeout(limit, child.wait()).await {
        Ok(status) => {
            let status = status.context("waiting for script")?;
            debug!(?status, "script exited");
            if status.success() {
                group.disarm();
            } else {
                group.kill();
            }
            Ok(ExitOutcome::Exited(status))
        }
        Err(_) => {
            warn!(seconds = limit.as_secs(), "script exceeded its deadline, killing it");
            group.kill();
            // Reaps the interpreter, and kills it if the group kill failed
            if let Err(e) = child.kill().await {
                warn!(error = %e, "could not kill timed out script");
            }
            Ok(ExitOutcome::TimedOut)
        }
    }
}
