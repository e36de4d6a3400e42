//! Attempt loop with exponential backoff.
//!
//! The controller is an explicit state machine:
//!
//! ```text
//! Idle -> Attempting(1)
//! Attempting(n) -> Succeeded                 exit ok and output valid
//! Attempting(n) -> Retrying(n, delay)        failure, n < max
//! Attempting(n) -> Exhausted                 failure, n == max
//! Retrying(n, delay) -> Attempting(n + 1)    after sleeping `delay`
//! ```
//!
//! The output document is removed before every entry into `Attempting`, so a
//! document found afterwards belongs to that attempt.

use std::{fs, io, path::Path, time::Duration};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::{error::AttemptFailure, validate::ResultDocument};

/// How the interpreter ended, as recorded on an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptExit {
    Code(i32),
    Signaled,
    TimedOut,
    /// The script never ran (materialization, spawn, or cleanup failed).
    NotStarted,
}

/// What a runner reports back for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptReport {
    pub exit: AttemptExit,
    pub result: Result<ResultDocument, AttemptFailure>,
}

/// Immutable record of a finished attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempt {
    pub ordinal: u32,
    pub started_at: DateTime<Utc>,
    pub exit: AttemptExit,
    pub outcome: Result<(), AttemptFailure>,
}

impl Attempt {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Attempting { attempt: u32 },
    Retrying { attempt: u32, delay: Duration },
    Succeeded,
    Exhausted,
}

/// Executes a single attempt. The controller owns sequencing; implementors
/// only run the script and judge its output.
#[allow(async_fn_in_trait)]
pub trait AttemptRunner {
    async fn run_attempt(&mut self, ordinal: u32) -> AttemptReport;
}

/// Waits out the backoff between attempts.
#[allow(async_fn_in_trait)]
pub trait Sleeper {
    async fn sleep(&mut self, delay: Duration);
}

impl<T: AttemptRunner> AttemptRunner for &mut T {
    async fn run_attempt(&mut self, ordinal: u32) -> AttemptReport {
        (**self).run_attempt(ordinal).await
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    async fn sleep(&mut self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

/// Delay slept before attempt `attempt` (2-based): `initial * 2^(attempt - 2)`.
/// There is no upper bound; the multiplication saturates rather than
/// overflowing.
pub fn backoff_delay(initial: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(2);
    let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
    initial.saturating_mul(factor)
}

/// Final result of the loop.
#[derive(Debug, Clone)]
pub struct RetryOutcome {
    pub state: ControllerState,
    pub attempts: Vec<Attempt>,
    /// The validated document; present only when the loop succeeded.
    pub document: Option<ResultDocument>,
}

impl RetryOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == ControllerState::Succeeded
    }

    pub fn last_failure(&self) -> Option<&AttemptFailure> {
        self.attempts.last().and_then(|a| a.outcome.as_ref().err())
    }
}

pub struct RetryController<'a, R, S> {
    max_attempts: u32,
    initial_delay: Duration,
    output_path: &'a Path,
    runner: R,
    sleeper: S,
}

impl<'a, R: AttemptRunner, S: Sleeper> RetryController<'a, R, S> {
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        output_path: &'a Path,
        runner: R,
        sleeper: S,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            output_path,
            runner,
            sleeper,
        }
    }

    pub async fn run(mut self) -> RetryOutcome {
        let mut attempts: Vec<Attempt> = Vec::new();
        let mut document = None;
        let mut state = ControllerState::Idle;

        loop {
            state = match state {
                ControllerState::Idle => ControllerState::Attempting { attempt: 1 },

                ControllerState::Attempting { attempt } => {
                    let started_at = Utc::now();
                    info!(attempt, max_attempts = self.max_attempts, "starting attempt");

                    let report = match clear_output(self.output_path) {
                        Ok(()) => self.runner.run_attempt(attempt).await,
                        Err(e) => AttemptReport {
                            exit: AttemptExit::NotStarted,
                            result: Err(AttemptFailure::LaunchFailed {
                                message: format!(
                                    "could not remove stale output {}: {}",
                                    self.output_path.display(),
                                    e
                                ),
                            }),
                        },
                    };

                    let (outcome, doc) = match report.result {
                        Ok(doc) => (Ok(()), Some(doc)),
                        Err(failure) => (Err(failure), None),
                    };
                    attempts.push(Attempt {
                        ordinal: attempt,
                        started_at,
                        exit: report.exit,
                        outcome: outcome.clone(),
                    });

                    match outcome {
                        Ok(()) => {
                            info!(attempt, "attempt succeeded");
                            document = doc;
                            ControllerState::Succeeded
                        }
                        Err(failure) if attempt < self.max_attempts => {
                            let delay = backoff_delay(self.initial_delay, attempt + 1);
                            warn!(
                                attempt,
                                kind = failure.kind(),
                                error = %failure,
                                retry_in_secs = delay.as_secs(),
                                "attempt failed, will retry"
                            );
                            ControllerState::Retrying { attempt, delay }
                        }
                        Err(failure) => {
                            warn!(
                                attempt,
                                kind = failure.kind(),
                                error = %failure,
                                "attempt failed, no attempts left"
                            );
                            ControllerState::Exhausted
                        }
                    }
                }

                ControllerState::Retrying { attempt, delay } => {
                    debug!(delay_secs = delay.as_secs(), "backing off");
                    self.sleeper.sleep(delay).await;
                    ControllerState::Attempting {
                        attempt: attempt + 1,
                    }
                }

                ControllerState::Succeeded | ControllerState::Exhausted => break,
            };
        }

        RetryOutcome {
            state,
            attempts,
            document,
        }
    }
}

fn clear_output(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed previous output");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
