//! One supervisor run: environment, attempt loop, fallback, post-processing.

use std::fs;

use tracing::{error, info, warn};

use crate::{
    adapter,
    config::ExecutionConfig,
    env::ScriptEnvironment,
    error::{AttemptFailure, SupervisorError},
    executor::{self, ExitOutcome},
    fallback::{self, FallbackAction},
    retry::{
        Attempt, AttemptExit, AttemptReport, AttemptRunner, RetryController, Sleeper,
        TokioSleeper,
    },
    script::MaterializedScript,
    validate::{validate_output, ResultDocument},
};

/// Materializes, executes and validates the script for a single attempt.
pub struct ScriptAttemptRunner<'a> {
    cfg: &'a ExecutionConfig,
    env: &'a ScriptEnvironment,
}

impl<'a> ScriptAttemptRunner<'a> {
    pub fn new(cfg: &'a ExecutionConfig, env: &'a ScriptEnvironment) -> Self {
        Self { cfg, env }
    }
}

impl AttemptRunner for ScriptAttemptRunner<'_> {
    async fn run_attempt(&mut self, _ordinal: u32) -> AttemptReport {
        // Dropped at the end of this attempt, whichever way it ends
        let script = match MaterializedScript::create(&self.cfg.script) {
            Ok(script) => script,
            Err(e) => return launch_failed(e),
        };

        let outcome = match executor::execute(
            &self.cfg.interpreter,
            script.path(),
            self.env,
            self.cfg.timeout,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => return launch_failed(e),
        };

        match outcome {
            ExitOutcome::TimedOut => AttemptReport {
                exit: AttemptExit::TimedOut,
                result: Err(AttemptFailure::ScriptTimeout {
                    seconds: self.cfg.timeout.as_secs(),
                }),
            },
            ExitOutcome::Exited(status) => {
                let exit = match status.code() {
                    Some(code) => AttemptExit::Code(code),
                    None => AttemptExit::Signaled,
                };
                let result = if status.success() {
                    validate_output(&self.cfg.output_path, &self.cfg.required_fields)
                } else {
                    Err(AttemptFailure::NonZeroExit {
                        code: status.code(),
                    })
                };
                AttemptReport { exit, result }
            }
        }
    }
}

fn launch_failed(e: anyhow::Error) -> AttemptReport {
    AttemptReport {
        exit: AttemptExit::NotStarted,
        result: Err(AttemptFailure::LaunchFailed {
            message: format!("{:#}", e),
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Succeeded,
    Exhausted,
    /// The script succeeded but post-processing found no usable address.
    AdapterFailed,
}

#[derive(Debug, Clone)]
pub struct SupervisorReport {
    pub status: RunStatus,
    pub attempts: Vec<Attempt>,
    pub document: Option<ResultDocument>,
    pub fallback: Option<FallbackAction>,
    /// The configuration line written by the autoscaler step, if it ran.
    pub fragment: Option<String>,
}

impl SupervisorReport {
    /// Process exit code: 0 success, 1 exhausted, 2 post-processing failure.
    pub fn exit_code(&self) -> u8 {
        match self.status {
            RunStatus::Succeeded => 0,
            RunStatus::Exhausted => 1,
            RunStatus::AdapterFailed => 2,
        }
    }
}

pub struct Supervisor<S = TokioSleeper> {
    cfg: ExecutionConfig,
    sleeper: S,
}

impl Supervisor<TokioSleeper> {
    pub fn new(cfg: ExecutionConfig) -> Self {
        Self {
            cfg,
            sleeper: TokioSleeper,
        }
    }
}

impl<S: Sleeper> Supervisor<S> {
    pub fn with_sleeper(cfg: ExecutionConfig, sleeper: S) -> Self {
        Self { cfg, sleeper }
    }

    pub async fn run(self) -> Result<SupervisorReport, SupervisorError> {
        let cfg = &self.cfg;
        let env = ScriptEnvironment::build(cfg);

        info!(
            flavor = %cfg.flavor,
            interpreter = %cfg.interpreter.display(),
            output = %cfg.output_path.display(),
            timeout_secs = cfg.timeout.as_secs(),
            max_attempts = cfg.max_attempts,
            initial_delay_secs = cfg.initial_delay.as_secs(),
            env_vars = env.len(),
            "running overlay network script"
        );

        let runner = ScriptAttemptRunner::new(cfg, &env);
        let mut outcome = RetryController::new(
            cfg.max_attempts,
            cfg.initial_delay,
            &cfg.output_path,
            runner,
            self.sleeper,
        )
        .run()
        .await;

        let Some(document) = outcome.document.take() else {
            if let Some(last) = outcome.last_failure() {
                error!(
                    attempts = outcome.attempts.len(),
                    kind = last.kind(),
                    error = %last,
                    "overlay network script failed on every attempt"
                );
            }
            let action = fallback::report_exhaustion(&cfg.output_path, cfg.max_attempts)?;
            log_document(cfg, false);
            return Ok(SupervisorReport {
                status: RunStatus::Exhausted,
                attempts: outcome.attempts,
                document: None,
                fallback: Some(action),
                fragment: None,
            });
        };

        info!(attempts = outcome.attempts.len(), "overlay network script succeeded");
        log_document(cfg, true);

        let mut report = SupervisorReport {
            status: RunStatus::Succeeded,
            attempts: outcome.attempts,
            document: Some(document),
            fallback: None,
            fragment: None,
        };

        if let (Some(settings), Some(doc)) = (&cfg.adapter, &report.document) {
            match adapter::write_fragment(doc, settings) {
                Ok(line) => report.fragment = Some(line),
                Err(SupervisorError::AutoscalerFieldMissing { field }) => {
                    error!(field = %field, "aborting node bootstrap, no retry");
                    report.status = RunStatus::AdapterFailed;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(report)
    }
}

/// Echo the document at the output path into the log.
fn log_document(cfg: &ExecutionConfig, success: bool) {
    match fs::read_to_string(&cfg.output_path) {
        Ok(body) if success => info!(document = %body.trim(), "final result document"),
        Ok(body) => error!(document = %body.trim(), "final result document"),
        Err(e) => warn!(
            path = %cfg.output_path.display(),
            error = %e,
            "could not read result document"
        ),
    }
}
