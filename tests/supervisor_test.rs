#![cfg(unix)]

use std::{
    cell::RefCell,
    fs,
    path::{Path, PathBuf},
    rc::Rc,
    time::Duration,
};

use anyhow::Result;
use overlay_supervisor::{
    fallback::FallbackAction,
    retry::{AttemptExit, Sleeper},
    AttemptFailure, Config, ExecutionConfig, RunStatus, Supervisor,
};
use serde_json::Value;

#[derive(Default, Clone)]
struct RecordingSleeper {
    slept: Rc<RefCell<Vec<Duration>>>,
}

impl Sleeper for RecordingSleeper {
    async fn sleep(&mut self, delay: Duration) {
        self.slept.borrow_mut().push(delay);
    }
}

fn exec_config(dir: &Path, rc: &str, script: &str) -> ExecutionConfig {
    let rc = format!(
        "OVERLAY_OUTPUT_FILE={}\nOVERLAY_RETRY_DELAY=1\n{}",
        dir.join("result.json").display(),
        rc
    );
    let cfg = Config::from_sources(PathBuf::from("test.rc"), Some(&rc), Vec::new());
    ExecutionConfig::from_config(&cfg, script.to_string()).unwrap()
}

fn read_json(path: &Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

#[tokio::test]
async fn test_successful_script_is_validated_and_kept() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let script = r#"printf '{"status":"success","ipv4_address":"10.10.0.5"}' > "$OUTPUT_FILE""#;
    let cfg = exec_config(dir.path(), "", script);
    let output = cfg.output_path.clone();
    let sleeper = RecordingSleeper::default();

    let report = Supervisor::with_sleeper(cfg, sleeper.clone()).run().await?;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(report.attempts[0].exit, AttemptExit::Code(0));
    assert!(sleeper.slept.borrow().is_empty());
    assert_eq!(
        report.document.unwrap().non_empty_str("ipv4_address"),
        Some("10.10.0.5")
    );
    assert_eq!(read_json(&output)["status"], "success");
    Ok(())
}

#[tokio::test]
async fn test_script_reporting_error_is_retried_with_doubling_backoff() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let script = r#"printf '{"status":"error"}' > "$OUTPUT_FILE"; exit 1"#;
    let cfg = exec_config(
        dir.path(),
        "OVERLAY_MAX_RETRIES=3\nOVERLAY_REQUIRED_FIELDS=status",
        script,
    );
    let output = cfg.output_path.clone();
    let sleeper = RecordingSleeper::default();

    let report = Supervisor::with_sleeper(cfg, sleeper.clone()).run().await?;

    assert_eq!(report.status, RunStatus::Exhausted);
    assert_ne!(report.exit_code(), 0);
    assert_eq!(report.attempts.len(), 3);
    assert_eq!(
        *sleeper.slept.borrow(),
        vec![Duration::from_secs(1), Duration::from_secs(2)]
    );
    assert_eq!(report.fallback, Some(FallbackAction::KeptScriptReport));
    // The script's own report is left as written
    assert_eq!(fs::read_to_string(&output)?, r#"{"status":"error"}"#);
    Ok(())
}

#[tokio::test]
async fn test_silent_failure_gets_a_synthetic_error_document() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = exec_config(dir.path(), "OVERLAY_MAX_RETRIES=2", "exit 3");
    let output = cfg.output_path.clone();

    let report = Supervisor::with_sleeper(cfg, RecordingSleeper::default())
        .run()
        .await?;

    assert_eq!(report.status, RunStatus::Exhausted);
    assert_eq!(report.fallback, Some(FallbackAction::WroteSynthetic));
    assert!(report
        .attempts
        .iter()
        .all(|a| a.outcome == Err(AttemptFailure::NonZeroExit { code: Some(3) })));
    let doc = read_json(&output);
    assert_eq!(doc["status"], "error");
    assert_eq!(doc["error_code"], "SCRIPT_EXECUTION_FAILED");
    assert!(doc["message"].as_str().unwrap().contains('2'));
    Ok(())
}

#[tokio::test]
async fn test_zero_exit_with_missing_field_is_not_success() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let script = r#"printf '{"status":"success"}' > "$OUTPUT_FILE""#;
    let cfg = exec_config(dir.path(), "OVERLAY_MAX_RETRIES=2", script);

    let report = Supervisor::with_sleeper(cfg, RecordingSleeper::default())
        .run()
        .await?;

    assert_eq!(report.status, RunStatus::Exhausted);
    assert_eq!(
        report.attempts.last().unwrap().outcome,
        Err(AttemptFailure::MissingRequiredField {
            name: "ipv4_address".into()
        })
    );
    Ok(())
}

#[tokio::test]
async fn test_zero_exit_without_output_is_not_success() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = exec_config(dir.path(), "OVERLAY_MAX_RETRIES=1", "true");
    let output = cfg.output_path.clone();

    let report = Supervisor::with_sleeper(cfg, RecordingSleeper::default())
        .run()
        .await?;

    assert!(matches!(
        report.attempts[0].outcome,
        Err(AttemptFailure::OutputMissing { .. })
    ));
    assert_eq!(read_json(&output)["error_code"], "SCRIPT_EXECUTION_FAILED");
    Ok(())
}

#[tokio::test]
async fn test_timeout_is_recorded_distinctly_and_retried() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = exec_config(
        dir.path(),
        "OVERLAY_MAX_RETRIES=2\nOVERLAY_SCRIPT_TIMEOUT=1",
        "sleep 10",
    );
    let output = cfg.output_path.clone();
    let sleeper = RecordingSleeper::default();

    let report = Supervisor::with_sleeper(cfg, sleeper.clone()).run().await?;

    assert_eq!(report.attempts.len(), 2);
    for attempt in &report.attempts {
        assert_eq!(attempt.exit, AttemptExit::TimedOut);
        assert_eq!(
            attempt.outcome,
            Err(AttemptFailure::ScriptTimeout { seconds: 1 })
        );
    }
    assert_eq!(sleeper.slept.borrow().len(), 1);
    assert_eq!(read_json(&output)["status"], "error");
    Ok(())
}

#[tokio::test]
async fn test_timed_out_attempt_cannot_write_into_the_next() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let counter = dir.path().join("count");
    // Attempt 1 leaves a background writer behind and times out. Attempt 2
    // writes nothing but is still running when that writer would fire.
    let script = r#"
n=$(cat "$COUNTER" 2>/dev/null || echo 0)
n=$((n + 1))
echo "$n" > "$COUNTER"
if [ "$n" -eq 1 ]; then
  ( sleep 4; printf '{"status":"success","ipv4_address":"stale"}' > "$OUTPUT_FILE" ) &
  sleep 10
fi
sleep 2
"#;
    let rc = format!(
        "OVERLAY_MAX_RETRIES=2\nOVERLAY_SCRIPT_TIMEOUT=3\nSCRIPT_ENV_COUNTER={}",
        counter.display()
    );
    let cfg = exec_config(dir.path(), &rc, script);
    let output = cfg.output_path.clone();

    let report = Supervisor::with_sleeper(cfg, RecordingSleeper::default())
        .run()
        .await?;

    assert_eq!(report.status, RunStatus::Exhausted);
    assert_eq!(report.attempts.len(), 2);
    assert_eq!(report.attempts[0].exit, AttemptExit::TimedOut);
    assert!(matches!(
        report.attempts[1].outcome,
        Err(AttemptFailure::OutputMissing { .. })
    ));
    assert!(report.document.is_none());
    assert_eq!(read_json(&output)["error_code"], "SCRIPT_EXECUTION_FAILED");
    Ok(())
}

#[tokio::test]
async fn test_recovers_on_a_later_attempt() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let counter = dir.path().join("count");
    let script = r#"
n=$(cat "$COUNTER" 2>/dev/null || echo 0)
n=$((n + 1))
echo "$n" > "$COUNTER"
if [ "$n" -lt 3 ]; then exit 1; fi
printf '{"status":"success","ipv4_address":"100.64.1.%s"}' "$n" > "$OUTPUT_FILE"
"#;
    let rc = format!(
        "OVERLAY_MAX_RETRIES=5\nSCRIPT_ENV_COUNTER={}",
        counter.display()
    );
    let cfg = exec_config(dir.path(), &rc, script);
    let sleeper = RecordingSleeper::default();

    let report = Supervisor::with_sleeper(cfg, sleeper.clone()).run().await?;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.attempts.len(), 3);
    assert_eq!(
        *sleeper.slept.borrow(),
        vec![Duration::from_secs(1), Duration::from_secs(2)]
    );
    assert_eq!(
        report.document.unwrap().non_empty_str("ipv4_address"),
        Some("100.64.1.3")
    );
    Ok(())
}

#[tokio::test]
async fn test_script_sees_node_facts_and_is_cleaned_up() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let script = r#"
[ "$CLUSTER_NAME" = edge ] || exit 9
[ "$NODE_ROLE" = agent ] || exit 9
[ "$SCRIPT_TIMEOUT" = 300 ] || exit 9
printf '{"status":"success","ipv4_address":"10.0.0.2","script":"%s"}' "$0" > "$OUTPUT_FILE"
"#;
    let cfg = exec_config(
        dir.path(),
        "CLUSTER_NAME=edge\nNODE_ROLE=agent\nSCRIPT_ENV_CLUSTER_NAME=spoofed",
        script,
    );

    let report = Supervisor::with_sleeper(cfg, RecordingSleeper::default())
        .run()
        .await?;

    assert_eq!(report.status, RunStatus::Succeeded);
    let doc = report.document.unwrap();
    let script_path = doc.non_empty_str("script").unwrap();
    assert!(!Path::new(script_path).exists());
    Ok(())
}

#[tokio::test]
async fn test_autoscaler_writes_node_ip_fragment() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let fragment = dir.path().join("config.yaml.d/overlay.yaml");
    let script = r#"printf '{"status":"success","node_ip":"100.64.0.5"}' > "$OUTPUT_FILE""#;
    let rc = format!(
        "OVERLAY_NODE_FLAVOR=autoscaler\nOVERLAY_AUTOSCALER_CONFIG_PATH={}",
        fragment.display()
    );
    let cfg = exec_config(dir.path(), &rc, script);

    let report = Supervisor::with_sleeper(cfg, RecordingSleeper::default())
        .run()
        .await?;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.fragment.as_deref(), Some("node-ip: 100.64.0.5"));
    assert_eq!(fs::read_to_string(&fragment)?.trim_end(), "node-ip: 100.64.0.5");
    Ok(())
}

#[tokio::test]
async fn test_autoscaler_missing_address_fails_without_retry() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let fragment = dir.path().join("overlay.yaml");
    let script = r#"printf '{"status":"success"}' > "$OUTPUT_FILE""#;
    let rc = format!(
        "OVERLAY_NODE_FLAVOR=autoscaler\nOVERLAY_REQUIRED_FIELDS=status\nOVERLAY_MAX_RETRIES=3\nOVERLAY_AUTOSCALER_CONFIG_PATH={}",
        fragment.display()
    );
    let cfg = exec_config(dir.path(), &rc, script);
    let sleeper = RecordingSleeper::default();

    let report = Supervisor::with_sleeper(cfg, sleeper.clone()).run().await?;

    assert_eq!(report.status, RunStatus::AdapterFailed);
    assert_eq!(report.exit_code(), 2);
    assert_eq!(report.attempts.len(), 1);
    assert!(sleeper.slept.borrow().is_empty());
    assert!(!fragment.exists());
    Ok(())
}

#[tokio::test]
async fn test_autoscaler_empty_address_passes_validation_but_fails_adapter() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let fragment = dir.path().join("overlay.yaml");
    let script = r#"printf '{"status":"success","node_ip":""}' > "$OUTPUT_FILE""#;
    let rc = format!(
        "OVERLAY_NODE_FLAVOR=autoscaler\nOVERLAY_AUTOSCALER_CONFIG_PATH={}",
        fragment.display()
    );
    let cfg = exec_config(dir.path(), &rc, script);

    let report = Supervisor::with_sleeper(cfg, RecordingSleeper::default())
        .run()
        .await?;

    assert_eq!(report.status, RunStatus::AdapterFailed);
    assert_eq!(report.attempts.len(), 1);
    assert!(report.attempts[0].succeeded());
    assert!(!fragment.exists());
    Ok(())
}
