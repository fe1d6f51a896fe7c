//! End-to-end runs of the harness against a fake provisioner
//!
//! The receiver and sender are shell scripts that exchange messages through a
//! spool file, so every stage runs for real except the docker container.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ircprobe_core::config::Config;
use ircprobe_core::test_utils::{FakeProvisioner, ProvisionCall, local_config, with_script};
use ircprobe_core::{Harness, HarnessError, Outcome, RunReport, Stage};
use tempfile::TempDir;

const ALL_STAGES: [Stage; 9] = [
    Stage::CleanPriorState,
    Stage::StartServer,
    Stage::AwaitReadiness,
    Stage::SettleServer,
    Stage::StartReceiver,
    Stage::SettleReceiver,
    Stage::RunSender,
    Stage::VerifyOutputs,
    Stage::Cleanup,
];

fn scenario() -> (TempDir, Config) {
    let dir = tempfile::tempdir().unwrap();
    let config = local_config(&dir.path().join("spool"));
    (dir, config)
}

async fn run(config: Config, fake: &FakeProvisioner) -> RunReport {
    Harness::new(config, fake).unwrap().run().await
}

fn failure(report: &RunReport) -> (Stage, &HarnessError) {
    match &report.outcome {
        Outcome::Failure { stage, error } => (*stage, error),
        Outcome::Success => panic!("expected failure, run succeeded: {report:?}"),
    }
}

fn assert_cleaned_up_once(report: &RunReport, fake: &FakeProvisioner) {
    assert_eq!(report.completed.last(), Some(&Stage::Cleanup));
    assert_eq!(
        report.completed.iter().filter(|s| **s == Stage::Cleanup).count(),
        1
    );
    assert_eq!(fake.stop_count(), 1);
    assert!(!fake.is_listening());
}

#[tokio::test]
async fn test_full_conversation_succeeds() {
    let (_dir, config) = scenario();
    let fake = FakeProvisioner::new();

    let report = run(config, &fake).await;

    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.completed, ALL_STAGES);
    assert!(report.cleanup.is_empty());
    assert!(report.artifact_dir.is_none());
    assert_eq!(
        fake.calls(),
        vec![
            ProvisionCall::EnsureClean(report.server_name.clone()),
            ProvisionCall::Start(report.server_name.clone()),
            ProvisionCall::Stop(report.server_name.clone()),
        ]
    );
    assert_cleaned_up_once(&report, &fake);
}

#[tokio::test]
async fn test_clients_receive_server_address() {
    let (_dir, mut config) = scenario();
    with_script(
        &mut config.sender.args,
        r#"printf 'Hello World\nGoodbye world\nserver=%s\n' "$IRC_SERVER" > "$SPOOL.tmp" && mv "$SPOOL.tmp" "$SPOOL""#,
    );
    config.artifacts.keep = true;
    let fake = FakeProvisioner::new();

    let report = run(config, &fake).await;
    assert!(report.is_success(), "{report:?}");

    let dir: PathBuf = report.artifact_dir.clone().unwrap();
    let output = std::fs::read_to_string(dir.join("receiver.stdout")).unwrap();
    assert!(output.contains(&format!("server={}", report.address)));
    std::fs::remove_dir_all(dir).unwrap();
}

#[tokio::test]
async fn test_sender_failure_skips_verification() {
    let (_dir, mut config) = scenario();
    with_script(&mut config.sender.args, "exit 1");
    let fake = FakeProvisioner::new();

    let report = run(config, &fake).await;

    let (stage, error) = failure(&report);
    assert_eq!(stage, Stage::RunSender);
    assert!(matches!(
        error,
        HarnessError::ProcessFailed { name, code: Some(1) } if name == "sender"
    ));
    assert_eq!(report.exit_code(), 4);
    assert!(!report.completed.contains(&Stage::VerifyOutputs));
    assert!(!report.completed.contains(&Stage::RunSender));
    assert_cleaned_up_once(&report, &fake);
}

#[tokio::test]
async fn test_sender_timeout() {
    let (_dir, mut config) = scenario();
    with_script(&mut config.sender.args, "sleep 30");
    config.sender.timeout_secs = 1;
    let fake = FakeProvisioner::new();

    let report = run(config, &fake).await;

    let (stage, error) = failure(&report);
    assert_eq!(stage, Stage::RunSender);
    assert!(matches!(error, HarnessError::ProcessTimedOut { .. }));
    assert_eq!(report.exit_code(), 5);
    assert_cleaned_up_once(&report, &fake);
}

#[tokio::test]
async fn test_missing_goodbye_is_reported() {
    let (_dir, mut config) = scenario();
    with_script(
        &mut config.sender.args,
        r#"printf 'Hello World\n' > "$SPOOL.tmp" && mv "$SPOOL.tmp" "$SPOOL""#,
    );
    let fake = FakeProvisioner::new();

    let report = run(config, &fake).await;

    let (stage, error) = failure(&report);
    assert_eq!(stage, Stage::VerifyOutputs);
    match error {
        HarnessError::MissingExpectedContent { missing, content } => {
            assert_eq!(missing, &vec!["Goodbye world".to_owned()]);
            assert!(content.contains("joined #test"));
            assert!(content.contains("Hello World"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(report.exit_code(), 6);
    assert!(report.completed.contains(&Stage::RunSender));
    assert_cleaned_up_once(&report, &fake);
}

#[tokio::test]
async fn test_silent_sender_reports_both_markers() {
    let (_dir, mut config) = scenario();
    with_script(&mut config.sender.args, "true");
    let fake = FakeProvisioner::new();

    let report = run(config, &fake).await;

    match failure(&report).1 {
        HarnessError::MissingExpectedContent { missing, .. } => {
            assert_eq!(missing, &vec!["Hello World".to_owned(), "Goodbye world".to_owned()]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_unreachable_server() {
    let (_dir, config) = scenario();
    let fake = FakeProvisioner::new().never_listen();

    let report = run(config, &fake).await;

    let (stage, error) = failure(&report);
    assert_eq!(stage, Stage::AwaitReadiness);
    assert!(matches!(
        error,
        HarnessError::ServiceUnavailable { attempts: 3, address } if *address == report.address
    ));
    assert_eq!(report.exit_code(), 3);
    assert_eq!(
        report.completed,
        vec![Stage::CleanPriorState, Stage::StartServer, Stage::Cleanup]
    );
    assert_cleaned_up_once(&report, &fake);
}

#[tokio::test]
async fn test_receiver_never_ready() {
    let (_dir, mut config) = scenario();
    with_script(&mut config.receiver.args, "exec sleep 30");
    config.receiver.ready_attempts = 3;
    let fake = FakeProvisioner::new();

    let report = run(config, &fake).await;

    let (stage, error) = failure(&report);
    assert_eq!(stage, Stage::SettleReceiver);
    assert!(matches!(
        error,
        HarnessError::ReceiverNotReady { attempts: 3, marker } if marker == "joined #test"
    ));
    assert_eq!(report.exit_code(), 8);
    assert!(!report.completed.contains(&Stage::RunSender));
    assert!(report.cleanup.is_empty());
    assert_cleaned_up_once(&report, &fake);
}

#[tokio::test]
async fn test_receiver_exiting_early_is_process_failure() {
    let (_dir, mut config) = scenario();
    with_script(&mut config.receiver.args, "echo 'connection refused' >&2; exit 2");
    config.receiver.ready_attempts = 10;
    config.receiver.ready_delay_ms = 50;
    let fake = FakeProvisioner::new();

    let report = run(config, &fake).await;

    let (stage, error) = failure(&report);
    assert_eq!(stage, Stage::SettleReceiver);
    assert!(matches!(
        error,
        HarnessError::ProcessFailed { name, code: Some(2) } if name == "receiver"
    ));
    assert_cleaned_up_once(&report, &fake);
}

#[tokio::test]
async fn test_clean_prior_state_failure_still_cleans_up() {
    let (_dir, config) = scenario();
    let fake = FakeProvisioner::new().fail_ensure_clean();

    let report = run(config, &fake).await;

    let (stage, error) = failure(&report);
    assert_eq!(stage, Stage::CleanPriorState);
    assert!(matches!(error, HarnessError::Provision(_)));
    assert_eq!(report.exit_code(), 7);
    assert_eq!(report.completed, vec![Stage::Cleanup]);
    assert_eq!(fake.stop_count(), 1);
}

#[tokio::test]
async fn test_start_failure() {
    let (_dir, config) = scenario();
    let fake = FakeProvisioner::new().fail_start();

    let report = run(config, &fake).await;

    assert_eq!(failure(&report).0, Stage::StartServer);
    assert_eq!(report.completed, vec![Stage::CleanPriorState, Stage::Cleanup]);
    assert_cleaned_up_once(&report, &fake);
}

#[tokio::test]
async fn test_cleanup_failure_does_not_change_verdict() {
    let (_dir, config) = scenario();
    let fake = FakeProvisioner::new().fail_stop();

    let report = run(config, &fake).await;

    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.cleanup.len(), 1);
    assert_eq!(report.cleanup[0].step, "stop-server");
    assert_eq!(fake.stop_count(), 1);
}

#[tokio::test]
async fn test_keep_server_skips_stop() {
    let (_dir, mut config) = scenario();
    config.server.keep = true;
    let fake = FakeProvisioner::new();

    let report = run(config, &fake).await;

    assert!(report.is_success(), "{report:?}");
    assert_eq!(fake.stop_count(), 0);
    assert!(fake.is_listening());
}

#[tokio::test]
async fn test_artifacts_kept_on_failure() {
    let (_dir, mut config) = scenario();
    with_script(&mut config.sender.args, "exit 1");
    config.artifacts.keep_on_failure = true;
    let fake = FakeProvisioner::new();

    let report = run(config, &fake).await;

    assert!(!report.is_success());
    let dir = report.artifact_dir.clone().unwrap();
    let output = std::fs::read_to_string(dir.join("receiver.stdout")).unwrap();
    assert!(output.contains("joined #test"));
    assert!(dir.join("receiver.stderr").exists());
    std::fs::remove_dir_all(dir).unwrap();
}

#[tokio::test]
async fn test_artifacts_removed_on_success_despite_keep_on_failure() {
    let (_dir, mut config) = scenario();
    config.artifacts.keep_on_failure = true;
    let fake = FakeProvisioner::new();

    let report = run(config, &fake).await;

    assert!(report.is_success(), "{report:?}");
    assert!(report.artifact_dir.is_none());
}

#[tokio::test]
async fn test_each_run_gets_its_own_server() {
    let (_dir, config) = scenario();

    let first = Harness::new(config.clone(), FakeProvisioner::new()).unwrap();
    let second = Harness::new(config.clone(), FakeProvisioner::new()).unwrap();

    assert_ne!(first.run_id(), second.run_id());
    assert_ne!(first.server().name, second.server().name);
    assert!(first.server().name.starts_with(&format!("{}-", config.server.name)));
    assert_ne!(first.server().host_port, 0);
    assert_ne!(first.artifact_dir(), second.artifact_dir());
}

#[tokio::test]
async fn test_invalid_config_is_rejected_before_running() {
    let (_dir, mut config) = scenario();
    config.verify.markers.clear();

    let err = Harness::new(config, FakeProvisioner::new()).err().unwrap();
    assert!(matches!(err, HarnessError::Config(_)));
    assert_eq!(err.exit_code(), 2);
}

/// Resolves once the file at `path` has content.
async fn written(path: &Path) {
    while std::fs::read_to_string(path).map_or(true, |s| s.trim().is_empty()) {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[cfg(target_os = "linux")]
fn alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next())
            .is_some_and(|state| state != 'Z'),
        Err(_) => false,
    }
}

#[tokio::test]
async fn test_interrupt_during_sender_cleans_up() {
    let (dir, mut config) = scenario();
    let pid_file = dir.path().join("sender.pid");
    with_script(
        &mut config.sender.args,
        &format!("sleep 30 & echo $! > '{}'; wait", pid_file.display()),
    );
    let fake = FakeProvisioner::new();

    let report = Harness::new(config, &fake)
        .unwrap()
        .run_until(written(&pid_file))
        .await;

    let (stage, error) = failure(&report);
    assert_eq!(stage, Stage::RunSender);
    assert!(matches!(error, HarnessError::Interrupted));
    assert_eq!(report.exit_code(), 130);
    assert!(report.completed.contains(&Stage::SettleReceiver));
    assert!(report.cleanup.is_empty());
    assert!(report.artifact_dir.is_none());
    assert_cleaned_up_once(&report, &fake);

    #[cfg(target_os = "linux")]
    {
        let sleeper: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let mut gone = false;
        for _ in 0..100 {
            if !alive(sleeper) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone, "sender's child {sleeper} survived the interrupt");
    }
}

#[tokio::test]
async fn test_interrupt_while_waiting_for_server() {
    let (_dir, mut config) = scenario();
    config.readiness.max_attempts = 1000;
    config.readiness.retry_delay_ms = 50;
    config.artifacts.keep_on_failure = true;
    let fake = FakeProvisioner::new().never_listen();

    let report = Harness::new(config, &fake)
        .unwrap()
        .run_until(tokio::time::sleep(Duration::from_millis(300)))
        .await;

    let (stage, error) = failure(&report);
    assert_eq!(stage, Stage::AwaitReadiness);
    assert!(matches!(error, HarnessError::Interrupted));
    assert_cleaned_up_once(&report, &fake);

    let dir = report.artifact_dir.clone().unwrap();
    assert!(dir.exists());
    std::fs::remove_dir_all(dir).unwrap();
}
