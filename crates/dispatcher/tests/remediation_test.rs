mod common;

use autoremedy_dispatcher::{
    alerts::{AlertConfigStore, Severity},
    config::ActionConfig,
    dispatcher::{AlertEvent, DispatchOutcome},
    executor::{ExecutionStatus, ProcessRunner},
};
use common::{harness, RecordingRunner};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

fn sh_runner() -> Arc<ProcessRunner> {
    Arc::new(ProcessRunner::new(ActionConfig {
        interpreter: Some("sh".to_string()),
        interpreter_args: Vec::new(),
        instance_flag: None,
        timeout: Duration::from_secs(10),
    }))
}

fn script(body: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "{}", body).unwrap();
    file
}

#[tokio::test]
async fn override_file_routes_alert_to_a_real_script() {
    let fix = script("echo \"cleaned $1\"");
    let mut overrides = tempfile::NamedTempFile::new().unwrap();
    write!(
        overrides,
        "LowDiskSpace:\n  playbook: {}\n  severity: critical\n  description: Purge temp files\n",
        fix.path().display()
    )
    .unwrap();

    let store = AlertConfigStore::load(Some(overrides.path()));
    let definition = store.resolve("LowDiskSpace").unwrap();
    assert_eq!(definition.severity, Severity::Critical);
    assert_eq!(definition.description, "Purge temp files");

    let h = harness(store, sh_runner(), 2);
    let dispatch = h
        .dispatcher
        .handle(&AlertEvent::new("LowDiskSpace", "db1", "firing"));
    assert_eq!(dispatch.status_code(), 202);

    let outcome = dispatch.execution.unwrap().outcome().await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Success);
    assert_eq!(outcome.exit_detail.unwrap().stdout.trim(), "cleaned db1");
    h.dispatcher.shutdown().await;
}

#[tokio::test]
async fn missing_script_is_accepted_then_reported_not_found() {
    // The builtin action paths do not exist relative to the test crate.
    let h = harness(AlertConfigStore::builtin(), sh_runner(), 1);

    let dispatch = h
        .dispatcher
        .handle(&AlertEvent::new("HighCPUUsage", "host1", "firing"));
    assert_eq!(dispatch.outcome, DispatchOutcome::Scheduled);
    assert_eq!(dispatch.status_code(), 202);

    let outcome = dispatch.execution.unwrap().outcome().await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::NotFound);
    assert_eq!(outcome.code(), 404);
    h.dispatcher.shutdown().await;
}

#[tokio::test]
async fn failing_script_surfaces_its_diagnostics() {
    let broken = script("echo 'service refused to restart' >&2; exit 1");
    let mut store = AlertConfigStore::builtin();
    store
        .apply_overrides(&format!(
            "SystemDown:\n  action_ref: {}\n  severity: critical\n  description: restart\n",
            broken.path().display()
        ))
        .unwrap();

    let h = harness(store, sh_runner(), 1);
    let dispatch = h
        .dispatcher
        .handle(&AlertEvent::new("SystemDown", "web1", "firing"));
    assert_eq!(dispatch.status_code(), 202);

    let outcome = dispatch.execution.unwrap().outcome().await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Error);
    assert!(outcome.message.contains("service refused to restart"));
    h.dispatcher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_firings_schedule_exactly_once_per_key() {
    let runner = Arc::new(RecordingRunner::default());
    let h = harness(AlertConfigStore::builtin(), runner.clone(), 4);

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let dispatcher = h.dispatcher.clone();
            let instance = if i % 2 == 0 { "host1" } else { "host2" };
            tokio::spawn(async move {
                dispatcher
                    .handle(&AlertEvent::new("HighCPUUsage", instance, "firing"))
                    .outcome
            })
        })
        .collect();

    let outcomes: Vec<DispatchOutcome> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let scheduled = outcomes
        .iter()
        .filter(|o| **o == DispatchOutcome::Scheduled)
        .count();
    let limited = outcomes
        .iter()
        .filter(|o| **o == DispatchOutcome::RateLimited)
        .count();
    assert_eq!(scheduled, 2);
    assert_eq!(limited, 30);

    h.dispatcher.shutdown().await;
    let mut instances: Vec<String> = runner.calls().into_iter().map(|(_, i)| i).collect();
    instances.sort();
    assert_eq!(instances, vec!["host1", "host2"]);
}
