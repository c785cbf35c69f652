//! Per-event policy: validate, resolve, check status, rate limit, schedule.
//!
//! [`AlertDispatcher::handle`] is the fault boundary. Whatever goes wrong
//! inside it comes back as a [`Dispatch`]; callers never see an `Err`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::{
    alerts::AlertConfigStore,
    executor::{ActionExecutor, ExecutionHandle, ExecutorStats},
    metrics,
    rate_limit::{RateLimitKey, RateLimiter},
    Error, Result,
};

pub const UNKNOWN_INSTANCE: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertStatus {
    Firing,
    Resolved,
}

/// One alert as Alertmanager sends it. Only `status` and the `alertname`,
/// `severity` and `instance` labels matter here; everything else is
/// carried along untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertEvent {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

impl AlertEvent {
    pub fn new(alert_name: &str, instance: &str, status: &str) -> Self {
        let labels = HashMap::from([
            ("alertname".to_string(), alert_name.to_string()),
            ("instance".to_string(), instance.to_string()),
        ]);
        Self {
            status: status.to_string(),
            labels,
            annotations: HashMap::new(),
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// The `alertname` label, if present and non-empty.
    pub fn alert_name(&self) -> Option<&str> {
        self.labels
            .get("alertname")
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }

    pub fn instance(&self) -> &str {
        self.labels
            .get("instance")
            .map(String::as_str)
            .unwrap_or(UNKNOWN_INSTANCE)
    }

    pub fn severity(&self) -> Option<&str> {
        self.labels.get("severity").map(String::as_str)
    }

    /// Anything other than "resolved" is treated as firing.
    pub fn status(&self) -> AlertStatus {
        if self.status.eq_ignore_ascii_case("resolved") {
            AlertStatus::Resolved
        } else {
            AlertStatus::Firing
        }
    }
}

/// Decodes one entry of a webhook batch. Entries are converted one at a
/// time so a malformed alert fails alone.
impl TryFrom<serde_json::Value> for AlertEvent {
    type Error = Error;

    fn try_from(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Terminal state reached by one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Rejected,
    Unconfigured,
    Resolved,
    RateLimited,
    Scheduled,
    Failed,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Rejected => "rejected",
            DispatchOutcome::Unconfigured => "unconfigured",
            DispatchOutcome::Resolved => "resolved",
            DispatchOutcome::RateLimited => "rate_limited",
            DispatchOutcome::Scheduled => "scheduled",
            DispatchOutcome::Failed => "failed",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            DispatchOutcome::Rejected => 400,
            DispatchOutcome::Unconfigured
            | DispatchOutcome::Resolved
            | DispatchOutcome::RateLimited => 200,
            DispatchOutcome::Scheduled => 202,
            DispatchOutcome::Failed => 500,
        }
    }

    fn response_status(&self) -> ResponseStatus {
        match self {
            DispatchOutcome::Rejected | DispatchOutcome::Failed => ResponseStatus::Error,
            DispatchOutcome::Unconfigured => ResponseStatus::Warning,
            DispatchOutcome::Resolved => ResponseStatus::Success,
            DispatchOutcome::RateLimited => ResponseStatus::Skipped,
            DispatchOutcome::Scheduled => ResponseStatus::Accepted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Error,
    Warning,
    Success,
    Skipped,
    Accepted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub status: ResponseStatus,
    pub message: String,
}

/// Result of handling one event.
#[derive(Debug)]
pub struct Dispatch {
    pub outcome: DispatchOutcome,
    pub response: DispatchResponse,
    /// Present only when an action was scheduled.
    pub execution: Option<ExecutionHandle>,
}

impl Dispatch {
    fn new(outcome: DispatchOutcome, message: impl Into<String>) -> Self {
        Self {
            outcome,
            response: DispatchResponse {
                status: outcome.response_status(),
                message: message.into(),
            },
            execution: None,
        }
    }

    fn scheduled(execution: ExecutionHandle) -> Self {
        Self {
            execution: Some(execution),
            ..Self::new(DispatchOutcome::Scheduled, "Remediation scheduled")
        }
    }

    pub fn status_code(&self) -> u16 {
        self.outcome.status_code()
    }
}

pub struct AlertDispatcher {
    store: Arc<AlertConfigStore>,
    limiter: Arc<RateLimiter>,
    executor: Arc<ActionExecutor>,
}

impl AlertDispatcher {
    pub fn new(
        store: Arc<AlertConfigStore>,
        limiter: Arc<RateLimiter>,
        executor: Arc<ActionExecutor>,
    ) -> Self {
        Self {
            store,
            limiter,
            executor,
        }
    }

    pub fn handle(&self, event: &AlertEvent) -> Dispatch {
        let dispatch = match self.try_handle(event) {
            Ok(dispatch) => dispatch,
            Err(e) => {
                error!(
                    alert = ?event.alert_name(),
                    instance = %event.instance(),
                    status = %event.status,
                    error = %e,
                    "Error processing alert"
                );
                Dispatch::new(DispatchOutcome::Failed, e.to_string())
            }
        };

        record(dispatch)
    }

    /// Answers an entry that could not be decoded into an [`AlertEvent`].
    pub fn reject_malformed(&self, error: &Error) -> Dispatch {
        warn!(error = %error, "Rejecting malformed alert");
        record(Dispatch::new(DispatchOutcome::Rejected, "Invalid alert data"))
    }

    fn try_handle(&self, event: &AlertEvent) -> Result<Dispatch> {
        let Some(alert_name) = event.alert_name() else {
            return Ok(Dispatch::new(DispatchOutcome::Rejected, "Missing alert name"));
        };
        let instance = event.instance();

        let Some(definition) = self.store.resolve(alert_name) else {
            warn!("No configuration found for alert: {}", alert_name);
            return Ok(Dispatch::new(
                DispatchOutcome::Unconfigured,
                format!("Unhandled alert type: {}", alert_name),
            ));
        };

        info!(
            "Processing {} alert: {} for instance {}",
            event.severity().unwrap_or("unspecified"),
            alert_name,
            instance
        );

        if event.status() == AlertStatus::Resolved {
            info!("Alert {} resolved for instance {}", alert_name, instance);
            return Ok(Dispatch::new(DispatchOutcome::Resolved, "Alert resolved"));
        }

        let key = RateLimitKey::new(alert_name, instance);
        if !self.limiter.admit(&key)? {
            info!(key = %key, "Skipping remediation, still cooling down");
            return Ok(Dispatch::new(DispatchOutcome::RateLimited, "Rate limited"));
        }

        let execution = self.executor.submit(&definition.action_ref, instance)?;
        info!(
            execution_id = %execution.id(),
            action = %definition.action_ref,
            "Scheduled remediation for {} on {}",
            alert_name,
            instance
        );
        Ok(Dispatch::scheduled(execution))
    }

    pub fn configured_alerts(&self) -> Vec<&str> {
        self.store.names()
    }

    pub fn executor_stats(&self) -> ExecutorStats {
        self.executor.stats()
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Drains the executor. Later firing events are answered with a 500.
    pub async fn shutdown(&self) {
        self.executor.shutdown().await;
    }
}

fn record(dispatch: Dispatch) -> Dispatch {
    metrics::DISPATCHED_ALERTS_TOTAL
        .with_label_values(&[dispatch.outcome.as_str()])
        .inc();
    dispatch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertDefinition, Severity};
    use crate::executor::{ExecutionOutcome, ExecutionStatus, ExitDetail, MockActionRunner};
    use crate::rate_limit::{ManualClock, DEFAULT_COOLDOWN};
    use std::time::Duration;

    fn dispatcher(runner: MockActionRunner) -> (Arc<ManualClock>, AlertDispatcher) {
        let clock = Arc::new(ManualClock::default());
        let limiter = RateLimiter::with_clock(DEFAULT_COOLDOWN, clock.clone());
        let executor = ActionExecutor::new(Arc::new(runner), 2).unwrap();
        let dispatcher = AlertDispatcher::new(
            Arc::new(AlertConfigStore::builtin()),
            Arc::new(limiter),
            Arc::new(executor),
        );
        (clock, dispatcher)
    }

    fn succeeding_runner(times: usize) -> MockActionRunner {
        let mut runner = MockActionRunner::new();
        runner
            .expect_run()
            .times(times)
            .returning(|_, _| ExecutionOutcome::success(ExitDetail::default()));
        runner
    }

    #[test]
    fn event_accessors_apply_defaults() {
        let event = AlertEvent::default();
        assert_eq!(event.alert_name(), None);
        assert_eq!(event.instance(), "unknown");
        assert_eq!(event.status(), AlertStatus::Firing);

        let event = AlertEvent::new("", "host1", "RESOLVED");
        assert_eq!(event.alert_name(), None);
        assert_eq!(event.status(), AlertStatus::Resolved);
    }

    #[tokio::test]
    async fn malformed_entries_fail_to_decode_and_are_rejected() {
        let (_, dispatcher) = dispatcher(MockActionRunner::new());

        for raw in [
            serde_json::json!({ "status": "firing", "labels": { "alertname": "SystemDown", "replica": 2 } }),
            serde_json::json!({ "status": null, "labels": { "alertname": "SystemDown" } }),
            serde_json::json!("not an alert"),
        ] {
            let err = AlertEvent::try_from(raw).unwrap_err();
            let dispatch = dispatcher.reject_malformed(&err);
            assert_eq!(dispatch.outcome, DispatchOutcome::Rejected);
            assert_eq!(dispatch.status_code(), 400);
            assert_eq!(dispatch.response.message, "Invalid alert data");
            assert!(dispatch.execution.is_none());
        }

        let event = AlertEvent::try_from(serde_json::json!({
            "labels": { "alertname": "SystemDown", "instance": "web1" },
            "startsAt": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(event.alert_name(), Some("SystemDown"));
        assert_eq!(event.status(), AlertStatus::Firing);
    }

    #[tokio::test]
    async fn missing_alert_name_is_rejected() {
        let (_clock, dispatcher) = dispatcher(succeeding_runner(0));
        let event = AlertEvent::default().with_label("instance", "host1");

        let dispatch = dispatcher.handle(&event);
        assert_eq!(dispatch.outcome, DispatchOutcome::Rejected);
        assert_eq!(dispatch.status_code(), 400);
        assert_eq!(dispatch.response.status, ResponseStatus::Error);
        assert_eq!(dispatch.response.message, "Missing alert name");
    }

    #[tokio::test]
    async fn unknown_alert_is_unhandled_and_consumes_nothing() {
        let (_clock, dispatcher) = dispatcher(succeeding_runner(0));

        let dispatch = dispatcher.handle(&AlertEvent::new("UnknownAlert", "host1", "firing"));
        assert_eq!(dispatch.outcome, DispatchOutcome::Unconfigured);
        assert_eq!(dispatch.status_code(), 200);
        assert_eq!(dispatch.response.status, ResponseStatus::Warning);
        assert_eq!(dispatch.response.message, "Unhandled alert type: UnknownAlert");
        assert!(dispatch.execution.is_none());
        assert_eq!(dispatcher.rate_limiter().tracked(), 0);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn resolved_events_never_schedule_or_consume_budget() {
        let (_clock, dispatcher) = dispatcher(succeeding_runner(1));

        for _ in 0..3 {
            let dispatch = dispatcher.handle(&AlertEvent::new("HighCPUUsage", "host1", "resolved"));
            assert_eq!(dispatch.outcome, DispatchOutcome::Resolved);
            assert_eq!(dispatch.response.status, ResponseStatus::Success);
            assert_eq!(dispatch.status_code(), 200);
        }
        assert_eq!(dispatcher.rate_limiter().tracked(), 0);

        // Budget is still available for the first firing.
        let dispatch = dispatcher.handle(&AlertEvent::new("HighCPUUsage", "host1", "firing"));
        assert_eq!(dispatch.outcome, DispatchOutcome::Scheduled);
        dispatch.execution.unwrap().outcome().await.unwrap();
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn repeated_firing_is_rate_limited_per_instance() {
        let (clock, dispatcher) = dispatcher(succeeding_runner(3));
        let firing = |instance: &str| AlertEvent::new("HighCPUUsage", instance, "firing");

        let first = dispatcher.handle(&firing("host1"));
        assert_eq!(first.status_code(), 202);
        assert_eq!(first.response.status, ResponseStatus::Accepted);
        assert_eq!(first.response.message, "Remediation scheduled");

        let second = dispatcher.handle(&firing("host1"));
        assert_eq!(second.status_code(), 200);
        assert_eq!(second.response.status, ResponseStatus::Skipped);
        assert_eq!(second.response.message, "Rate limited");
        assert!(second.execution.is_none());

        let other_host = dispatcher.handle(&firing("host2"));
        assert_eq!(other_host.status_code(), 202);

        clock.advance(Duration::from_secs(300));
        let after_cooldown = dispatcher.handle(&firing("host1"));
        assert_eq!(after_cooldown.status_code(), 202);

        for dispatch in [first, other_host, after_cooldown] {
            dispatch.execution.unwrap().outcome().await.unwrap();
        }
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn severity_label_is_not_part_of_the_key() {
        let (_clock, dispatcher) = dispatcher(succeeding_runner(1));

        let warning = AlertEvent::new("LowDiskSpace", "db1", "firing").with_label("severity", "warning");
        let critical = AlertEvent::new("LowDiskSpace", "db1", "firing").with_label("severity", "critical");

        let first = dispatcher.handle(&warning);
        assert_eq!(first.outcome, DispatchOutcome::Scheduled);
        assert_eq!(dispatcher.handle(&critical).outcome, DispatchOutcome::RateLimited);
        first.execution.unwrap().outcome().await.unwrap();
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn scheduled_action_runs_with_the_configured_reference() {
        let mut runner = MockActionRunner::new();
        runner
            .expect_run()
            .withf(|action, instance| action == "/opt/fix-disk.sh" && instance == "db1")
            .times(1)
            .returning(|action, _| ExecutionOutcome::not_found(action));

        let store = AlertConfigStore::from_definitions([AlertDefinition::new(
            "LowDiskSpace",
            "/opt/fix-disk.sh",
            Severity::Warning,
            "disk",
        )]);
        let dispatcher = AlertDispatcher::new(
            Arc::new(store),
            Arc::new(RateLimiter::new(DEFAULT_COOLDOWN)),
            Arc::new(ActionExecutor::new(Arc::new(runner), 1).unwrap()),
        );

        let dispatch = dispatcher.handle(&AlertEvent::new("LowDiskSpace", "db1", "firing"));
        assert_eq!(dispatch.status_code(), 202);
        let outcome = dispatch.execution.unwrap().outcome().await.unwrap();
        assert_eq!(outcome.status, ExecutionStatus::NotFound);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn executor_failure_becomes_an_internal_error() {
        let (_clock, dispatcher) = dispatcher(succeeding_runner(0));
        dispatcher.shutdown().await;

        let dispatch = dispatcher.handle(&AlertEvent::new("SystemDown", "web1", "firing"));
        assert_eq!(dispatch.outcome, DispatchOutcome::Failed);
        assert_eq!(dispatch.status_code(), 500);
        assert_eq!(dispatch.response.status, ResponseStatus::Error);
        assert!(dispatch.response.message.contains("shut down"));
    }

    #[tokio::test]
    async fn health_introspection() {
        let (_clock, dispatcher) = dispatcher(succeeding_runner(0));
        assert_eq!(dispatcher.configured_alerts().len(), 4);
        assert_eq!(dispatcher.executor_stats().workers, 2);
        dispatcher.shutdown().await;
    }
}
