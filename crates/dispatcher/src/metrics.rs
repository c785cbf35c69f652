use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::{Error, Result};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref DISPATCHED_ALERTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "autoremedy_dispatched_alerts_total",
            "Alert events handled by the dispatcher, by outcome."
        ),
        &["outcome"]
    )
    .unwrap();
    pub static ref ACTION_EXECUTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "autoremedy_action_executions_total",
            "Finished remediation action runs, by status."
        ),
        &["status"]
    )
    .unwrap();
    pub static ref ACTIONS_IN_FLIGHT: IntGauge = IntGauge::new(
        "autoremedy_actions_in_flight",
        "Remediation actions currently running."
    )
    .unwrap();
}

/// Registers the dispatcher metrics with [`REGISTRY`]. Safe to call more
/// than once.
pub fn register_metrics() -> Result<()> {
    let collectors: [Box<dyn prometheus::core::Collector>; 3] = [
        Box::new(DISPATCHED_ALERTS_TOTAL.clone()),
        Box::new(ACTION_EXECUTIONS_TOTAL.clone()),
        Box::new(ACTIONS_IN_FLIGHT.clone()),
    ];

    for collector in collectors {
        match REGISTRY.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(Error::Internal(format!("Failed to register metric: {}", e))),
        }
    }
    Ok(())
}

/// Renders every registered metric in the Prometheus text format.
pub fn gather_metrics() -> Result<String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| Error::Internal(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| Error::Internal(format!("Failed to convert metrics to string: {}", e)))
}
