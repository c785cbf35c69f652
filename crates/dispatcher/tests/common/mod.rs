#![allow(dead_code)]

use async_trait::async_trait;
use autoremedy_dispatcher::{
    alerts::AlertConfigStore,
    dispatcher::AlertDispatcher,
    executor::{ActionExecutor, ActionRunner, ExecutionOutcome, ExitDetail},
    rate_limit::{ManualClock, RateLimiter, DEFAULT_COOLDOWN},
};
use std::sync::{Arc, Mutex};

/// Remembers every invocation and reports success.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<(String, String)>>,
}

impl RecordingRunner {
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionRunner for RecordingRunner {
    async fn run(&self, action_ref: &str, instance: &str) -> ExecutionOutcome {
        self.calls
            .lock()
            .unwrap()
            .push((action_ref.to_string(), instance.to_string()));
        ExecutionOutcome::success(ExitDetail::default())
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub dispatcher: Arc<AlertDispatcher>,
}

pub fn harness(store: AlertConfigStore, runner: Arc<dyn ActionRunner>, workers: usize) -> Harness {
    let clock = Arc::new(ManualClock::default());
    let limiter = RateLimiter::with_clock(DEFAULT_COOLDOWN, clock.clone());
    let executor = ActionExecutor::new(runner, workers).unwrap();
    let dispatcher = AlertDispatcher::new(Arc::new(store), Arc::new(limiter), Arc::new(executor));
    Harness {
        clock,
        dispatcher: Arc::new(dispatcher),
    }
}
