use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::rate_limit::DEFAULT_COOLDOWN;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub alerts: AlertsConfig,
    pub executor: ExecutorConfig,
    pub action: ActionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// Optional YAML file merged over the built-in alert definitions.
    pub config_path: Option<PathBuf>,
    pub cooldown: Duration,
    /// How often expired rate-limit entries are swept.
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub max_workers: usize,
}

/// How an action reference is turned into a process invocation:
/// `[interpreter [interpreter_args..]] <action_ref> [instance_flag] <instance>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionConfig {
    pub interpreter: Option<String>,
    #[serde(default)]
    pub interpreter_args: Vec<String>,
    pub instance_flag: Option<String>,
    pub timeout: Duration,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            interpreter: Some("powershell".to_string()),
            interpreter_args: vec![
                "-ExecutionPolicy".to_string(),
                "Bypass".to_string(),
                "-File".to_string(),
            ],
            instance_flag: Some("-TargetHost".to_string()),
            timeout: Duration::from_secs(600),
        }
    }
}

impl ActionConfig {
    /// Runs the action reference itself with the instance as its only argument.
    pub fn direct(timeout: Duration) -> Self {
        Self {
            interpreter: None,
            interpreter_args: Vec::new(),
            instance_flag: None,
            timeout,
        }
    }
}

impl Config {
    pub fn load() -> crate::Result<Self> {
        // Load environment variables from .env file if it exists
        let _ = dotenvy::dotenv();

        let defaults = Config::default();

        let config = Config {
            server: ServerConfig {
                addr: std::env::var("SERVER_ADDR").unwrap_or(defaults.server.addr),
            },
            alerts: AlertsConfig {
                config_path: match std::env::var("ALERT_CONFIG_PATH") {
                    Ok(path) if path.is_empty() => None,
                    Ok(path) => Some(PathBuf::from(path)),
                    Err(_) => defaults.alerts.config_path,
                },
                cooldown: env_secs("COOLDOWN_SECS")?.unwrap_or(defaults.alerts.cooldown),
                sweep_interval: env_secs("SWEEP_INTERVAL_SECS")?
                    .unwrap_or(defaults.alerts.sweep_interval),
            },
            executor: ExecutorConfig {
                max_workers: match std::env::var("MAX_WORKERS") {
                    Ok(raw) => raw.trim().parse().map_err(|_| {
                        crate::Error::Config(format!("MAX_WORKERS must be a number, got {:?}", raw))
                    })?,
                    Err(_) => defaults.executor.max_workers,
                },
            },
            action: ActionConfig {
                interpreter: match std::env::var("ACTION_INTERPRETER") {
                    Ok(value) => non_empty(value),
                    Err(_) => defaults.action.interpreter,
                },
                interpreter_args: match std::env::var("ACTION_INTERPRETER_ARGS") {
                    Ok(value) => value.split_whitespace().map(String::from).collect(),
                    Err(_) => defaults.action.interpreter_args,
                },
                instance_flag: match std::env::var("ACTION_INSTANCE_FLAG") {
                    Ok(value) => non_empty(value),
                    Err(_) => defaults.action.instance_flag,
                },
                timeout: env_secs("ACTION_TIMEOUT_SECS")?.unwrap_or(defaults.action.timeout),
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.executor.max_workers == 0 {
            return Err(crate::Error::Config(
                "MAX_WORKERS must be at least 1".to_string(),
            ));
        }
        if self.action.timeout.is_zero() {
            return Err(crate::Error::Config(
                "ACTION_TIMEOUT_SECS must be at least 1".to_string(),
            ));
        }
        if self.alerts.sweep_interval.is_zero() {
            return Err(crate::Error::Config(
                "SWEEP_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }
        if self.action.interpreter.is_none() && !self.action.interpreter_args.is_empty() {
            tracing::warn!("ACTION_INTERPRETER_ARGS is set without ACTION_INTERPRETER and will be ignored");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                addr: "0.0.0.0:5000".to_string(),
            },
            alerts: AlertsConfig {
                config_path: Some(PathBuf::from("alert_config.yml")),
                cooldown: DEFAULT_COOLDOWN,
                sweep_interval: Duration::from_secs(600),
            },
            executor: ExecutorConfig { max_workers: 4 },
            action: ActionConfig::default(),
        }
    }
}

fn env_secs(name: &str) -> crate::Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|_| crate::Error::Config(format!("{} must be a number of seconds, got {:?}", name, raw))),
        Err(_) => Ok(None),
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}
