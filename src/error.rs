use crate::state::LifecycleState;
use thiserror::Error;


#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The operation is not allowed from the current state; nothing changed.
    #[error("cannot {op} while {state}")]
    InvalidOperation {
        op: &'static str,
        state: LifecycleState,
    },

    #[error("illegal state transition {from} -> {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("failed to spawn `{cmd}`: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot build readiness probe: {0}")]
    Probe(#[source] reqwest::Error),

    /// The monitor task is no longer running.
    #[error("supervisor monitor task has shut down")]
    Closed,
}

impl SupervisorError {
    pub fn as_label(&self) -> &'static str {
        match self {
            SupervisorError::InvalidOperation { .. } => "invalid_operation",
            SupervisorError::InvalidTransition { .. } => "invalid_transition",
            SupervisorError::Spawn { .. } => "spawn_failed",
            SupervisorError::Probe(_) => "probe_setup",
            SupervisorError::Closed => "supervisor_closed",
        }
    }
}


#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("environment override {var}={value:?} is not valid")]
    Env { var: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigError::Io(_) => "config_io",
            ConfigError::Yaml(_) => "config_yaml",
            ConfigError::Env { .. } => "config_env",
            ConfigError::Invalid(_) => "config_invalid",
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_operation_message_names_op_and_state() {
        let err = SupervisorError::InvalidOperation { op: "start", state: LifecycleState::Running };
        assert_eq!(err.to_string(), "cannot start while running");
        assert_eq!(err.as_label(), "invalid_operation");
    }

    #[test]
    fn env_error_quotes_value() {
        let err = ConfigError::Env { var: "PORT", value: "eighty".into() };
        assert_eq!(err.to_string(), "environment override PORT=\"eighty\" is not valid");
    }
}
