use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fmt::Display, fs, str::FromStr};


fn default_args() -> Vec<String> {
    ["serve", "--host", "{host}", "--port", "{port}"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_env() -> BTreeMap<String, String> {
    BTreeMap::from([("PYTHONIOENCODING".to_string(), "utf-8".to_string())])
}


#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SupervisorConfig {
    pub cmd: String,
    /// `{host}` and `{port}` are replaced at spawn time.
    pub args: Vec<String>,
    pub workingdir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub host: String,
    pub port: u16,
    #[serde(with = "seconds")]
    pub health_check_timeout: Duration,
    #[serde(with = "seconds")]
    pub probe_interval: Duration,
    #[serde(with = "seconds")]
    pub probe_timeout: Duration,
    #[serde(with = "seconds")]
    pub monitor_interval: Duration,
    pub failure_threshold: u32,
    #[serde(with = "seconds")]
    pub shutdown_timeout: Duration,
    pub max_console_lines: usize,
    pub console_log: Option<PathBuf>,
    pub autostart: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            cmd: "open-webui".to_string(),
            args: default_args(),
            workingdir: None,
            env: default_env(),
            host: "127.0.0.1".to_string(),
            port: 8080,
            health_check_timeout: Duration::from_secs(120),
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(5),
            monitor_interval: Duration::from_secs(5),
            failure_threshold: 1,
            shutdown_timeout: Duration::from_secs(10),
            max_console_lines: 1000,
            console_log: None,
            autostart: true,
        }
    }
}

impl SupervisorConfig {
    pub fn resolved_args(&self) -> Vec<String> {
        let port = self.port.to_string();
        self.args
            .iter()
            .map(|a| a.replace("{host}", &self.host).replace("{port}", &port))
            .collect()
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.cmd.clone())
            .chain(self.resolved_args())
            .collect::<Vec<_>>()
            .join(" ")
    }



    /*
        @@@
        @apply_env_overrides();
        . Lets HOST, PORT, SHUTDOWN_TIMEOUT, HEALTH_CHECK_TIMEOUT and MAX_CONSOLE_LINES win over the file.
        . `lookup` is std::env::var in the binary and a plain map in tests.
        . A value that does not parse is an error naming the variable, not a silent fallback.
    */
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("HOST") {
            self.host = host;
        }
        if let Some(port) = parse_var(&lookup, "PORT")? {
            self.port = port;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "SHUTDOWN_TIMEOUT")? {
            self.shutdown_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "HEALTH_CHECK_TIMEOUT")? {
            self.health_check_timeout = Duration::from_secs(secs);
        }
        if let Some(lines) = parse_var(&lookup, "MAX_CONSOLE_LINES")? {
            self.max_console_lines = lines;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cmd.trim().is_empty() {
            return Err(ConfigError::Invalid("cmd must not be empty".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be non-zero".into()));
        }
        if self.max_console_lines == 0 {
            return Err(ConfigError::Invalid("max_console_lines must be at least 1".into()));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid("failure_threshold must be at least 1".into()));
        }
        for (name, value) in [
            ("probe_interval", self.probe_interval),
            ("probe_timeout", self.probe_timeout),
            ("monitor_interval", self.monitor_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env { var, value }),
    }
}


#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            level: "info".to_string(),
        }
    }
}


#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub service: SupervisorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}



/*
    @@@
    @parser();
    . Reads the YAML file into a String; I/O errors (missing file, permissions) come back as ConfigError::Io.
    . Hands the text to serde_yaml; every absent key takes its default.
    . Validates the service section before returning.
*/
pub fn parser(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let yaml_file = fs::read_to_string(path)?;
    let parsed_config: Config = serde_yaml::from_str(&yaml_file)?;
    parsed_config.service.validate()?;
    Ok(parsed_config)
}


/// Durations written as (possibly fractional) seconds.
pub mod seconds {
    use serde::{de::Error, Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|_| D::Error::custom(format!("invalid duration {secs} (expected non-negative seconds)")))
    }
}
