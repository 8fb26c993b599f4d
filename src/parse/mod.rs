mod parse;

pub use parse::{parser, seconds, Config, LoggingConfig, SupervisorConfig};
