/* src/lib.rs */

// Re-export modules for both binary and tests
pub mod buffer;
pub mod console_log;
pub mod control;
pub mod error;
pub mod hub;
pub mod logger;
pub mod parse;
pub mod probe;
pub mod runtime;
pub mod shell;
pub mod state;

pub use buffer::{OutputBuffer, OutputLine, OutputStream};
pub use error::{ConfigError, SupervisorError};
pub use hub::{Notification, NotificationHub, Subscription, SubscriptionKind};
pub use parse::{Config, SupervisorConfig};
pub use probe::{HttpProbe, Probe, Readiness, ReadinessProber};
pub use runtime::Supervisor;
pub use state::{LifecycleState, StateChange};
